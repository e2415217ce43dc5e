//! Inert stage descriptors.
//!
//! A model is described as an ordered `Vec<StageSpec>` before anything is
//! built. Descriptors are plain serializable data so the sequence can be
//! shipped to a partitioning runtime as-is; construction happens later,
//! either on the owning pipeline stage or in the sequential reconstructor.

use super::adapters::AdapterKind;
use crate::tensor::{DType, Tensor};
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key linking the two descriptors of a weight-tied pair.
///
/// Exactly two descriptors in a sequence may carry the same key: the owner
/// (earlier, performs real construction) and the receiver (later, reuses the
/// owner's instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TieKey(String);

impl TieKey {
    pub fn new(key: impl Into<String>) -> Self {
        TieKey(key.into())
    }

    /// The embedding/LM-head tie used by weight-tied models.
    pub fn embed() -> Self {
        TieKey::new("embed")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TieKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How attention-style scores are combined with a left-to-right mask.
///
/// Stands in for a function reference so descriptors stay serializable; the
/// rule is resolved to behavior where scores are computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MaskRule {
    /// Overwrite every masked score with `fill` before the softmax.
    CausalFill { fill: f32 },
}

impl MaskRule {
    pub fn fill_value(&self) -> f32 {
        match self {
            MaskRule::CausalFill { fill } => *fill,
        }
    }

    /// Applies the rule in place to a score tensor and a boolean mask of the
    /// same shape (`true` marks a disallowed position).
    pub fn apply(&self, scores: &mut Tensor, mask: &Tensor) -> Result<()> {
        ensure!(
            mask.dtype() == DType::Bool && mask.shape() == scores.shape(),
            "mask must be Bool with shape {:?}, got {:?} {:?}",
            scores.shape().dims(),
            mask.dtype(),
            mask.shape().dims()
        );
        let fill = self.fill_value();
        for (score, &masked) in scores.data_mut().iter_mut().zip(mask.data_bool()) {
            if masked {
                *score = fill;
            }
        }
        Ok(())
    }
}

/// Architecture of one transformer-layer stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockKind {
    /// Causal self-attention plus GELU MLP. `caching` is the construction-time
    /// default for the key/value cache flag; mode switches may change the
    /// built layer later.
    Standard { mask: MaskRule, caching: bool },
    /// Attention-free gated-MLP variant. Has no key/value cache.
    GatedMlp { mask: MaskRule },
}

/// One element of the model's linear stage chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageSpec {
    /// Word plus position embeddings. Carries a tie key when the word table
    /// doubles as the LM-head weight.
    Embedding { tie: Option<TieKey> },
    /// A stateless boundary adapter.
    Adapter(AdapterKind),
    /// Transformer layer `index` with its architecture choice.
    TransformerBlock { index: usize, kind: BlockKind },
    /// Final layer normalization.
    FinalNorm,
    /// Untied vocabulary projection.
    LmHead { gather_output: bool, inference: bool },
    /// Tied vocabulary projection: reuses the embedding owner named by `tie`
    /// and projects against its word table instead of owning a weight.
    TiedLmHead { tie: TieKey, gather_output: bool },
}

impl StageSpec {
    /// The tie key this descriptor participates in, if any.
    pub fn tie_key(&self) -> Option<&TieKey> {
        match self {
            StageSpec::Embedding { tie } => tie.as_ref(),
            StageSpec::TiedLmHead { tie, .. } => Some(tie),
            _ => None,
        }
    }

    /// True for the descriptor that constructs the tied instance.
    pub fn is_tie_owner(&self) -> bool {
        matches!(self, StageSpec::Embedding { tie: Some(_) })
    }

    /// True for the descriptor that reuses a tied instance built earlier.
    pub fn is_tie_receiver(&self) -> bool {
        matches!(self, StageSpec::TiedLmHead { .. })
    }

    pub fn is_adapter(&self) -> bool {
        matches!(self, StageSpec::Adapter(_))
    }

    pub fn is_transformer_block(&self) -> bool {
        matches!(self, StageSpec::TransformerBlock { .. })
    }

    /// Layer index for transformer-block descriptors.
    pub fn block_index(&self) -> Option<usize> {
        match self {
            StageSpec::TransformerBlock { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            StageSpec::Embedding { .. } => "embedding",
            StageSpec::Adapter(AdapterKind::PreTransformer) => "pre-transformer adapter",
            StageSpec::Adapter(AdapterKind::PostTransformer) => "post-transformer adapter",
            StageSpec::TransformerBlock {
                kind: BlockKind::Standard { .. },
                ..
            } => "transformer block",
            StageSpec::TransformerBlock {
                kind: BlockKind::GatedMlp { .. },
                ..
            } => "gated-mlp block",
            StageSpec::FinalNorm => "final norm",
            StageSpec::LmHead { .. } => "lm head",
            StageSpec::TiedLmHead { .. } => "tied lm head",
        }
    }
}
