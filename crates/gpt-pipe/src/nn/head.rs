//! Final vocabulary projections: the untied linear head and the tied head
//! that borrows the embedding owner's word table.

use super::embedding::EmbeddingStage;
use crate::config::GptPipeConfig;
use crate::ops::functional;
use crate::pipe::io::{StageIo, StageValue};
use crate::tensor::{Shape, Tensor};
use anyhow::{anyhow, bail, Result};
use rand::Rng;
use std::sync::Arc;

/// Untied LM head: `logits = hidden W + b` with a `[hidden, vocab]` weight.
///
/// `gather_output` records whether logits should be collected into one
/// full-vocabulary tensor across model-parallel shards before being
/// returned. A single-shard build returns full-vocabulary logits either way;
/// the flag still travels with the stage so a partitioning runtime can honor
/// it.
#[derive(Debug)]
pub struct LinearHeadStage {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    gather_output: bool,
    inference: bool,
}

impl LinearHeadStage {
    pub fn random(
        config: &GptPipeConfig,
        gather_output: bool,
        inference: bool,
        rng: &mut impl Rng,
    ) -> Self {
        LinearHeadStage {
            weight: Tensor::randn(
                Shape::new([config.hidden_size, config.vocab_size]),
                config.init_std,
                rng,
            ),
            bias: None,
            gather_output,
            inference,
        }
    }

    pub fn gather_output(&self) -> bool {
        self.gather_output
    }

    pub fn set_gather_output(&mut self, value: bool) {
        self.gather_output = value;
    }

    /// The mode the head was constructed for. Kept alongside the tuple-arity
    /// dispatch so callers can introspect it; the arity remains what decides
    /// each call.
    pub fn inference(&self) -> bool {
        self.inference
    }

    fn project(&self, hidden: &Tensor) -> Result<Tensor> {
        let logits = functional::matmul(hidden, &self.weight)?;
        match &self.bias {
            Some(bias) => functional::add_bias(&logits, bias),
            None => Ok(logits),
        }
    }

    pub fn forward(&self, io: StageIo) -> Result<StageIo> {
        let _prof_guard = crate::profiling::layer_scope("LinearHeadStage::forward");
        match io.len() {
            1 => {
                let hidden = io.into_single_tensor("lm head")?;
                Ok(StageIo::single(self.project(&hidden)?))
            }
            2 => match io.into_array::<2>("lm head")? {
                [StageValue::Tensor(hidden), StageValue::Cache(presents)] => {
                    Ok(StageIo::from_values([
                        StageValue::Tensor(self.project(&hidden)?),
                        StageValue::Cache(presents),
                    ]))
                }
                [first, second] => bail!(
                    "lm head expected (hidden, presents), got ({}, {})",
                    first.kind_name(),
                    second.kind_name()
                ),
            },
            arity => bail!(
                "lm head expected 1 (training) or 2 (inference) inputs, got {}",
                arity
            ),
        }
    }
}

/// Tied LM head: projects hidden states against the word table of the
/// embedding stage it references.
///
/// This is the receiver half of a weight-tied pair. It owns no weight of its
/// own; the back-reference to the owner is resolved once, when the sequence
/// is built, and the table is read at call time so weight updates on either
/// side stay visible to both.
#[derive(Debug)]
pub struct TiedLogitsStage {
    owner: Arc<EmbeddingStage>,
    gather_output: bool,
}

impl TiedLogitsStage {
    pub fn new(owner: Arc<EmbeddingStage>, gather_output: bool) -> Self {
        TiedLogitsStage {
            owner,
            gather_output,
        }
    }

    pub fn owner(&self) -> &Arc<EmbeddingStage> {
        &self.owner
    }

    pub fn gather_output(&self) -> bool {
        self.gather_output
    }

    pub fn set_gather_output(&mut self, value: bool) {
        self.gather_output = value;
    }

    fn project(&self, hidden: &Tensor) -> Result<Tensor> {
        let weight = self.owner.word_embeddings_weight();
        let weight = weight
            .read()
            .map_err(|_| anyhow!("word embedding lock poisoned"))?;
        functional::lm_logits(hidden, &weight)
    }

    /// A bare hidden tensor yields bare logits; a `(hidden, presents)` pair
    /// yields `(logits, presents)` with the cached key/values passed through
    /// untouched.
    pub fn forward(&self, io: StageIo) -> Result<StageIo> {
        let _prof_guard = crate::profiling::layer_scope("TiedLogitsStage::forward");
        match io.len() {
            1 => {
                let hidden = io.into_single_tensor("tied lm head")?;
                Ok(StageIo::single(self.project(&hidden)?))
            }
            2 => match io.into_array::<2>("tied lm head")? {
                [StageValue::Tensor(hidden), StageValue::Cache(presents)] => {
                    Ok(StageIo::from_values([
                        StageValue::Tensor(self.project(&hidden)?),
                        StageValue::Cache(presents),
                    ]))
                }
                [first, second] => bail!(
                    "tied lm head expected (hidden, presents), got ({}, {})",
                    first.kind_name(),
                    second.kind_name()
                ),
            },
            arity => bail!(
                "tied lm head expected 1 (training) or 2 (inference) inputs, got {}",
                arity
            ),
        }
    }
}
