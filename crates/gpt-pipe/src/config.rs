//! Model configuration consumed by the layer sequence builder.
//!
//! Loading (files, CLI flags) is the caller's concern; this module only
//! defines the typed shape of a configuration plus its validity rules.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};

/// Per-layer architecture choice.
///
/// `Gmlp` and `Amlp` select the gated-MLP block variant; everything else
/// attends normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Global,
    Gmlp,
    Amlp,
}

impl LayerKind {
    /// True for the gated-MLP block variants.
    pub fn is_gated(&self) -> bool {
        matches!(self, LayerKind::Gmlp | LayerKind::Amlp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GptPipeConfig {
    pub vocab_size: usize,
    pub context_length: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub mlp_ratio: usize,
    /// One entry per transformer layer. Must cover every index exactly.
    pub layer_kinds: Vec<LayerKind>,
    #[serde(default = "default_true")]
    pub weight_tying: bool,
    #[serde(default)]
    pub checkpoint_activations: bool,
    #[serde(default = "default_checkpoint_num_layers")]
    pub checkpoint_num_layers: usize,
    #[serde(default)]
    pub fp16_lm_cross_entropy: bool,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
    /// Value written into masked attention scores before the softmax.
    #[serde(default = "default_mask_fill")]
    pub mask_fill: f32,
    #[serde(default = "default_init_std")]
    pub init_std: f32,
    #[serde(default = "default_init_seed")]
    pub init_seed: u64,
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_num_layers() -> usize {
    1
}

fn default_layer_norm_eps() -> f32 {
    1e-5
}

fn default_mask_fill() -> f32 {
    -10000.0
}

fn default_init_std() -> f32 {
    0.02
}

fn default_init_seed() -> u64 {
    1234
}

impl Default for GptPipeConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50257,
            context_length: 1024,
            hidden_size: 768,
            num_layers: 12,
            num_heads: 12,
            mlp_ratio: 4,
            layer_kinds: vec![LayerKind::Global; 12],
            weight_tying: true,
            checkpoint_activations: false,
            checkpoint_num_layers: default_checkpoint_num_layers(),
            fp16_lm_cross_entropy: false,
            layer_norm_eps: default_layer_norm_eps(),
            mask_fill: default_mask_fill(),
            init_std: default_init_std(),
            init_seed: default_init_seed(),
        }
    }
}

impl GptPipeConfig {
    /// Checks the rules the stage builder depends on. Called once at
    /// assembly; all violations are fatal.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.vocab_size == 0
            || self.context_length == 0
            || self.hidden_size == 0
            || self.num_heads == 0
            || self.mlp_ratio == 0
        {
            return Err(PipelineError::Config(
                "vocab_size, context_length, hidden_size, num_heads, and mlp_ratio must be non-zero"
                    .to_string(),
            ));
        }
        if self.hidden_size % self.num_heads != 0 {
            return Err(PipelineError::Config(format!(
                "hidden_size {} is not divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        if self.layer_kinds.len() != self.num_layers {
            return Err(PipelineError::LayerKindTableLength {
                got: self.layer_kinds.len(),
                expected: self.num_layers,
            });
        }
        Ok(())
    }

    /// Hidden width of the transformer MLPs.
    pub fn mlp_hidden(&self) -> usize {
        self.hidden_size * self.mlp_ratio
    }

    /// Activation-checkpoint interval handed to the execution engine:
    /// `checkpoint_num_layers` when checkpointing is on, zero otherwise.
    pub fn checkpoint_interval(&self) -> usize {
        if self.checkpoint_activations {
            self.checkpoint_num_layers
        } else {
            0
        }
    }
}
