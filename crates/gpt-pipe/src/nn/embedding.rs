//! Word and position embeddings, including the tied word table.
//!
//! The word table sits behind a shared handle because a weight-tied model
//! projects its final hidden states against the same matrix: the tied head
//! holds a reference to this stage and reads the table at call time, so a
//! weight update through either side is seen by both.

use crate::config::GptPipeConfig;
use crate::ops::functional;
use crate::pipe::io::{StageIo, StageValue};
use crate::tensor::{Shape, Tensor};
use anyhow::{anyhow, bail, Result};
use rand::Rng;
use std::sync::{Arc, RwLock};

/// Embedding stage mapping `(input_ids, position_ids)` to hidden states.
#[derive(Debug)]
pub struct EmbeddingStage {
    word: Arc<RwLock<Tensor>>,
    pub position: Tensor,
}

impl EmbeddingStage {
    /// Initializes both tables from `N(0, init_std^2)`.
    pub fn random(config: &GptPipeConfig, rng: &mut impl Rng) -> Self {
        let word = Tensor::randn(
            Shape::new([config.vocab_size, config.hidden_size]),
            config.init_std,
            rng,
        );
        let position = Tensor::randn(
            Shape::new([config.context_length, config.hidden_size]),
            config.init_std,
            rng,
        );
        EmbeddingStage {
            word: Arc::new(RwLock::new(word)),
            position,
        }
    }

    /// Shared handle to the word table. The tied LM head projects against
    /// this exact tensor.
    pub fn word_embeddings_weight(&self) -> Arc<RwLock<Tensor>> {
        Arc::clone(&self.word)
    }

    fn lookup(&self, input_ids: &Tensor, position_ids: &Tensor) -> Result<Tensor> {
        let word = self
            .word
            .read()
            .map_err(|_| anyhow!("word embedding lock poisoned"))?;
        let tokens = functional::embedding_lookup(&word, input_ids)?;
        let positions = functional::embedding_lookup(&self.position, position_ids)?;
        functional::add(&tokens, &positions)
    }

    /// Training input is `(input_ids, position_ids, mask)`; inference adds
    /// the prior key/values as a fourth element. Either way the hidden
    /// states replace the id tensors and the mask ends up last, which is
    /// where the next boundary expects it.
    #[deny(clippy::disallowed_methods, clippy::disallowed_types)]
    pub fn forward(&self, io: StageIo) -> Result<StageIo> {
        let _prof_guard = crate::profiling::layer_scope("EmbeddingStage::forward");
        match io.len() {
            3 => match io.into_array::<3>("embedding stage")? {
                [StageValue::Tensor(ids), StageValue::Tensor(pos), StageValue::Tensor(mask)] => {
                    let hidden = self.lookup(&ids, &pos)?;
                    Ok(StageIo::from_values([
                        StageValue::Tensor(hidden),
                        StageValue::Tensor(mask),
                    ]))
                }
                values => bail!(
                    "embedding stage expected (input_ids, position_ids, mask), got ({}, {}, {})",
                    values[0].kind_name(),
                    values[1].kind_name(),
                    values[2].kind_name()
                ),
            },
            4 => match io.into_array::<4>("embedding stage")? {
                [StageValue::Tensor(ids), StageValue::Tensor(pos), StageValue::Tensor(mask), StageValue::Cache(past)] =>
                {
                    let hidden = self.lookup(&ids, &pos)?;
                    Ok(StageIo::from_values([
                        StageValue::Tensor(hidden),
                        StageValue::Cache(past),
                        StageValue::Tensor(mask),
                    ]))
                }
                values => bail!(
                    "embedding stage expected (input_ids, position_ids, mask, layer_past), got ({}, {}, {}, {})",
                    values[0].kind_name(),
                    values[1].kind_name(),
                    values[2].kind_name(),
                    values[3].kind_name()
                ),
            },
            arity => bail!(
                "embedding stage expected 3 (training) or 4 (inference) inputs, got {}",
                arity
            ),
        }
    }
}
