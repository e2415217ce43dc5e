//! Materializes stage descriptors into runnable layers and provides the
//! single-device sequential form of the model.

use super::adapters::AdapterKind;
use super::builder::validate_sequence;
use super::io::{KvCacheSet, StageIo, StageValue};
use super::spec::{BlockKind, StageSpec, TieKey};
use crate::config::GptPipeConfig;
use crate::error::PipelineError;
use crate::nn::{
    EmbeddingStage, FinalNormStage, GatedMlpBlockStage, LinearHeadStage, SupportsCaching,
    TiedLogitsStage, TransformerBlockStage,
};
use crate::tensor::Tensor;
use anyhow::{anyhow, bail, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;

/// A constructed stage, ready to execute.
///
/// The embedding sits behind an `Arc` because a tied LM head keeps a
/// back-reference to it; every other stage is owned outright.
#[derive(Debug)]
pub enum BuiltStage {
    Embedding(Arc<EmbeddingStage>),
    Adapter(AdapterKind),
    Block(TransformerBlockStage),
    GatedBlock(GatedMlpBlockStage),
    FinalNorm(FinalNormStage),
    LmHead(LinearHeadStage),
    TiedLmHead(TiedLogitsStage),
}

impl BuiltStage {
    pub fn forward(&self, io: StageIo) -> Result<StageIo> {
        match self {
            BuiltStage::Embedding(stage) => stage.forward(io),
            BuiltStage::Adapter(kind) => kind.apply(io),
            BuiltStage::Block(stage) => stage.forward(io),
            BuiltStage::GatedBlock(stage) => stage.forward(io),
            BuiltStage::FinalNorm(stage) => stage.forward(io),
            BuiltStage::LmHead(stage) => stage.forward(io),
            BuiltStage::TiedLmHead(stage) => stage.forward(io),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            BuiltStage::Embedding(_) => "embedding",
            BuiltStage::Adapter(AdapterKind::PreTransformer) => "pre-transformer adapter",
            BuiltStage::Adapter(AdapterKind::PostTransformer) => "post-transformer adapter",
            BuiltStage::Block(_) => "transformer block",
            BuiltStage::GatedBlock(_) => "gated-mlp block",
            BuiltStage::FinalNorm(_) => "final norm",
            BuiltStage::LmHead(_) => "lm head",
            BuiltStage::TiedLmHead(_) => "tied lm head",
        }
    }

    /// Applies the caching capability where it exists; every other stage
    /// kind is skipped, never failed.
    pub(crate) fn set_caching_if_supported(&mut self, enabled: bool) {
        if let BuiltStage::Block(block) = self {
            block.set_caching(enabled);
        }
    }

    /// Caching flag for stages that have one.
    pub fn caching_enabled(&self) -> Option<bool> {
        match self {
            BuiltStage::Block(block) => Some(block.caching_enabled()),
            _ => None,
        }
    }

    /// Gather-output flag for head stages.
    pub fn gather_output(&self) -> Option<bool> {
        match self {
            BuiltStage::LmHead(head) => Some(head.gather_output()),
            BuiltStage::TiedLmHead(head) => Some(head.gather_output()),
            _ => None,
        }
    }

    pub fn as_embedding(&self) -> Option<&Arc<EmbeddingStage>> {
        match self {
            BuiltStage::Embedding(stage) => Some(stage),
            _ => None,
        }
    }
}

/// Sets the gather-output flag on the chain's final stage.
///
/// The final stage must be a head kind; anything else is a contract
/// violation rather than a silent skip.
pub(crate) fn set_gather_on_final(
    stages: &mut [BuiltStage],
    value: bool,
) -> Result<(), PipelineError> {
    match stages.last_mut() {
        Some(BuiltStage::LmHead(head)) => {
            head.set_gather_output(value);
            Ok(())
        }
        Some(BuiltStage::TiedLmHead(head)) => {
            head.set_gather_output(value);
            Ok(())
        }
        Some(other) => Err(PipelineError::HeadCapability {
            kind: other.kind_name(),
        }),
        None => Err(PipelineError::HeadCapability {
            kind: "empty stage list",
        }),
    }
}

/// Walks a descriptor sequence and materializes stages one by one,
/// maintaining the tie-key map that resolves owners to receivers.
///
/// Parameter initialization is seeded per descriptor position, so a stage
/// built here is bit-identical no matter which partition (or the sequential
/// form) builds it. That is what lets a pipeline stage that holds only the
/// tied receiver materialize a replica of the remote owner's table.
pub(crate) struct StageBuilder<'a> {
    config: &'a GptPipeConfig,
    specs: &'a [StageSpec],
    tied: HashMap<TieKey, Arc<EmbeddingStage>>,
    allow_remote_owner: bool,
}

impl<'a> StageBuilder<'a> {
    pub fn new(config: &'a GptPipeConfig, specs: &'a [StageSpec], allow_remote_owner: bool) -> Self {
        StageBuilder {
            config,
            specs,
            tied: HashMap::new(),
            allow_remote_owner,
        }
    }

    fn rng_for(&self, index: usize) -> StdRng {
        StdRng::seed_from_u64(self.config.init_seed.wrapping_add(index as u64))
    }

    fn build_embedding(&self, index: usize) -> Arc<EmbeddingStage> {
        let mut rng = self.rng_for(index);
        Arc::new(EmbeddingStage::random(self.config, &mut rng))
    }

    pub fn build(&mut self, index: usize) -> Result<BuiltStage, PipelineError> {
        match &self.specs[index] {
            StageSpec::Embedding { tie } => {
                let stage = self.build_embedding(index);
                if let Some(key) = tie {
                    self.tied.insert(key.clone(), Arc::clone(&stage));
                }
                Ok(BuiltStage::Embedding(stage))
            }
            StageSpec::Adapter(kind) => Ok(BuiltStage::Adapter(*kind)),
            StageSpec::TransformerBlock { index: layer, kind } => {
                let mut rng = self.rng_for(index);
                Ok(match kind {
                    BlockKind::Standard { mask, caching } => BuiltStage::Block(
                        TransformerBlockStage::random(*layer, *mask, *caching, self.config, &mut rng),
                    ),
                    BlockKind::GatedMlp { mask } => BuiltStage::GatedBlock(
                        GatedMlpBlockStage::random(*layer, *mask, self.config, &mut rng),
                    ),
                })
            }
            StageSpec::FinalNorm => Ok(BuiltStage::FinalNorm(FinalNormStage::new(self.config))),
            StageSpec::LmHead {
                gather_output,
                inference,
            } => {
                let mut rng = self.rng_for(index);
                Ok(BuiltStage::LmHead(LinearHeadStage::random(
                    self.config,
                    *gather_output,
                    *inference,
                    &mut rng,
                )))
            }
            StageSpec::TiedLmHead { tie, gather_output } => {
                let owner = match self.tied.get(tie) {
                    Some(owner) => Arc::clone(owner),
                    None if self.allow_remote_owner => {
                        // The owner lives on another pipeline stage; build a
                        // replica from the owner's seed so the tables match.
                        let owner_index = self
                            .specs
                            .iter()
                            .position(|s| s.is_tie_owner() && s.tie_key() == Some(tie))
                            .ok_or_else(|| PipelineError::UnboundTiedStage {
                                key: tie.to_string(),
                            })?;
                        let replica = self.build_embedding(owner_index);
                        self.tied.insert(tie.clone(), Arc::clone(&replica));
                        replica
                    }
                    None => {
                        return Err(PipelineError::UnboundTiedStage {
                            key: tie.to_string(),
                        })
                    }
                };
                Ok(BuiltStage::TiedLmHead(TiedLogitsStage::new(
                    owner,
                    *gather_output,
                )))
            }
        }
    }
}

/// The whole model as one ordered chain on a single device.
#[derive(Debug)]
pub struct SequentialModel {
    stages: Vec<BuiltStage>,
    checkpoint_interval: usize,
}

impl SequentialModel {
    /// Materializes every descriptor in order, resolving weight ties against
    /// instances built earlier in the walk.
    pub fn build(config: &GptPipeConfig, specs: &[StageSpec]) -> Result<Self> {
        config.validate()?;
        validate_sequence(specs)?;
        let mut builder = StageBuilder::new(config, specs, false);
        let mut stages = Vec::with_capacity(specs.len());
        for index in 0..specs.len() {
            stages.push(builder.build(index)?);
        }
        Ok(SequentialModel {
            stages,
            checkpoint_interval: config.checkpoint_interval(),
        })
    }

    /// Runs every stage in order on the given tuple.
    pub fn forward(&self, io: StageIo) -> Result<StageIo> {
        let _prof_guard = crate::profiling::layer_scope("SequentialModel::forward");
        let mut current = io;
        for stage in &self.stages {
            current = stage.forward(current)?;
        }
        Ok(current)
    }

    /// Training-mode convenience wrapper; returns the logits.
    pub fn forward_train(
        &self,
        input_ids: &Tensor,
        position_ids: &Tensor,
        mask: &Tensor,
    ) -> Result<Tensor> {
        let io = StageIo::embedding_training(
            input_ids.clone(),
            position_ids.clone(),
            mask.clone(),
        );
        self.forward(io)?.into_single_tensor("training forward")
    }

    /// Inference-mode convenience wrapper; returns the logits plus the
    /// key/values accumulated this pass.
    pub fn forward_inference(
        &self,
        input_ids: &Tensor,
        position_ids: &Tensor,
        mask: &Tensor,
        past: KvCacheSet,
    ) -> Result<(Tensor, KvCacheSet)> {
        let io = StageIo::embedding_inference(
            input_ids.clone(),
            position_ids.clone(),
            mask.clone(),
            past,
        );
        match self.forward(io)?.into_array::<2>("inference forward")? {
            [StageValue::Tensor(logits), StageValue::Cache(presents)] => Ok((logits, presents)),
            [first, second] => bail!(
                "inference forward expected (logits, presents), got ({}, {})",
                first.kind_name(),
                second.kind_name()
            ),
        }
    }

    /// Enables or disables key/value caching on every layer that supports it
    /// and stops gathering logits on the final head.
    pub fn switch_to_inference_mode(&mut self, cache: bool) -> Result<()> {
        for stage in &mut self.stages {
            stage.set_caching_if_supported(cache);
        }
        set_gather_on_final(&mut self.stages, false)?;
        Ok(())
    }

    /// Disables caching everywhere and gathers logits on the final head.
    pub fn switch_to_training_mode(&mut self) -> Result<()> {
        for stage in &mut self.stages {
            stage.set_caching_if_supported(false);
        }
        set_gather_on_final(&mut self.stages, true)?;
        Ok(())
    }

    pub fn stages(&self) -> &[BuiltStage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Activation-checkpoint interval shared with the pipeline form. The
    /// recomputation schedule itself belongs to the execution engine.
    pub fn checkpoint_interval(&self) -> usize {
        self.checkpoint_interval
    }

    /// Visits every owned parameter with a stable dotted name. The tied LM
    /// head is skipped: its table is the embedding's and is visited once.
    pub fn for_each_parameter<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&str, &Tensor) -> Result<()>,
    {
        for stage in &self.stages {
            match stage {
                BuiltStage::Embedding(embedding) => {
                    let word = embedding.word_embeddings_weight();
                    let word = word
                        .read()
                        .map_err(|_| anyhow!("word embedding lock poisoned"))?;
                    f("embedding.word", &word)?;
                    f("embedding.position", &embedding.position)?;
                }
                BuiltStage::Block(block) => {
                    let prefix = format!("blocks.{}", block.index());
                    f(&format!("{prefix}.ln_attn.gamma"), &block.ln_attn.gamma)?;
                    f(&format!("{prefix}.ln_attn.beta"), &block.ln_attn.beta)?;
                    f(&format!("{prefix}.w_qkv"), &block.w_qkv)?;
                    f(&format!("{prefix}.b_qkv"), &block.b_qkv)?;
                    f(&format!("{prefix}.w_out"), &block.w_out)?;
                    f(&format!("{prefix}.b_out"), &block.b_out)?;
                    f(&format!("{prefix}.ln_mlp.gamma"), &block.ln_mlp.gamma)?;
                    f(&format!("{prefix}.ln_mlp.beta"), &block.ln_mlp.beta)?;
                    f(&format!("{prefix}.w_in"), &block.w_in)?;
                    f(&format!("{prefix}.b_in"), &block.b_in)?;
                    f(&format!("{prefix}.w_proj"), &block.w_proj)?;
                    f(&format!("{prefix}.b_proj"), &block.b_proj)?;
                }
                BuiltStage::GatedBlock(block) => {
                    let prefix = format!("blocks.{}", block.index());
                    f(&format!("{prefix}.ln.gamma"), &block.ln.gamma)?;
                    f(&format!("{prefix}.ln.beta"), &block.ln.beta)?;
                    f(&format!("{prefix}.w_gate"), &block.w_gate)?;
                    f(&format!("{prefix}.b_gate"), &block.b_gate)?;
                    f(&format!("{prefix}.w_up"), &block.w_up)?;
                    f(&format!("{prefix}.b_up"), &block.b_up)?;
                    f(&format!("{prefix}.w_spatial"), &block.w_spatial)?;
                    f(&format!("{prefix}.w_down"), &block.w_down)?;
                    f(&format!("{prefix}.b_down"), &block.b_down)?;
                }
                BuiltStage::FinalNorm(norm) => {
                    f("final_norm.gamma", &norm.norm.gamma)?;
                    f("final_norm.beta", &norm.norm.beta)?;
                }
                BuiltStage::LmHead(head) => {
                    f("lm_head.weight", &head.weight)?;
                    if let Some(bias) = &head.bias {
                        f("lm_head.bias", bias)?;
                    }
                }
                BuiltStage::Adapter(_) | BuiltStage::TiedLmHead(_) => {}
            }
        }
        Ok(())
    }
}
