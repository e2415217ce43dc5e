//! The pipeline-partitioned model handed to a pipeline-parallel runtime.

use super::builder::{build_layer_sequence, validate_sequence};
use super::io::StageIo;
use super::sequential::{set_gather_on_final, BuiltStage, SequentialModel, StageBuilder};
use super::spec::StageSpec;
use crate::config::GptPipeConfig;
use crate::error::PipelineError;
use crate::loss::CrossEntropyLoss;
use crate::nn::EmbeddingStage;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

/// Placement of this process in the pipeline dimension.
///
/// Data and tensor parallelism are coordinated by the external runtime; the
/// stage chain only needs to know how many pipeline stages exist and which
/// one it is building for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipeTopology {
    pub num_stages: usize,
    pub stage_id: usize,
}

impl PipeTopology {
    pub fn new(num_stages: usize, stage_id: usize) -> Result<Self, PipelineError> {
        let topology = PipeTopology {
            num_stages,
            stage_id,
        };
        topology.validate()?;
        Ok(topology)
    }

    /// One process owning the whole chain.
    pub fn single() -> Self {
        PipeTopology {
            num_stages: 1,
            stage_id: 0,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.num_stages == 0 || self.stage_id >= self.num_stages {
            return Err(PipelineError::StageOutOfRange {
                stage_id: self.stage_id,
                num_stages: self.num_stages,
            });
        }
        Ok(())
    }

    pub fn is_first_stage(&self) -> bool {
        self.stage_id == 0
    }

    pub fn is_last_stage(&self) -> bool {
        self.stage_id + 1 == self.num_stages
    }
}

/// Splits `num_items` chain positions into `num_parts` contiguous ranges,
/// sized as evenly as possible with the remainder spread over the front.
pub fn partition_stages(
    num_items: usize,
    num_parts: usize,
) -> Result<Vec<Range<usize>>, PipelineError> {
    if num_parts == 0 || num_items < num_parts {
        return Err(PipelineError::Partition {
            items: num_items,
            parts: num_parts,
        });
    }
    let base = num_items / num_parts;
    let extra = num_items % num_parts;
    let mut ranges = Vec::with_capacity(num_parts);
    let mut start = 0;
    for part in 0..num_parts {
        let len = base + usize::from(part < extra);
        ranges.push(start..start + len);
        start += len;
    }
    Ok(ranges)
}

/// GPT model expressed as a partitionable stage chain.
///
/// Owns the full descriptor sequence plus the built stages of its local
/// partition. The external pipeline runtime drives execution and inter-stage
/// transfer; this type supplies the descriptors, the loss, the checkpoint
/// interval, and the mode/introspection operations.
pub struct GptPipeModel {
    config: GptPipeConfig,
    specs: Vec<StageSpec>,
    stages: Vec<BuiltStage>,
    local_range: Range<usize>,
    topology: PipeTopology,
    loss: Option<CrossEntropyLoss>,
    checkpoint_interval: usize,
    caching_enabled: bool,
    gather_output: bool,
    inference: bool,
}

impl GptPipeModel {
    /// Assembles the descriptor sequence and builds this process's partition.
    ///
    /// `caching` is honored only when `inference` is set, matching the
    /// training default of no key/value cache. [`switch_to_inference_mode`]
    /// can re-enable caching later regardless of the construction-time
    /// `inference` flag; keeping the two flags coherent across an in-flight
    /// forward pass is the caller's responsibility.
    ///
    /// [`switch_to_inference_mode`]: GptPipeModel::switch_to_inference_mode
    pub fn new(
        config: GptPipeConfig,
        gather_output: bool,
        topology: PipeTopology,
        inference: bool,
        caching: bool,
    ) -> Result<Self> {
        topology.validate()?;
        let caching = caching && inference;
        let specs = build_layer_sequence(&config, gather_output, inference, caching)?;
        validate_sequence(&specs)?;

        let ranges = partition_stages(specs.len(), topology.num_stages)?;
        let local_range = ranges[topology.stage_id].clone();
        let mut builder = StageBuilder::new(&config, &specs, true);
        let mut stages = Vec::with_capacity(local_range.len());
        for index in local_range.clone() {
            stages.push(builder.build(index)?);
        }

        let loss = (!inference).then(|| CrossEntropyLoss::new(config.fp16_lm_cross_entropy));
        let checkpoint_interval = config.checkpoint_interval();
        Ok(GptPipeModel {
            config,
            specs,
            stages,
            local_range,
            topology,
            loss,
            checkpoint_interval,
            caching_enabled: caching,
            gather_output,
            inference,
        })
    }

    /// Enables key/value caching on every local layer that supports it (the
    /// rest are skipped) and stops gathering logits across shards, so each
    /// shard keeps local logits for lower per-step latency.
    pub fn switch_to_inference_mode(&mut self, cache: bool) -> Result<()> {
        for stage in &mut self.stages {
            stage.set_caching_if_supported(cache);
        }
        self.caching_enabled = cache;
        self.apply_gather_output(false)?;
        Ok(())
    }

    /// Disables caching everywhere and gathers logits on the final head so
    /// every rank sees the complete vocabulary for the loss.
    pub fn switch_to_training_mode(&mut self) -> Result<()> {
        for stage in &mut self.stages {
            stage.set_caching_if_supported(false);
        }
        self.caching_enabled = false;
        self.apply_gather_output(true)?;
        Ok(())
    }

    /// Records the flag and pushes it into the final head when the chain's
    /// last descriptor is built locally. A local final stage of any other
    /// kind is a contract violation.
    fn apply_gather_output(&mut self, value: bool) -> Result<(), PipelineError> {
        self.gather_output = value;
        if self.local_range.end == self.specs.len() {
            set_gather_on_final(&mut self.stages, value)?;
        }
        Ok(())
    }

    /// True when this process owns the head of the chain, and with it the
    /// embedding table.
    pub fn is_first_stage(&self) -> bool {
        self.topology.is_first_stage()
    }

    /// The embedding stage, present only on the first pipeline stage.
    pub fn get_word_embeddings(&self) -> Option<Arc<EmbeddingStage>> {
        if !self.is_first_stage() {
            return None;
        }
        self.stages
            .iter()
            .find_map(|stage| stage.as_embedding().map(Arc::clone))
    }

    /// The full descriptor sequence, identical on every pipeline stage.
    pub fn specs(&self) -> &[StageSpec] {
        &self.specs
    }

    /// Descriptor subsequence assigned to an arbitrary pipeline stage.
    pub fn stage_specs(&self, stage_id: usize) -> Result<&[StageSpec], PipelineError> {
        if stage_id >= self.topology.num_stages {
            return Err(PipelineError::StageOutOfRange {
                stage_id,
                num_stages: self.topology.num_stages,
            });
        }
        let ranges = partition_stages(self.specs.len(), self.topology.num_stages)?;
        Ok(&self.specs[ranges[stage_id].clone()])
    }

    /// Descriptor range built on this process.
    pub fn local_stage_range(&self) -> Range<usize> {
        self.local_range.clone()
    }

    /// The built stages of the local partition, in chain order.
    pub fn local_stages(&self) -> &[BuiltStage] {
        &self.stages
    }

    /// Executes the local partition on one tuple. The runtime is responsible
    /// for transporting tuples between partitions.
    pub fn forward_local(&self, io: StageIo) -> Result<StageIo> {
        let _prof_guard = crate::profiling::layer_scope("GptPipeModel::forward_local");
        let mut current = io;
        for stage in &self.stages {
            current = stage.forward(current)?;
        }
        Ok(current)
    }

    /// Rebuilds the whole chain as a single-device sequential model from the
    /// same descriptors. Per-descriptor seeding makes the resulting
    /// parameters identical to the partitioned build.
    pub fn to_sequential(&self) -> Result<SequentialModel> {
        SequentialModel::build(&self.config, &self.specs)
    }

    pub fn config(&self) -> &GptPipeConfig {
        &self.config
    }

    pub fn topology(&self) -> PipeTopology {
        self.topology
    }

    /// Loss attached at construction; absent for inference-mode models.
    pub fn loss(&self) -> Option<&CrossEntropyLoss> {
        self.loss.as_ref()
    }

    pub fn checkpoint_interval(&self) -> usize {
        self.checkpoint_interval
    }

    pub fn caching_enabled(&self) -> bool {
        self.caching_enabled
    }

    pub fn gather_output(&self) -> bool {
        self.gather_output
    }

    pub fn inference(&self) -> bool {
        self.inference
    }
}
