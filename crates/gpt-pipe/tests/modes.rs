use gpt_pipe::pipe::{
    build_layer_sequence, partition_stages, AdapterKind, BlockKind, BuiltStage, MaskRule,
    StageSpec,
};
use gpt_pipe::{
    GptPipeConfig, GptPipeModel, LayerKind, PipeTopology, PipelineError, SequentialModel,
};

fn small_config(kinds: Vec<LayerKind>) -> GptPipeConfig {
    GptPipeConfig {
        vocab_size: 32,
        context_length: 16,
        hidden_size: 8,
        num_layers: kinds.len(),
        num_heads: 2,
        mlp_ratio: 2,
        layer_kinds: kinds,
        ..GptPipeConfig::default()
    }
}

fn caching_flags(stages: &[BuiltStage]) -> Vec<bool> {
    stages.iter().filter_map(|s| s.caching_enabled()).collect()
}

fn head_gather(stages: &[BuiltStage]) -> bool {
    stages
        .iter()
        .find_map(|s| s.gather_output())
        .expect("chain has no head stage")
}

#[test]
fn mode_round_trip_restores_training_flags() {
    let config = small_config(vec![LayerKind::Global; 3]);
    // Start from an inference-time sequence so the round trip has flags to undo.
    let specs = build_layer_sequence(&config, false, true, true).unwrap();
    let mut model = SequentialModel::build(&config, &specs).unwrap();
    assert_eq!(caching_flags(model.stages()), vec![true; 3]);

    model.switch_to_inference_mode(true).unwrap();
    assert_eq!(caching_flags(model.stages()), vec![true; 3]);
    assert!(!head_gather(model.stages()));

    model.switch_to_training_mode().unwrap();
    assert_eq!(caching_flags(model.stages()), vec![false; 3]);
    assert!(head_gather(model.stages()));
}

#[test]
fn pipeline_model_round_trip_on_one_stage() {
    let config = small_config(vec![LayerKind::Global; 2]);
    let mut model =
        GptPipeModel::new(config, true, PipeTopology::single(), false, false).unwrap();

    model.switch_to_inference_mode(true).unwrap();
    assert!(model.caching_enabled());
    assert!(!model.gather_output());
    assert_eq!(caching_flags(model.local_stages()), vec![true; 2]);
    assert!(!head_gather(model.local_stages()));

    model.switch_to_training_mode().unwrap();
    assert!(!model.caching_enabled());
    assert!(model.gather_output());
    assert_eq!(caching_flags(model.local_stages()), vec![false; 2]);
    assert!(head_gather(model.local_stages()));
}

#[test]
fn caching_is_ignored_outside_inference_at_construction() {
    let config = small_config(vec![LayerKind::Global; 2]);
    let trainer =
        GptPipeModel::new(config.clone(), true, PipeTopology::single(), false, true).unwrap();
    assert!(!trainer.caching_enabled());
    assert!(trainer.loss().is_some());

    let sampler = GptPipeModel::new(config, false, PipeTopology::single(), true, true).unwrap();
    assert!(sampler.caching_enabled());
    assert!(sampler.loss().is_none());
}

#[test]
fn first_stage_owns_the_embedding_table() {
    let config = small_config(vec![LayerKind::Global; 2]);
    let first = GptPipeModel::new(
        config.clone(),
        true,
        PipeTopology::new(2, 0).unwrap(),
        false,
        false,
    )
    .unwrap();
    let last = GptPipeModel::new(
        config,
        true,
        PipeTopology::new(2, 1).unwrap(),
        false,
        false,
    )
    .unwrap();

    assert!(first.is_first_stage());
    assert!(first.get_word_embeddings().is_some());
    assert!(!last.is_first_stage());
    assert!(last.get_word_embeddings().is_none());

    // The two partitions cover the whole chain contiguously.
    assert_eq!(first.local_stage_range().start, 0);
    assert_eq!(first.local_stage_range().end, last.local_stage_range().start);
    assert_eq!(last.local_stage_range().end, first.specs().len());
    assert_eq!(
        first.stage_specs(0).unwrap().len() + first.stage_specs(1).unwrap().len(),
        first.specs().len()
    );
}

#[test]
fn tied_replica_matches_the_remote_owner() {
    let config = small_config(vec![LayerKind::Global; 2]);
    let first = GptPipeModel::new(
        config.clone(),
        true,
        PipeTopology::new(2, 0).unwrap(),
        false,
        false,
    )
    .unwrap();
    let last = GptPipeModel::new(
        config,
        true,
        PipeTopology::new(2, 1).unwrap(),
        false,
        false,
    )
    .unwrap();

    let owner = first.get_word_embeddings().unwrap();
    let Some(BuiltStage::TiedLmHead(head)) = last.local_stages().last() else {
        panic!("last stage must end with the tied head");
    };
    let owner_weight = owner.word_embeddings_weight();
    let replica_weight = head.owner().word_embeddings_weight();
    assert_eq!(
        owner_weight.read().unwrap().data(),
        replica_weight.read().unwrap().data()
    );
}

#[test]
fn gather_flag_skips_stages_without_the_head() {
    let config = small_config(vec![LayerKind::Global; 2]);
    let mut first = GptPipeModel::new(
        config,
        true,
        PipeTopology::new(2, 0).unwrap(),
        false,
        false,
    )
    .unwrap();
    // No head lives on this partition; the flag is recorded without error.
    first.switch_to_inference_mode(true).unwrap();
    assert!(!first.gather_output());
    first.switch_to_training_mode().unwrap();
    assert!(first.gather_output());
}

#[test]
fn unrecognized_final_stage_rejects_the_gather_flag() {
    let config = small_config(vec![LayerKind::Global]);
    let mask = MaskRule::CausalFill { fill: -10000.0 };
    let specs = vec![
        StageSpec::Embedding { tie: None },
        StageSpec::Adapter(AdapterKind::PreTransformer),
        StageSpec::TransformerBlock {
            index: 0,
            kind: BlockKind::Standard {
                mask,
                caching: false,
            },
        },
        StageSpec::Adapter(AdapterKind::PostTransformer),
        StageSpec::FinalNorm,
    ];
    let mut model = SequentialModel::build(&config, &specs).unwrap();
    let err = model.switch_to_training_mode().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::HeadCapability { kind: "final norm" })
    ));
}

#[test]
fn partitioning_is_contiguous_and_near_even() {
    let ranges = partition_stages(7, 3).unwrap();
    assert_eq!(ranges, vec![0..3, 3..5, 5..7]);

    let ranges = partition_stages(4, 4).unwrap();
    assert_eq!(ranges, vec![0..1, 1..2, 2..3, 3..4]);

    assert!(matches!(
        partition_stages(3, 4),
        Err(PipelineError::Partition { items: 3, parts: 4 })
    ));
    assert!(matches!(
        partition_stages(3, 0),
        Err(PipelineError::Partition { .. })
    ));
}

#[test]
fn sequential_rebuild_shares_the_descriptor_list() {
    let config = small_config(vec![LayerKind::Global; 2]);
    let model = GptPipeModel::new(config, true, PipeTopology::single(), false, false).unwrap();
    let sequential = model.to_sequential().unwrap();
    assert_eq!(sequential.len(), model.specs().len());
    assert_eq!(
        sequential.checkpoint_interval(),
        model.checkpoint_interval()
    );
}
