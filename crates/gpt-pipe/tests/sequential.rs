use gpt_pipe::pipe::{
    build_layer_sequence, causal_mask, BuiltStage, KvCacheSet, StageSpec, TieKey,
};
use gpt_pipe::{GptPipeConfig, LayerKind, PipelineError, SequentialModel, Shape, Tensor};
use std::sync::Arc;

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

fn ids(values: &[i32]) -> Tensor {
    Tensor::from_i32(Shape::new([1, values.len()]), values.to_vec()).unwrap()
}

#[test]
fn training_forward_produces_vocab_logits() {
    let config = small_config(vec![LayerKind::Global; 2]);
    let specs = build_layer_sequence(&config, true, false, false).unwrap();
    let model = SequentialModel::build(&config, &specs).unwrap();
    assert_eq!(model.len(), 7);

    let mask = causal_mask(4, 4).unwrap();
    let logits = model
        .forward_train(&ids(&[1, 2, 3, 4]), &ids(&[0, 1, 2, 3]), &mask)
        .unwrap();
    assert_eq!(logits.shape().dims(), &[1, 4, 32]);
}

#[test]
fn gated_mlp_layers_run_in_the_chain() {
    let config = small_config(vec![LayerKind::Global, LayerKind::Gmlp]);
    let specs = build_layer_sequence(&config, true, false, false).unwrap();
    let model = SequentialModel::build(&config, &specs).unwrap();

    let mask = causal_mask(3, 3).unwrap();
    let logits = model
        .forward_train(&ids(&[5, 6, 7]), &ids(&[0, 1, 2]), &mask)
        .unwrap();
    assert_eq!(logits.shape().dims(), &[1, 3, 32]);
}

#[test]
fn tied_receiver_shares_the_owner_weight() {
    let config = small_config(vec![LayerKind::Global; 2]);
    let specs = build_layer_sequence(&config, true, false, false).unwrap();
    let model = SequentialModel::build(&config, &specs).unwrap();

    let embedding = model.stages()[0].as_embedding().unwrap();
    let Some(BuiltStage::TiedLmHead(head)) = model.stages().last() else {
        panic!("expected a tied head at the end of the chain");
    };
    assert!(Arc::ptr_eq(embedding, head.owner()));

    let mask = causal_mask(3, 3).unwrap();
    let before = model
        .forward_train(&ids(&[1, 2, 3]), &ids(&[0, 1, 2]), &mask)
        .unwrap();
    assert!(before.data().iter().any(|&v| v != 0.0));

    // Zeroing the table through the owner must be seen by the receiver:
    // tied logits are hidden . W^T, so they collapse to exactly zero.
    embedding
        .word_embeddings_weight()
        .write()
        .unwrap()
        .fill(0.0);
    let after = model
        .forward_train(&ids(&[1, 2, 3]), &ids(&[0, 1, 2]), &mask)
        .unwrap();
    assert!(after.data().iter().all(|&v| v == 0.0));
}

#[test]
fn untied_head_owns_an_independent_weight() {
    let config = GptPipeConfig {
        weight_tying: false,
        ..small_config(vec![LayerKind::Global; 2])
    };
    let specs = build_layer_sequence(&config, true, false, false).unwrap();
    let model = SequentialModel::build(&config, &specs).unwrap();
    assert!(matches!(model.stages().last(), Some(BuiltStage::LmHead(_))));

    let embedding = model.stages()[0].as_embedding().unwrap();
    embedding
        .word_embeddings_weight()
        .write()
        .unwrap()
        .fill(0.0);
    let mask = causal_mask(3, 3).unwrap();
    let logits = model
        .forward_train(&ids(&[1, 2, 3]), &ids(&[0, 1, 2]), &mask)
        .unwrap();
    assert!(logits.data().iter().any(|&v| v != 0.0));
}

#[test]
fn inference_accumulates_one_cache_entry_per_standard_block() {
    let config = small_config(vec![LayerKind::Global; 2]);
    let specs = build_layer_sequence(&config, false, true, true).unwrap();
    let model = SequentialModel::build(&config, &specs).unwrap();

    let mask = causal_mask(3, 3).unwrap();
    let (logits, presents) = model
        .forward_inference(&ids(&[1, 2, 3]), &ids(&[0, 1, 2]), &mask, KvCacheSet::empty())
        .unwrap();
    assert_eq!(logits.shape().dims(), &[1, 3, 32]);
    assert_eq!(presents.len(), 2);
    for (_, cache) in presents.iter() {
        assert_eq!(cache.len(), 3);
    }

    // One more token against the accumulated history grows every cache.
    let step_mask = causal_mask(1, 4).unwrap();
    let (step_logits, grown) = model
        .forward_inference(&ids(&[4]), &ids(&[3]), &step_mask, presents)
        .unwrap();
    assert_eq!(step_logits.shape().dims(), &[1, 1, 32]);
    for (_, cache) in grown.iter() {
        assert_eq!(cache.len(), 4);
    }
}

#[test]
fn caching_disabled_leaves_the_accumulator_empty() {
    let config = small_config(vec![LayerKind::Global; 2]);
    let specs = build_layer_sequence(&config, false, true, false).unwrap();
    let model = SequentialModel::build(&config, &specs).unwrap();

    let mask = causal_mask(2, 2).unwrap();
    let (_, presents) = model
        .forward_inference(&ids(&[1, 2]), &ids(&[0, 1]), &mask, KvCacheSet::empty())
        .unwrap();
    assert!(presents.is_empty());
}

#[test]
fn cached_decode_matches_the_full_forward() {
    let config = small_config(vec![LayerKind::Global]);
    let specs = build_layer_sequence(&config, false, true, true).unwrap();
    let model = SequentialModel::build(&config, &specs).unwrap();

    let full_mask = causal_mask(2, 2).unwrap();
    let (full, _) = model
        .forward_inference(&ids(&[3, 9]), &ids(&[0, 1]), &full_mask, KvCacheSet::empty())
        .unwrap();

    let (_, past) = model
        .forward_inference(
            &ids(&[3]),
            &ids(&[0]),
            &causal_mask(1, 1).unwrap(),
            KvCacheSet::empty(),
        )
        .unwrap();
    let (step, _) = model
        .forward_inference(&ids(&[9]), &ids(&[1]), &causal_mask(1, 2).unwrap(), past)
        .unwrap();

    let full_last = &full.data()[32..64];
    let step_row = &step.data()[..32];
    for (a, b) in full_last.iter().zip(step_row) {
        assert!((a - b).abs() < 1e-4, "cached decode diverged: {} vs {}", a, b);
    }
}

#[test]
fn reconstruction_is_deterministic() {
    let config = small_config(vec![LayerKind::Global, LayerKind::Gmlp]);
    let specs = build_layer_sequence(&config, true, false, false).unwrap();

    let collect = |model: &SequentialModel| {
        let mut params: Vec<(String, Vec<f32>)> = Vec::new();
        model
            .for_each_parameter(|name, tensor| {
                params.push((name.to_string(), tensor.data().to_vec()));
                Ok(())
            })
            .unwrap();
        params
    };

    let first = collect(&SequentialModel::build(&config, &specs).unwrap());
    let second = collect(&SequentialModel::build(&config, &specs).unwrap());
    assert_eq!(first, second);

    let names: Vec<&str> = first.iter().map(|(name, _)| name.as_str()).collect();
    assert!(names.contains(&"embedding.word"));
    assert!(names.contains(&"blocks.0.w_qkv"));
    assert!(names.contains(&"blocks.1.w_spatial"));
    assert!(names.contains(&"final_norm.gamma"));
}

#[test]
fn receiver_without_owner_is_rejected() {
    let config = small_config(vec![LayerKind::Global]);
    let specs = vec![StageSpec::TiedLmHead {
        tie: TieKey::embed(),
        gather_output: true,
    }];
    let err = SequentialModel::build(&config, &specs).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::UnboundTiedStage { .. })
    ));
}
