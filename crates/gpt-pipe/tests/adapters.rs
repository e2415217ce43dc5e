use gpt_pipe::ops::functional::KvCache;
use gpt_pipe::pipe::adapters::{post_transformer_block, pre_transformer_block};
use gpt_pipe::pipe::{causal_mask, KvCacheSet, StageIo, StageValue};
use gpt_pipe::{PipelineError, Shape, Tensor};

fn hidden_2x3x4() -> Tensor {
    let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
    Tensor::from_vec(Shape::new([2, 3, 4]), data).unwrap()
}

fn one_entry_cache() -> KvCacheSet {
    let keys = Tensor::zeros(Shape::new([1, 1, 2, 2]));
    let values = Tensor::zeros(Shape::new([1, 1, 2, 2]));
    let mut set = KvCacheSet::empty();
    set.insert(0, KvCache::new(keys, values).unwrap());
    set
}

#[test]
fn pre_adapter_transposes_training_tuple() {
    let hidden = hidden_2x3x4();
    let mask = causal_mask(3, 3).unwrap();
    let out = pre_transformer_block(StageIo::training(hidden.clone(), mask.clone())).unwrap();

    assert_eq!(out.len(), 2);
    let transposed = out.tensor(0).unwrap();
    assert_eq!(transposed.shape().dims(), &[3, 2, 4]);
    // element [b=1, s=2, :] must land at [s=2, b=1, :]
    let expected = &hidden.data()[(1 * 3 + 2) * 4..(1 * 3 + 2) * 4 + 4];
    let actual = &transposed.data()[(2 * 2 + 1) * 4..(2 * 2 + 1) * 4 + 4];
    assert_eq!(expected, actual);
    assert_eq!(out.tensor(1).unwrap().data_bool(), mask.data_bool());
}

#[test]
fn pre_adapter_inserts_a_fresh_accumulator() {
    let hidden = hidden_2x3x4();
    let mask = causal_mask(3, 4).unwrap();
    let past = one_entry_cache();
    let io = StageIo::from_values([
        StageValue::Tensor(hidden),
        StageValue::Cache(past),
        StageValue::Tensor(mask),
    ]);
    let out = pre_transformer_block(io).unwrap();

    assert_eq!(out.len(), 4);
    let values = out.values();
    let StageValue::Cache(past) = &values[1] else {
        panic!("expected past cache at position 1");
    };
    assert_eq!(past.len(), 1);
    let StageValue::Cache(presents) = &values[2] else {
        panic!("expected fresh accumulator at position 2");
    };
    assert!(presents.is_empty());
    assert!(matches!(values[3], StageValue::Tensor(_)));
}

#[test]
fn post_adapter_training_drops_mask() {
    let hidden = hidden_2x3x4();
    let mask = causal_mask(3, 3).unwrap();
    let out = post_transformer_block(StageIo::training(hidden, mask)).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out.tensor(0).unwrap().shape().dims(), &[3, 2, 4]);
}

#[test]
fn post_adapter_inference_keeps_accumulated_cache() {
    let hidden = hidden_2x3x4();
    let mask = causal_mask(3, 4).unwrap();
    let out = post_transformer_block(StageIo::inference(
        hidden,
        KvCacheSet::empty(),
        one_entry_cache(),
        mask,
    ))
    .unwrap();

    assert_eq!(out.len(), 2);
    let StageValue::Cache(presents) = &out.values()[1] else {
        panic!("expected presents at position 1");
    };
    assert_eq!(presents.len(), 1);
}

#[test]
fn adapters_reject_unknown_arity() {
    let single = StageIo::single(hidden_2x3x4());
    let err = pre_transformer_block(single).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::AdapterArity { arity: 1, .. })
    ));

    let four = StageIo::inference(
        hidden_2x3x4(),
        KvCacheSet::empty(),
        KvCacheSet::empty(),
        causal_mask(3, 3).unwrap(),
    );
    let err = pre_transformer_block(four).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::AdapterArity { arity: 4, .. })
    ));

    let three = StageIo::from_values([
        StageValue::Tensor(hidden_2x3x4()),
        StageValue::Cache(KvCacheSet::empty()),
        StageValue::Tensor(causal_mask(3, 3).unwrap()),
    ]);
    let err = post_transformer_block(three).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::AdapterArity { arity: 3, .. })
    ));
}

#[test]
fn adapters_reject_misplaced_value_kinds() {
    let io = StageIo::from_values([
        StageValue::Cache(KvCacheSet::empty()),
        StageValue::Tensor(causal_mask(3, 3).unwrap()),
    ]);
    let err = pre_transformer_block(io).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::ValueKind { position: 0, .. })
    ));
}
