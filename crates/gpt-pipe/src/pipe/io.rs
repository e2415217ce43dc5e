//! The tensor tuple flowing between stages.
//!
//! Stages communicate through a positional list of values so a partitioning
//! runtime can route them without knowing layer internals. The number of
//! values doubles as the calling-convention discriminant (two for training,
//! three or four for inference, depending on the boundary); the attention
//! mask by convention occupies the last position between the two adapters.

use crate::ops::functional::KvCache;
use crate::tensor::{Shape, Tensor};
use anyhow::{anyhow, bail, ensure, Result};
use smallvec::SmallVec;
use std::collections::BTreeMap;

/// Per-layer key/value caches accumulated during autoregressive inference,
/// keyed by transformer-layer index.
#[derive(Debug, Clone, Default)]
pub struct KvCacheSet {
    layers: BTreeMap<usize, KvCache>,
}

impl KvCacheSet {
    /// Fresh, empty accumulator inserted by the pre-transformer adapter.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, layer: usize, cache: KvCache) {
        self.layers.insert(layer, cache);
    }

    pub fn get(&self, layer: usize) -> Option<&KvCache> {
        self.layers.get(&layer)
    }

    /// Number of layers with a cached history.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &KvCache)> {
        self.layers.iter().map(|(k, v)| (*k, v))
    }
}

/// One positional slot of the inter-stage tuple.
#[derive(Debug, Clone)]
pub enum StageValue {
    Tensor(Tensor),
    Cache(KvCacheSet),
}

impl StageValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            StageValue::Tensor(_) => "tensor",
            StageValue::Cache(_) => "cache",
        }
    }
}

/// The ordered tuple handed from one stage to the next.
#[derive(Debug, Clone, Default)]
pub struct StageIo {
    values: SmallVec<[StageValue; 4]>,
}

impl StageIo {
    pub fn from_values(values: impl IntoIterator<Item = StageValue>) -> Self {
        StageIo {
            values: values.into_iter().collect(),
        }
    }

    /// Single-tensor tuple, the training output of the post-transformer
    /// adapter onward.
    pub fn single(tensor: Tensor) -> Self {
        StageIo::from_values([StageValue::Tensor(tensor)])
    }

    /// Training tuple between the adapters: `(hidden, mask)`.
    pub fn training(hidden: Tensor, mask: Tensor) -> Self {
        StageIo::from_values([StageValue::Tensor(hidden), StageValue::Tensor(mask)])
    }

    /// Inference tuple between the adapters:
    /// `(hidden, past, presents, mask)`, mask last.
    pub fn inference(
        hidden: Tensor,
        past: KvCacheSet,
        presents: KvCacheSet,
        mask: Tensor,
    ) -> Self {
        StageIo::from_values([
            StageValue::Tensor(hidden),
            StageValue::Cache(past),
            StageValue::Cache(presents),
            StageValue::Tensor(mask),
        ])
    }

    /// Training-mode model input: `(input_ids, position_ids, mask)`.
    pub fn embedding_training(input_ids: Tensor, position_ids: Tensor, mask: Tensor) -> Self {
        StageIo::from_values([
            StageValue::Tensor(input_ids),
            StageValue::Tensor(position_ids),
            StageValue::Tensor(mask),
        ])
    }

    /// Inference-mode model input:
    /// `(input_ids, position_ids, mask, layer_past)`.
    pub fn embedding_inference(
        input_ids: Tensor,
        position_ids: Tensor,
        mask: Tensor,
        past: KvCacheSet,
    ) -> Self {
        StageIo::from_values([
            StageValue::Tensor(input_ids),
            StageValue::Tensor(position_ids),
            StageValue::Tensor(mask),
            StageValue::Cache(past),
        ])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[StageValue] {
        &self.values
    }

    /// Borrows the tensor at `position`, failing on kind or index mismatch.
    pub fn tensor(&self, position: usize) -> Result<&Tensor> {
        match self.values.get(position) {
            Some(StageValue::Tensor(t)) => Ok(t),
            Some(other) => bail!(
                "expected a tensor at tuple position {}, got {}",
                position,
                other.kind_name()
            ),
            None => bail!(
                "tuple position {} out of range for {} values",
                position,
                self.values.len()
            ),
        }
    }

    /// Consumes the tuple into a fixed-size array for destructuring.
    pub fn into_array<const N: usize>(self, context: &str) -> Result<[StageValue; N]> {
        let len = self.values.len();
        <[StageValue; N]>::try_from(self.values.into_vec())
            .map_err(|_| anyhow!("{} expected {} values, got {}", context, N, len))
    }

    /// Consumes a single-tensor tuple.
    pub fn into_single_tensor(self, context: &str) -> Result<Tensor> {
        match self.into_array::<1>(context)? {
            [StageValue::Tensor(t)] => Ok(t),
            [other] => bail!("{context} expected a tensor, got {}", other.kind_name()),
        }
    }
}

/// Left-to-right mask for `query_len` fresh positions attending over
/// `key_len` total positions (history first). Entry `(i, j)` is `true` when
/// query `i` must not see key `j`.
pub fn causal_mask(query_len: usize, key_len: usize) -> Result<Tensor> {
    ensure!(
        query_len > 0 && key_len >= query_len,
        "causal mask requires 0 < query_len <= key_len, got {} and {}",
        query_len,
        key_len
    );
    let offset = key_len - query_len;
    let mut data = Vec::with_capacity(query_len * key_len);
    for i in 0..query_len {
        for j in 0..key_len {
            data.push(j > offset + i);
        }
    }
    Tensor::from_bool(Shape::new([query_len, key_len]), data)
}
