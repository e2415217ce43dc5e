//! Reference implementations of the tensor operations the stages compose.
//!
//! Everything here is loop-based host math. Shapes and dtypes are validated
//! at entry and violations reported with `ensure!`, so layer code above can
//! chain calls with `?` and trust the dimensions that come back.

use crate::tensor::{DType, Shape, Tensor};
use anyhow::{ensure, Result};

/// Swaps the first two axes of a tensor, e.g. `[b, s, h] -> [s, b, h]`.
///
/// Used at the transformer-block boundary where the data layout changes from
/// batch-major to sequence-major and back.
pub fn transpose01(x: &Tensor) -> Result<Tensor> {
    let dims = x.shape().dims();
    ensure!(
        dims.len() >= 2,
        "transpose01 expects rank >= 2, got shape {:?}",
        dims
    );
    let (d0, d1) = (dims[0], dims[1]);
    let inner: usize = dims[2..].iter().product();
    let src = x.data();
    let mut out = vec![0.0f32; src.len()];
    for i in 0..d0 {
        for j in 0..d1 {
            let from = (i * d1 + j) * inner;
            let to = (j * d0 + i) * inner;
            out[to..to + inner].copy_from_slice(&src[from..from + inner]);
        }
    }
    let mut out_dims = vec![d1, d0];
    out_dims.extend_from_slice(&dims[2..]);
    Tensor::from_vec(Shape::new(out_dims), out)
}

/// Element-wise addition of two tensors with identical shapes.
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    ensure!(
        a.shape() == b.shape(),
        "add expects matching shapes, got {:?} and {:?}",
        a.shape().dims(),
        b.shape().dims()
    );
    let out = a
        .data()
        .iter()
        .zip(b.data())
        .map(|(x, y)| x + y)
        .collect();
    Tensor::from_vec(a.shape().clone(), out)
}

/// Adds a bias vector over the last axis of `x`.
pub fn add_bias(x: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let dims = x.shape().dims();
    let width = dims[dims.len() - 1];
    ensure!(
        bias.shape().dims() == [width],
        "bias shape {:?} does not match last axis {} of {:?}",
        bias.shape().dims(),
        width,
        dims
    );
    let bv = bias.data();
    let mut out = x.data().to_vec();
    for row in out.chunks_mut(width) {
        for (o, b) in row.iter_mut().zip(bv) {
            *o += b;
        }
    }
    Tensor::from_vec(x.shape().clone(), out)
}

/// Matrix product of `a` (`[.., k]`, leading axes treated as batch) and a 2D
/// weight `b` (`[k, n]`), yielding `[.., n]`.
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let ad = a.shape().dims();
    let bd = b.shape().dims();
    ensure!(
        ad.len() >= 2 && bd.len() == 2,
        "matmul expects lhs rank >= 2 and a 2D rhs, got {:?} x {:?}",
        ad,
        bd
    );
    let k = ad[ad.len() - 1];
    ensure!(
        k == bd[0],
        "matmul inner dimensions do not match: {} vs {}",
        k,
        bd[0]
    );
    let n = bd[1];
    let rows: usize = ad[..ad.len() - 1].iter().product();
    let av = a.data();
    let bv = b.data();
    let mut out = vec![0.0f32; rows * n];
    for r in 0..rows {
        let lhs = &av[r * k..(r + 1) * k];
        let dst = &mut out[r * n..(r + 1) * n];
        for (kk, &lv) in lhs.iter().enumerate() {
            let rhs = &bv[kk * n..(kk + 1) * n];
            for (o, &rv) in dst.iter_mut().zip(rhs) {
                *o += lv * rv;
            }
        }
    }
    let mut dims = ad[..ad.len() - 1].to_vec();
    dims.push(n);
    Tensor::from_vec(Shape::new(dims), out)
}

/// Gathers rows of a `[rows, width]` table by integer index.
///
/// `ids` may have any shape; the result appends the table width as a new
/// trailing axis. Out-of-range ids are reported, not clamped.
pub fn embedding_lookup(table: &Tensor, ids: &Tensor) -> Result<Tensor> {
    let td = table.shape().dims();
    ensure!(td.len() == 2, "embedding table must be 2D, got {:?}", td);
    ensure!(
        ids.dtype() == DType::I32,
        "embedding indices must have dtype I32, got {:?}",
        ids.dtype()
    );
    let (rows, width) = (td[0], td[1]);
    let tv = table.data();
    let iv = ids.data_i32();
    let mut out = Vec::with_capacity(iv.len() * width);
    for (pos, &id) in iv.iter().enumerate() {
        ensure!(
            id >= 0 && (id as usize) < rows,
            "index {} at position {} out of range for table with {} rows",
            id,
            pos,
            rows
        );
        let base = id as usize * width;
        out.extend_from_slice(&tv[base..base + width]);
    }
    let mut dims = ids.shape().dims().to_vec();
    dims.push(width);
    Tensor::from_vec(Shape::new(dims), out)
}

/// Layer normalization over the last axis with affine parameters.
pub fn layer_norm(x: &Tensor, gamma: &Tensor, beta: &Tensor, eps: f32) -> Result<Tensor> {
    let dims = x.shape().dims();
    let width = dims[dims.len() - 1];
    ensure!(
        gamma.shape().dims() == [width] && beta.shape().dims() == [width],
        "layer norm parameters must match last axis {} of {:?}",
        width,
        dims
    );
    let gv = gamma.data();
    let bv = beta.data();
    let mut out = x.data().to_vec();
    for row in out.chunks_mut(width) {
        let mean = row.iter().sum::<f32>() / width as f32;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / width as f32;
        let inv_std = 1.0 / (var + eps).sqrt();
        for ((v, g), b) in row.iter_mut().zip(gv).zip(bv) {
            *v = (*v - mean) * inv_std * g + b;
        }
    }
    Tensor::from_vec(x.shape().clone(), out)
}

/// GELU activation (tanh approximation).
pub fn gelu(x: &Tensor) -> Result<Tensor> {
    const C: f32 = 0.797_884_6; // sqrt(2 / pi)
    let out = x
        .data()
        .iter()
        .map(|&v| 0.5 * v * (1.0 + (C * (v + 0.044_715 * v * v * v)).tanh()))
        .collect();
    Tensor::from_vec(x.shape().clone(), out)
}

/// SwiGLU gate: `silu(gate) * up`, element-wise.
pub fn swiglu(gate: &Tensor, up: &Tensor) -> Result<Tensor> {
    ensure!(
        gate.shape() == up.shape(),
        "swiglu expects matching shapes, got {:?} and {:?}",
        gate.shape().dims(),
        up.shape().dims()
    );
    let out = gate
        .data()
        .iter()
        .zip(up.data())
        .map(|(&g, &u)| g / (1.0 + (-g).exp()) * u)
        .collect();
    Tensor::from_vec(gate.shape().clone(), out)
}

/// Numerically stable softmax over the last axis.
pub fn softmax_last_axis(x: &Tensor) -> Result<Tensor> {
    let dims = x.shape().dims();
    let width = dims[dims.len() - 1];
    ensure!(width > 0, "softmax requires a non-empty last axis");
    let mut out = x.data().to_vec();
    for row in out.chunks_mut(width) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
    Tensor::from_vec(x.shape().clone(), out)
}

/// Projects hidden states onto the vocabulary using a `[vocab, hidden]`
/// embedding table, i.e. `x . W^T`.
///
/// This is the tied-head projection: the weight is the word-embedding matrix
/// itself, so no transposed copy is materialized.
pub fn lm_logits(hidden: &Tensor, embedding_weight: &Tensor) -> Result<Tensor> {
    let hd = hidden.shape().dims();
    let wd = embedding_weight.shape().dims();
    ensure!(
        wd.len() == 2,
        "embedding weight must be 2D, got {:?}",
        wd
    );
    let width = hd[hd.len() - 1];
    ensure!(
        width == wd[1],
        "hidden width {} does not match embedding width {}",
        width,
        wd[1]
    );
    let vocab = wd[0];
    let rows: usize = hd[..hd.len() - 1].iter().product();
    let hv = hidden.data();
    let wv = embedding_weight.data();
    let mut out = vec![0.0f32; rows * vocab];
    for r in 0..rows {
        let lhs = &hv[r * width..(r + 1) * width];
        let dst = &mut out[r * vocab..(r + 1) * vocab];
        for (vi, o) in dst.iter_mut().enumerate() {
            let wrow = &wv[vi * width..(vi + 1) * width];
            *o = lhs.iter().zip(wrow).map(|(a, b)| a * b).sum();
        }
    }
    let mut dims = hd[..hd.len() - 1].to_vec();
    dims.push(vocab);
    Tensor::from_vec(Shape::new(dims), out)
}

/// Key/value tensors accumulated by one attention layer, laid out
/// `[len, batch, heads, head_dim]`.
#[derive(Debug, Clone)]
pub struct KvCache {
    pub keys: Tensor,
    pub values: Tensor,
}

impl KvCache {
    pub fn new(keys: Tensor, values: Tensor) -> Result<Self> {
        ensure!(
            keys.shape() == values.shape(),
            "key/value shapes must match, got {:?} and {:?}",
            keys.shape().dims(),
            values.shape().dims()
        );
        ensure!(
            keys.shape().rank() == 4,
            "key/value cache must be rank 4, got {:?}",
            keys.shape().dims()
        );
        Ok(KvCache { keys, values })
    }

    /// Number of cached sequence positions.
    pub fn len(&self) -> usize {
        self.keys.shape().dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one attention pass: the projected context plus the full
/// key/value history including the freshly computed positions.
#[derive(Debug)]
pub struct AttentionOutput {
    pub output: Tensor,
    pub present: KvCache,
}

/// Causal multi-head self-attention over sequence-major input `[s, b, h]`.
///
/// `mask` is a `[s, past + s]` boolean tensor where `true` marks a position
/// the query may not attend to; masked scores are overwritten with
/// `mask_fill` before the softmax. When `past` is given, its keys and values
/// are prepended so each new query attends over the whole history.
pub fn causal_attention(
    x: &Tensor,
    num_heads: usize,
    w_qkv: &Tensor,
    b_qkv: &Tensor,
    w_out: &Tensor,
    b_out: &Tensor,
    mask: &Tensor,
    mask_fill: f32,
    past: Option<&KvCache>,
) -> Result<AttentionOutput> {
    let dims = x.shape().dims();
    ensure!(
        dims.len() == 3,
        "attention input must be [seq, batch, hidden], got {:?}",
        dims
    );
    let (s, b, h) = (dims[0], dims[1], dims[2]);
    ensure!(
        num_heads > 0 && h % num_heads == 0,
        "hidden size {} must be divisible by {} heads",
        h,
        num_heads
    );
    let hd = h / num_heads;

    let p = past.map(|c| c.len()).unwrap_or(0);
    if let Some(cache) = past {
        ensure!(
            cache.keys.shape().dims() == [p, b, num_heads, hd],
            "cache shape {:?} does not match input [*, {}, {}, {}]",
            cache.keys.shape().dims(),
            b,
            num_heads,
            hd
        );
    }
    let total = p + s;
    ensure!(
        mask.dtype() == DType::Bool && mask.shape().dims() == [s, total],
        "attention mask must be Bool [{}, {}], got {:?} {:?}",
        s,
        total,
        mask.dtype(),
        mask.shape().dims()
    );

    let qkv = add_bias(&matmul(x, w_qkv)?, b_qkv)?;
    ensure!(
        qkv.shape().dims()[2] == 3 * h,
        "qkv projection must produce width {}, got {}",
        3 * h,
        qkv.shape().dims()[2]
    );
    let qkvv = qkv.data();

    // Full key/value history, fresh positions appended after the past.
    // The [len, batch, heads, head_dim] layout flattens to [len, batch, h],
    // so a past cache is a plain prefix of the buffers.
    let mut keys = vec![0.0f32; total * b * h];
    let mut values = vec![0.0f32; total * b * h];
    if let Some(cache) = past {
        keys[..p * b * h].copy_from_slice(cache.keys.data());
        values[..p * b * h].copy_from_slice(cache.values.data());
    }
    for t in 0..s {
        for bi in 0..b {
            let row = (t * b + bi) * 3 * h;
            let dst = ((p + t) * b + bi) * h;
            keys[dst..dst + h].copy_from_slice(&qkvv[row + h..row + 2 * h]);
            values[dst..dst + h].copy_from_slice(&qkvv[row + 2 * h..row + 3 * h]);
        }
    }

    let maskv = mask.data_bool();
    let scale = 1.0 / (hd as f32).sqrt();
    let mut context = vec![0.0f32; s * b * h];
    let mut scores = vec![0.0f32; total];
    for bi in 0..b {
        for head in 0..num_heads {
            let hoff = head * hd;
            for i in 0..s {
                let q = (i * b + bi) * 3 * h + hoff;
                for (j, score) in scores.iter_mut().enumerate() {
                    if maskv[i * total + j] {
                        *score = mask_fill;
                        continue;
                    }
                    let k = (j * b + bi) * h + hoff;
                    let mut dot = 0.0;
                    for d in 0..hd {
                        dot += qkvv[q + d] * keys[k + d];
                    }
                    *score = dot * scale;
                }
                let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut sum = 0.0;
                for score in scores.iter_mut() {
                    *score = (*score - max).exp();
                    sum += *score;
                }
                let out = (i * b + bi) * h + hoff;
                for (j, &score) in scores.iter().enumerate() {
                    let w = score / sum;
                    if w == 0.0 {
                        continue;
                    }
                    let v = (j * b + bi) * h + hoff;
                    for d in 0..hd {
                        context[out + d] += w * values[v + d];
                    }
                }
            }
        }
    }

    let context = Tensor::from_vec(Shape::new([s, b, h]), context)?;
    let output = add_bias(&matmul(&context, w_out)?, b_out)?;
    let present = KvCache::new(
        Tensor::from_vec(Shape::new([total, b, num_heads, hd]), keys)?,
        Tensor::from_vec(Shape::new([total, b, num_heads, hd]), values)?,
    )?;
    Ok(AttentionOutput { output, present })
}
