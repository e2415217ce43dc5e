//! Stage-boundary adapters.
//!
//! Two pure functions reshape the tuple at the edges of the transformer
//! chain. The tuple arity is the calling-convention discriminant and is
//! checked here, at the boundary, so a malformed tuple fails immediately
//! instead of surfacing as a shape mismatch deep inside a layer.

use super::io::{KvCacheSet, StageIo, StageValue};
use crate::error::PipelineError;
use crate::ops::functional;
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Which boundary an adapter sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterKind {
    PreTransformer,
    PostTransformer,
}

impl AdapterKind {
    pub fn name(&self) -> &'static str {
        match self {
            AdapterKind::PreTransformer => "pre-transformer",
            AdapterKind::PostTransformer => "post-transformer",
        }
    }

    pub fn apply(&self, io: StageIo) -> Result<StageIo> {
        match self {
            AdapterKind::PreTransformer => pre_transformer_block(io),
            AdapterKind::PostTransformer => post_transformer_block(io),
        }
    }
}

fn value_kind_error(
    context: &'static str,
    position: usize,
    expected: &'static str,
    got: &StageValue,
) -> PipelineError {
    PipelineError::ValueKind {
        context,
        position,
        expected,
        got: got.kind_name(),
    }
}

/// Reshapes the embedding output for the transformer chain.
///
/// Training (`(hidden, mask)`): transposes the hidden states to
/// sequence-major and passes the mask through.
///
/// Inference (`(hidden, past, mask)`): additionally inserts a fresh, empty
/// key/value accumulator directly after the past so downstream layers can
/// deposit the keys and values they produce this pass. The mask stays in the
/// last position, where the partitioning boundary locates it.
pub fn pre_transformer_block(io: StageIo) -> Result<StageIo> {
    match io.len() {
        2 => match io.into_array::<2>("pre-transformer adapter")? {
            [StageValue::Tensor(hidden), StageValue::Tensor(mask)] => Ok(StageIo::from_values([
                StageValue::Tensor(functional::transpose01(&hidden)?),
                StageValue::Tensor(mask),
            ])),
            [first, second] => {
                let err = match first {
                    StageValue::Tensor(_) => {
                        value_kind_error("pre-transformer adapter", 1, "tensor", &second)
                    }
                    _ => value_kind_error("pre-transformer adapter", 0, "tensor", &first),
                };
                Err(err.into())
            }
        },
        3 => match io.into_array::<3>("pre-transformer adapter")? {
            [StageValue::Tensor(hidden), StageValue::Cache(past), StageValue::Tensor(mask)] => {
                Ok(StageIo::from_values([
                    StageValue::Tensor(functional::transpose01(&hidden)?),
                    StageValue::Cache(past),
                    StageValue::Cache(KvCacheSet::empty()),
                    StageValue::Tensor(mask),
                ]))
            }
            values => {
                let expected = ["tensor", "cache", "tensor"];
                let (position, got) = values
                    .iter()
                    .enumerate()
                    .find(|(i, v)| v.kind_name() != expected[*i])
                    .map(|(i, v)| (i, v.kind_name()))
                    .unwrap_or((0, values[0].kind_name()));
                Err(PipelineError::ValueKind {
                    context: "pre-transformer adapter",
                    position,
                    expected: expected[position],
                    got,
                }
                .into())
            }
        },
        arity => Err(PipelineError::AdapterArity {
            adapter: "pre-transformer",
            arity,
            expected: "2 (training) or 3 (inference)",
        }
        .into()),
    }
}

/// Reshapes the transformer-chain output for the final layers.
///
/// Training (`(hidden, mask)`): undoes the sequence-major layout and drops
/// the mask, leaving the hidden states alone.
///
/// Inference (`(hidden, past, presents, mask)`): keeps the accumulated
/// key/values and drops both the spent past and the mask.
pub fn post_transformer_block(io: StageIo) -> Result<StageIo> {
    match io.len() {
        2 => match io.into_array::<2>("post-transformer adapter")? {
            [StageValue::Tensor(hidden), StageValue::Tensor(_mask)] => {
                Ok(StageIo::single(functional::transpose01(&hidden)?))
            }
            [first, second] => {
                let err = match first {
                    StageValue::Tensor(_) => {
                        value_kind_error("post-transformer adapter", 1, "tensor", &second)
                    }
                    _ => value_kind_error("post-transformer adapter", 0, "tensor", &first),
                };
                Err(err.into())
            }
        },
        4 => match io.into_array::<4>("post-transformer adapter")? {
            [StageValue::Tensor(hidden), StageValue::Cache(_past), StageValue::Cache(presents), StageValue::Tensor(_mask)] => {
                Ok(StageIo::from_values([
                    StageValue::Tensor(functional::transpose01(&hidden)?),
                    StageValue::Cache(presents),
                ]))
            }
            values => {
                let expected = ["tensor", "cache", "cache", "tensor"];
                let (position, got) = values
                    .iter()
                    .enumerate()
                    .find(|(i, v)| v.kind_name() != expected[*i])
                    .map(|(i, v)| (i, v.kind_name()))
                    .unwrap_or((0, values[0].kind_name()));
                Err(PipelineError::ValueKind {
                    context: "post-transformer adapter",
                    position,
                    expected: expected[position],
                    got,
                }
                .into())
            }
        },
        arity => Err(PipelineError::AdapterArity {
            adapter: "post-transformer",
            arity,
            expected: "2 (training) or 4 (inference)",
        }
        .into()),
    }
}
