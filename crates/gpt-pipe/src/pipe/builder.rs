//! Constructs the ordered stage-descriptor sequence for a model.

use super::adapters::AdapterKind;
use super::spec::{BlockKind, MaskRule, StageSpec, TieKey};
use crate::config::GptPipeConfig;
use crate::error::PipelineError;
use std::collections::HashMap;

/// Produces the complete stage sequence:
/// embeddings, pre-adapter, one block per layer, post-adapter, final norm,
/// and the LM head (tied back to the embeddings or standalone).
///
/// Deterministic and side-effect free; nothing is constructed here. The
/// `caching` flag is baked into the standard-block descriptors as their
/// construction-time default, exactly like the gather/inference flags on the
/// head.
pub fn build_layer_sequence(
    config: &GptPipeConfig,
    gather_output: bool,
    inference: bool,
    caching: bool,
) -> Result<Vec<StageSpec>, PipelineError> {
    config.validate()?;
    let mask = MaskRule::CausalFill {
        fill: config.mask_fill,
    };

    let mut specs = Vec::with_capacity(config.num_layers + 5);

    specs.push(StageSpec::Embedding {
        tie: config.weight_tying.then(TieKey::embed),
    });

    specs.push(StageSpec::Adapter(AdapterKind::PreTransformer));

    for (index, kind) in config.layer_kinds.iter().enumerate() {
        let kind = if kind.is_gated() {
            BlockKind::GatedMlp { mask }
        } else {
            BlockKind::Standard { mask, caching }
        };
        specs.push(StageSpec::TransformerBlock { index, kind });
    }

    specs.push(StageSpec::Adapter(AdapterKind::PostTransformer));
    specs.push(StageSpec::FinalNorm);

    if config.weight_tying {
        specs.push(StageSpec::TiedLmHead {
            tie: TieKey::embed(),
            gather_output,
        });
    } else {
        specs.push(StageSpec::LmHead {
            gather_output,
            inference,
        });
    }

    Ok(specs)
}

/// Checks the weight-tying invariant over an arbitrary sequence: every tie
/// key names exactly one owner and exactly one receiver, owner first.
///
/// Sequences from [`build_layer_sequence`] satisfy this by construction;
/// the check guards hand-assembled or deserialized sequences.
pub fn validate_sequence(specs: &[StageSpec]) -> Result<(), PipelineError> {
    let mut owners: HashMap<&TieKey, usize> = HashMap::new();
    let mut receivers: HashMap<&TieKey, usize> = HashMap::new();

    for spec in specs {
        let Some(key) = spec.tie_key() else {
            continue;
        };
        if spec.is_tie_receiver() {
            if !owners.contains_key(key) {
                return Err(PipelineError::UnboundTiedStage {
                    key: key.to_string(),
                });
            }
            *receivers.entry(key).or_default() += 1;
        } else {
            *owners.entry(key).or_default() += 1;
        }
    }

    for (key, &owner_count) in &owners {
        let receiver_count = receivers.get(key).copied().unwrap_or(0);
        let total = owner_count + receiver_count;
        if total != 2 {
            return Err(PipelineError::TieCardinality {
                key: key.to_string(),
                count: total,
            });
        }
        if owner_count != 1 || receiver_count != 1 {
            return Err(PipelineError::TieShape {
                key: key.to_string(),
                owners: owner_count,
                receivers: receiver_count,
            });
        }
    }
    Ok(())
}
