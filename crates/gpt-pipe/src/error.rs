//! Typed errors for model assembly and stage-boundary contracts.
//!
//! Two families exist: configuration errors detected while the stage sequence
//! is assembled, and contract violations detected while data crosses a stage
//! boundary. Both are fatal and surface synchronously at the point of
//! detection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("layer kind table has {got} entries but the model declares {expected} layers")]
    LayerKindTableLength { got: usize, expected: usize },

    #[error("tie key '{key}' appears {count} time(s) in the stage sequence, expected exactly two")]
    TieCardinality { key: String, count: usize },

    #[error("tie key '{key}' names {owners} owner(s) and {receivers} receiver(s), expected one of each with the owner first")]
    TieShape {
        key: String,
        owners: usize,
        receivers: usize,
    },

    #[error("tied stage '{key}' has no owner earlier in the sequence")]
    UnboundTiedStage { key: String },

    #[error("{adapter} adapter received a {arity}-value tuple, expected {expected}")]
    AdapterArity {
        adapter: &'static str,
        arity: usize,
        expected: &'static str,
    },

    #[error("{context} expected a {expected} at tuple position {position}, got {got}")]
    ValueKind {
        context: &'static str,
        position: usize,
        expected: &'static str,
        got: &'static str,
    },

    #[error("final stage kind '{kind}' does not accept a gather-output flag")]
    HeadCapability { kind: &'static str },

    #[error("cannot partition {items} stages across {parts} pipeline stages")]
    Partition { items: usize, parts: usize },

    #[error("pipeline stage id {stage_id} out of range for {num_stages} stages")]
    StageOutOfRange {
        stage_id: usize,
        num_stages: usize,
    },
}
