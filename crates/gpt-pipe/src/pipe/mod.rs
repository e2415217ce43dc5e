//! The pipeline core: stage descriptors, boundary adapters, the sequence
//! builder, the pipeline-partitioned model, and the sequential reconstructor.

pub mod adapters;
pub mod builder;
pub mod io;
pub mod model;
pub mod sequential;
pub mod spec;

pub use adapters::AdapterKind;
pub use builder::{build_layer_sequence, validate_sequence};
pub use io::{causal_mask, KvCacheSet, StageIo, StageValue};
pub use model::{partition_stages, GptPipeModel, PipeTopology};
pub use sequential::{BuiltStage, SequentialModel};
pub use spec::{BlockKind, MaskRule, StageSpec, TieKey};
