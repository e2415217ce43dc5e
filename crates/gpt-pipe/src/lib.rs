pub mod config;
pub mod error;
pub mod loss;
pub mod nn;
pub mod ops;
pub mod pipe;
pub mod profiling;
pub mod tensor;

pub use config::{GptPipeConfig, LayerKind};
pub use error::PipelineError;
pub use loss::CrossEntropyLoss;
pub use pipe::model::{GptPipeModel, PipeTopology};
pub use pipe::sequential::SequentialModel;
pub use tensor::{DType, Shape, Tensor};
