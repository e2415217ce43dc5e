pub mod host;
pub mod shape;

pub use host::{DType, Tensor};
pub use shape::Shape;
