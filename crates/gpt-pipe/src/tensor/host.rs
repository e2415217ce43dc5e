//! Host-resident tensor storage.
//!
//! The pipeline core runs on one process and needs nothing fancier than a
//! densely packed host buffer per tensor. Storage is a typed enum rather than
//! a raw byte buffer; accessors panic on a dtype mismatch, which keeps call
//! sites in layer code free of redundant error plumbing (shapes and dtypes
//! are validated once at the operation boundary).

use super::shape::Shape;
use anyhow::{bail, Result};
use rand::Rng;

/// Scalar element type of a tensor payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    I32,
    Bool,
}

#[derive(Debug, Clone)]
enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    Bool(Vec<bool>),
}

/// Dense host tensor used for parameters, activations, and masks.
#[derive(Debug, Clone)]
pub struct Tensor {
    shape: Shape,
    data: TensorData,
}

impl Tensor {
    /// Constructs an `F32` tensor from raw values, validating the length against the shape.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor {
            shape,
            data: TensorData::F32(data),
        })
    }

    /// Constructs an `I32` tensor, typically holding token or position ids.
    pub fn from_i32(shape: Shape, data: Vec<i32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor {
            shape,
            data: TensorData::I32(data),
        })
    }

    /// Constructs a `Bool` tensor, typically holding an attention mask.
    pub fn from_bool(shape: Shape, data: Vec<bool>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor {
            shape,
            data: TensorData::Bool(data),
        })
    }

    /// Returns a zero-initialized `F32` tensor of the requested shape.
    pub fn zeros(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor {
            shape,
            data: TensorData::F32(vec![0.0; len]),
        }
    }

    /// Returns a one-initialized `F32` tensor of the requested shape.
    pub fn ones(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor {
            shape,
            data: TensorData::F32(vec![1.0; len]),
        }
    }

    /// Samples from `N(0, std^2)` using the Box-Muller transform.
    pub fn randn(shape: Shape, std: f32, rng: &mut impl Rng) -> Self {
        let len = shape.num_elements();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f32 = rng.gen::<f32>().max(f32::MIN_POSITIVE);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        Tensor {
            shape,
            data: TensorData::F32(values),
        }
    }

    /// Provides access to the tensor shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the scalar dtype of the tensor payload.
    pub fn dtype(&self) -> DType {
        match self.data {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
            TensorData::Bool(_) => DType::Bool,
        }
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    /// Reports whether the tensor contains zero elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows the underlying `f32` data slice, panicking if the dtype differs.
    pub fn data(&self) -> &[f32] {
        match &self.data {
            TensorData::F32(values) => values,
            _ => panic!("tensor data is not stored as f32"),
        }
    }

    /// Mutably borrows the `f32` data slice, panicking if the dtype differs.
    pub fn data_mut(&mut self) -> &mut [f32] {
        match &mut self.data {
            TensorData::F32(values) => values,
            _ => panic!("tensor data is not stored as mutable f32"),
        }
    }

    /// Borrows the underlying `i32` data slice, panicking if the dtype differs.
    pub fn data_i32(&self) -> &[i32] {
        match &self.data {
            TensorData::I32(values) => values,
            _ => panic!("tensor data is not stored as i32"),
        }
    }

    /// Borrows the underlying `bool` data slice, panicking if the dtype differs.
    pub fn data_bool(&self) -> &[bool] {
        match &self.data {
            TensorData::Bool(values) => values,
            _ => panic!("tensor data is not stored as bool"),
        }
    }

    /// Fills an `F32` tensor with a constant value.
    pub fn fill(&mut self, value: f32) {
        self.data_mut().fill(value);
    }

    /// Applies a unary function in place over every `f32` element.
    pub fn map_inplace<F>(&mut self, mut f: F)
    where
        F: FnMut(f32) -> f32,
    {
        for v in self.data_mut() {
            *v = f(*v);
        }
    }
}
