use std::sync::Arc;

use crate::{
    dtype::{map_data, DataType, TensorData},
    Error, Result, TensorLayout, TensorShape,
};

use super::{inverse_permutation, transpose};

const SITE: (&str, &str) = ("ConstantTensor", "");

/// A tensor whose values are known at compile time.
///
/// The buffer is immutable and shared between consumers. It is stored in the
/// physical order induced by the layout; an empty layout means source order.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantTensor {
    shape: TensorShape,
    layout: TensorLayout,
    data: Arc<TensorData>,
}

impl ConstantTensor {
    pub fn new(
        shape: impl Into<TensorShape>,
        layout: TensorLayout,
        data: impl Into<TensorData>,
    ) -> Result<Self> {
        let shape = shape.into();
        let data = data.into();
        if !layout.is_empty() && layout.rank() != shape.rank() {
            return Err(Error::internal(
                &SITE,
                format!("layout {layout} does not match shape {shape}"),
            ));
        }
        if data.len() != shape.element_count() {
            return Err(Error::internal(
                &SITE,
                format!(
                    "buffer holds {} elements but shape {shape} needs {}",
                    data.len(),
                    shape.element_count()
                ),
            ));
        }
        Ok(Self {
            shape,
            layout,
            data: Arc::new(data),
        })
    }

    /// A tensor with an uncommitted layout, data in source order.
    pub fn from_data(shape: impl Into<TensorShape>, data: impl Into<TensorData>) -> Result<Self> {
        Self::new(shape, TensorLayout::empty(), data)
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: TensorShape::scalar(),
            layout: TensorLayout::empty(),
            data: Arc::new(TensorData::Float(vec![value])),
        }
    }

    /// A rank-1 int tensor, the form shapes and indices take.
    pub fn ints(values: Vec<i64>) -> Self {
        Self {
            shape: TensorShape::new(vec![values.len()]),
            layout: TensorLayout::empty(),
            data: Arc::new(TensorData::Int(values)),
        }
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn layout(&self) -> &TensorLayout {
        &self.layout
    }

    /// The buffer in physical order.
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn data_type(&self) -> DataType {
        self.data.data_type()
    }

    /// The buffer in source axis order.
    pub fn source_data(&self) -> TensorData {
        if !self.layout.is_transposed() {
            return self.data.as_ref().clone();
        }
        let perm = self.layout.source_order_permutation(self.shape.rank());
        let physical = self.shape.permuted(&perm);
        let inv = inverse_permutation(&perm);
        map_data!(self.data.as_ref(), v => transpose(v, physical.dims(), &inv))
    }

    /// Source-order values as floats.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.source_data().to_f32_vec()
    }

    /// Source-order values as ints.
    pub fn to_i64_vec(&self) -> Vec<i64> {
        self.source_data().to_i64_vec()
    }

    /// The same values laid out under `target`, permuting the buffer if the
    /// physical order changes.
    pub fn to_layout(&self, target: &TensorLayout) -> Result<Self> {
        if &self.layout == target {
            return Ok(self.clone());
        }
        if !target.is_empty() && target.rank() != self.shape.rank() {
            return Err(Error::internal(
                &SITE,
                format!("cannot lay out {} as {target}", self.shape),
            ));
        }
        let extents = self.shape.dims();
        if !self.layout.moves_data(target, extents) {
            return Ok(Self {
                shape: self.shape.clone(),
                layout: target.clone(),
                data: self.data.clone(),
            });
        }
        let source = self.source_data();
        let perm = target.source_order_permutation(self.shape.rank());
        let data = map_data!(&source, v => transpose(v, extents, &perm));
        Self::new(self.shape.clone(), target.clone(), data)
    }

    /// Same values under a new shape with the same element count, in source
    /// order.
    pub fn reshaped(&self, shape: impl Into<TensorShape>) -> Result<Self> {
        let shape = shape.into();
        if shape.element_count() != self.shape.element_count() {
            return Err(Error::internal(
                &SITE,
                format!("cannot reshape {} into {shape}", self.shape),
            ));
        }
        if !self.layout.is_transposed() {
            return Ok(Self {
                shape,
                layout: TensorLayout::empty(),
                data: self.data.clone(),
            });
        }
        Self::from_data(shape, self.source_data())
    }

    /// Same values converted to another element type, in source order.
    pub fn cast(&self, dtype: DataType) -> Result<Self> {
        if self.data_type() == dtype {
            return Ok(self.clone());
        }
        Self::new(self.shape.clone(), self.layout.clone(), self.data.cast(dtype))
    }
}
