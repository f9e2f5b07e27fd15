pub mod constant;
pub mod symbolic;

pub use constant::ConstantTensor;
pub use symbolic::{LayerId, LayerOutput, SymbolicTensor};

use crate::{TensorLayout, TensorShape};

/// A value flowing along a graph edge: either fully known at compile time or
/// produced by a layer at run time.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    Constant(ConstantTensor),
    Symbolic(SymbolicTensor),
}

impl Tensor {
    pub fn shape(&self) -> &TensorShape {
        match self {
            Self::Constant(t) => t.shape(),
            Self::Symbolic(t) => t.shape(),
        }
    }

    pub fn layout(&self) -> &TensorLayout {
        match self {
            Self::Constant(t) => t.layout(),
            Self::Symbolic(t) => t.layout(),
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Self::Constant(_))
    }

    pub fn as_constant(&self) -> Option<&ConstantTensor> {
        match self {
            Self::Constant(t) => Some(t),
            Self::Symbolic(_) => None,
        }
    }

    pub fn as_symbolic(&self) -> Option<&SymbolicTensor> {
        match self {
            Self::Symbolic(t) => Some(t),
            Self::Constant(_) => None,
        }
    }
}

impl From<ConstantTensor> for Tensor {
    fn from(value: ConstantTensor) -> Self {
        Self::Constant(value)
    }
}

impl From<SymbolicTensor> for Tensor {
    fn from(value: SymbolicTensor) -> Self {
        Self::Symbolic(value)
    }
}

/// Compute default (contiguous) strides for a tensor of given shape.
pub(crate) fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = Vec::with_capacity(shape.len());
    let mut acc = 1;
    // Iterate dims in reverse to accumulate products
    for dim in shape.iter().rev() {
        strides.push(acc);
        acc *= *dim;
    }
    strides.reverse();
    strides
}

/// Walk `dims` in row-major order, reading `data` at `base + sum(index * stride)`.
///
/// A zero stride repeats the same element along that axis.
pub(crate) fn gather_strided<T: Copy>(
    data: &[T],
    base: usize,
    dims: &[usize],
    strides: &[usize],
) -> Vec<T> {
    let count: usize = dims.iter().product();
    let mut out = Vec::with_capacity(count);
    let mut index = vec![0usize; dims.len()];
    let mut offset = base;
    for _ in 0..count {
        out.push(data[offset]);
        for axis in (0..dims.len()).rev() {
            index[axis] += 1;
            offset += strides[axis];
            if index[axis] < dims[axis] {
                break;
            }
            offset -= strides[axis] * dims[axis];
            index[axis] = 0;
        }
    }
    out
}

/// Reorder a row-major buffer so that output axis `k` is input axis `perm[k]`.
pub(crate) fn transpose<T: Copy>(data: &[T], shape: &[usize], perm: &[usize]) -> Vec<T> {
    if perm.iter().enumerate().all(|(i, p)| i == *p) {
        return data.to_vec();
    }
    let in_strides = contiguous_strides(shape);
    let dims: Vec<usize> = perm.iter().map(|p| shape[*p]).collect();
    let strides: Vec<usize> = perm.iter().map(|p| in_strides[*p]).collect();
    gather_strided(data, 0, &dims, &strides)
}

/// Repeat a buffer of shape `from` along its unit axes to shape `to`.
/// Both shapes have the same rank.
pub(crate) fn expand<T: Copy>(data: &[T], from: &[usize], to: &[usize]) -> Vec<T> {
    let strides: Vec<usize> = contiguous_strides(from)
        .into_iter()
        .zip(from.iter().zip(to))
        .map(|(s, (f, t))| if f == t { s } else { 0 })
        .collect();
    gather_strided(data, 0, to, &strides)
}

pub(crate) fn inverse_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; perm.len()];
    for (k, p) in perm.iter().enumerate() {
        inv[*p] = k;
    }
    inv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_2d() {
        let data = [1, 2, 3, 4, 5, 6];
        assert_eq!(transpose(&data, &[2, 3], &[1, 0]), vec![1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn transpose_then_inverse_is_identity() {
        let data: Vec<i64> = (0..24).collect();
        let perm = [2, 0, 1];
        let t = transpose(&data, &[2, 3, 4], &perm);
        let back = transpose(&t, &[4, 2, 3], &inverse_permutation(&perm));
        assert_eq!(back, data);
    }

    #[test]
    fn expand_repeats_unit_axes() {
        let data = [1.0f32, 2.0, 3.0];
        assert_eq!(
            expand(&data, &[1, 3], &[2, 3]),
            vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]
        );
        assert_eq!(expand(&[7.0f32, 8.0], &[2, 1], &[2, 2]), vec![7.0, 7.0, 8.0, 8.0]);
    }
}
