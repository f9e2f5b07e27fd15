use std::{
    fmt::{self, Display},
    ops::Index,
};

/// Ordered extents of a tensor. Rank 0 is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TensorShape(Vec<usize>);

impl TensorShape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn element_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major strides in source axis order.
    pub fn strides(&self) -> Vec<usize> {
        crate::tensor::contiguous_strides(&self.0)
    }

    /// Extents listed in the order given by `perm`.
    pub fn permuted(&self, perm: &[usize]) -> Self {
        Self(perm.iter().map(|p| self.0[*p]).collect())
    }

    pub fn into_vec(self) -> Vec<usize> {
        self.0
    }
}

impl Index<usize> for TensorShape {
    type Output = usize;

    fn index(&self, index: usize) -> &usize {
        &self.0[index]
    }
}

impl From<Vec<usize>> for TensorShape {
    fn from(value: Vec<usize>) -> Self {
        Self(value)
    }
}

impl From<&[usize]> for TensorShape {
    fn from(value: &[usize]) -> Self {
        Self(value.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for TensorShape {
    fn from(value: [usize; N]) -> Self {
        Self(value.to_vec())
    }
}

impl Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_and_count() {
        let s = TensorShape::from([2, 3, 4]);
        assert_eq!(s.strides(), vec![12, 4, 1]);
        assert_eq!(s.element_count(), 24);
        assert_eq!(TensorShape::scalar().element_count(), 1);
        assert_eq!(s.to_string(), "[2, 3, 4]");
    }
}
