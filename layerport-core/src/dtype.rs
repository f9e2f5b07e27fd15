use std::fmt::{self, Debug, Display};

/// Element type tag of a constant buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// 32-bit float, used for weights and activations.
    Float,
    /// 64-bit signed integer, used for shapes and indices.
    Int,
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float => write!(f, "float"),
            Self::Int => write!(f, "int64"),
        }
    }
}

impl DataType {
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Float => 4,
            Self::Int => 8,
        }
    }
}

/// Marker trait for constant element types.
pub trait DType: Debug + Copy + PartialEq + Send + Sync + 'static {
    const ZERO: Self;
    const ONE: Self;
    const C_NAME: &'static str;
    const INTEGRAL: bool;
    const DATA_TYPE: DataType;

    fn to_f64(&self) -> f64;
    fn from_f64(x: f64) -> Self;

    fn slice(data: &TensorData) -> Option<&[Self]>;
    fn wrap(values: Vec<Self>) -> TensorData;
}

macro_rules! dtype {
    ($rt:ident, $variant:ident, $zero:expr, $one:expr, $c_repr:expr, $integral:expr) => {
        impl DType for $rt {
            const ZERO: $rt = $zero;
            const ONE: $rt = $one;
            const C_NAME: &'static str = $c_repr;
            const INTEGRAL: bool = $integral;
            const DATA_TYPE: DataType = DataType::$variant;

            fn to_f64(&self) -> f64 {
                *self as f64
            }

            fn from_f64(x: f64) -> Self {
                x as $rt
            }

            fn slice(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn wrap(values: Vec<Self>) -> TensorData {
                TensorData::$variant(values)
            }
        }
    };
}

dtype!(f32, Float, 0f32, 1f32, "float", false);
dtype!(i64, Int, 0i64, 1i64, "int64_t", true);

/// A flat element buffer.
#[derive(Clone, PartialEq)]
pub enum TensorData {
    Float(Vec<f32>),
    Int(Vec<i64>),
}

/// Apply a type-generic expression to whichever buffer is stored, rewrapping
/// the result in the same variant.
macro_rules! map_data {
    ($data:expr, $v:ident => $body:expr) => {
        match $data {
            $crate::dtype::TensorData::Float($v) => $crate::dtype::TensorData::Float($body),
            $crate::dtype::TensorData::Int($v) => $crate::dtype::TensorData::Int($body),
        }
    };
}
pub(crate) use map_data;

impl Debug for TensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "Float({v:?})"),
            Self::Int(v) => write!(f, "Int({v:?})"),
        }
    }
}

impl TensorData {
    pub fn zeros(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::Float => Self::Float(vec![0.; len]),
            DataType::Int => Self::Int(vec![0; len]),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Int(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Float(_) => DataType::Float,
            Self::Int(_) => DataType::Int,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        f32::slice(self)
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        i64::slice(self)
    }

    /// Values converted to float, whatever the stored type.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Self::Float(v) => v.clone(),
            Self::Int(v) => v.iter().map(|x| *x as f32).collect(),
        }
    }

    /// Values converted to int (truncating floats), whatever the stored type.
    pub fn to_i64_vec(&self) -> Vec<i64> {
        match self {
            Self::Float(v) => v.iter().map(|x| *x as i64).collect(),
            Self::Int(v) => v.clone(),
        }
    }

    /// Convert to another element type.
    pub fn cast(&self, dtype: DataType) -> Self {
        match dtype {
            DataType::Float => Self::Float(self.to_f32_vec()),
            DataType::Int => Self::Int(self.to_i64_vec()),
        }
    }

    /// Little-endian byte image of the buffer.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Self::Float(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Int(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    /// Decode a little-endian byte image. Returns `None` if the length is not a
    /// multiple of the element size.
    pub fn from_le_bytes(dtype: DataType, bytes: &[u8]) -> Option<Self> {
        if bytes.len() % dtype.byte_size() != 0 {
            return None;
        }
        Some(match dtype {
            DataType::Float => Self::Float(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DataType::Int => Self::Int(
                bytes
                    .chunks_exact(8)
                    .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
        })
    }
}

impl From<Vec<f32>> for TensorData {
    fn from(value: Vec<f32>) -> Self {
        Self::Float(value)
    }
}

impl From<Vec<i64>> for TensorData {
    fn from(value: Vec<i64>) -> Self {
        Self::Int(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_bytes_are_bit_exact() {
        let data = TensorData::Float(vec![1.5, -0.0, f32::MIN_POSITIVE, 3.25e7]);
        let bytes = data.to_le_bytes();
        assert_eq!(bytes.len(), 16);
        let back = TensorData::from_le_bytes(DataType::Float, &bytes).unwrap();
        assert_eq!(back.to_le_bytes(), bytes);
    }

    #[test]
    fn ragged_bytes_are_rejected() {
        assert!(TensorData::from_le_bytes(DataType::Int, &[0u8; 12]).is_none());
    }

    #[test]
    fn map_data_keeps_variant() {
        let data = TensorData::Int(vec![3, 1, 2]);
        let rev = map_data!(&data, v => v.iter().rev().copied().collect());
        assert_eq!(rev, TensorData::Int(vec![2, 1, 3]));
    }
}
