//! Arithmetic used while folding constant subgraphs.
//!
//! The compiler never computes values itself; it hands flat buffers to a
//! [`ComputeBackend`]. Data movement (permutation, broadcasting, slicing) is
//! not arithmetic and stays in the tensor model.

mod cpu;

pub use cpu::CpuBackend;

use crate::{dtype::TensorData, layer::ActivationKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn as_c_op(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }

    pub fn as_closure(&self) -> fn(f32, f32) -> f32 {
        match self {
            Self::Add => |x, y| x + y,
            Self::Sub => |x, y| x - y,
            Self::Mul => |x, y| x * y,
            Self::Div => |x, y| x / y,
        }
    }

    /// Integer form; `None` on overflow or division by zero.
    pub fn checked_int(&self, x: i64, y: i64) -> Option<i64> {
        match self {
            Self::Add => x.checked_add(y),
            Self::Sub => x.checked_sub(y),
            Self::Mul => x.checked_mul(y),
            Self::Div => x.checked_div(y),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Activation(ActivationKind),
    Neg,
    Reciprocal,
    Sqrt,
}

/// Synchronous executor for constant folding.
pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Elementwise `lhs op rhs` over buffers of equal length and type.
    fn binary(&self, op: BinaryOp, lhs: &TensorData, rhs: &TensorData) -> Result<TensorData>;

    fn unary(&self, op: UnaryOp, data: &TensorData) -> Result<TensorData>;

    /// `batch` independent row-major products `[m, k] x [k, n]`.
    #[allow(clippy::too_many_arguments)]
    fn matmul(
        &self,
        lhs: &[f32],
        rhs: &[f32],
        batch: usize,
        m: usize,
        k: usize,
        n: usize,
    ) -> Result<Vec<f32>>;

    /// Softmax over each consecutive run of `inner` elements.
    fn softmax(&self, data: &[f32], inner: usize) -> Result<Vec<f32>>;

    /// Mean over `axes` of a row-major buffer of `shape`, keeping reduced
    /// axes as extent 1.
    fn reduce_mean(&self, data: &[f32], shape: &[usize], axes: &[usize]) -> Result<Vec<f32>>;
}
