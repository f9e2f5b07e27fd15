use gemm::{gemm, Parallelism};
use rayon::prelude::*;

use crate::{dtype::TensorData, Error, Result};

use super::{BinaryOp, ComputeBackend, UnaryOp};

/// Reference backend running on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    fn site(op: &str) -> (&'static str, &str) {
        ("CpuBackend", op)
    }
}

fn parallelism() -> Parallelism {
    let num_threads = num_cpus::get();
    if num_threads > 1 {
        Parallelism::Rayon(num_threads)
    } else {
        Parallelism::None
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn binary(&self, op: BinaryOp, lhs: &TensorData, rhs: &TensorData) -> Result<TensorData> {
        if lhs.len() != rhs.len() {
            return Err(Error::internal(
                &Self::site(op.as_c_op()),
                format!("operand lengths differ: {} vs {}", lhs.len(), rhs.len()),
            ));
        }
        match (lhs, rhs) {
            (TensorData::Float(a), TensorData::Float(b)) => {
                let f = op.as_closure();
                Ok(TensorData::Float(
                    a.par_iter().zip(b.par_iter()).map(|(x, y)| f(*x, *y)).collect(),
                ))
            }
            (TensorData::Int(a), TensorData::Int(b)) => {
                let out: Option<Vec<i64>> = a
                    .par_iter()
                    .zip(b.par_iter())
                    .map(|(x, y)| op.checked_int(*x, *y))
                    .collect();
                out.map(TensorData::Int).ok_or_else(|| {
                    Error::unsupported(
                        &Self::site(op.as_c_op()),
                        "integer overflow or division by zero in constant",
                    )
                })
            }
            _ => Err(Error::internal(
                &Self::site(op.as_c_op()),
                format!(
                    "operand types differ: {} vs {}",
                    lhs.data_type(),
                    rhs.data_type()
                ),
            )),
        }
    }

    fn unary(&self, op: UnaryOp, data: &TensorData) -> Result<TensorData> {
        match data {
            TensorData::Float(v) => {
                let out = match op {
                    UnaryOp::Activation(kind) => v.par_iter().map(|x| kind.apply(*x)).collect(),
                    UnaryOp::Neg => v.par_iter().map(|x| -x).collect(),
                    UnaryOp::Reciprocal => v.par_iter().map(|x| 1. / x).collect(),
                    UnaryOp::Sqrt => v.par_iter().map(|x| x.sqrt()).collect(),
                };
                Ok(TensorData::Float(out))
            }
            TensorData::Int(v) => match op {
                UnaryOp::Neg => v
                    .iter()
                    .map(|x| x.checked_neg())
                    .collect::<Option<Vec<_>>>()
                    .map(TensorData::Int)
                    .ok_or_else(|| {
                        Error::unsupported(&Self::site("-"), "integer overflow in constant negation")
                    }),
                UnaryOp::Activation(kind) => Ok(TensorData::Int(
                    v.iter().map(|x| kind.apply(*x as f32) as i64).collect(),
                )),
                other => Err(Error::unsupported(
                    &Self::site("unary"),
                    format!("{other:?} on int64 constants"),
                )),
            },
        }
    }

    fn matmul(
        &self,
        lhs: &[f32],
        rhs: &[f32],
        batch: usize,
        m: usize,
        k: usize,
        n: usize,
    ) -> Result<Vec<f32>> {
        if lhs.len() != batch * m * k || rhs.len() != batch * k * n {
            return Err(Error::internal(
                &Self::site("matmul"),
                format!("buffers do not hold {batch} x [{m}, {k}] x [{k}, {n}]"),
            ));
        }
        let mut out = vec![0f32; batch * m * n];
        if m == 0 || n == 0 {
            return Ok(out);
        }
        let parallelism = parallelism();
        for b in 0..batch {
            let lhs_p = &lhs[b * m * k..];
            let rhs_p = &rhs[b * k * n..];
            let out_p = &mut out[b * m * n..];

            // SAFETY: the slices hold at least m*k, k*n and m*n elements with
            // the row-major strides passed here.
            unsafe {
                gemm(
                    /* m: usize = */ m,
                    /* n: usize = */ n,
                    /* k: usize = */ k,
                    /* dst: *mut T = */ out_p.as_mut_ptr(),
                    /* dst_cs: isize = */ 1,
                    /* dst_rs: isize = */ n as isize,
                    /* read_dst: bool = */ false,
                    /* lhs: *const T = */ lhs_p.as_ptr(),
                    /* lhs_cs: isize = */ 1,
                    /* lhs_rs: isize = */ k as isize,
                    /* rhs: *const T = */ rhs_p.as_ptr(),
                    /* rhs_cs: isize = */ 1,
                    /* rhs_rs: isize = */ n as isize,
                    /* alpha: T = */ 0f32,
                    /* beta: T = */ 1f32,
                    /* conj_dst: bool = */ false,
                    /* conj_lhs: bool = */ false,
                    /* conj_rhs: bool = */ false,
                    parallelism,
                )
            }
        }
        Ok(out)
    }

    fn softmax(&self, data: &[f32], inner: usize) -> Result<Vec<f32>> {
        if inner == 0 || data.len() % inner != 0 {
            return Err(Error::internal(
                &Self::site("softmax"),
                format!("{} elements do not split into rows of {inner}", data.len()),
            ));
        }
        let mut out = data.to_vec();
        out.par_chunks_mut(inner).for_each(|row| {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0f32;
            for x in row.iter_mut() {
                *x = (*x - max).exp();
                sum += *x;
            }
            for x in row.iter_mut() {
                *x /= sum;
            }
        });
        Ok(out)
    }

    fn reduce_mean(&self, data: &[f32], shape: &[usize], axes: &[usize]) -> Result<Vec<f32>> {
        if data.len() != shape.iter().product::<usize>() || axes.iter().any(|a| *a >= shape.len())
        {
            return Err(Error::internal(
                &Self::site("reduce_mean"),
                format!("cannot reduce {shape:?} over {axes:?}"),
            ));
        }
        let out_shape: Vec<usize> = shape
            .iter()
            .enumerate()
            .map(|(i, d)| if axes.contains(&i) { 1 } else { *d })
            .collect();
        let out_strides = crate::tensor::contiguous_strides(&out_shape);
        let count: usize = axes.iter().map(|a| shape[*a]).product();
        let mut sums = vec![0f32; out_shape.iter().product()];
        let mut index = vec![0usize; shape.len()];
        for value in data {
            let offset: usize = index
                .iter()
                .zip(&out_shape)
                .zip(&out_strides)
                .map(|((i, d), s)| if *d == 1 { 0 } else { i * s })
                .sum();
            sums[offset] += value;
            for axis in (0..shape.len()).rev() {
                index[axis] += 1;
                if index[axis] < shape[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        let scale = 1. / count.max(1) as f32;
        Ok(sums.into_iter().map(|s| s * scale).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::ActivationKind;

    #[test]
    fn matmul_2x3_3x2() {
        let lhs = [1., 2., 3., 4., 5., 6.];
        let rhs = [7., 8., 9., 10., 11., 12.];
        let out = CpuBackend.matmul(&lhs, &rhs, 1, 2, 3, 2).unwrap();
        assert_eq!(out, vec![58., 64., 139., 154.]);
    }

    #[test]
    fn int_division_by_zero_is_rejected() {
        let err = CpuBackend
            .binary(
                BinaryOp::Div,
                &TensorData::Int(vec![4, 2]),
                &TensorData::Int(vec![2, 0]),
            )
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Unsupported);
    }

    #[test]
    fn int_negation_overflow_is_rejected() {
        let out = CpuBackend
            .unary(UnaryOp::Neg, &TensorData::Int(vec![3, -7]))
            .unwrap();
        assert_eq!(out, TensorData::Int(vec![-3, 7]));
        let err = CpuBackend
            .unary(UnaryOp::Neg, &TensorData::Int(vec![1, i64::MIN]))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Unsupported);
        assert!(err.to_string().contains("overflow"));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let out = CpuBackend.softmax(&[1., 2., 3., 0., 0., 0.], 3).unwrap();
        let first: f32 = out[..3].iter().sum();
        assert!((first - 1.).abs() < 1e-6);
        assert!((out[3] - 1. / 3.).abs() < 1e-6);
    }

    #[test]
    fn reduce_mean_over_last_axes() {
        let data: Vec<f32> = (0..12).map(|x| x as f32).collect();
        let out = CpuBackend.reduce_mean(&data, &[2, 2, 3], &[1, 2]).unwrap();
        assert_eq!(out, vec![2.5, 8.5]);
        let out = CpuBackend.reduce_mean(&data, &[2, 2, 3], &[0]).unwrap();
        assert_eq!(out, vec![3., 4., 5., 6., 7., 8.]);
    }

    #[test]
    fn relu_fold() {
        let out = CpuBackend
            .unary(
                UnaryOp::Activation(ActivationKind::Relu),
                &TensorData::Float(vec![-1., 0.5]),
            )
            .unwrap();
        assert_eq!(out, TensorData::Float(vec![0., 0.5]));
    }
}
