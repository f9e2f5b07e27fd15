use crate::{
    attributes::Attributes,
    backend::{BinaryOp, ComputeBackend},
    broadcast::{broadcast_constant, broadcast_shapes, BroadcastMode},
    descriptor::NodeDescriptor,
    dtype::{DataType, TensorData},
    layer::LayerKind,
    roles::RoleTable,
    tensor::{expand, transpose},
    ConstantTensor, Dim, Error, Result, Tensor, TensorLayout, TensorShape,
};

use super::{LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator};

/// `data * factor`, skipping the multiplication for a unit factor.
fn scaled(backend: &dyn ComputeBackend, data: TensorData, factor: f32) -> Result<TensorData> {
    if factor == 1. {
        return Ok(data);
    }
    let factors = TensorData::Float(vec![factor; data.len()]);
    backend.binary(BinaryOp::Mul, &data.cast(DataType::Float), &factors)
}

/// Weights `[K, N]` for a fully connected layer: stored as `[N, K]`.
fn weights_layout(transposed: bool) -> Result<TensorLayout> {
    if transposed {
        TensorLayout::new(vec![Dim::BatchWidth, Dim::Channels])
    } else {
        TensorLayout::new(vec![Dim::Channels, Dim::BatchWidth])
    }
}

/// `Y = alpha * op(A) * op(B) + beta * C`.
#[derive(Debug, Clone)]
pub struct Gemm {
    header: OpHeader,
    alpha: f32,
    beta: f32,
    trans_a: bool,
    trans_b: bool,
}

struct GemmDims {
    m: usize,
    k: usize,
    n: usize,
}

impl Gemm {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (2, 3), (1, 1))?;
        let attrs = Attributes::new(node);
        Ok(Operator::Gemm(Self {
            alpha: attrs.get_optional("alpha", 1f32)?,
            beta: attrs.get_optional("beta", 1f32)?,
            trans_a: attrs.get_optional("transA", 0i64)? != 0,
            trans_b: attrs.get_optional("transB", 0i64)? != 0,
            header,
        }))
    }

    fn dims(&self, a: &TensorShape, b: &TensorShape) -> Result<GemmDims> {
        if a.rank() != 2 || b.rank() != 2 {
            return Err(Error::malformed(
                &self.header,
                format!("operands {a} and {b} are not matrices"),
            ));
        }
        let (m, k) = if self.trans_a { (a[1], a[0]) } else { (a[0], a[1]) };
        let (kb, n) = if self.trans_b { (b[1], b[0]) } else { (b[0], b[1]) };
        if k != kb {
            return Err(Error::malformed(
                &self.header,
                format!("inner dimensions differ: {k} and {kb}"),
            ));
        }
        Ok(GemmDims { m, k, n })
    }

    /// The bias as one value per output column, scaled by `beta`.
    fn column_bias(
        &self,
        c: &ConstantTensor,
        n: usize,
        backend: &dyn ComputeBackend,
    ) -> Result<ConstantTensor> {
        let rank = c.shape().rank();
        if rank > 2 || (rank == 2 && c.shape()[0] != 1) {
            return Err(Error::unsupported(
                &self.header,
                format!("bias {} that varies along the batch", c.shape()),
            ));
        }
        let row = TensorShape::from([1, n]);
        broadcast_shapes(&self.header, &row, c.shape(), BroadcastMode::Numpy)?;
        let expanded = broadcast_constant(c, 2 - rank, &row)?;
        let data = scaled(backend, expanded.source_data().cast(DataType::Float), self.beta)?;
        ConstantTensor::new([n], TensorLayout::new(vec![Dim::Channels])?, data)
    }
}

impl LayerOperator for Gemm {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let GemmDims { m, n, .. } = self.dims(inputs.shape(0)?, inputs.shape(1)?)?;
        let out = TensorShape::from([m, n]);
        if let Some(c) = inputs.optional(2) {
            let b = broadcast_shapes(&self.header, &out, c.shape, BroadcastMode::Numpy)?;
            if b != out {
                return Err(Error::malformed(
                    &self.header,
                    format!("bias {} does not broadcast to {out}", c.shape),
                ));
            }
        }
        Ok(vec![out])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let (a, b) = (inputs.constant(0)?, inputs.constant(1)?);
        let GemmDims { m, k, n } = self.dims(a.shape(), b.shape())?;
        let operand = |t: &ConstantTensor, trans: bool| -> Vec<f32> {
            let v = t.to_f32_vec();
            if trans {
                transpose(&v, t.shape().dims(), &[1, 0])
            } else {
                v
            }
        };
        let product = backend.matmul(&operand(a, self.trans_a), &operand(b, self.trans_b), 1, m, k, n)?;
        let mut out = scaled(backend, TensorData::Float(product), self.alpha)?;
        if let Some(c) = inputs.optional_constant(2)? {
            let shape = TensorShape::from([m, n]);
            let offset = 2 - c.shape().rank();
            let bias = broadcast_constant(c, offset, &shape)?.source_data();
            let bias = scaled(backend, bias.cast(DataType::Float), self.beta)?;
            out = backend.binary(BinaryOp::Add, &out, &bias)?;
        }
        Ok(vec![ConstantTensor::from_data([m, n], out)?])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        table.require_layout(&self.header, io.output(0)?, &[Dim::BatchWidth, Dim::Channels])?;
        if let Some(a) = io.input(0) {
            let dims = if self.trans_a {
                [Dim::Channels, Dim::BatchWidth]
            } else {
                [Dim::BatchWidth, Dim::Channels]
            };
            table.require_layout(&self.header, a, &dims)?;
        }
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let b = ctx.constant_input(1, "second operand")?.clone();
        let c = ctx.optional_constant_input(2, "bias")?.cloned();
        let GemmDims { m, n, .. } = self.dims(ctx.input(0)?.shape(), b.shape())?;

        let weights = scaled(ctx.backend(), b.source_data().cast(DataType::Float), self.alpha)?;
        let weights = ConstantTensor::from_data(b.shape().clone(), weights)?
            .to_layout(&weights_layout(self.trans_b)?)?;
        let free_term = match c {
            Some(c) => Some(self.column_bias(&c, n, ctx.backend())?),
            None => None,
        };

        let a_layout = if self.trans_a {
            TensorLayout::new(vec![Dim::Channels, Dim::BatchWidth])?
        } else {
            TensorLayout::new(vec![Dim::BatchWidth, Dim::Channels])?
        };
        let a = ctx.input_as(0, &a_layout)?;
        let id = ctx.add_layer(
            None,
            LayerKind::FullyConnected { weights, free_term },
            vec![a.output()],
        )?;
        let out_layout = TensorLayout::new(vec![Dim::BatchWidth, Dim::Channels])?;
        Ok(vec![ctx
            .layer_output(id, TensorShape::from([m, n]), out_layout)?
            .into()])
    }
}

/// Numpy-style matrix product.
#[derive(Debug, Clone)]
pub struct MatMul {
    header: OpHeader,
}

/// Operand shapes promoted to matrices, with the broadcast batch.
struct MatMulDims {
    batch: TensorShape,
    a: TensorShape,
    b: TensorShape,
    m: usize,
    k: usize,
    n: usize,
    output: TensorShape,
}

impl MatMul {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (2, 2), (1, 1))?;
        Ok(Operator::MatMul(Self { header }))
    }

    fn dims(&self, a: &TensorShape, b: &TensorShape) -> Result<MatMulDims> {
        if a.rank() == 0 || b.rank() == 0 {
            return Err(Error::malformed(&self.header, "scalar operand"));
        }
        let a2 = if a.rank() == 1 {
            TensorShape::from([1, a[0]])
        } else {
            a.clone()
        };
        let b2 = if b.rank() == 1 {
            TensorShape::from([b[0], 1])
        } else {
            b.clone()
        };
        let (ra, rb) = (a2.rank(), b2.rank());
        let (m, k) = (a2[ra - 2], a2[ra - 1]);
        let (kb, n) = (b2[rb - 2], b2[rb - 1]);
        if k != kb {
            return Err(Error::malformed(
                &self.header,
                format!("inner dimensions of {a} and {b} differ"),
            ));
        }
        let batch = broadcast_shapes(
            &self.header,
            &TensorShape::from(&a2.dims()[..ra - 2]),
            &TensorShape::from(&b2.dims()[..rb - 2]),
            BroadcastMode::Numpy,
        )?;
        let mut output = batch.dims().to_vec();
        if a.rank() > 1 {
            output.push(m);
        }
        if b.rank() > 1 {
            output.push(n);
        }
        Ok(MatMulDims {
            batch,
            a: a2,
            b: b2,
            m,
            k,
            n,
            output: TensorShape::new(output),
        })
    }

    /// Input layouts the fully connected layer accepts.
    fn data_layout(rank: usize) -> Option<Vec<Dim>> {
        match rank {
            2 => Some(vec![Dim::BatchWidth, Dim::Channels]),
            3 => Some(vec![Dim::BatchLength, Dim::BatchWidth, Dim::Channels]),
            4 => Some(vec![
                Dim::BatchLength,
                Dim::BatchWidth,
                Dim::ListSize,
                Dim::Channels,
            ]),
            _ => None,
        }
    }
}

impl LayerOperator for MatMul {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        Ok(vec![self.dims(inputs.shape(0)?, inputs.shape(1)?)?.output])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let (a, b) = (inputs.constant(0)?, inputs.constant(1)?);
        let d = self.dims(a.shape(), b.shape())?;
        let batched = |t: &ConstantTensor, matrix: &TensorShape| -> Vec<f32> {
            let mut from = vec![1; d.batch.rank() + 2 - matrix.rank()];
            from.extend_from_slice(matrix.dims());
            let mut to = d.batch.dims().to_vec();
            to.extend_from_slice(&matrix.dims()[matrix.rank() - 2..]);
            expand(&t.to_f32_vec(), &from, &to)
        };
        let product = backend.matmul(
            &batched(a, &d.a),
            &batched(b, &d.b),
            d.batch.element_count(),
            d.m,
            d.k,
            d.n,
        )?;
        Ok(vec![ConstantTensor::from_data(d.output, product)?])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        let (Some(a), Some(b)) = (io.input(0), io.input(1)) else {
            return Ok(());
        };
        if !table.is_constant(b) || table.shape(b)?.rank() != 2 {
            return Ok(());
        }
        if let Some(dims) = Self::data_layout(table.shape(a)?.rank()) {
            table.require_layout(&self.header, a, &dims)?;
            table.require_layout(&self.header, io.output(0)?, &dims)?;
        }
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let b = ctx.constant_input(1, "second operand")?.clone();
        if b.shape().rank() != 2 {
            return Err(Error::unsupported(
                &self.header,
                format!("constant second operand of rank {}", b.shape().rank()),
            ));
        }
        let rank = ctx.input(0)?.shape().rank();
        let dims = Self::data_layout(rank).ok_or_else(|| {
            Error::unsupported(&self.header, format!("first operand of rank {rank}"))
        })?;
        let layout = TensorLayout::new(dims)?;
        let weights = b.cast(DataType::Float)?.to_layout(&weights_layout(false)?)?;
        let out_shape = ctx.output_shape(0)?.clone();
        let a = ctx.input_as(0, &layout)?;
        let id = ctx.add_layer(
            None,
            LayerKind::FullyConnected {
                weights,
                free_term: None,
            },
            vec![a.output()],
        )?;
        Ok(vec![ctx.layer_output(id, out_shape, layout)?.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::CpuBackend, ops::constant_operands, ErrorKind};

    #[test]
    fn gemm_fold_with_bias() {
        let node = NodeDescriptor::new("Gemm", "g")
            .input("a")
            .input("b")
            .input("c")
            .output("y")
            .attr("transB", 1i64)
            .attr("alpha", 2f32);
        let op = Gemm::build(&node, 11).unwrap();
        let header = op.header().clone();
        let a = ConstantTensor::from_data([1, 2], vec![1f32, 2.]).unwrap();
        // B is stored transposed: op(B) = [[1, 0, 1], [0, 1, 1]]
        let b = ConstantTensor::from_data([3, 2], vec![1f32, 0., 0., 1., 1., 1.]).unwrap();
        let c = ConstantTensor::from_data([3], vec![10f32, 20., 30.]).unwrap();
        let out = op
            .fold(&constant_operands(&header, &[&a, &b, &c]), &CpuBackend)
            .unwrap();
        assert_eq!(out[0].shape(), &TensorShape::from([1, 3]));
        assert_eq!(out[0].to_f32_vec(), vec![12., 24., 36.]);
    }

    #[test]
    fn gemm_inner_mismatch_is_malformed() {
        let node = NodeDescriptor::new("Gemm", "g").input("a").input("b").output("y");
        let Operator::Gemm(g) = Gemm::build(&node, 11).unwrap() else { panic!() };
        let err = g
            .dims(&TensorShape::from([2, 3]), &TensorShape::from([4, 5]))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn matmul_batches_broadcast() {
        let node = NodeDescriptor::new("MatMul", "m").input("a").input("b").output("y");
        let op = MatMul::build(&node, 11).unwrap();
        let header = op.header().clone();
        let a = ConstantTensor::from_data([2, 1, 2], vec![1f32, 2., 3., 4.]).unwrap();
        let b = ConstantTensor::from_data([2, 1], vec![1f32, 1.]).unwrap();
        let out = op
            .fold(&constant_operands(&header, &[&a, &b]), &CpuBackend)
            .unwrap();
        assert_eq!(out[0].shape(), &TensorShape::from([2, 1, 1]));
        assert_eq!(out[0].to_f32_vec(), vec![3., 7.]);
    }

    #[test]
    fn matmul_vector_operands_drop_axes() {
        let node = NodeDescriptor::new("MatMul", "m").input("a").input("b").output("y");
        let Operator::MatMul(mm) = MatMul::build(&node, 11).unwrap() else { panic!() };
        let d = mm
            .dims(&TensorShape::from([3]), &TensorShape::from([3, 4]))
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(d.output, TensorShape::from([4]));
    }
}
