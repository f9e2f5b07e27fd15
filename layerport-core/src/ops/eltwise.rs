use crate::{
    attributes::Attributes,
    backend::{BinaryOp, ComputeBackend, UnaryOp},
    broadcast::{self, axis_offset, broadcast_constant, broadcast_shapes, BroadcastMode},
    descriptor::NodeDescriptor,
    dtype::DataType,
    layer::{ActivationKind, LayerKind},
    roles::RoleTable,
    ConstantTensor, Error, Result, Tensor, TensorShape,
};

use super::{LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EltwiseOp {
    Add,
    Sub,
    Mul,
    Div,
    Sum,
}

impl EltwiseOp {
    fn binary(&self) -> BinaryOp {
        match self {
            Self::Add | Self::Sum => BinaryOp::Add,
            Self::Sub => BinaryOp::Sub,
            Self::Mul => BinaryOp::Mul,
            Self::Div => BinaryOp::Div,
        }
    }
}

/// Elementwise arithmetic with broadcasting.
#[derive(Debug, Clone)]
pub struct Eltwise {
    header: OpHeader,
    op: EltwiseOp,
    mode: BroadcastMode,
}

impl Eltwise {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        let attrs = Attributes::new(node);
        let op = match node.op_type.as_str() {
            "Add" => EltwiseOp::Add,
            "Sub" => EltwiseOp::Sub,
            "Mul" => EltwiseOp::Mul,
            "Div" => EltwiseOp::Div,
            "Sum" => EltwiseOp::Sum,
            other => {
                return Err(Error::internal(
                    &header,
                    format!("{other} is not an elementwise operator"),
                ))
            }
        };
        let mode = if op == EltwiseOp::Sum {
            header.check_arity(node, (1, usize::MAX), (1, 1))?;
            if opset < 8 {
                BroadcastMode::None
            } else {
                BroadcastMode::Numpy
            }
        } else {
            header.check_arity(node, (2, 2), (1, 1))?;
            if opset >= 7 {
                BroadcastMode::Numpy
            } else if attrs.get_optional("broadcast", 0i64)? != 0 {
                BroadcastMode::Legacy {
                    axis: attrs.get::<i64>("axis")?,
                }
            } else {
                BroadcastMode::None
            }
        };
        Ok(Operator::Eltwise(Self { header, op, mode }))
    }

    pub fn mode(&self) -> BroadcastMode {
        self.mode
    }

    fn broadcast_all<'s>(&self, shapes: impl IntoIterator<Item = &'s TensorShape>) -> Result<TensorShape> {
        let mut shapes = shapes.into_iter();
        let first = shapes
            .next()
            .ok_or_else(|| Error::malformed(&self.header, "no inputs"))?;
        shapes.try_fold(first.clone(), |acc, s| {
            broadcast_shapes(&self.header, &acc, s, self.mode)
        })
    }
}

impl LayerOperator for Eltwise {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        Ok(vec![self.broadcast_all(inputs.shapes())?])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let out_shape = self.broadcast_all(inputs.shapes())?;
        let mut acc: Option<ConstantTensor> = None;
        for i in 0..inputs.len() {
            let c = inputs.constant(i)?;
            let offset = axis_offset(&self.header, self.mode, c.shape().rank(), out_shape.rank())?;
            let expanded = broadcast_constant(c, offset, &out_shape)?;
            acc = Some(match acc {
                None => expanded,
                Some(lhs) => {
                    if lhs.data_type() != expanded.data_type() {
                        return Err(Error::malformed(
                            &self.header,
                            format!(
                                "input types differ: {} and {}",
                                lhs.data_type(),
                                expanded.data_type()
                            ),
                        ));
                    }
                    let data = backend.binary(self.op.binary(), lhs.data(), expanded.data())?;
                    ConstantTensor::from_data(out_shape.clone(), data)?
                }
            });
        }
        let out = acc.ok_or_else(|| Error::malformed(&self.header, "no inputs"))?;
        Ok(vec![out])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        let output = io.output(0)?;
        let out_rank = table.shape(output)?.rank();
        for input in io.inputs.iter().flatten() {
            let rank = table.shape(*input)?.rank();
            let offset = axis_offset(&self.header, self.mode, rank, out_rank)?;
            table.link_aligned(&self.header, *input, offset, output)?;
        }
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        if ctx.input_count() == 1 {
            return Ok(vec![ctx.input(0)?.clone()]);
        }
        let out_shape = ctx.output_shape(0)?.clone();
        let out_rank = out_shape.rank();

        // The first symbolic input decides the layout everything is brought to.
        let mut target = ctx.output_layout(0)?.clone();
        for i in 0..ctx.input_count() {
            if let Some(Tensor::Symbolic(s)) = ctx.optional_input(i) {
                let offset = axis_offset(&self.header, self.mode, s.shape().rank(), out_rank)?;
                target =
                    broadcast::pad_layout(&self.header, s.layout(), offset, out_rank, &target)?;
                break;
            }
        }

        let mut operands = Vec::with_capacity(ctx.input_count());
        for i in 0..ctx.input_count() {
            let mut input = ctx.input(i)?.clone();
            let second = i > 0;
            if second && matches!(self.op, EltwiseOp::Sub | EltwiseOp::Div) {
                input = self.invert_operand(ctx, input)?;
            }
            let offset =
                axis_offset(&self.header, self.mode, input.shape().rank(), out_rank)?;
            let name = ctx.name().to_string();
            let reconciled = broadcast::reconcile(
                &self.header,
                ctx.graph(),
                &name,
                &input,
                offset,
                &out_shape,
                &target,
            )?;
            let symbolic = match reconciled {
                Tensor::Symbolic(s) => s,
                Tensor::Constant(c) => {
                    let c = c.cast(DataType::Float)?;
                    broadcast::constant_source(ctx.graph(), &name, &c, &target)?
                }
            };
            operands.push(symbolic.output());
        }

        let kind = match self.op {
            EltwiseOp::Add | EltwiseOp::Sub | EltwiseOp::Sum => LayerKind::EltwiseSum,
            EltwiseOp::Mul | EltwiseOp::Div => LayerKind::EltwiseMul,
        };
        let id = ctx.add_layer(None, kind, operands)?;
        Ok(vec![ctx.layer_output(id, out_shape, target)?.into()])
    }
}

impl Eltwise {
    /// Turn the second operand of `Sub` into its negation and the second
    /// operand of `Div` into its reciprocal, so that both become sums or
    /// products.
    fn invert_operand(&self, ctx: &mut MaterializeContext<'_>, input: Tensor) -> Result<Tensor> {
        match (self.op, input) {
            (EltwiseOp::Sub, Tensor::Constant(c)) => {
                let data = ctx.backend().unary(UnaryOp::Neg, c.data())?;
                Ok(ConstantTensor::new(c.shape().clone(), c.layout().clone(), data)?.into())
            }
            (EltwiseOp::Sub, Tensor::Symbolic(s)) => {
                let id = ctx.add_layer(
                    Some("neg"),
                    LayerKind::Activation(ActivationKind::Linear {
                        multiplier: -1.,
                        free_term: 0.,
                    }),
                    vec![s.output()],
                )?;
                Ok(ctx
                    .layer_output(id, s.shape().clone(), s.layout().clone())?
                    .into())
            }
            (EltwiseOp::Div, Tensor::Constant(c)) => {
                let c = c.cast(DataType::Float)?;
                let data = ctx.backend().unary(UnaryOp::Reciprocal, c.data())?;
                Ok(ConstantTensor::new(c.shape().clone(), c.layout().clone(), data)?.into())
            }
            (EltwiseOp::Div, Tensor::Symbolic(_)) => Err(Error::unsupported(
                &self.header,
                "division by a non-constant tensor",
            )),
            (_, input) => Ok(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::CpuBackend, ops::constant_operands, ErrorKind};

    fn build(op: &str, opset: i64) -> Operator {
        let node = NodeDescriptor::new(op, "e").input("a").input("b").output("y");
        Eltwise::build(&node, opset).unwrap()
    }

    #[test]
    fn broadcast_modes_by_opset() {
        let Operator::Eltwise(e) = build("Add", 12) else { panic!() };
        assert_eq!(e.mode(), BroadcastMode::Numpy);
        let Operator::Eltwise(e) = build("Add", 6) else { panic!() };
        assert_eq!(e.mode(), BroadcastMode::None);

        let node = NodeDescriptor::new("Mul", "m")
            .input("a")
            .input("b")
            .output("y")
            .attr("broadcast", 1i64)
            .attr("axis", 1i64);
        let Operator::Eltwise(e) = Eltwise::build(&node, 6).unwrap() else { panic!() };
        assert_eq!(e.mode(), BroadcastMode::Legacy { axis: Some(1) });
    }

    #[test]
    fn fold_with_broadcast() {
        let op = build("Sub", 12);
        let header = op.header().clone();
        let a = ConstantTensor::from_data([2, 3], vec![1f32, 2., 3., 4., 5., 6.]).unwrap();
        let b = ConstantTensor::from_data([3], vec![1f32, 1., 1.]).unwrap();
        let operands = constant_operands(&header, &[&a, &b]);
        assert_eq!(
            op.output_shapes(&operands).unwrap(),
            vec![TensorShape::from([2, 3])]
        );
        let out = op.fold(&operands, &CpuBackend).unwrap();
        assert_eq!(out[0].to_f32_vec(), vec![0., 1., 2., 3., 4., 5.]);
    }

    #[test]
    fn arity_checked() {
        let node = NodeDescriptor::new("Add", "e").input("a").output("y");
        assert_eq!(
            Eltwise::build(&node, 12).unwrap_err().kind(),
            ErrorKind::Malformed
        );
    }
}
