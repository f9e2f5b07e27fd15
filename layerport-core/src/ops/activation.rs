use crate::{
    attributes::Attributes,
    backend::{ComputeBackend, UnaryOp},
    descriptor::NodeDescriptor,
    layer::{ActivationKind, LayerKind},
    roles::RoleTable,
    ConstantTensor, Error, Result, Tensor, TensorShape,
};

use super::{
    link_pass_through, LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator,
};

/// Single-input elementwise activation.
#[derive(Debug, Clone)]
pub struct Activation {
    header: OpHeader,
    kind: ActivationKind,
    /// `Clip` from opset 11 reads its bounds from inputs 1 and 2.
    bounds_from_inputs: bool,
}

impl Activation {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        let attrs = Attributes::new(node);
        let mut bounds_from_inputs = false;
        let kind = match node.op_type.as_str() {
            "Relu" => ActivationKind::Relu,
            "Sigmoid" => ActivationKind::Sigmoid,
            "Tanh" => ActivationKind::Tanh,
            "Abs" => ActivationKind::Abs,
            "Elu" => ActivationKind::Elu {
                alpha: attrs.get_optional("alpha", 1f32)?,
            },
            "LeakyRelu" => ActivationKind::LeakyRelu {
                alpha: attrs.get_optional("alpha", 0.01f32)?,
            },
            "Clip" if opset < 11 => ActivationKind::Clip {
                min: attrs.get_optional("min", f32::MIN)?,
                max: attrs.get_optional("max", f32::MAX)?,
            },
            "Clip" => {
                bounds_from_inputs = true;
                ActivationKind::Clip {
                    min: f32::MIN,
                    max: f32::MAX,
                }
            }
            other => {
                return Err(Error::internal(
                    &header,
                    format!("{other} is not an activation"),
                ))
            }
        };
        if bounds_from_inputs {
            header.check_arity(node, (1, 3), (1, 1))?;
        } else {
            header.check_arity(node, (1, 1), (1, 1))?;
        }
        Ok(Operator::Activation(Self {
            header,
            kind,
            bounds_from_inputs,
        }))
    }

    /// The activation with `Clip` bounds taken from constant inputs.
    fn resolve(
        &self,
        min: Option<&ConstantTensor>,
        max: Option<&ConstantTensor>,
    ) -> Result<ActivationKind> {
        if !self.bounds_from_inputs {
            return Ok(self.kind);
        }
        let scalar = |t: Option<&ConstantTensor>, default: f32| -> Result<f32> {
            match t {
                None => Ok(default),
                Some(t) => match t.to_f32_vec().as_slice() {
                    [v] => Ok(*v),
                    _ => Err(Error::malformed(
                        &self.header,
                        format!("bound of shape {} is not a scalar", t.shape()),
                    )),
                },
            }
        };
        Ok(ActivationKind::Clip {
            min: scalar(min, f32::MIN)?,
            max: scalar(max, f32::MAX)?,
        })
    }
}

impl LayerOperator for Activation {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        Ok(vec![inputs.shape(0)?.clone()])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let kind = self.resolve(inputs.optional_constant(1)?, inputs.optional_constant(2)?)?;
        let x = inputs.constant(0)?;
        let data = backend.unary(UnaryOp::Activation(kind), x.data())?;
        Ok(vec![ConstantTensor::new(
            x.shape().clone(),
            x.layout().clone(),
            data,
        )?])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        link_pass_through(&self.header, io, table)
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let kind = self.resolve(
            ctx.optional_constant_input(1, "Clip min")?,
            ctx.optional_constant_input(2, "Clip max")?,
        )?;
        let x = ctx.symbolic_input(0)?;
        let id = ctx.add_layer(None, LayerKind::Activation(kind), vec![x.output()])?;
        Ok(vec![ctx
            .layer_output(id, x.shape().clone(), x.layout().clone())?
            .into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::ops::constant_operands;

    #[test]
    fn clip_bounds_from_inputs() {
        let node = NodeDescriptor::new("Clip", "clip")
            .input("x")
            .input("lo")
            .input("hi")
            .output("y");
        let op = Activation::build(&node, 12).unwrap();
        let header = op.header().clone();
        let x = ConstantTensor::from_data([3], vec![-5f32, 0.5, 5.]).unwrap();
        let lo = ConstantTensor::scalar(0.);
        let hi = ConstantTensor::scalar(1.);
        let operands = constant_operands(&header, &[&x, &lo, &hi]);
        let out = op.fold(&operands, &CpuBackend).unwrap();
        assert_eq!(out[0].to_f32_vec(), vec![0., 0.5, 1.]);
    }

    #[test]
    fn leaky_relu_default_alpha() {
        let node = NodeDescriptor::new("LeakyRelu", "lr").input("x").output("y");
        let Operator::Activation(a) = Activation::build(&node, 12).unwrap() else {
            panic!("wrong operator kind");
        };
        assert_eq!(a.kind, ActivationKind::LeakyRelu { alpha: 0.01 });
    }
}
