use crate::{
    attributes::Attributes,
    descriptor::NodeDescriptor,
    layer::LayerKind,
    roles::RoleTable,
    check, Dim, Result, Tensor, TensorShape,
};

use super::{LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator};

/// Local response normalization across channels.
#[derive(Debug, Clone)]
pub struct Lrn {
    header: OpHeader,
    size: usize,
    alpha: f32,
    beta: f32,
    bias: f32,
}

impl Lrn {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (1, 1), (1, 1))?;
        let attrs = Attributes::new(node);
        let size = attrs.get_required::<i64>("size")?;
        check!(size > 0, malformed, header, "window size {size} must be positive");
        Ok(Operator::Lrn(Self {
            size: size as usize,
            alpha: attrs.get_optional("alpha", 1e-4f32)?,
            beta: attrs.get_optional("beta", 0.75f32)?,
            bias: attrs.get_optional("bias", 1f32)?,
            header,
        }))
    }
}

impl LayerOperator for Lrn {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let x = inputs.shape(0)?;
        check!(x.rank() >= 3, malformed, self.header, "input {x} has no spatial axes");
        Ok(vec![x.clone()])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        let output = io.output(0)?;
        table.require(&self.header, output, 1, Dim::Channels)?;
        if let Some(input) = io.input(0) {
            table.require(&self.header, input, 1, Dim::Channels)?;
            table.link(&self.header, input, output)?;
        }
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let out_shape = ctx.output_shape(0)?.clone();
        let layout = ctx.output_layout(0)?.clone();
        let x = ctx.input_as(0, &layout)?;
        let kind = LayerKind::Lrn {
            size: self.size,
            alpha: self.alpha,
            beta: self.beta,
            bias: self.bias,
        };
        let id = ctx.add_layer(None, kind, vec![x.output()])?;
        Ok(vec![ctx.layer_output(id, out_shape, layout)?.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ops::Operand, ErrorKind};

    fn node() -> NodeDescriptor {
        NodeDescriptor::new("LRN", "norm").input("x").output("y")
    }

    #[test]
    fn defaults_follow_the_operator_definition() {
        let Operator::Lrn(lrn) = Lrn::build(&node().attr("size", 5i64), 11).unwrap() else {
            panic!()
        };
        assert_eq!(lrn.size, 5);
        assert_eq!((lrn.alpha, lrn.beta, lrn.bias), (1e-4, 0.75, 1.));
    }

    #[test]
    fn size_is_required_and_positive() {
        assert_eq!(Lrn::build(&node(), 11).unwrap_err().kind(), ErrorKind::Malformed);
        let empty = node().attr("size", 0i64);
        assert_eq!(Lrn::build(&empty, 11).unwrap_err().kind(), ErrorKind::Malformed);
    }

    #[test]
    fn matrix_input_is_malformed() {
        let op = Lrn::build(&node().attr("size", 3i64), 11).unwrap();
        let header = op.header().clone();
        let x = TensorShape::from([2, 8]);
        let operands = Operands::new(
            &header,
            vec![Some(Operand {
                shape: &x,
                constant: None,
            })],
        );
        assert_eq!(op.output_shapes(&operands).unwrap_err().kind(), ErrorKind::Malformed);
    }
}
