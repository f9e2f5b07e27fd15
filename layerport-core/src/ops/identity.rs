use crate::{
    backend::ComputeBackend, descriptor::NodeDescriptor, roles::RoleTable, ConstantTensor,
    Error, Result, Tensor, TensorShape,
};

use super::{
    link_pass_through, LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator,
};

/// `Identity`, and `Dropout` in inference mode: the output is the input.
#[derive(Debug, Clone)]
pub struct Identity {
    header: OpHeader,
}

impl Identity {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        match node.op_type.as_str() {
            "Dropout" => {
                // opset 12 adds ratio and training_mode inputs
                header.check_arity(node, (1, 3), (1, 2))?;
                if node.outputs.len() == 2 && !node.outputs[1].is_empty() {
                    return Err(Error::unsupported(&header, "Dropout mask output"));
                }
            }
            _ => header.check_arity(node, (1, 1), (1, 1))?,
        }
        Ok(Operator::Identity(Self { header }))
    }
}

impl LayerOperator for Identity {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        Ok(vec![inputs.shape(0)?.clone()])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        _backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        Ok(vec![inputs.constant(0)?.clone()])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        link_pass_through(&self.header, io, table)
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        Ok(vec![ctx.input(0)?.clone()])
    }
}
