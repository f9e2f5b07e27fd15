use crate::{
    attributes::Attributes,
    backend::ComputeBackend,
    descriptor::NodeDescriptor,
    layer::LayerKind,
    roles::RoleTable,
    check, ConstantTensor, Dim, Result, Tensor, TensorLayout, TensorShape,
};

use super::{LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator};

const BATCH_SLOTS: [Dim; 3] = [Dim::BatchLength, Dim::BatchWidth, Dim::ListSize];
const OBJECT_SLOTS: [Dim; 4] = [Dim::Height, Dim::Width, Dim::Depth, Dim::Channels];

/// Softmax over the axes from `axis` on, the leading axes being the batch.
#[derive(Debug, Clone)]
pub struct Softmax {
    header: OpHeader,
    axis: i64,
}

impl Softmax {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (1, 1), (1, 1))?;
        let default = if opset >= 13 { -1 } else { 1 };
        let axis = Attributes::new(node).get_optional("axis", default)?;
        Ok(Operator::Softmax(Self { header, axis }))
    }

    fn axis(&self, rank: usize) -> Result<usize> {
        // a rank-0 input behaves like [1]
        let axis = self.header.axis(self.axis, rank.max(1))?;
        check!(
            self.header.opset < 13 || axis + 1 == rank.max(1),
            unsupported,
            self.header,
            "softmax over axis {axis} of a rank {rank} input"
        );
        Ok(axis)
    }

    /// Batch slots for the leading axes, then the trailing object slots.
    fn layout_dims(&self, rank: usize) -> Result<Vec<Dim>> {
        let axis = self.axis(rank)?.min(rank);
        let trailing = rank - axis;
        check!(
            axis <= BATCH_SLOTS.len() && trailing <= OBJECT_SLOTS.len(),
            unsupported,
            self.header,
            "softmax from axis {axis} of a rank {rank} input"
        );
        let mut dims = match axis {
            0 => vec![],
            1 => vec![Dim::BatchWidth],
            2 => vec![Dim::BatchLength, Dim::BatchWidth],
            _ => BATCH_SLOTS.to_vec(),
        };
        dims.extend_from_slice(&OBJECT_SLOTS[OBJECT_SLOTS.len() - trailing..]);
        Ok(dims)
    }
}

impl LayerOperator for Softmax {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let x = inputs.shape(0)?;
        self.axis(x.rank())?;
        Ok(vec![x.clone()])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let x = inputs.constant(0)?;
        let axis = self.axis(x.shape().rank())?.min(x.shape().rank());
        let inner = x.shape().dims()[axis..].iter().product();
        let out = backend.softmax(&x.to_f32_vec(), inner)?;
        Ok(vec![ConstantTensor::from_data(x.shape().clone(), out)?])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        let output = io.output(0)?;
        let dims = self.layout_dims(table.shape(output)?.rank())?;
        table.require_layout(&self.header, output, &dims)?;
        if let Some(input) = io.input(0) {
            table.require_layout(&self.header, input, &dims)?;
        }
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let out_shape = ctx.output_shape(0)?.clone();
        let layout = TensorLayout::new(self.layout_dims(out_shape.rank())?)?;
        let x = ctx.input_as(0, &layout)?;
        let id = ctx.add_layer(None, LayerKind::Softmax, vec![x.output()])?;
        Ok(vec![ctx.layer_output(id, out_shape, layout)?.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::CpuBackend, ops::constant_operands, ErrorKind};

    fn softmax(axis: Option<i64>, opset: i64) -> Softmax {
        let mut node = NodeDescriptor::new("Softmax", "s").input("x").output("y");
        if let Some(axis) = axis {
            node = node.attr("axis", axis);
        }
        match Softmax::build(&node, opset).unwrap() {
            Operator::Softmax(s) => s,
            _ => unreachable!(),
        }
    }

    #[test]
    fn leading_axes_become_batch() {
        let s = softmax(None, 11);
        assert_eq!(
            s.layout_dims(4).unwrap(),
            vec![Dim::BatchWidth, Dim::Width, Dim::Depth, Dim::Channels]
        );
        let s = softmax(Some(2), 11);
        assert_eq!(
            s.layout_dims(3).unwrap(),
            vec![Dim::BatchLength, Dim::BatchWidth, Dim::Channels]
        );
    }

    #[test]
    fn too_many_leading_axes() {
        let s = softmax(Some(4), 11);
        assert_eq!(s.layout_dims(5).unwrap_err().kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn fold_rows() {
        let s = softmax(None, 11);
        let x = ConstantTensor::from_data([2, 2], vec![0f32, 0., 1., 1.]).unwrap();
        let out = s
            .fold(&constant_operands(&s.header, &[&x]), &CpuBackend)
            .unwrap();
        assert_eq!(out[0].to_f32_vec(), vec![0.5; 4]);
    }
}
