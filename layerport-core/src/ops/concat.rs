use crate::{
    attributes::Attributes,
    backend::ComputeBackend,
    broadcast,
    descriptor::NodeDescriptor,
    dtype::{DataType, TensorData},
    layer::LayerKind,
    roles::RoleTable,
    check, ConstantTensor, Error, Result, Tensor, TensorShape,
};

use super::{LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator};

/// Joins inputs along one axis.
#[derive(Debug, Clone)]
pub struct Concat {
    header: OpHeader,
    axis: i64,
}

impl Concat {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (1, usize::MAX), (1, 1))?;
        let attrs = Attributes::new(node);
        let axis = if opset < 4 {
            attrs.get_optional("axis", 1i64)?
        } else {
            attrs.get_required("axis")?
        };
        Ok(Operator::Concat(Self { header, axis }))
    }

    fn concat_shape(&self, shapes: &[&TensorShape]) -> Result<(usize, TensorShape)> {
        let first = shapes
            .first()
            .ok_or_else(|| Error::malformed(&self.header, "no inputs"))?;
        let axis = self.header.axis(self.axis, first.rank())?;
        let mut dims = first.dims().to_vec();
        for s in &shapes[1..] {
            let compatible = s.rank() == first.rank()
                && (0..first.rank()).all(|a| a == axis || s[a] == first[a]);
            check!(
                compatible,
                malformed,
                self.header,
                "cannot concatenate {first} and {s} along axis {axis}"
            );
            dims[axis] += s[axis];
        }
        Ok((axis, TensorShape::new(dims)))
    }
}

/// Interleave row-major chunks: for every index over the leading axes, the
/// trailing block of each input in turn.
fn join<T: Copy>(parts: &[(&[T], usize)], outer: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(parts.iter().map(|(d, _)| d.len()).sum());
    for o in 0..outer {
        for (data, block) in parts {
            out.extend_from_slice(&data[o * block..(o + 1) * block]);
        }
    }
    out
}

impl LayerOperator for Concat {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        Ok(vec![self.concat_shape(&inputs.shapes())?.1])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        _backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let (axis, out_shape) = self.concat_shape(&inputs.shapes())?;
        let outer: usize = out_shape.dims()[..axis].iter().product();
        let mut tensors = Vec::with_capacity(inputs.len());
        for i in 0..inputs.len() {
            tensors.push(inputs.constant(i)?);
        }
        let dtype = tensors
            .iter()
            .map(|t| t.data_type())
            .reduce(|a, b| if a == b { a } else { DataType::Float })
            .unwrap_or(DataType::Float);
        let blocks: Vec<(TensorData, usize)> = tensors
            .iter()
            .map(|t| {
                let block = t.shape().dims()[axis..].iter().product();
                (t.source_data().cast(dtype), block)
            })
            .collect();
        let data = match dtype {
            DataType::Float => {
                let parts: Vec<(&[f32], usize)> = blocks
                    .iter()
                    .filter_map(|(d, b)| d.as_f32().map(|d| (d, *b)))
                    .collect();
                TensorData::Float(join(&parts, outer))
            }
            DataType::Int => {
                let parts: Vec<(&[i64], usize)> = blocks
                    .iter()
                    .filter_map(|(d, b)| d.as_i64().map(|d| (d, *b)))
                    .collect();
                TensorData::Int(join(&parts, outer))
            }
        };
        Ok(vec![ConstantTensor::from_data(out_shape, data)?])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        let output = io.output(0)?;
        let rank = table.shape(output)?.rank();
        let axis = self.header.axis(self.axis, rank)?;
        for input in io.inputs.iter().flatten() {
            table.link_aligned(&self.header, *input, 0, output)?;
            table.link_axis(&self.header, *input, axis, output, axis)?;
        }
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        if ctx.input_count() == 1 {
            return Ok(vec![ctx.input(0)?.clone()]);
        }
        let out_shape = ctx.output_shape(0)?.clone();
        let target = ctx.output_layout(0)?.clone();
        let axis = self.header.axis(self.axis, out_shape.rank())?;
        let mut parts = Vec::with_capacity(ctx.input_count());
        for i in 0..ctx.input_count() {
            let part = match ctx.input(i)?.clone() {
                Tensor::Symbolic(s) => ctx.convert(&s, &target)?,
                Tensor::Constant(c) => {
                    let name = ctx.name().to_string();
                    let c = c.cast(DataType::Float)?;
                    broadcast::constant_source(ctx.graph(), &name, &c, &target)?
                }
            };
            parts.push(part.output());
        }
        let dim = target.dims()[axis];
        let id = ctx.add_layer(None, LayerKind::Concat { dim }, parts)?;
        Ok(vec![ctx.layer_output(id, out_shape, target)?.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::CpuBackend, ops::constant_operands, ErrorKind};

    fn concat(axis: i64) -> Operator {
        let node = NodeDescriptor::new("Concat", "c")
            .input("a")
            .input("b")
            .output("y")
            .attr("axis", axis);
        Concat::build(&node, 11).unwrap()
    }

    #[test]
    fn fold_along_inner_axis() {
        let op = concat(1);
        let header = op.header().clone();
        let a = ConstantTensor::from_data([2, 1], vec![1f32, 2.]).unwrap();
        let b = ConstantTensor::from_data([2, 2], vec![3f32, 4., 5., 6.]).unwrap();
        let out = op
            .fold(&constant_operands(&header, &[&a, &b]), &CpuBackend)
            .unwrap();
        assert_eq!(out[0].shape(), &TensorShape::from([2, 3]));
        assert_eq!(out[0].to_f32_vec(), vec![1., 3., 4., 2., 5., 6.]);
    }

    #[test]
    fn shapes_must_agree_off_axis() {
        let op = concat(0);
        let header = op.header().clone();
        let a = ConstantTensor::from_data([1, 2], vec![1f32, 2.]).unwrap();
        let b = ConstantTensor::from_data([1, 3], vec![1f32, 2., 3.]).unwrap();
        let err = op
            .output_shapes(&constant_operands(&header, &[&a, &b]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn missing_axis_is_malformed() {
        let node = NodeDescriptor::new("Concat", "c").input("a").output("y");
        assert_eq!(Concat::build(&node, 11).unwrap_err().kind(), ErrorKind::Malformed);
    }
}
