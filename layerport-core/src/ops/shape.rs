//! Operators whose outputs are always known at compile time.

use crate::{
    attributes::Attributes,
    backend::ComputeBackend,
    descriptor::NodeDescriptor,
    dtype::{map_data, TensorData},
    roles::RoleTable,
    ConstantTensor, Error, Result, Tensor, TensorShape,
};

use super::{LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator};

fn always_folded(header: &OpHeader) -> Result<Vec<Tensor>> {
    Err(Error::internal(header, "reached materialization without being folded"))
}

/// `Shape`: the input's extents as an int vector.
#[derive(Debug, Clone)]
pub struct ShapeOf {
    header: OpHeader,
}

impl ShapeOf {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (1, 1), (1, 1))?;
        Ok(Operator::Shape(Self { header }))
    }
}

impl LayerOperator for ShapeOf {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        Ok(vec![TensorShape::from([inputs.shape(0)?.rank()])])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        _backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let dims = inputs.shape(0)?.dims().iter().map(|d| *d as i64).collect();
        Ok(vec![ConstantTensor::ints(dims)])
    }

    fn folds_from_shapes(&self) -> bool {
        true
    }

    fn propagate_roles(&self, _io: &NodeIo, _table: &mut RoleTable) -> Result<()> {
        Ok(())
    }

    fn materialize(&self, _ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        always_folded(&self.header)
    }
}

/// `Gather` over constant data and indices.
#[derive(Debug, Clone)]
pub struct Gather {
    header: OpHeader,
    axis: i64,
}

impl Gather {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (2, 2), (1, 1))?;
        let axis = Attributes::new(node).get_optional("axis", 0i64)?;
        Ok(Operator::Gather(Self { header, axis }))
    }

    fn output_shape(&self, data: &TensorShape, indices: &TensorShape) -> Result<(usize, TensorShape)> {
        let axis = self.header.axis(self.axis, data.rank())?;
        let mut dims = data.dims()[..axis].to_vec();
        dims.extend_from_slice(indices.dims());
        dims.extend_from_slice(&data.dims()[axis + 1..]);
        Ok((axis, TensorShape::new(dims)))
    }

    fn resolve_index(&self, index: i64, extent: usize) -> Result<usize> {
        if index < 0 && self.header.opset < 11 {
            return Err(Error::malformed(
                &self.header,
                format!("negative index {index} is only valid from opset 11"),
            ));
        }
        let resolved = if index < 0 { index + extent as i64 } else { index };
        usize::try_from(resolved)
            .ok()
            .filter(|i| *i < extent)
            .ok_or_else(|| {
                Error::malformed(
                    &self.header,
                    format!("index {index} is out of range for extent {extent}"),
                )
            })
    }
}

impl LayerOperator for Gather {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        Ok(vec![self.output_shape(inputs.shape(0)?, inputs.shape(1)?)?.1])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        _backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let (data, indices) = (inputs.constant(0)?, inputs.constant(1)?);
        let (axis, out_shape) = self.output_shape(data.shape(), indices.shape())?;
        let dims = data.shape().dims();
        let outer: usize = dims[..axis].iter().product();
        let inner: usize = dims[axis + 1..].iter().product();
        let extent = dims[axis];
        let rows = indices
            .to_i64_vec()
            .into_iter()
            .map(|i| self.resolve_index(i, extent))
            .collect::<Result<Vec<_>>>()?;
        let source = data.source_data();
        let gathered: TensorData = map_data!(&source, v => {
            let mut out = Vec::with_capacity(outer * rows.len() * inner);
            for o in 0..outer {
                for r in &rows {
                    let start = (o * extent + r) * inner;
                    out.extend_from_slice(&v[start..start + inner]);
                }
            }
            out
        });
        Ok(vec![ConstantTensor::from_data(out_shape, gathered)?])
    }

    fn propagate_roles(&self, _io: &NodeIo, _table: &mut RoleTable) -> Result<()> {
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        ctx.constant_input(0, "gather data")?;
        ctx.constant_input(1, "gather indices")?;
        always_folded(&self.header)
    }
}

/// A tensor of a constant shape filled with one value.
#[derive(Debug, Clone)]
pub struct ConstantOfShape {
    header: OpHeader,
    value: ConstantTensor,
}

impl ConstantOfShape {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        if opset < 9 {
            return Err(Error::malformed(
                &header,
                format!("operator does not exist in opset {opset}"),
            ));
        }
        header.check_arity(node, (1, 1), (1, 1))?;
        let value = Attributes::new(node).get_optional("value", ConstantTensor::scalar(0.))?;
        if value.shape().element_count() != 1 {
            return Err(Error::malformed(
                &header,
                format!("value of shape {} is not a single element", value.shape()),
            ));
        }
        Ok(Operator::ConstantOfShape(Self { header, value }))
    }

    fn target(&self, inputs: &Operands<'_>) -> Result<TensorShape> {
        inputs
            .constant(0)?
            .to_i64_vec()
            .into_iter()
            .map(|d| {
                usize::try_from(d)
                    .map_err(|_| Error::malformed(&self.header, format!("negative extent {d}")))
            })
            .collect::<Result<Vec<_>>>()
            .map(TensorShape::new)
    }
}

impl LayerOperator for ConstantOfShape {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        Ok(vec![self.target(inputs)?])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        _backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let shape = self.target(inputs)?;
        let count = shape.element_count();
        let data: TensorData = map_data!(self.value.data(), v => vec![v[0]; count]);
        Ok(vec![ConstantTensor::from_data(shape, data)?])
    }

    fn propagate_roles(&self, _io: &NodeIo, _table: &mut RoleTable) -> Result<()> {
        Ok(())
    }

    fn materialize(&self, _ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        always_folded(&self.header)
    }
}

/// `Constant`: a value carried in the node's attributes.
#[derive(Debug, Clone)]
pub struct Constant {
    header: OpHeader,
    value: ConstantTensor,
}

impl Constant {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (0, 0), (1, 1))?;
        let attrs = Attributes::new(node);
        for unsupported in ["sparse_value", "value_string", "value_strings"] {
            if attrs.has(unsupported) {
                return Err(Error::unsupported(&header, format!("{unsupported} constant")));
            }
        }
        let mut values = Vec::new();
        if let Some(t) = attrs.get::<ConstantTensor>("value")? {
            values.push(t);
        }
        if let Some(v) = attrs.get::<f32>("value_float")? {
            values.push(ConstantTensor::scalar(v));
        }
        if let Some(v) = attrs.get::<Vec<f32>>("value_floats")? {
            values.push(ConstantTensor::from_data([v.len()], v)?);
        }
        if let Some(v) = attrs.get::<i64>("value_int")? {
            values.push(ConstantTensor::from_data(TensorShape::scalar(), vec![v])?);
        }
        if let Some(v) = attrs.get::<Vec<i64>>("value_ints")? {
            values.push(ConstantTensor::ints(v));
        }
        if values.len() != 1 {
            return Err(Error::malformed(
                &header,
                format!("expected exactly one value attribute, got {}", values.len()),
            ));
        }
        let value = values.remove(0);
        Ok(Operator::Constant(Self { header, value }))
    }
}

impl LayerOperator for Constant {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, _inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        Ok(vec![self.value.shape().clone()])
    }

    fn fold(
        &self,
        _inputs: &Operands<'_>,
        _backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        Ok(vec![self.value.clone()])
    }

    fn propagate_roles(&self, _io: &NodeIo, _table: &mut RoleTable) -> Result<()> {
        Ok(())
    }

    fn materialize(&self, _ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        always_folded(&self.header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::CpuBackend, ops::constant_operands, ErrorKind};

    #[test]
    fn shape_folds_from_shapes() {
        let node = NodeDescriptor::new("Shape", "s").input("x").output("y");
        let op = ShapeOf::build(&node, 11).unwrap();
        assert!(op.folds_from_shapes());
        let header = op.header().clone();
        let x = ConstantTensor::from_data([2, 3], vec![0f32; 6]).unwrap();
        let out = op
            .fold(&constant_operands(&header, &[&x]), &CpuBackend)
            .unwrap();
        assert_eq!(out[0].to_i64_vec(), vec![2, 3]);
    }

    #[test]
    fn gather_rows_with_negative_index() {
        let node = NodeDescriptor::new("Gather", "g").input("d").input("i").output("y");
        let op = Gather::build(&node, 11).unwrap();
        let header = op.header().clone();
        let data = ConstantTensor::from_data([3, 2], vec![1f32, 2., 3., 4., 5., 6.]).unwrap();
        let indices = ConstantTensor::ints(vec![-1, 0]);
        let out = op
            .fold(&constant_operands(&header, &[&data, &indices]), &CpuBackend)
            .unwrap();
        assert_eq!(out[0].shape(), &TensorShape::from([2, 2]));
        assert_eq!(out[0].to_f32_vec(), vec![5., 6., 1., 2.]);

        let old = Gather::build(&node, 9).unwrap();
        let header = old.header().clone();
        let err = old
            .fold(&constant_operands(&header, &[&data, &indices]), &CpuBackend)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn constant_of_shape_fills() {
        let node = NodeDescriptor::new("ConstantOfShape", "c")
            .input("s")
            .output("y")
            .attr("value", ConstantTensor::from_data([1], vec![7i64]).unwrap());
        let op = ConstantOfShape::build(&node, 11).unwrap();
        let header = op.header().clone();
        let shape = ConstantTensor::ints(vec![2, 2]);
        let out = op
            .fold(&constant_operands(&header, &[&shape]), &CpuBackend)
            .unwrap();
        assert_eq!(out[0].to_i64_vec(), vec![7; 4]);
        assert_eq!(
            ConstantOfShape::build(&node, 8).unwrap_err().kind(),
            ErrorKind::Malformed
        );
    }

    #[test]
    fn constant_needs_exactly_one_value() {
        let node = NodeDescriptor::new("Constant", "c").output("y");
        assert_eq!(Constant::build(&node, 11).unwrap_err().kind(), ErrorKind::Malformed);
        let node = node.attr("value_ints", vec![1i64, 2]);
        let op = Constant::build(&node, 11).unwrap();
        assert_eq!(
            op.output_shapes(&Operands::new(op.header(), vec![])).unwrap(),
            vec![TensorShape::from([2])]
        );
    }
}
