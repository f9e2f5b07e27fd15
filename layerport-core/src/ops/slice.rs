use crate::{
    attributes::Attributes,
    backend::ComputeBackend,
    descriptor::NodeDescriptor,
    dtype::map_data,
    layer::LayerKind,
    roles::RoleTable,
    tensor::gather_strided,
    ConstantTensor, Error, Result, Tensor, TensorShape,
};

use super::{LayerOperator, MaterializeContext, NodeIo, OpHeader, Operand, Operands, Operator};

/// Slice bounds from attributes, used before opset 10.
#[derive(Debug, Clone)]
struct Bounds {
    starts: Vec<i64>,
    ends: Vec<i64>,
    axes: Option<Vec<i64>>,
}

/// One sliced axis, resolved against the input extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AxisSlice {
    axis: usize,
    start: usize,
    length: usize,
}

/// `Slice` with unit steps.
#[derive(Debug, Clone)]
pub struct Slice {
    header: OpHeader,
    bounds: Option<Bounds>,
}

impl Slice {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        let bounds = if opset < 10 {
            header.check_arity(node, (1, 1), (1, 1))?;
            let attrs = Attributes::new(node);
            Some(Bounds {
                starts: attrs.get_required("starts")?,
                ends: attrs.get_required("ends")?,
                axes: attrs.get("axes")?,
            })
        } else {
            header.check_arity(node, (3, 5), (1, 1))?;
            None
        };
        Ok(Operator::Slice(Self { header, bounds }))
    }

    fn slices(&self, inputs: &Operands<'_>) -> Result<Vec<AxisSlice>> {
        let (starts, ends, axes, steps) = match &self.bounds {
            Some(b) => (b.starts.clone(), b.ends.clone(), b.axes.clone(), None),
            None => {
                let ints = |i: usize| -> Result<Option<Vec<i64>>> {
                    Ok(inputs.optional_constant(i)?.map(|t| t.to_i64_vec()))
                };
                (
                    inputs.constant(1)?.to_i64_vec(),
                    inputs.constant(2)?.to_i64_vec(),
                    ints(3)?,
                    ints(4)?,
                )
            }
        };
        let x = inputs.shape(0)?;
        let axes = axes.unwrap_or_else(|| (0..starts.len() as i64).collect());
        if ends.len() != starts.len() || axes.len() != starts.len() {
            return Err(Error::malformed(
                &self.header,
                format!(
                    "{} starts, {} ends and {} axes",
                    starts.len(),
                    ends.len(),
                    axes.len()
                ),
            ));
        }
        if let Some(steps) = steps {
            if steps.len() != starts.len() {
                return Err(Error::malformed(&self.header, "steps do not match starts"));
            }
            if let Some(step) = steps.iter().find(|s| **s != 1) {
                return Err(Error::unsupported(&self.header, format!("slice step {step}")));
            }
        }

        let clamp = |v: i64, extent: usize| -> usize {
            let v = if v < 0 { v.saturating_add(extent as i64) } else { v };
            v.clamp(0, extent as i64) as usize
        };
        let mut slices: Vec<AxisSlice> = Vec::with_capacity(axes.len());
        for ((start, end), axis) in starts.iter().zip(&ends).zip(&axes) {
            let axis = self.header.axis(*axis, x.rank())?;
            if slices.iter().any(|s| s.axis == axis) {
                return Err(Error::malformed(&self.header, format!("axis {axis} sliced twice")));
            }
            let extent = x[axis];
            let start = clamp(*start, extent);
            let end = clamp(*end, extent);
            slices.push(AxisSlice {
                axis,
                start,
                length: end.saturating_sub(start),
            });
        }
        slices.sort_by_key(|s| s.axis);
        Ok(slices)
    }

    fn sliced_shape(x: &TensorShape, slices: &[AxisSlice]) -> TensorShape {
        let mut dims = x.dims().to_vec();
        for s in slices {
            dims[s.axis] = s.length;
        }
        TensorShape::new(dims)
    }
}

impl LayerOperator for Slice {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let slices = self.slices(inputs)?;
        Ok(vec![Self::sliced_shape(inputs.shape(0)?, &slices)])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        _backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let x = inputs.constant(0)?;
        let slices = self.slices(inputs)?;
        let out_shape = Self::sliced_shape(x.shape(), &slices);
        let strides = x.shape().strides();
        let base = slices.iter().map(|s| s.start * strides[s.axis]).sum();
        let source = x.source_data();
        let data = map_data!(&source, v => gather_strided(v, base, out_shape.dims(), &strides));
        Ok(vec![ConstantTensor::from_data(out_shape, data)?])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        if let Some(input) = io.input(0) {
            table.link(&self.header, input, io.output(0)?)?;
        }
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let layout = ctx.output_layout(0)?.clone();
        let x = ctx.symbolic_input(0)?;
        let mut current = ctx.convert(&x, &layout)?;

        let mut operands = vec![Some(Operand {
            shape: x.shape(),
            constant: None,
        })];
        for i in 1..ctx.input_count() {
            operands.push(ctx.optional_input(i).map(|t| Operand {
                shape: t.shape(),
                constant: t.as_constant(),
            }));
        }
        let slices = self.slices(&Operands::new(&self.header, operands))?;

        for s in slices {
            if s.length == current.shape()[s.axis] {
                continue;
            }
            if s.length == 0 {
                return Err(Error::unsupported(&self.header, "empty slice"));
            }
            let mut dims = current.shape().dims().to_vec();
            dims[s.axis] = s.length;
            let id = ctx.add_layer(
                None,
                LayerKind::Slice {
                    dim: layout.dims()[s.axis],
                    start: s.start,
                    length: s.length,
                },
                vec![current.output()],
            )?;
            current = ctx.layer_output(id, TensorShape::new(dims), layout.clone())?;
        }
        Ok(vec![current.into()])
    }
}
