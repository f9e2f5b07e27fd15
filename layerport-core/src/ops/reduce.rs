use crate::{
    attributes::Attributes,
    backend::ComputeBackend,
    descriptor::NodeDescriptor,
    layer::{LayerKind, PoolKind, PoolParams},
    roles::RoleTable,
    ConstantTensor, Dim, Error, Result, Tensor, TensorLayout, TensorShape,
};

use super::{LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator};

/// Slots the reduced axes are pooled over, in axis order.
const POOLED: [Dim; 2] = [Dim::Height, Dim::Width];

/// `ReduceMean`, lowered to mean pooling over at most two axes.
#[derive(Debug, Clone)]
pub struct ReduceMean {
    header: OpHeader,
    axes: Option<Vec<i64>>,
    keep_dims: bool,
}

impl ReduceMean {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (1, 1), (1, 1))?;
        let attrs = Attributes::new(node);
        Ok(Operator::ReduceMean(Self {
            axes: attrs.get("axes")?,
            keep_dims: attrs.get_optional("keepdims", 1i64)? != 0,
            header,
        }))
    }

    /// Sorted reduced axes; all axes when none are given.
    fn reduced(&self, rank: usize) -> Result<Vec<usize>> {
        let Some(axes) = &self.axes else {
            return Ok((0..rank).collect());
        };
        let mut resolved = axes
            .iter()
            .map(|a| self.header.axis(*a, rank))
            .collect::<Result<Vec<_>>>()?;
        resolved.sort_unstable();
        resolved.dedup();
        Ok(resolved)
    }

    fn reduced_shape(&self, x: &TensorShape, reduced: &[usize]) -> TensorShape {
        let dims = (0..x.rank())
            .filter_map(|a| match (reduced.contains(&a), self.keep_dims) {
                (false, _) => Some(x[a]),
                (true, true) => Some(1),
                (true, false) => None,
            })
            .collect::<Vec<_>>();
        TensorShape::new(dims)
    }

    fn poolable(&self, reduced: &[usize]) -> Result<()> {
        if reduced.len() > POOLED.len() {
            return Err(Error::unsupported(
                &self.header,
                format!("mean over {} axes", reduced.len()),
            ));
        }
        Ok(())
    }
}

impl LayerOperator for ReduceMean {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let x = inputs.shape(0)?;
        let reduced = self.reduced(x.rank())?;
        Ok(vec![self.reduced_shape(x, &reduced)])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let x = inputs.constant(0)?;
        let reduced = self.reduced(x.shape().rank())?;
        let data = backend.reduce_mean(&x.to_f32_vec(), x.shape().dims(), &reduced)?;
        Ok(vec![ConstantTensor::from_data(
            self.reduced_shape(x.shape(), &reduced),
            data,
        )?])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        let Some(input) = io.input(0) else {
            return Ok(());
        };
        let output = io.output(0)?;
        let rank = table.shape(input)?.rank();
        let reduced = self.reduced(rank)?;
        if reduced.len() > POOLED.len() {
            return Ok(());
        }
        for (axis, dim) in reduced.iter().zip(POOLED) {
            table.require(&self.header, input, *axis, dim)?;
        }
        if self.keep_dims {
            return table.link(&self.header, input, output);
        }
        let kept = (0..rank).filter(|a| !reduced.contains(a));
        for (out_axis, axis) in kept.enumerate() {
            table.link_axis(&self.header, input, axis, output, out_axis)?;
        }
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let out_shape = ctx.output_shape(0)?.clone();
        let committed = ctx.output_layout(0)?.clone();
        let x = ctx.symbolic_input(0)?;
        let rank = x.shape().rank();
        let reduced = self.reduced(rank)?;
        self.poolable(&reduced)?;

        // Reduced axes go to the pooled slots; the others keep theirs unless
        // a pooled slot has to be freed.
        let mut dims: Vec<Option<Dim>> = vec![None; rank];
        for (axis, dim) in reduced.iter().zip(POOLED) {
            dims[*axis] = Some(dim);
        }
        for axis in 0..rank {
            if dims[axis].is_none() {
                let current = x.layout().dims()[axis];
                if !dims.contains(&Some(current)) {
                    dims[axis] = Some(current);
                }
            }
        }
        for axis in 0..rank {
            if dims[axis].is_none() {
                let free = Dim::ALL
                    .into_iter()
                    .find(|d| !dims.contains(&Some(*d)))
                    .ok_or_else(|| Error::internal(&self.header, "ran out of slots"))?;
                dims[axis] = Some(free);
            }
        }
        let pooled_layout = TensorLayout::new(dims.into_iter().flatten().collect::<Vec<_>>())?;
        let x = ctx.convert(&x, &pooled_layout)?;

        let mut kernel = [1; 2];
        for (i, axis) in reduced.iter().enumerate() {
            kernel[i] = x.shape()[*axis];
        }
        let id = ctx.add_layer(
            None,
            LayerKind::Pooling {
                kind: PoolKind::Mean,
                params: PoolParams {
                    kernel,
                    strides: kernel,
                    pads: [0; 2],
                },
            },
            vec![x.output()],
        )?;
        let mut kept_dims = x.shape().dims().to_vec();
        for axis in &reduced {
            kept_dims[*axis] = 1;
        }
        let mut pooled = ctx.layer_output(id, TensorShape::new(kept_dims), pooled_layout.clone())?;
        if !self.keep_dims {
            let slots = pooled_layout
                .dims()
                .iter()
                .enumerate()
                .filter(|(axis, _)| !reduced.contains(axis))
                .map(|(_, d)| *d)
                .collect::<Vec<_>>();
            pooled = pooled.relabeled(out_shape, TensorLayout::new(slots)?);
        }
        Ok(vec![ctx.convert(&pooled, &committed)?.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::CpuBackend, ops::constant_operands, ErrorKind};

    fn reduce_mean(axes: Vec<i64>, keepdims: i64) -> Operator {
        let node = NodeDescriptor::new("ReduceMean", "r")
            .input("x")
            .output("y")
            .attr("axes", axes)
            .attr("keepdims", keepdims);
        ReduceMean::build(&node, 11).unwrap()
    }

    #[test]
    fn fold_over_trailing_axes() {
        let op = reduce_mean(vec![2, 3], 0);
        let header = op.header().clone();
        let x = ConstantTensor::from_data(
            [1, 2, 2, 2],
            vec![1f32, 2., 3., 4., 10., 20., 30., 40.],
        )
        .unwrap();
        let out = op
            .fold(&constant_operands(&header, &[&x]), &CpuBackend)
            .unwrap();
        assert_eq!(out[0].shape(), &TensorShape::from([1, 2]));
        assert_eq!(out[0].to_f32_vec(), vec![2.5, 25.]);
    }

    #[test]
    fn keepdims_shape() {
        let op = reduce_mean(vec![-1], 1);
        let header = op.header().clone();
        let x = ConstantTensor::from_data([2, 3], vec![0f32; 6]).unwrap();
        assert_eq!(
            op.output_shapes(&constant_operands(&header, &[&x])).unwrap(),
            vec![TensorShape::from([2, 1])]
        );
    }

    #[test]
    fn three_axes_are_unsupported() {
        let Operator::ReduceMean(r) = reduce_mean(vec![0, 1, 2], 1) else { panic!() };
        assert_eq!(
            r.poolable(&r.reduced(3).unwrap()).unwrap_err().kind(),
            ErrorKind::Unsupported
        );
    }
}
