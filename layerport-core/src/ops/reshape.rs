//! Operators that change the shape but not the values.

use crate::{
    attributes::Attributes,
    backend::ComputeBackend,
    descriptor::NodeDescriptor,
    graph::ValueRef,
    layer::LayerKind,
    roles::RoleTable,
    ConstantTensor, Dim, Error, Result, Tensor, TensorLayout, TensorShape,
};

use super::{LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator};

/// Reinterpret input 0 under the output shape.
///
/// The input is first brought to a non-transposed layout so that its memory
/// image is in source order; shapes that differ then go through a reshape
/// layer.
fn reinterpret(ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
    let out_shape = ctx.output_shape(0)?.clone();
    let committed = ctx.output_layout(0)?.clone();
    let x = ctx.symbolic_input(0)?;
    let x = ctx.convert(&x, &x.layout().sorted())?;
    if x.shape() == &out_shape {
        return Ok(vec![ctx.convert(&x, &committed)?.into()]);
    }
    let id = ctx.add_layer(
        None,
        LayerKind::Reshape {
            from: x.shape().clone(),
            to: out_shape.clone(),
        },
        vec![x.output()],
    )?;
    Ok(vec![ctx.layer_output(id, out_shape, committed.sorted())?.into()])
}

fn fold_reshape(inputs: &Operands<'_>, shape: TensorShape) -> Result<Vec<ConstantTensor>> {
    Ok(vec![inputs.constant(0)?.reshaped(shape)?])
}

/// `[d0, .., dn]` to `[d0 * .. * d(axis-1), d(axis) * .. * dn]`.
#[derive(Debug, Clone)]
pub struct Flatten {
    header: OpHeader,
    axis: i64,
}

impl Flatten {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (1, 1), (1, 1))?;
        let axis = Attributes::new(node).get_optional("axis", 1i64)?;
        Ok(Operator::Flatten(Self { header, axis }))
    }
}

impl LayerOperator for Flatten {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let x = inputs.shape(0)?;
        // axis ranges over [-rank, rank]
        let axis = if self.axis == x.rank() as i64 {
            x.rank()
        } else {
            self.header.axis(self.axis, x.rank())?
        };
        let outer: usize = x.dims()[..axis].iter().product();
        let inner: usize = x.dims()[axis..].iter().product();
        Ok(vec![TensorShape::from([outer, inner])])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        _backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let shape = self.output_shapes(inputs)?.remove(0);
        fold_reshape(inputs, shape)
    }

    fn propagate_roles(&self, _io: &NodeIo, _table: &mut RoleTable) -> Result<()> {
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        reinterpret(ctx)
    }
}

/// `Reshape` to a constant target shape.
#[derive(Debug, Clone)]
pub struct Reshape {
    header: OpHeader,
    /// Target from the `shape` attribute of early opsets.
    shape: Option<Vec<i64>>,
}

impl Reshape {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        let shape = if opset < 5 {
            header.check_arity(node, (1, 1), (1, 1))?;
            Some(Attributes::new(node).get_required::<Vec<i64>>("shape")?)
        } else {
            header.check_arity(node, (2, 2), (1, 1))?;
            None
        };
        Ok(Operator::Reshape(Self { header, shape }))
    }

    /// Resolve `0` (copy the input extent) and `-1` (the remainder).
    fn target(&self, input: &TensorShape, requested: &[i64]) -> Result<TensorShape> {
        let mut dims = Vec::with_capacity(requested.len());
        let mut inferred = None;
        for (i, d) in requested.iter().enumerate() {
            match *d {
                0 => dims.push(*input.dims().get(i).ok_or_else(|| {
                    Error::malformed(&self.header, format!("no input extent to copy at {i}"))
                })?),
                -1 if inferred.is_none() => {
                    inferred = Some(i);
                    dims.push(1);
                }
                -1 => return Err(Error::malformed(&self.header, "more than one -1 in shape")),
                d if d > 0 => dims.push(d as usize),
                d => return Err(Error::malformed(&self.header, format!("invalid extent {d}"))),
            }
        }
        let known: usize = dims.iter().product();
        let total = input.element_count();
        if let Some(i) = inferred {
            if known == 0 || total % known != 0 {
                return Err(Error::malformed(
                    &self.header,
                    format!("cannot reshape {input} into {requested:?}"),
                ));
            }
            dims[i] = total / known;
        }
        let shape = TensorShape::new(dims);
        if shape.element_count() != total {
            return Err(Error::malformed(
                &self.header,
                format!("cannot reshape {input} into {shape}"),
            ));
        }
        Ok(shape)
    }

    fn requested_dims(&self, inputs: &Operands<'_>) -> Result<Vec<i64>> {
        match &self.shape {
            Some(s) => Ok(s.clone()),
            None => Ok(inputs.constant(1)?.to_i64_vec()),
        }
    }
}

impl LayerOperator for Reshape {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        Ok(vec![self.target(inputs.shape(0)?, &self.requested_dims(inputs)?)?])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        _backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let shape = self.output_shapes(inputs)?.remove(0);
        fold_reshape(inputs, shape)
    }

    fn propagate_roles(&self, _io: &NodeIo, _table: &mut RoleTable) -> Result<()> {
        Ok(())
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        reinterpret(ctx)
    }
}

/// Axes from the `axes` attribute, or from constant input 1 from opset 13.
fn read_axes(
    node: &NodeDescriptor,
    header: &OpHeader,
    required: bool,
) -> Result<Option<Vec<i64>>> {
    let attrs = Attributes::new(node);
    if header.opset >= 13 {
        header.check_arity(node, (1 + required as usize, 2), (1, 1))?;
        return Ok(None);
    }
    header.check_arity(node, (1, 1), (1, 1))?;
    if required {
        Ok(Some(attrs.get_required("axes")?))
    } else {
        attrs.get("axes")
    }
}

fn axes_operand(axes: &Option<Vec<i64>>, inputs: &Operands<'_>) -> Result<Option<Vec<i64>>> {
    match axes {
        Some(a) => Ok(Some(a.clone())),
        None => Ok(inputs.optional_constant(1)?.map(|t| t.to_i64_vec())),
    }
}

/// Sorted, deduplicated axes resolved against `rank`.
fn resolve_axes(header: &OpHeader, axes: &[i64], rank: usize) -> Result<Vec<usize>> {
    let mut resolved = axes
        .iter()
        .map(|a| header.axis(*a, rank))
        .collect::<Result<Vec<_>>>()?;
    resolved.sort_unstable();
    if resolved.windows(2).any(|w| w[0] == w[1]) {
        return Err(Error::malformed(header, format!("repeated axis in {axes:?}")));
    }
    Ok(resolved)
}

/// Axes of `long` left over after matching `short` into it from the left.
///
/// Squeeze and unsqueeze only drop or add unit axes, so any such embedding
/// describes the same memory image.
fn unit_axes_outside(short: &TensorShape, long: &TensorShape) -> Vec<usize> {
    let mut next = 0;
    (0..long.rank())
        .filter(|axis| {
            if next < short.rank() && short[next] == long[*axis] {
                next += 1;
                false
            } else {
                true
            }
        })
        .collect()
}

/// Link every axis of `narrow` with the axis of `wide` it embeds into.
fn link_embedded(
    header: &OpHeader,
    table: &mut RoleTable,
    wide: ValueRef,
    narrow: ValueRef,
) -> Result<()> {
    let wide_shape = table.shape(wide)?.clone();
    let narrow_shape = table.shape(narrow)?.clone();
    let extra = unit_axes_outside(&narrow_shape, &wide_shape);
    let kept = (0..wide_shape.rank()).filter(|a| !extra.contains(a));
    for (narrow_axis, wide_axis) in kept.enumerate() {
        table.link_axis(header, wide, wide_axis, narrow, narrow_axis)?;
    }
    Ok(())
}

/// Drops unit axes.
#[derive(Debug, Clone)]
pub struct Squeeze {
    header: OpHeader,
    axes: Option<Vec<i64>>,
}

impl Squeeze {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        let axes = read_axes(node, &header, false)?;
        Ok(Operator::Squeeze(Self { header, axes }))
    }

    fn removed(&self, inputs: &Operands<'_>) -> Result<Vec<usize>> {
        let x = inputs.shape(0)?;
        let removed = match axes_operand(&self.axes, inputs)? {
            Some(axes) => resolve_axes(&self.header, &axes, x.rank())?,
            None => (0..x.rank()).filter(|a| x[*a] == 1).collect(),
        };
        if let Some(a) = removed.iter().find(|a| x[**a] != 1) {
            return Err(Error::malformed(
                &self.header,
                format!("cannot squeeze axis {a} of {x}"),
            ));
        }
        Ok(removed)
    }
}

impl LayerOperator for Squeeze {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let x = inputs.shape(0)?;
        let removed = self.removed(inputs)?;
        let dims = (0..x.rank())
            .filter(|a| !removed.contains(a))
            .map(|a| x[a])
            .collect::<Vec<_>>();
        Ok(vec![TensorShape::new(dims)])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        _backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let shape = self.output_shapes(inputs)?.remove(0);
        fold_reshape(inputs, shape)
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        match io.input(0) {
            Some(input) => link_embedded(&self.header, table, input, io.output(0)?),
            None => Ok(()),
        }
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let out_shape = ctx.output_shape(0)?.clone();
        let x = ctx.symbolic_input(0)?;
        let removed = unit_axes_outside(&out_shape, x.shape());
        let dims: Vec<Dim> = x
            .layout()
            .dims()
            .iter()
            .enumerate()
            .filter(|(axis, _)| !removed.contains(axis))
            .map(|(_, d)| *d)
            .collect();
        let squeezed = x.relabeled(out_shape, TensorLayout::new(dims)?);
        let committed = ctx.output_layout(0)?.clone();
        Ok(vec![ctx.convert(&squeezed, &committed)?.into()])
    }
}

/// Inserts unit axes.
#[derive(Debug, Clone)]
pub struct Unsqueeze {
    header: OpHeader,
    axes: Option<Vec<i64>>,
}

impl Unsqueeze {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        let axes = read_axes(node, &header, true)?;
        Ok(Operator::Unsqueeze(Self { header, axes }))
    }

    fn inserted(&self, inputs: &Operands<'_>) -> Result<Vec<usize>> {
        let rank = inputs.shape(0)?.rank();
        let axes = axes_operand(&self.axes, inputs)?
            .ok_or_else(|| Error::malformed(&self.header, "missing axes"))?;
        resolve_axes(&self.header, &axes, rank + axes.len())
    }
}

impl LayerOperator for Unsqueeze {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let x = inputs.shape(0)?;
        let inserted = self.inserted(inputs)?;
        let mut source = x.dims().iter();
        let dims = (0..x.rank() + inserted.len())
            .map(|axis| {
                if inserted.contains(&axis) {
                    1
                } else {
                    source.next().copied().unwrap_or(1)
                }
            })
            .collect::<Vec<_>>();
        Ok(vec![TensorShape::new(dims)])
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        _backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        let shape = self.output_shapes(inputs)?.remove(0);
        fold_reshape(inputs, shape)
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        match io.input(0) {
            Some(input) => link_embedded(&self.header, table, io.output(0)?, input),
            None => Ok(()),
        }
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let out_shape = ctx.output_shape(0)?.clone();
        let committed = ctx.output_layout(0)?.clone();
        let x = ctx.symbolic_input(0)?;
        let inserted = unit_axes_outside(x.shape(), &out_shape);
        let mut dims: Vec<Option<Dim>> = Vec::with_capacity(out_shape.rank());
        let mut source = x.layout().dims().iter();
        for axis in 0..out_shape.rank() {
            dims.push(if inserted.contains(&axis) {
                None
            } else {
                source.next().copied()
            });
        }
        for axis in 0..dims.len() {
            if dims[axis].is_some() {
                continue;
            }
            let wanted = committed.dims().get(axis).copied();
            let slot = wanted
                .filter(|w| !dims.contains(&Some(*w)))
                .or_else(|| Dim::ALL.into_iter().find(|d| !dims.contains(&Some(*d))))
                .ok_or_else(|| {
                    Error::unsupported(
                        &self.header,
                        format!("rank {} exceeds the {} physical dimensions", out_shape.rank(), Dim::COUNT),
                    )
                })?;
            dims[axis] = Some(slot);
        }
        let layout = TensorLayout::new(dims.into_iter().flatten().collect::<Vec<_>>())?;
        let unsqueezed = x.relabeled(out_shape, layout);
        Ok(vec![ctx.convert(&unsqueezed, &committed)?.into()])
    }
}
