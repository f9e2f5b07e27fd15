use crate::{
    attributes::Attributes,
    descriptor::NodeDescriptor,
    layer::{LayerKind, PoolKind, PoolParams},
    roles::RoleTable,
    Error, Result, Tensor, TensorLayout, TensorShape,
};

use super::{
    conv::{pin_spatial, windowed_shape, ResolvedWindow, Window},
    spatial_layout, LayerOperator, MaterializeContext, NodeIo, OpHeader, Operands, Operator,
};

fn pool_kind(header: &OpHeader) -> Result<PoolKind> {
    match header.op_type.as_str() {
        "MaxPool" | "GlobalMaxPool" => Ok(PoolKind::Max),
        "AveragePool" | "GlobalAveragePool" => Ok(PoolKind::Mean),
        other => Err(Error::internal(header, format!("{other} is not a pooling"))),
    }
}

/// `MaxPool` and `AveragePool`.
#[derive(Debug, Clone)]
pub struct Pool {
    header: OpHeader,
    kind: PoolKind,
    window: Window,
}

impl Pool {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (1, 1), (1, 2))?;
        let kind = pool_kind(&header)?;
        let attrs = Attributes::new(node);
        let window = Window::read(&header, &attrs)?;
        if window.kernel().is_none() {
            return Err(Error::malformed(&header, "missing required attribute kernel_shape"));
        }
        if attrs.get_optional("ceil_mode", 0i64)? != 0 {
            return Err(Error::unsupported(&header, "ceil_mode"));
        }
        if window.dilations().is_some_and(|d| d.iter().any(|d| *d != 1)) {
            return Err(Error::unsupported(&header, "dilated pooling"));
        }
        if node.outputs.len() == 2 && !node.outputs[1].is_empty() {
            return Err(Error::unsupported(&header, "MaxPool indices output"));
        }
        if kind == PoolKind::Mean && attrs.get_optional("count_include_pad", 0i64)? != 0 {
            return Err(Error::unsupported(&header, "count_include_pad"));
        }
        Ok(Operator::Pool(Self {
            header,
            kind,
            window,
        }))
    }

    fn resolve(&self, x: &TensorShape) -> Result<ResolvedWindow> {
        if x.rank() < 3 {
            return Err(Error::malformed(
                &self.header,
                format!("pooling input {x} has no spatial axes"),
            ));
        }
        self.window.resolve(&self.header, &x.dims()[2..], None)
    }
}

impl LayerOperator for Pool {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let x = inputs.shape(0)?;
        let window = self.resolve(x)?;
        Ok(vec![windowed_shape(x, x[1], &window)])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        pin_spatial(&self.header, io, table)
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let out_shape = ctx.output_shape(0)?.clone();
        let layout = TensorLayout::new(spatial_layout(&self.header, out_shape.rank())?)?;
        let x = ctx.input_as(0, &layout)?;
        let window = self.resolve(x.shape())?;
        let params = PoolParams {
            kernel: ResolvedWindow::hw(&window.kernel, 1),
            strides: ResolvedWindow::hw(&window.strides, 1),
            pads: window.symmetric_pads(&self.header)?,
        };
        let id = ctx.add_layer(
            None,
            LayerKind::Pooling {
                kind: self.kind,
                params,
            },
            vec![x.output()],
        )?;
        Ok(vec![ctx.layer_output(id, out_shape, layout)?.into()])
    }
}

/// `GlobalAveragePool` and `GlobalMaxPool`: one value per channel.
#[derive(Debug, Clone)]
pub struct GlobalPool {
    header: OpHeader,
    kind: PoolKind,
}

impl GlobalPool {
    pub fn build(node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let header = OpHeader::from_node(node, opset);
        header.check_arity(node, (1, 1), (1, 1))?;
        let kind = pool_kind(&header)?;
        Ok(Operator::GlobalPool(Self { header, kind }))
    }
}

impl LayerOperator for GlobalPool {
    fn header(&self) -> &OpHeader {
        &self.header
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        let x = inputs.shape(0)?;
        if x.rank() < 3 {
            return Err(Error::malformed(
                &self.header,
                format!("pooling input {x} has no spatial axes"),
            ));
        }
        let mut dims = x.dims().to_vec();
        dims[2..].fill(1);
        Ok(vec![TensorShape::new(dims)])
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        pin_spatial(&self.header, io, table)
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        let out_shape = ctx.output_shape(0)?.clone();
        let layout = TensorLayout::new(spatial_layout(&self.header, out_shape.rank())?)?;
        let x = ctx.input_as(0, &layout)?;
        let id = ctx.add_layer(
            None,
            LayerKind::GlobalPooling { kind: self.kind },
            vec![x.output()],
        )?;
        Ok(vec![ctx.layer_output(id, out_shape, layout)?.into()])
    }
}
