//! Operators and the three phases every operator goes through:
//! shape derivation (plus folding when its inputs are constant), dimension
//! role propagation, and materialization into layers.

use crate::{
    backend::ComputeBackend,
    broadcast,
    descriptor::NodeDescriptor,
    error::ErrorSite,
    graph::ValueRef,
    layer::{LayerGraph, LayerKind},
    roles::RoleTable,
    tensor::{LayerId, LayerOutput},
    ConstantTensor, Dim, Error, Result, SymbolicTensor, Tensor, TensorLayout, TensorShape,
};

pub mod activation;
pub mod batchnorm;
pub mod concat;
pub mod conv;
pub mod eltwise;
pub mod gemm;
pub mod identity;
pub mod lrn;
pub mod lstm;
pub mod pool;
pub mod reduce;
pub mod reshape;
pub mod shape;
pub mod slice;
pub mod softmax;

use activation::Activation;
use batchnorm::BatchNorm;
use concat::Concat;
use conv::Conv;
use eltwise::Eltwise;
use gemm::{Gemm, MatMul};
use identity::Identity;
use lrn::Lrn;
use lstm::Lstm;
use pool::{GlobalPool, Pool};
use reduce::ReduceMean;
use reshape::{Flatten, Reshape, Squeeze, Unsqueeze};
use shape::{Constant, ConstantOfShape, Gather, ShapeOf};
use slice::Slice;
use softmax::Softmax;

/// Identity of a node for error reporting, plus the opset it was built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpHeader {
    pub op_type: String,
    pub name: String,
    pub opset: i64,
}

impl OpHeader {
    pub fn new(op_type: impl Into<String>, name: impl Into<String>, opset: i64) -> Self {
        Self {
            op_type: op_type.into(),
            name: name.into(),
            opset,
        }
    }

    pub(crate) fn from_node(node: &NodeDescriptor, opset: i64) -> Self {
        Self::new(node.op_type.clone(), node.name.clone(), opset)
    }

    /// Validate declared input and output counts.
    pub(crate) fn check_arity(
        &self,
        node: &NodeDescriptor,
        inputs: (usize, usize),
        outputs: (usize, usize),
    ) -> Result<()> {
        let (lo, hi) = inputs;
        if node.inputs.len() < lo || node.inputs.len() > hi {
            return Err(Error::malformed(
                self,
                format!(
                    "expected {} inputs, got {}",
                    range_text(lo, hi),
                    node.inputs.len()
                ),
            ));
        }
        let (lo, hi) = outputs;
        if node.outputs.len() < lo || node.outputs.len() > hi {
            return Err(Error::malformed(
                self,
                format!(
                    "expected {} outputs, got {}",
                    range_text(lo, hi),
                    node.outputs.len()
                ),
            ));
        }
        Ok(())
    }

    /// Resolve a possibly negative axis against `rank`.
    pub(crate) fn axis(&self, axis: i64, rank: usize) -> Result<usize> {
        if axis < 0 && self.opset < 11 {
            return Err(Error::malformed(
                self,
                format!("negative axis {axis} is only valid from opset 11"),
            ));
        }
        let resolved = if axis < 0 { axis + rank as i64 } else { axis };
        if resolved < 0 || resolved as usize >= rank {
            return Err(Error::malformed(
                self,
                format!("axis {axis} is out of range for rank {rank}"),
            ));
        }
        Ok(resolved as usize)
    }
}

fn range_text(lo: usize, hi: usize) -> String {
    if lo == hi {
        format!("{lo}")
    } else if hi == usize::MAX {
        format!("at least {lo}")
    } else {
        format!("{lo} to {hi}")
    }
}

impl ErrorSite for OpHeader {
    fn op_type(&self) -> &str {
        &self.op_type
    }

    fn node_name(&self) -> &str {
        &self.name
    }
}

/// What an operator knows about one input before materialization.
#[derive(Debug, Clone, Copy)]
pub struct Operand<'a> {
    pub shape: &'a TensorShape,
    pub constant: Option<&'a ConstantTensor>,
}

/// The inputs of one node during shape derivation and folding.
pub struct Operands<'a> {
    site: &'a OpHeader,
    items: Vec<Option<Operand<'a>>>,
}

impl<'a> Operands<'a> {
    pub fn new(site: &'a OpHeader, items: Vec<Option<Operand<'a>>>) -> Self {
        Self { site, items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn optional(&self, index: usize) -> Option<Operand<'a>> {
        self.items.get(index).copied().flatten()
    }

    pub fn get(&self, index: usize) -> Result<Operand<'a>> {
        self.optional(index)
            .ok_or_else(|| Error::malformed(self.site, format!("input {index} is not bound")))
    }

    pub fn shape(&self, index: usize) -> Result<&'a TensorShape> {
        Ok(self.get(index)?.shape)
    }

    /// The value of an input that has to be known at compile time.
    pub fn constant(&self, index: usize) -> Result<&'a ConstantTensor> {
        self.get(index)?.constant.ok_or_else(|| {
            Error::unsupported(
                self.site,
                format!("input {index} must be a constant"),
            )
        })
    }

    pub fn optional_constant(&self, index: usize) -> Result<Option<&'a ConstantTensor>> {
        match self.optional(index) {
            Some(op) => op.constant.map(Some).ok_or_else(|| {
                Error::unsupported(self.site, format!("input {index} must be a constant"))
            }),
            None => Ok(None),
        }
    }

    /// Whether every bound input is constant.
    pub fn all_constant(&self) -> bool {
        self.items.iter().flatten().all(|o| o.constant.is_some())
    }

    /// Shapes of the bound inputs, in order.
    pub fn shapes(&self) -> Vec<&'a TensorShape> {
        self.items.iter().flatten().map(|o| o.shape).collect()
    }
}

/// Operands for folding tests: every input bound to a constant.
#[cfg(test)]
pub(crate) fn constant_operands<'a>(
    site: &'a OpHeader,
    tensors: &[&'a ConstantTensor],
) -> Operands<'a> {
    Operands::new(
        site,
        tensors
            .iter()
            .map(|t| {
                Some(Operand {
                    shape: t.shape(),
                    constant: Some(*t),
                })
            })
            .collect(),
    )
}

/// The value references of one node, used by role propagation.
#[derive(Debug, Clone)]
pub struct NodeIo {
    pub inputs: Vec<Option<ValueRef>>,
    pub outputs: Vec<ValueRef>,
}

impl NodeIo {
    pub fn input(&self, index: usize) -> Option<ValueRef> {
        self.inputs.get(index).copied().flatten()
    }

    pub fn output(&self, index: usize) -> Result<ValueRef> {
        self.outputs.get(index).copied().ok_or_else(|| {
            Error::internal(&("NodeIo", ""), format!("no output {index}"))
        })
    }
}

/// Everything an operator needs to append its layers.
pub struct MaterializeContext<'a> {
    header: &'a OpHeader,
    inputs: Vec<Option<Tensor>>,
    output_shapes: &'a [TensorShape],
    output_layouts: &'a [TensorLayout],
    graph: &'a mut LayerGraph,
    backend: &'a dyn ComputeBackend,
    name: String,
}

impl<'a> MaterializeContext<'a> {
    pub fn new(
        header: &'a OpHeader,
        inputs: Vec<Option<Tensor>>,
        output_shapes: &'a [TensorShape],
        output_layouts: &'a [TensorLayout],
        graph: &'a mut LayerGraph,
        backend: &'a dyn ComputeBackend,
        name: String,
    ) -> Self {
        Self {
            header,
            inputs,
            output_shapes,
            output_layouts,
            graph,
            backend,
            name,
        }
    }

    pub fn header(&self) -> &OpHeader {
        self.header
    }

    pub fn backend(&self) -> &dyn ComputeBackend {
        self.backend
    }

    pub fn graph(&mut self) -> &mut LayerGraph {
        &mut *self.graph
    }

    /// Base name for the layers of this node.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn optional_input(&self, index: usize) -> Option<&Tensor> {
        self.inputs.get(index).and_then(Option::as_ref)
    }

    pub fn input(&self, index: usize) -> Result<&Tensor> {
        self.optional_input(index)
            .ok_or_else(|| Error::malformed(self.header, format!("input {index} is not bound")))
    }

    /// An input that has to be known at compile time; `what` names it in the
    /// error.
    pub fn constant_input(&self, index: usize, what: &str) -> Result<&ConstantTensor> {
        self.input(index)?
            .as_constant()
            .ok_or_else(|| Error::unsupported(self.header, format!("non-constant {what}")))
    }

    pub fn optional_constant_input(&self, index: usize, what: &str) -> Result<Option<&ConstantTensor>> {
        match self.optional_input(index) {
            Some(t) => t
                .as_constant()
                .map(Some)
                .ok_or_else(|| Error::unsupported(self.header, format!("non-constant {what}"))),
            None => Ok(None),
        }
    }

    /// A data input as a layer output. A constant is fed in through a
    /// constant source laid out in slot order.
    pub fn symbolic_input(&mut self, index: usize) -> Result<SymbolicTensor> {
        match self.input(index)?.clone() {
            Tensor::Symbolic(s) => Ok(s),
            Tensor::Constant(c) => {
                let layout = slot_order_layout(self.header, c.shape().rank())?;
                broadcast::constant_source(self.graph, &self.name, &c, &layout)
            }
        }
    }

    /// A data input laid out under `layout`.
    pub fn input_as(&mut self, index: usize, layout: &TensorLayout) -> Result<SymbolicTensor> {
        match self.input(index)?.clone() {
            Tensor::Symbolic(s) => self.convert(&s, layout),
            Tensor::Constant(c) => broadcast::constant_source(self.graph, &self.name, &c, layout),
        }
    }

    /// Relabel or convert a symbolic tensor to `layout`.
    pub fn convert(&mut self, tensor: &SymbolicTensor, layout: &TensorLayout) -> Result<SymbolicTensor> {
        broadcast::convert_symbolic(self.graph, &self.name, tensor, layout)
    }

    pub fn output_shape(&self, index: usize) -> Result<&TensorShape> {
        self.output_shapes
            .get(index)
            .ok_or_else(|| Error::internal(self.header, format!("no output {index}")))
    }

    /// The committed layout of an output.
    pub fn output_layout(&self, index: usize) -> Result<&TensorLayout> {
        self.output_layouts
            .get(index)
            .ok_or_else(|| Error::internal(self.header, format!("no output {index}")))
    }

    /// Append a layer named after this node, with an optional suffix.
    pub fn add_layer(
        &mut self,
        suffix: Option<&str>,
        kind: LayerKind,
        inputs: Vec<LayerOutput>,
    ) -> Result<LayerId> {
        let base = match suffix {
            Some(s) => format!("{}/{s}", self.name),
            None => self.name.clone(),
        };
        let name = self.graph.unique_name(&base);
        self.graph.add_layer(name, kind, inputs)
    }

    /// Output 0 of `layer` as a tensor.
    pub fn layer_output(
        &self,
        layer: LayerId,
        shape: TensorShape,
        layout: TensorLayout,
    ) -> Result<SymbolicTensor> {
        self.graph
            .output_of(LayerOutput { layer, index: 0 }, shape, layout)
    }
}

/// The first `rank` slots in slot order.
pub(crate) fn slot_order_layout<S: ErrorSite + ?Sized>(site: &S, rank: usize) -> Result<TensorLayout> {
    if rank > Dim::COUNT {
        return Err(Error::unsupported(
            site,
            format!("rank {rank} exceeds the {} physical dimensions", Dim::COUNT),
        ));
    }
    TensorLayout::new(Dim::ALL[..rank].to_vec())
}

/// Spatial operators see `[batch, channels, height(, width)]`.
pub(crate) fn spatial_layout<S: ErrorSite + ?Sized>(site: &S, rank: usize) -> Result<Vec<Dim>> {
    match rank {
        3 => Ok(vec![Dim::BatchWidth, Dim::Channels, Dim::Height]),
        4 => Ok(vec![Dim::BatchWidth, Dim::Channels, Dim::Height, Dim::Width]),
        _ => Err(Error::unsupported(
            site,
            format!("{}-D spatial input", rank.saturating_sub(2)),
        )),
    }
}

/// The behavior every operator provides.
pub trait LayerOperator {
    fn header(&self) -> &OpHeader;

    /// Output shapes from input shapes and attributes. Pure.
    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>>;

    /// Evaluate the node when its inputs are constant.
    fn fold(
        &self,
        _inputs: &Operands<'_>,
        _backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        Err(Error::unsupported(
            self.header(),
            "output pre-calculation for constant inputs",
        ))
    }

    /// Whether the outputs are constant from input shapes alone.
    fn folds_from_shapes(&self) -> bool {
        false
    }

    /// Pin and link dimension roles. Must be idempotent.
    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()>;

    /// Append layers and return the output tensors.
    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>>;
}

/// Roles of an operator whose single output has its input's axes.
pub(crate) fn link_pass_through(
    header: &OpHeader,
    io: &NodeIo,
    table: &mut RoleTable,
) -> Result<()> {
    if let Some(input) = io.input(0) {
        table.link(header, input, io.output(0)?)?;
    }
    Ok(())
}

/// Every supported operator kind.
#[derive(Debug, Clone)]
pub enum Operator {
    Identity(Identity),
    Eltwise(Eltwise),
    Activation(Activation),
    Conv(Conv),
    Pool(Pool),
    GlobalPool(GlobalPool),
    BatchNorm(BatchNorm),
    Gemm(Gemm),
    MatMul(MatMul),
    Softmax(Softmax),
    Lrn(Lrn),
    Lstm(Lstm),
    Flatten(Flatten),
    Reshape(Reshape),
    Squeeze(Squeeze),
    Unsqueeze(Unsqueeze),
    Concat(Concat),
    Shape(ShapeOf),
    Gather(Gather),
    ConstantOfShape(ConstantOfShape),
    Constant(Constant),
    Slice(Slice),
    ReduceMean(ReduceMean),
}

macro_rules! dispatch {
    ($self:ident, $op:ident => $body:expr) => {
        match $self {
            Operator::Identity($op) => $body,
            Operator::Eltwise($op) => $body,
            Operator::Activation($op) => $body,
            Operator::Conv($op) => $body,
            Operator::Pool($op) => $body,
            Operator::GlobalPool($op) => $body,
            Operator::BatchNorm($op) => $body,
            Operator::Gemm($op) => $body,
            Operator::MatMul($op) => $body,
            Operator::Softmax($op) => $body,
            Operator::Lrn($op) => $body,
            Operator::Lstm($op) => $body,
            Operator::Flatten($op) => $body,
            Operator::Reshape($op) => $body,
            Operator::Squeeze($op) => $body,
            Operator::Unsqueeze($op) => $body,
            Operator::Concat($op) => $body,
            Operator::Shape($op) => $body,
            Operator::Gather($op) => $body,
            Operator::ConstantOfShape($op) => $body,
            Operator::Constant($op) => $body,
            Operator::Slice($op) => $body,
            Operator::ReduceMean($op) => $body,
        }
    };
}

impl LayerOperator for Operator {
    fn header(&self) -> &OpHeader {
        dispatch!(self, op => op.header())
    }

    fn output_shapes(&self, inputs: &Operands<'_>) -> Result<Vec<TensorShape>> {
        dispatch!(self, op => op.output_shapes(inputs))
    }

    fn fold(
        &self,
        inputs: &Operands<'_>,
        backend: &dyn ComputeBackend,
    ) -> Result<Vec<ConstantTensor>> {
        dispatch!(self, op => op.fold(inputs, backend))
    }

    fn folds_from_shapes(&self) -> bool {
        dispatch!(self, op => op.folds_from_shapes())
    }

    fn propagate_roles(&self, io: &NodeIo, table: &mut RoleTable) -> Result<()> {
        dispatch!(self, op => op.propagate_roles(io, table))
    }

    fn materialize(&self, ctx: &mut MaterializeContext<'_>) -> Result<Vec<Tensor>> {
        dispatch!(self, op => op.materialize(ctx))
    }
}

/// Builds an operator from its node descriptor and the graph opset.
pub type OperatorConstructor = fn(&NodeDescriptor, i64) -> Result<Operator>;

/// Op type names and constructors registered by default.
pub(crate) const BUILTINS: &[(&str, OperatorConstructor)] = &[
    ("Identity", Identity::build),
    ("Dropout", Identity::build),
    ("Add", Eltwise::build),
    ("Sub", Eltwise::build),
    ("Mul", Eltwise::build),
    ("Div", Eltwise::build),
    ("Sum", Eltwise::build),
    ("Relu", Activation::build),
    ("Sigmoid", Activation::build),
    ("Tanh", Activation::build),
    ("Abs", Activation::build),
    ("Elu", Activation::build),
    ("LeakyRelu", Activation::build),
    ("Clip", Activation::build),
    ("Conv", Conv::build),
    ("MaxPool", Pool::build),
    ("AveragePool", Pool::build),
    ("GlobalAveragePool", GlobalPool::build),
    ("GlobalMaxPool", GlobalPool::build),
    ("BatchNormalization", BatchNorm::build),
    ("Gemm", Gemm::build),
    ("MatMul", MatMul::build),
    ("Softmax", Softmax::build),
    ("LRN", Lrn::build),
    ("LSTM", Lstm::build),
    ("Flatten", Flatten::build),
    ("Reshape", Reshape::build),
    ("Squeeze", Squeeze::build),
    ("Unsqueeze", Unsqueeze::build),
    ("Concat", Concat::build),
    ("Shape", ShapeOf::build),
    ("Gather", Gather::build),
    ("ConstantOfShape", ConstantOfShape::build),
    ("Constant", Constant::build),
    ("Slice", Slice::build),
    ("ReduceMean", ReduceMean::build),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn negative_axis_needs_opset_11() {
        let old = OpHeader::new("Concat", "c", 9);
        assert_eq!(old.axis(-1, 3).unwrap_err().kind(), ErrorKind::Malformed);
        let new = OpHeader::new("Concat", "c", 11);
        assert_eq!(new.axis(-1, 3).unwrap(), 2);
        assert!(new.axis(3, 3).is_err());
    }

    #[test]
    fn arity_is_malformed() {
        let node = NodeDescriptor::new("Relu", "r").input("a").input("b").output("y");
        let header = OpHeader::from_node(&node, 12);
        let err = header.check_arity(&node, (1, 1), (1, 1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert!(err.to_string().contains("expected 1 inputs, got 2"));
    }
}
