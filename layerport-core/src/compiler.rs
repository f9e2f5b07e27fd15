//! The compilation driver.
//!
//! A compilation runs five passes over the node graph:
//!
//! 1. link nodes by value name ([`NodeGraph::build`]);
//! 2. derive output shapes, folding every node whose inputs are all constant;
//! 3. propagate dimension roles, a forward then a backward sweep;
//! 4. commit a layout for every value;
//! 5. materialize the remaining nodes into layers, in visitation order.
//!
//! The first error stops the compilation. Layers appended before it are left
//! in the graph for the caller to discard.

use tracing::{debug, info, instrument, trace};

use crate::{
    backend::{ComputeBackend, CpuBackend},
    descriptor::GraphDescriptor,
    graph::{NodeGraph, NodeKind, NodeState, ValueRef},
    layer::{LayerGraph, LayerKind},
    ops::{LayerOperator, MaterializeContext, OpHeader, Operand, Operands},
    registry::OperatorRegistry,
    roles::RoleTable,
    tensor::LayerId,
    check, ConstantTensor, Error, LayerOutput, Result, Tensor, TensorLayout, TensorShape,
};

/// Knobs of one [`Compiler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Newest opset the operators are known to handle.
    pub max_opset_version: i64,
    /// Sort the nodes topologically instead of rejecting graphs whose nodes
    /// are declared out of order. Without it such a graph is malformed, since
    /// the format requires producers to come before their consumers.
    pub reorder_nodes: bool,
    /// Prepended to every layer name.
    pub layer_name_prefix: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            max_opset_version: 12,
            reorder_nodes: false,
            layer_name_prefix: String::new(),
        }
    }
}

/// A graph input or output and the layer it is bound to.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundValue {
    pub name: String,
    /// The `Source` layer of an input, the `Sink` layer of an output.
    pub layer: LayerId,
    pub shape: TensorShape,
    pub layout: TensorLayout,
}

/// Graph inputs and outputs in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Endpoints {
    pub inputs: Vec<BoundValue>,
    pub outputs: Vec<BoundValue>,
}

#[derive(Debug, Clone)]
pub struct CompiledModel {
    pub layers: LayerGraph,
    pub inputs: Vec<BoundValue>,
    pub outputs: Vec<BoundValue>,
}

impl CompiledModel {
    pub fn input(&self, name: &str) -> Option<&BoundValue> {
        self.inputs.iter().find(|v| v.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&BoundValue> {
        self.outputs.iter().find(|v| v.name == name)
    }
}

/// Turns graph descriptors into layer graphs.
pub struct Compiler<'r> {
    registry: &'r OperatorRegistry,
    backend: Box<dyn ComputeBackend>,
    options: CompileOptions,
}

impl Compiler<'static> {
    /// A compiler over the global registry and the CPU backend.
    pub fn new() -> Self {
        Self::with_registry(OperatorRegistry::global())
    }
}

impl Default for Compiler<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'r> Compiler<'r> {
    pub fn with_registry(registry: &'r OperatorRegistry) -> Self {
        Self {
            registry,
            backend: Box::new(CpuBackend),
            options: CompileOptions::default(),
        }
    }

    /// Use `backend` for constant folding.
    pub fn with_backend(mut self, backend: impl ComputeBackend + 'static) -> Self {
        self.backend = Box::new(backend);
        self
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn compile(&self, desc: &GraphDescriptor) -> Result<CompiledModel> {
        let mut layers = LayerGraph::new();
        let endpoints = self.compile_into(desc, &mut layers)?;
        Ok(CompiledModel {
            layers,
            inputs: endpoints.inputs,
            outputs: endpoints.outputs,
        })
    }

    /// Compile into a caller-owned, empty layer graph.
    #[instrument(
        skip_all,
        fields(opset = desc.opset, nodes = desc.nodes.len(), backend = self.backend.name())
    )]
    pub fn compile_into(
        &self,
        desc: &GraphDescriptor,
        layers: &mut LayerGraph,
    ) -> Result<Endpoints> {
        if !layers.is_empty() {
            return Err(Error::internal(
                &("Compiler", ""),
                format!("target layer graph already holds {} layers", layers.len()),
            ));
        }
        self.check_opset(desc.opset)?;

        let graph = NodeGraph::build(desc, self.registry, self.options.reorder_nodes)?;
        let mut session = Session::new(graph, self.backend.as_ref(), &self.options);
        session.infer()?;
        let table = session.propagate_roles()?;
        session.commit_layouts(table)?;
        let endpoints = session.materialize(layers)?;

        info!(
            layers = layers.len(),
            folded = session.count(NodeState::Folded),
            materialized = session.count(NodeState::Materialized),
            inputs = endpoints.inputs.len(),
            outputs = endpoints.outputs.len(),
            "compiled graph"
        );
        Ok(endpoints)
    }

    fn check_opset(&self, opset: i64) -> Result<()> {
        let site = ("Graph", "");
        check!(opset > 0, malformed, site, "opset {opset} is not valid");
        check!(
            opset <= self.options.max_opset_version,
            unsupported,
            site,
            "opset {opset} is newer than the supported {}",
            self.options.max_opset_version
        );
        Ok(())
    }
}

/// Per-compilation state, indexed by node.
struct Session<'c> {
    graph: NodeGraph,
    backend: &'c dyn ComputeBackend,
    options: &'c CompileOptions,
    shapes: Vec<Vec<TensorShape>>,
    constants: Vec<Vec<Option<ConstantTensor>>>,
    layouts: Vec<Vec<TensorLayout>>,
}

impl<'c> Session<'c> {
    fn new(graph: NodeGraph, backend: &'c dyn ComputeBackend, options: &'c CompileOptions) -> Self {
        Self {
            graph,
            backend,
            options,
            shapes: Vec::new(),
            constants: Vec::new(),
            layouts: Vec::new(),
        }
    }

    fn count(&self, state: NodeState) -> usize {
        self.graph.nodes().iter().filter(|n| n.state() == state).count()
    }

    fn header(&self, index: usize) -> Result<&OpHeader> {
        self.graph
            .node(index)
            .map(|n| &n.header)
            .ok_or_else(|| Error::internal(&("Compiler", ""), format!("no node {index}")))
    }

    fn operands<'s>(&'s self, header: &'s OpHeader, inputs: &[Option<ValueRef>]) -> Result<Operands<'s>> {
        let mut items = Vec::with_capacity(inputs.len());
        for input in inputs {
            let item = match input {
                Some(v) => {
                    let shape = self
                        .shapes
                        .get(v.node)
                        .and_then(|s| s.get(v.output))
                        .ok_or_else(|| {
                            Error::internal(header, format!("input {v:?} has no shape yet"))
                        })?;
                    let constant = self
                        .constants
                        .get(v.node)
                        .and_then(|c| c.get(v.output))
                        .and_then(Option::as_ref);
                    Some(Operand { shape, constant })
                }
                None => None,
            };
            items.push(item);
        }
        Ok(Operands::new(header, items))
    }

    /// Shapes of every value; folds what can be folded.
    #[instrument(skip_all)]
    fn infer(&mut self) -> Result<()> {
        for index in 0..self.graph.len() {
            let node = &self.graph.nodes()[index];
            let (shapes, constants, folded) = match &node.kind {
                NodeKind::Input(info) => (vec![info.shape.clone()], vec![None], false),
                NodeKind::Initializer(tensor) => {
                    (vec![tensor.shape().clone()], vec![Some(tensor.clone())], true)
                }
                NodeKind::Output => (Vec::new(), Vec::new(), false),
                NodeKind::Operator(op) => {
                    let operands = self.operands(&node.header, node.inputs())?;
                    let shapes = op.output_shapes(&operands)?;
                    for (slot, name) in node.output_names().iter().enumerate().skip(shapes.len()) {
                        if !name.is_empty() {
                            return Err(Error::unsupported(
                                &node.header,
                                format!("output {slot} ('{name}') is not produced"),
                            ));
                        }
                    }
                    if operands.all_constant() || op.folds_from_shapes() {
                        let values = op.fold(&operands, self.backend)?;
                        if values.len() != shapes.len() {
                            return Err(Error::internal(
                                &node.header,
                                format!("folded {} outputs, expected {}", values.len(), shapes.len()),
                            ));
                        }
                        (shapes, values.into_iter().map(Some).collect(), true)
                    } else {
                        let constants = vec![None; shapes.len()];
                        (shapes, constants, false)
                    }
                }
            };
            trace!(node = %node.header.name, ?shapes, "inferred");
            self.shapes.push(shapes);
            self.constants.push(constants);
            if folded {
                self.transition(index, NodeState::Folded)?;
            }
        }
        Ok(())
    }

    fn transition(&mut self, index: usize, to: NodeState) -> Result<()> {
        self.graph
            .node_mut(index)
            .ok_or_else(|| Error::internal(&("Compiler", ""), format!("no node {index}")))?
            .transition(to)
    }

    fn role_table(&self) -> RoleTable {
        let mut table = RoleTable::new();
        for (shapes, constants) in self.shapes.iter().zip(&self.constants) {
            table.push_node(
                shapes
                    .iter()
                    .zip(constants)
                    .map(|(s, c)| (s.clone(), c.is_some())),
            );
        }
        table
    }

    /// Forward then backward over the operators that still need layers.
    #[instrument(skip_all)]
    fn propagate_roles(&self) -> Result<RoleTable> {
        let mut table = self.role_table();
        let pending: Vec<usize> = self
            .graph
            .operators()
            .filter(|(i, _)| self.graph.nodes()[*i].state() == NodeState::Pending)
            .map(|(i, _)| i)
            .collect();
        for index in pending.iter().chain(pending.iter().rev()) {
            let node = &self.graph.nodes()[*index];
            if let NodeKind::Operator(op) = &node.kind {
                let io = node.io(*index, self.shapes[*index].len());
                op.propagate_roles(&io, &mut table)?;
            }
        }
        Ok(table)
    }

    /// Fix a layout for every value. Constants keep the empty layout.
    fn commit_layouts(&mut self, mut table: RoleTable) -> Result<()> {
        for index in 0..self.graph.len() {
            let header = self.header(index)?;
            let layouts = (0..self.shapes[index].len())
                .map(|o| table.commit(header, ValueRef::new(index, o)))
                .collect::<Result<Vec<_>>>()?;
            if layouts.iter().any(|l| !l.is_empty()) {
                debug!(node = %header.name, ?layouts, "committed");
            }
            self.layouts.push(layouts);
        }
        Ok(())
    }

    fn layer_name(&self, name: &str) -> String {
        format!("{}{name}", self.options.layer_name_prefix)
    }

    fn bound_input(
        bound: &[Vec<Option<Tensor>>],
        header: &OpHeader,
        value: ValueRef,
    ) -> Result<Tensor> {
        bound
            .get(value.node)
            .and_then(|b| b.get(value.output))
            .cloned()
            .flatten()
            .ok_or_else(|| Error::internal(header, format!("input {value:?} is not bound yet")))
    }

    #[instrument(skip_all)]
    fn materialize(&mut self, layers: &mut LayerGraph) -> Result<Endpoints> {
        let mut endpoints = Endpoints::default();
        let mut bound: Vec<Vec<Option<Tensor>>> = Vec::with_capacity(self.graph.len());
        for index in 0..self.graph.len() {
            let node = &self.graph.nodes()[index];
            let header = &node.header;
            let shapes = &self.shapes[index];
            let layouts = &self.layouts[index];

            if node.state() == NodeState::Folded {
                bound.push(
                    self.constants[index]
                        .iter()
                        .map(|c| c.clone().map(Tensor::Constant))
                        .collect(),
                );
                continue;
            }

            let outputs: Vec<Tensor> = match &node.kind {
                NodeKind::Input(info) => {
                    let name = layers.unique_name(&self.layer_name(&info.name));
                    let id = layers.add_layer(name, LayerKind::Source, vec![])?;
                    let tensor = layers.output_of(
                        LayerOutput { layer: id, index: 0 },
                        shapes[0].clone(),
                        layouts[0].clone(),
                    )?;
                    endpoints.inputs.push(BoundValue {
                        name: info.name.clone(),
                        layer: id,
                        shape: tensor.shape().clone(),
                        layout: tensor.layout().clone(),
                    });
                    vec![tensor.into()]
                }
                NodeKind::Output => {
                    let value = node.inputs()[0]
                        .ok_or_else(|| Error::internal(header, "graph output is not bound"))?;
                    let tensor = match Self::bound_input(&bound, header, value)? {
                        Tensor::Symbolic(s) => s,
                        Tensor::Constant(_) => {
                            return Err(Error::unsupported(
                                header,
                                "output node must have user-dependent data as input",
                            ))
                        }
                    };
                    let name = layers.unique_name(&self.layer_name(&header.name));
                    let id = layers.add_layer(name, LayerKind::Sink, vec![tensor.output()])?;
                    endpoints.outputs.push(BoundValue {
                        name: header.name.clone(),
                        layer: id,
                        shape: tensor.shape().clone(),
                        layout: tensor.layout().clone(),
                    });
                    Vec::new()
                }
                NodeKind::Initializer(_) => {
                    return Err(Error::internal(header, "initializer was not folded"))
                }
                NodeKind::Operator(op) => {
                    let inputs = node
                        .inputs()
                        .iter()
                        .map(|i| i.map(|v| Self::bound_input(&bound, header, v)).transpose())
                        .collect::<Result<Vec<_>>>()?;
                    let base = if header.name.is_empty() {
                        header.op_type.to_lowercase()
                    } else {
                        header.name.clone()
                    };
                    let mut ctx = MaterializeContext::new(
                        header,
                        inputs,
                        shapes,
                        layouts,
                        layers,
                        self.backend,
                        self.layer_name(&base),
                    );
                    let before = ctx.graph().len();
                    let outputs = op.materialize(&mut ctx)?;
                    let added = ctx.graph().len() - before;
                    if outputs.len() != shapes.len() {
                        return Err(Error::internal(
                            header,
                            format!("materialized {} outputs, expected {}", outputs.len(), shapes.len()),
                        ));
                    }
                    for (slot, (tensor, shape)) in outputs.iter().zip(shapes).enumerate() {
                        if tensor.shape() != shape {
                            return Err(Error::internal(
                                header,
                                format!("output {slot} has shape {}, expected {shape}", tensor.shape()),
                            ));
                        }
                    }
                    debug!(node = %header.name, op = %header.op_type, layers = added, "materialized");
                    outputs
                }
            };
            bound.push(outputs.into_iter().map(Some).collect());
            self.transition(index, NodeState::Materialized)?;
        }
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{descriptor::NodeDescriptor, ErrorKind};

    #[test]
    fn opset_bounds() {
        let compiler = Compiler::new();
        let err = compiler.compile(&GraphDescriptor::new(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        let err = compiler.compile(&GraphDescriptor::new(13)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn compile_into_needs_empty_graph() {
        let mut layers = LayerGraph::new();
        layers.add_layer("stale", LayerKind::Source, vec![]).unwrap();
        let err = Compiler::new()
            .compile_into(&GraphDescriptor::new(12), &mut layers)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn layer_names_get_prefix() {
        let desc = GraphDescriptor::new(12)
            .input("x", [1, 4])
            .node(NodeDescriptor::new("Relu", "act").input("x").output("y"))
            .output("y");
        let model = Compiler::new()
            .with_options(CompileOptions {
                layer_name_prefix: "net/".into(),
                ..Default::default()
            })
            .compile(&desc)
            .unwrap();
        let names: Vec<_> = model.layers.layers().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["net/x", "net/act", "net/y"]);
    }

    #[test]
    fn folded_nodes_add_no_layers() {
        let desc = GraphDescriptor::new(12)
            .input("x", [2, 3])
            .initializer("a", ConstantTensor::from_data([3], vec![1f32, 2., 3.]).unwrap())
            .node(NodeDescriptor::new("Relu", "r").input("a").output("b"))
            .node(NodeDescriptor::new("Add", "add").input("x").input("b").output("y"))
            .output("y");
        let model = Compiler::new().compile(&desc).unwrap();
        assert_eq!(model.layers.count(|k| matches!(k, LayerKind::Activation(_))), 0);
        assert_eq!(model.layers.count(|k| matches!(k, LayerKind::EltwiseSum)), 1);
        assert_eq!(model.output("y").unwrap().shape, TensorShape::from([2, 3]));
    }
}
