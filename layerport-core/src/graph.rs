//! The node graph the compiler walks: one arena entry per graph input,
//! initializer, operator and graph output, wired by `(producer, output)`
//! references resolved once at load time.

use std::collections::{HashMap, HashSet};

use petgraph::{algo::toposort, graphmap::DiGraphMap};
use tracing::debug;

use crate::{
    descriptor::{GraphDescriptor, NodeDescriptor, ValueInfo},
    ops::{LayerOperator, NodeIo, OpHeader, Operator},
    registry::OperatorRegistry,
    ConstantTensor, Error, Result,
};

/// Output `output` of node `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueRef {
    pub node: usize,
    pub output: usize,
}

impl ValueRef {
    pub fn new(node: usize, output: usize) -> Self {
        Self { node, output }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    /// Outputs were computed at compile time.
    Folded,
    /// Outputs are bound to layer outputs.
    Materialized,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Input(ValueInfo),
    Initializer(ConstantTensor),
    Operator(Operator),
    /// A designated graph output; becomes a sink.
    Output,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub header: OpHeader,
    pub kind: NodeKind,
    inputs: Vec<Option<ValueRef>>,
    /// Declared output names; empty names are omitted optional outputs.
    outputs: Vec<String>,
    state: NodeState,
}

impl Node {
    fn new(header: OpHeader, kind: NodeKind, input_count: usize, outputs: Vec<String>) -> Self {
        Self {
            header,
            kind,
            inputs: vec![None; input_count],
            outputs,
            state: NodeState::Pending,
        }
    }

    pub fn inputs(&self) -> &[Option<ValueRef>] {
        &self.inputs
    }

    pub fn output_names(&self) -> &[String] {
        &self.outputs
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Wire input `index` to `value`. Every input is bound at most once.
    pub(crate) fn bind_input(&mut self, index: usize, value: ValueRef) -> Result<()> {
        match self.inputs.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(value);
                Ok(())
            }
            Some(Some(bound)) => Err(Error::internal(
                &self.header,
                format!("input {index} is already bound to {bound:?}"),
            )),
            None => Err(Error::internal(
                &self.header,
                format!("node has no input {index}"),
            )),
        }
    }

    /// Leave `Pending`. A node is folded or materialized exactly once.
    pub(crate) fn transition(&mut self, to: NodeState) -> Result<()> {
        if self.state != NodeState::Pending || to == NodeState::Pending {
            return Err(Error::internal(
                &self.header,
                format!("cannot move from {:?} to {to:?}", self.state),
            ));
        }
        debug!(node = %self.header.name, op = %self.header.op_type, state = ?to, "node state");
        self.state = to;
        Ok(())
    }

    /// Role-propagation view of this node, for `output_count` outputs.
    pub(crate) fn io(&self, index: usize, output_count: usize) -> NodeIo {
        NodeIo {
            inputs: self.inputs.clone(),
            outputs: (0..output_count).map(|o| ValueRef::new(index, o)).collect(),
        }
    }
}

/// Arena of nodes in an order where every producer precedes its consumers.
#[derive(Debug, Clone, Default)]
pub struct NodeGraph {
    nodes: Vec<Node>,
}

impl NodeGraph {
    /// Create every operator, then link the nodes by value name.
    ///
    /// Initializers come first and shadow graph inputs of the same name.
    /// Operators are visited in declaration order unless `reorder` is set,
    /// in which case they are sorted topologically first. A reference to a
    /// value produced by a later node is rejected either way.
    pub fn build(
        desc: &GraphDescriptor,
        registry: &OperatorRegistry,
        reorder: bool,
    ) -> Result<Self> {
        let operators = desc
            .nodes
            .iter()
            .map(|node| registry.create(node, desc.opset))
            .collect::<Result<Vec<_>>>()?;

        let order: Vec<usize> = if reorder {
            topological_order(&desc.nodes)?
        } else {
            (0..desc.nodes.len()).collect()
        };

        let mut graph = Self::default();
        let mut producers: HashMap<&str, ValueRef> = HashMap::new();

        for init in &desc.initializers {
            let header = OpHeader::new("Initializer", init.name.clone(), desc.opset);
            if producers.contains_key(init.name.as_str()) {
                return Err(Error::malformed(&header, "value is defined twice"));
            }
            let index = graph.push(Node::new(
                header,
                NodeKind::Initializer(init.tensor.clone()),
                0,
                vec![init.name.clone()],
            ));
            producers.insert(&init.name, ValueRef::new(index, 0));
        }
        for input in &desc.inputs {
            if producers.contains_key(input.name.as_str()) {
                debug!(input = %input.name, "graph input shadowed by an initializer");
                continue;
            }
            let header = OpHeader::new("GraphInput", input.name.clone(), desc.opset);
            let index = graph.push(Node::new(
                header,
                NodeKind::Input(input.clone()),
                0,
                vec![input.name.clone()],
            ));
            producers.insert(&input.name, ValueRef::new(index, 0));
        }

        let declared: HashSet<&str> = desc
            .nodes
            .iter()
            .flat_map(|n| n.outputs.iter().map(String::as_str))
            .filter(|name| !name.is_empty())
            .collect();

        let mut operators: Vec<Option<Operator>> = operators.into_iter().map(Some).collect();
        for position in order {
            let node = &desc.nodes[position];
            let operator = operators[position].take().ok_or_else(|| {
                Error::internal(node, "node visited twice while linking")
            })?;
            let header = operator.header().clone();
            let mut entry = Node::new(
                header,
                NodeKind::Operator(operator),
                node.inputs.len(),
                node.outputs.clone(),
            );
            for (slot, name) in node.inputs.iter().enumerate() {
                if name.is_empty() {
                    continue;
                }
                let value = match producers.get(name.as_str()) {
                    Some(v) => *v,
                    None if declared.contains(name.as_str()) => {
                        return Err(Error::malformed(
                            node,
                            format!(
                                "input '{name}' is produced later; \
                                 the graph is not topologically sorted"
                            ),
                        ))
                    }
                    None => {
                        return Err(Error::malformed(
                            node,
                            format!("input '{name}' is not defined"),
                        ))
                    }
                };
                entry.bind_input(slot, value)?;
            }
            let index = graph.push(entry);
            for (slot, name) in node.outputs.iter().enumerate() {
                if name.is_empty() {
                    continue;
                }
                if producers.insert(name, ValueRef::new(index, slot)).is_some() {
                    return Err(Error::malformed(
                        node,
                        format!("value '{name}' is defined twice"),
                    ));
                }
            }
        }

        for name in &desc.outputs {
            let header = OpHeader::new("GraphOutput", name.clone(), desc.opset);
            let value = producers.get(name.as_str()).copied().ok_or_else(|| {
                Error::malformed(&header, format!("graph output '{name}' is not defined"))
            })?;
            let mut entry = Node::new(header, NodeKind::Output, 1, Vec::new());
            entry.bind_input(0, value)?;
            graph.push(entry);
        }
        debug!(nodes = graph.len(), "linked node graph");
        Ok(graph)
    }

    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub(crate) fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.nodes.get_mut(index)
    }

    /// Operator nodes, in visitation order.
    pub fn operators(&self) -> impl Iterator<Item = (usize, &Operator)> {
        self.nodes.iter().enumerate().filter_map(|(i, n)| match &n.kind {
            NodeKind::Operator(op) => Some((i, op)),
            _ => None,
        })
    }
}

/// Declaration indices sorted so that producers come before consumers.
fn topological_order(nodes: &[NodeDescriptor]) -> Result<Vec<usize>> {
    let mut producer: HashMap<&str, usize> = HashMap::new();
    for (i, node) in nodes.iter().enumerate() {
        for name in node.outputs.iter().filter(|n| !n.is_empty()) {
            producer.insert(name, i);
        }
    }
    let mut deps = DiGraphMap::<usize, ()>::new();
    for i in 0..nodes.len() {
        deps.add_node(i);
    }
    for (i, node) in nodes.iter().enumerate() {
        for name in &node.inputs {
            if let Some(p) = producer.get(name.as_str()) {
                deps.add_edge(*p, i, ());
            }
        }
    }
    toposort(&deps, None).map_err(|cycle| {
        let node = &nodes[cycle.node_id()];
        Error::malformed(node, "the graph has a cycle through this node")
    })
}
