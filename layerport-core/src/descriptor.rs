//! In-memory form of a deserialized ONNX-style graph.
//!
//! Decoding the wire format is left to the caller; these types are what the
//! compiler consumes.

use crate::{
    attributes::Attribute,
    dtype::{DataType, TensorData},
    error::ErrorSite,
    ConstantTensor, Error, Result, TensorShape,
};

/// Declared shape of a graph input whose data is supplied at run time.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueInfo {
    pub name: String,
    pub shape: TensorShape,
    pub data_type: DataType,
}

impl ValueInfo {
    pub fn new(name: impl Into<String>, shape: impl Into<TensorShape>) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
            data_type: DataType::Float,
        }
    }
}

/// A named constant stored in the graph (weights, biases, shape vectors).
#[derive(Debug, Clone, PartialEq)]
pub struct Initializer {
    pub name: String,
    pub tensor: ConstantTensor,
}

impl Initializer {
    pub fn new(name: impl Into<String>, tensor: ConstantTensor) -> Self {
        Self {
            name: name.into(),
            tensor,
        }
    }

    /// Build from the little-endian `raw_data` image used by serialized graphs.
    pub fn from_raw(
        name: impl Into<String>,
        data_type: DataType,
        shape: impl Into<TensorShape>,
        raw: &[u8],
    ) -> Result<Self> {
        let name = name.into();
        let data = TensorData::from_le_bytes(data_type, raw).ok_or_else(|| {
            Error::malformed(
                &("Initializer", name.as_str()),
                format!("raw data of {} bytes is not a {data_type} buffer", raw.len()),
            )
        })?;
        let shape = shape.into();
        if data.len() != shape.element_count() {
            return Err(Error::malformed(
                &("Initializer", name.as_str()),
                format!("{} elements do not fill shape {shape}", data.len()),
            ));
        }
        let tensor = ConstantTensor::from_data(shape, data)?;
        Ok(Self { name, tensor })
    }
}

/// One operator node as declared in the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    pub op_type: String,
    pub name: String,
    /// Value names; an empty string marks an omitted optional input.
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<(String, Attribute)>,
}

impl NodeDescriptor {
    pub fn new(op_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<Attribute>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }
}

impl ErrorSite for NodeDescriptor {
    fn op_type(&self) -> &str {
        &self.op_type
    }

    fn node_name(&self) -> &str {
        &self.name
    }
}

/// A whole graph: declared inputs, stored constants, nodes in declaration
/// order, and the names of the values exposed as outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphDescriptor {
    pub opset: i64,
    pub inputs: Vec<ValueInfo>,
    pub initializers: Vec<Initializer>,
    pub nodes: Vec<NodeDescriptor>,
    pub outputs: Vec<String>,
}

impl GraphDescriptor {
    pub fn new(opset: i64) -> Self {
        Self {
            opset,
            inputs: Vec::new(),
            initializers: Vec::new(),
            nodes: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, name: impl Into<String>, shape: impl Into<TensorShape>) -> Self {
        self.inputs.push(ValueInfo::new(name, shape));
        self
    }

    pub fn initializer(mut self, name: impl Into<String>, tensor: ConstantTensor) -> Self {
        self.initializers.push(Initializer::new(name, tensor));
        self
    }

    pub fn node(mut self, node: NodeDescriptor) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }
}
