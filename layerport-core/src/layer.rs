use std::{
    collections::HashSet,
    fmt::{self, Display},
};

use petgraph::{
    dot::{Config, Dot},
    Graph as PetGraph,
};

use crate::{
    tensor::{LayerId, LayerOutput, SymbolicTensor},
    ConstantTensor, Dim, Error, Result, TensorLayout, TensorShape,
};

/// Elementwise activation functions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
    Abs,
    Elu { alpha: f32 },
    LeakyRelu { alpha: f32 },
    Clip { min: f32, max: f32 },
    /// `x * multiplier + free_term`
    Linear { multiplier: f32, free_term: f32 },
}

impl ActivationKind {
    pub fn apply(&self, x: f32) -> f32 {
        match *self {
            Self::Relu => x.max(0.),
            Self::Sigmoid => 1. / (1. + (-x).exp()),
            Self::Tanh => x.tanh(),
            Self::Abs => x.abs(),
            Self::Elu { alpha } => {
                if x >= 0. {
                    x
                } else {
                    alpha * (x.exp() - 1.)
                }
            }
            Self::LeakyRelu { alpha } => {
                if x >= 0. {
                    x
                } else {
                    alpha * x
                }
            }
            Self::Clip { min, max } => x.max(min).min(max),
            Self::Linear {
                multiplier,
                free_term,
            } => x * multiplier + free_term,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Mean,
}

/// Spatial parameters, indexed `[height, width]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvParams {
    pub filter_count: usize,
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub pads: [usize; 2],
    pub dilations: [usize; 2],
}

/// Spatial parameters, indexed `[height, width]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolParams {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub pads: [usize; 2],
}

/// The runtime layer types a compiled graph is made of.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    /// A graph input, filled at run time.
    Source,
    /// A blob with fixed contents.
    ConstantSource { tensor: ConstantTensor },
    /// A graph output.
    Sink,
    /// Moves data so that the same tensor is laid out under `to`.
    LayoutConversion { from: TensorLayout, to: TensorLayout },
    /// Repeats unit-extent slots up to `shape`.
    Broadcast { shape: TensorShape },
    EltwiseSum,
    EltwiseMul,
    Activation(ActivationKind),
    Conv {
        filter: ConstantTensor,
        free_term: Option<ConstantTensor>,
        params: ConvParams,
    },
    ChannelwiseConv {
        filter: ConstantTensor,
        free_term: Option<ConstantTensor>,
        params: ConvParams,
    },
    Pooling { kind: PoolKind, params: PoolParams },
    GlobalPooling { kind: PoolKind },
    /// `y = x * gamma + beta` per channel.
    BatchNorm {
        gamma: ConstantTensor,
        beta: ConstantTensor,
    },
    FullyConnected {
        weights: ConstantTensor,
        free_term: Option<ConstantTensor>,
    },
    /// `x / (bias + alpha / size * sum(x^2))^beta` over a window of `size`
    /// neighbouring channels.
    Lrn {
        size: usize,
        alpha: f32,
        beta: f32,
        bias: f32,
    },
    /// One-direction LSTM stepping along `BatchLength`. Both weight matrices
    /// are `[BatchWidth = 4 * hidden_size, Channels]` with the gate blocks in
    /// `c, f, i, o` order.
    Lstm {
        hidden_size: usize,
        input_weights: ConstantTensor,
        recurrent_weights: ConstantTensor,
        free_term: Option<ConstantTensor>,
        reverse: bool,
    },
    /// Softmax over each object (all non-batch slots).
    Softmax,
    /// Reinterprets a non-transposed blob under a new shape.
    Reshape { from: TensorShape, to: TensorShape },
    Concat { dim: Dim },
    Slice { dim: Dim, start: usize, length: usize },
}

impl LayerKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Source => "Source",
            Self::ConstantSource { .. } => "ConstantSource",
            Self::Sink => "Sink",
            Self::LayoutConversion { .. } => "LayoutConversion",
            Self::Broadcast { .. } => "Broadcast",
            Self::EltwiseSum => "EltwiseSum",
            Self::EltwiseMul => "EltwiseMul",
            Self::Activation(_) => "Activation",
            Self::Conv { .. } => "Conv",
            Self::ChannelwiseConv { .. } => "ChannelwiseConv",
            Self::Pooling { .. } => "Pooling",
            Self::GlobalPooling { .. } => "GlobalPooling",
            Self::BatchNorm { .. } => "BatchNorm",
            Self::FullyConnected { .. } => "FullyConnected",
            Self::Lrn { .. } => "Lrn",
            Self::Lstm { .. } => "Lstm",
            Self::Softmax => "Softmax",
            Self::Reshape { .. } => "Reshape",
            Self::Concat { .. } => "Concat",
            Self::Slice { .. } => "Slice",
        }
    }

    pub fn output_count(&self) -> usize {
        match self {
            Self::Sink => 0,
            _ => 1,
        }
    }
}

impl Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConstantSource { tensor } => write!(f, "ConstantSource({})", tensor.shape()),
            Self::LayoutConversion { from, to } => write!(f, "LayoutConversion({from} -> {to})"),
            Self::Broadcast { shape } => write!(f, "Broadcast({shape})"),
            Self::Activation(kind) => write!(f, "Activation({kind:?})"),
            Self::Pooling { kind, .. } => write!(f, "Pooling({kind:?})"),
            Self::GlobalPooling { kind } => write!(f, "GlobalPooling({kind:?})"),
            Self::Reshape { from, to } => write!(f, "Reshape({from} -> {to})"),
            Self::Concat { dim } => write!(f, "Concat({dim})"),
            Self::Lstm {
                hidden_size,
                reverse,
                ..
            } => write!(f, "Lstm({hidden_size}{})", if *reverse { ", reverse" } else { "" }),
            Self::Slice { dim, start, length } => {
                write!(f, "Slice({dim}, {start}..{})", start + length)
            }
            other => write!(f, "{}", other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    pub inputs: Vec<LayerOutput>,
    pub output_count: usize,
}

/// An append-only graph of runtime layers wired by `(layer, output)` pairs.
///
/// Layers are never modified after they are added, and an input may only
/// reference a layer added before it.
#[derive(Debug, Clone, Default)]
pub struct LayerGraph {
    layers: Vec<Layer>,
    names: HashSet<String>,
}

impl LayerGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.get(id.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LayerId, &Layer)> {
        self.layers.iter().enumerate().map(|(i, l)| (LayerId(i), l))
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// `base`, or `base_N` for the smallest N that is not taken yet.
    pub fn unique_name(&self, base: &str) -> String {
        if !self.names.contains(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|n| !self.names.contains(n))
            .unwrap_or_else(|| base.to_string())
    }

    fn check_output(&self, output: LayerOutput, site: &str) -> Result<()> {
        match self.layers.get(output.layer.0) {
            Some(layer) if output.index < layer.output_count => Ok(()),
            Some(layer) => Err(Error::internal(
                &("LayerGraph", site),
                format!(
                    "layer '{}' has no output {} (it has {})",
                    layer.name, output.index, layer.output_count
                ),
            )),
            None => Err(Error::internal(
                &("LayerGraph", site),
                format!("forward reference to layer {}", output.layer),
            )),
        }
    }

    /// Append a layer. Inputs must reference existing layer outputs.
    pub fn add_layer(
        &mut self,
        name: impl Into<String>,
        kind: LayerKind,
        inputs: Vec<LayerOutput>,
    ) -> Result<LayerId> {
        let name = name.into();
        for input in &inputs {
            self.check_output(*input, &name)?;
        }
        if !self.names.insert(name.clone()) {
            return Err(Error::internal(
                &("LayerGraph", name.as_str()),
                "layer name is already taken",
            ));
        }
        let id = LayerId(self.layers.len());
        self.layers.push(Layer {
            name,
            output_count: kind.output_count(),
            kind,
            inputs,
        });
        Ok(id)
    }

    /// A typed handle to an existing layer output.
    pub fn output_of(
        &self,
        output: LayerOutput,
        shape: TensorShape,
        layout: TensorLayout,
    ) -> Result<SymbolicTensor> {
        self.check_output(output, "output_of")?;
        if !layout.is_empty() && layout.rank() != shape.rank() {
            return Err(Error::internal(
                &("LayerGraph", "output_of"),
                format!("layout {layout} does not match shape {shape}"),
            ));
        }
        Ok(SymbolicTensor::new(shape, layout, output))
    }

    /// Number of layers whose kind satisfies `pred`.
    pub fn count(&self, pred: impl Fn(&LayerKind) -> bool) -> usize {
        self.layers.iter().filter(|l| pred(&l.kind)).count()
    }

    /// Layers reading any output of `id`.
    pub fn consumers(&self, id: LayerId) -> Vec<LayerId> {
        self.iter()
            .filter(|(_, l)| l.inputs.iter().any(|i| i.layer == id))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn to_petgraph(&self) -> PetGraph<String, usize> {
        let mut g = PetGraph::<String, usize>::new();
        let nodes: Vec<_> = self
            .layers
            .iter()
            .map(|l| g.add_node(format!("{}\n{}", l.name, l.kind)))
            .collect();
        for (dst, layer) in self.layers.iter().enumerate() {
            for input in &layer.inputs {
                g.add_edge(nodes[input.layer.0], nodes[dst], input.index);
            }
        }
        g
    }

    pub fn to_dot(&self) -> String {
        let g = self.to_petgraph();
        format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }
}
