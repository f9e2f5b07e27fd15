use std::fmt::{self, Display};

use crate::{TensorLayout, TensorShape};

/// Index of a layer in a [`LayerGraph`](crate::LayerGraph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub(crate) usize);

impl LayerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One output slot of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerOutput {
    pub layer: LayerId,
    pub index: usize,
}

impl Display for LayerOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.layer, self.index)
    }
}

/// A tensor computed at run time by a layer output.
///
/// Only [`LayerGraph::output_of`](crate::LayerGraph::output_of) creates these,
/// so the referenced output always exists.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolicTensor {
    shape: TensorShape,
    layout: TensorLayout,
    output: LayerOutput,
}

impl SymbolicTensor {
    pub(crate) fn new(shape: TensorShape, layout: TensorLayout, output: LayerOutput) -> Self {
        Self {
            shape,
            layout,
            output,
        }
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn layout(&self) -> &TensorLayout {
        &self.layout
    }

    pub fn output(&self) -> LayerOutput {
        self.output
    }

    /// The same layer output viewed under another shape and layout. Only valid
    /// when the memory image is unchanged, e.g. adding or removing unit axes.
    pub(crate) fn relabeled(&self, shape: TensorShape, layout: TensorLayout) -> Self {
        Self {
            shape,
            layout,
            output: self.output,
        }
    }
}
