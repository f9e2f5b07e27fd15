//! Layerport compiles ONNX-style operator graphs into layer graphs for a runtime whose
//! tensors have seven named physical dimensions.
//!
//! Two things are decided at compile time. Every edge of the graph is either a constant,
//! known now and folded through the [`ComputeBackend`], or symbolic, produced by a layer at
//! run time. And every axis of every symbolic tensor is mapped onto one of the seven
//! [`Dim`] slots, so that each layer sees its operands in the slots it expects.
//!
//! ## A quick guide
//! - Describe the graph with a [`GraphDescriptor`]: declared inputs, initializers, nodes and
//!   the names of the output values.
//! - Create a [`Compiler`]. By default it uses the global [`OperatorRegistry`] and the
//!   [`CpuBackend`] for folding.
//! - [`Compiler::compile`] returns a [`CompiledModel`]: the [`LayerGraph`] plus the `Source`
//!   and `Sink` layers bound to each graph input and output.
//!
//! ## What can you do with it?
//! ```
//! use layerport_core::{Compiler, ConstantTensor, GraphDescriptor, LayerKind, NodeDescriptor};
//!
//! let desc = GraphDescriptor::new(11)
//!     .input("x", [2, 3])
//!     .initializer("b", ConstantTensor::from_data([3], vec![1f32, 2., 3.]).unwrap())
//!     .node(NodeDescriptor::new("Add", "add").input("x").input("b").output("sum"))
//!     .node(NodeDescriptor::new("Relu", "relu").input("sum").output("y"))
//!     .output("y");
//!
//! let model = Compiler::new().compile(&desc).unwrap();
//!
//! assert_eq!(model.layers.count(|k| matches!(k, LayerKind::EltwiseSum)), 1);
//! assert_eq!(model.output("y").unwrap().shape.dims(), &[2, 3]);
//! ```

pub mod attributes;
pub mod backend;
pub mod broadcast;
mod compiler;
pub mod descriptor;
pub mod dtype;
mod error;
pub mod graph;
pub mod layer;
mod layout;
pub mod ops;
mod registry;
pub mod roles;
mod shape;
pub mod tensor;

pub use attributes::{Attribute, Attributes};
pub use backend::{ComputeBackend, CpuBackend};
pub use compiler::{BoundValue, CompileOptions, CompiledModel, Compiler, Endpoints};
pub use descriptor::{GraphDescriptor, Initializer, NodeDescriptor, ValueInfo};
pub use dtype::{DType, DataType, TensorData};
pub use error::{Error, ErrorKind, ErrorSite, Result};
pub use layer::{Layer, LayerGraph, LayerKind};
pub use layout::{Dim, TensorLayout};
pub use registry::OperatorRegistry;
pub use shape::TensorShape;
pub use tensor::{ConstantTensor, LayerId, LayerOutput, SymbolicTensor, Tensor};
