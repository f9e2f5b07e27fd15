use std::{collections::HashMap, fmt, sync::OnceLock};

use crate::{
    descriptor::NodeDescriptor,
    ops::{Operator, OperatorConstructor, BUILTINS},
    Error, Result,
};

/// Maps op type names to operator constructors.
///
/// The process-wide instance from [`OperatorRegistry::global`] is filled once
/// with the builtin operators and is read-only afterwards, so concurrent
/// compilations can share it.
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    constructors: HashMap<String, OperatorConstructor>,
}

impl fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperatorRegistry")
            .field("op_types", &self.op_types())
            .finish()
    }
}

static GLOBAL: OnceLock<OperatorRegistry> = OnceLock::new();

impl OperatorRegistry {
    /// A registry without any operators.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A registry holding every builtin operator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for (name, ctor) in BUILTINS {
            registry.constructors.insert(name.to_string(), *ctor);
        }
        registry
    }

    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(Self::with_builtins)
    }

    /// Register `ctor` under `op_type`. Names can only be registered once.
    pub fn register(&mut self, op_type: impl Into<String>, ctor: OperatorConstructor) -> Result<()> {
        let op_type = op_type.into();
        if self.constructors.contains_key(&op_type) {
            return Err(Error::internal(
                &(op_type.as_str(), ""),
                "operator is already registered",
            ));
        }
        self.constructors.insert(op_type, ctor);
        Ok(())
    }

    pub fn contains(&self, op_type: &str) -> bool {
        self.constructors.contains_key(op_type)
    }

    /// Registered op type names, sorted.
    pub fn op_types(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the operator for `node`.
    pub fn create(&self, node: &NodeDescriptor, opset: i64) -> Result<Operator> {
        let ctor = self.constructors.get(&node.op_type).ok_or_else(|| {
            Error::unsupported(node, format!("operator {} is not supported", node.op_type))
        })?;
        ctor(node, opset)
    }
}
