use crate::{descriptor::NodeDescriptor, ConstantTensor, Error, Result};

/// A raw attribute value as stored on a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
    Tensor(ConstantTensor),
}

impl Attribute {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Ints(_) => "ints",
            Self::Floats(_) => "floats",
            Self::Strings(_) => "strings",
            Self::Tensor(_) => "tensor",
        }
    }
}

macro_rules! attribute_from {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Attribute {
            fn from(value: $t) -> Self {
                Self::$variant(value.into())
            }
        }
    };
}

attribute_from!(i64, Int);
attribute_from!(f32, Float);
attribute_from!(String, String);
attribute_from!(&str, String);
attribute_from!(Vec<i64>, Ints);
attribute_from!(Vec<f32>, Floats);
attribute_from!(Vec<String>, Strings);
attribute_from!(ConstantTensor, Tensor);

/// Types that can be read out of an [`Attribute`].
pub trait FromAttribute: Sized {
    const EXPECTED: &'static str;

    /// `None` if the stored value has a different type. Scalar readers accept
    /// a one-element list.
    fn from_attribute(attr: &Attribute) -> Option<Self>;
}

impl FromAttribute for i64 {
    const EXPECTED: &'static str = "int";

    fn from_attribute(attr: &Attribute) -> Option<Self> {
        match attr {
            Attribute::Int(v) => Some(*v),
            Attribute::Ints(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }
}

impl FromAttribute for f32 {
    const EXPECTED: &'static str = "float";

    fn from_attribute(attr: &Attribute) -> Option<Self> {
        match attr {
            Attribute::Float(v) => Some(*v),
            Attribute::Floats(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }
}

impl FromAttribute for String {
    const EXPECTED: &'static str = "string";

    fn from_attribute(attr: &Attribute) -> Option<Self> {
        match attr {
            Attribute::String(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromAttribute for Vec<i64> {
    const EXPECTED: &'static str = "ints";

    fn from_attribute(attr: &Attribute) -> Option<Self> {
        match attr {
            Attribute::Ints(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromAttribute for Vec<f32> {
    const EXPECTED: &'static str = "floats";

    fn from_attribute(attr: &Attribute) -> Option<Self> {
        match attr {
            Attribute::Floats(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromAttribute for Vec<String> {
    const EXPECTED: &'static str = "strings";

    fn from_attribute(attr: &Attribute) -> Option<Self> {
        match attr {
            Attribute::Strings(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromAttribute for ConstantTensor {
    const EXPECTED: &'static str = "tensor";

    fn from_attribute(attr: &Attribute) -> Option<Self> {
        match attr {
            Attribute::Tensor(t) => Some(t.clone()),
            _ => None,
        }
    }
}

/// Typed view over a node's attribute list.
pub struct Attributes<'a> {
    node: &'a NodeDescriptor,
}

impl<'a> Attributes<'a> {
    pub fn new(node: &'a NodeDescriptor) -> Self {
        Self { node }
    }

    fn find(&self, name: &str) -> Option<&'a Attribute> {
        self.node
            .attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a)
    }

    pub fn has(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    fn read<T: FromAttribute>(&self, name: &str, attr: &Attribute) -> Result<T> {
        T::from_attribute(attr).ok_or_else(|| {
            Error::malformed(
                self.node,
                format!(
                    "attribute '{name}' is {}, expected {}",
                    attr.type_name(),
                    T::EXPECTED
                ),
            )
        })
    }

    /// The attribute value, or `default` if it is absent. A present value of
    /// the wrong type is still an error.
    pub fn get_optional<T: FromAttribute>(&self, name: &str, default: T) -> Result<T> {
        match self.find(name) {
            Some(attr) => self.read(name, attr),
            None => Ok(default),
        }
    }

    pub fn get_required<T: FromAttribute>(&self, name: &str) -> Result<T> {
        match self.find(name) {
            Some(attr) => self.read(name, attr),
            None => Err(Error::malformed(
                self.node,
                format!("missing required attribute '{name}'"),
            )),
        }
    }

    /// The attribute value if present.
    pub fn get<T: FromAttribute>(&self, name: &str) -> Result<Option<T>> {
        self.find(name).map(|attr| self.read(name, attr)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn node() -> NodeDescriptor {
        NodeDescriptor::new("Conv", "conv1")
            .attr("group", 2i64)
            .attr("strides", vec![2i64, 2])
            .attr("auto_pad", "VALID")
            .attr("alpha", vec![0.5f32])
    }

    #[test]
    fn optional_and_required() {
        let node = node();
        let attrs = Attributes::new(&node);
        assert_eq!(attrs.get_optional("group", 1i64).unwrap(), 2);
        assert_eq!(attrs.get_optional("missing", 7i64).unwrap(), 7);
        assert_eq!(attrs.get_required::<Vec<i64>>("strides").unwrap(), vec![2, 2]);
        assert_eq!(attrs.get_required::<String>("auto_pad").unwrap(), "VALID");
        assert_eq!(attrs.get_required::<f32>("alpha").unwrap(), 0.5);
        assert!(attrs.has("group"));
    }

    #[test]
    fn missing_required_names_node_and_attribute() {
        let node = node();
        let err = Attributes::new(&node)
            .get_required::<Vec<i64>>("kernel_shape")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        let text = err.to_string();
        assert!(text.contains("Conv"), "{text}");
        assert!(text.contains("kernel_shape"), "{text}");
    }

    #[test]
    fn wrong_type_is_malformed() {
        let node = node();
        let attrs = Attributes::new(&node);
        let err = attrs.get_optional::<i64>("strides", 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
        assert!(attrs.get_required::<f32>("group").is_err());
    }
}
