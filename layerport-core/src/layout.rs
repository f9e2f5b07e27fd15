use std::fmt::{self, Display};

use crate::{Error, Result};

/// Physical dimension slot of a runtime blob.
///
/// Blob memory is row-major over the slots in declaration order, so the order
/// of variants is significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dim {
    BatchLength,
    BatchWidth,
    ListSize,
    Height,
    Width,
    Depth,
    Channels,
}

impl Dim {
    pub const COUNT: usize = 7;

    pub const ALL: [Dim; Dim::COUNT] = [
        Dim::BatchLength,
        Dim::BatchWidth,
        Dim::ListSize,
        Dim::Height,
        Dim::Width,
        Dim::Depth,
        Dim::Channels,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Dim::BatchLength => "BL",
            Dim::BatchWidth => "BW",
            Dim::ListSize => "LS",
            Dim::Height => "H",
            Dim::Width => "W",
            Dim::Depth => "D",
            Dim::Channels => "C",
        }
    }
}

impl Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

/// Mapping from tensor axes to physical slots, one entry per axis.
///
/// An empty layout means the tensor has not been committed to slots and is
/// still in source axis order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TensorLayout(Vec<Dim>);

impl TensorLayout {
    /// Build a layout, rejecting slots that appear twice.
    pub fn new(dims: impl Into<Vec<Dim>>) -> Result<Self> {
        let dims = dims.into();
        for (i, d) in dims.iter().enumerate() {
            if dims[..i].contains(d) {
                return Err(Error::internal(
                    &("TensorLayout", ""),
                    format!("slot {d} assigned to two axes in {dims:?}"),
                ));
            }
        }
        Ok(Self(dims))
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn dims(&self) -> &[Dim] {
        &self.0
    }

    pub fn contains(&self, dim: Dim) -> bool {
        self.0.contains(&dim)
    }

    pub fn position(&self, dim: Dim) -> Option<usize> {
        self.0.iter().position(|d| *d == dim)
    }

    /// Whether the physical order differs from the source axis order.
    pub fn is_transposed(&self) -> bool {
        self.0.windows(2).any(|w| w[0] > w[1])
    }

    /// Slots not used by this layout, in slot order.
    pub fn unused(&self) -> impl Iterator<Item = Dim> + '_ {
        Dim::ALL.into_iter().filter(|d| !self.0.contains(d))
    }

    /// The same slots assigned in increasing order, so that physical order
    /// equals source order.
    pub fn sorted(&self) -> Self {
        let mut dims = self.0.clone();
        dims.sort();
        Self(dims)
    }

    /// Axis indices in the order they are laid out in memory.
    ///
    /// For an empty layout this is the identity over `rank` axes.
    pub fn source_order_permutation(&self, rank: usize) -> Vec<usize> {
        if self.is_empty() {
            return (0..rank).collect();
        }
        let mut perm: Vec<usize> = (0..self.0.len()).collect();
        perm.sort_by_key(|i| self.0[*i]);
        perm
    }

    /// Whether re-labelling a tensor of `extents` from `self` to `to` has to
    /// move data. Axes of extent 1 never affect the memory image.
    pub fn moves_data(&self, to: &TensorLayout, extents: &[usize]) -> bool {
        let order = |layout: &TensorLayout| -> Vec<usize> {
            layout
                .source_order_permutation(extents.len())
                .into_iter()
                .filter(|axis| extents[*axis] > 1)
                .collect()
        };
        order(self) != order(to)
    }
}

impl Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}
