//! Dimension-role propagation.
//!
//! Every value (node output) gets one row with a slot per axis. Operators
//! pin axes to physical slots and link axes across their inputs and outputs;
//! once propagation settles, the remaining free axes are committed. A free
//! axis takes the slot already committed for an axis it is linked to when it
//! can, and the smallest unused slot otherwise. The table lives for one
//! compilation.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::{error::ErrorSite, graph::ValueRef, Dim, Error, Result, TensorLayout, TensorShape};

#[derive(Debug, Clone)]
struct Row {
    shape: TensorShape,
    constant: bool,
    roles: Vec<Option<Dim>>,
}

/// One axis of one value.
type AxisRef = (ValueRef, usize);

#[derive(Debug, Clone, Default)]
pub struct RoleTable {
    rows: Vec<Vec<Row>>,
    links: BTreeMap<AxisRef, BTreeSet<AxisRef>>,
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the outputs of the next node, as `(shape, is_constant)` pairs.
    /// Constant values take no part in propagation.
    pub fn push_node(&mut self, outputs: impl IntoIterator<Item = (TensorShape, bool)>) -> usize {
        self.rows.push(
            outputs
                .into_iter()
                .map(|(shape, constant)| Row {
                    roles: vec![None; shape.rank()],
                    shape,
                    constant,
                })
                .collect(),
        );
        self.rows.len() - 1
    }

    fn row(&self, value: ValueRef) -> Result<&Row> {
        self.rows
            .get(value.node)
            .and_then(|r| r.get(value.output))
            .ok_or_else(|| {
                Error::internal(&("RoleTable", ""), format!("no row for value {value:?}"))
            })
    }

    fn row_mut(&mut self, value: ValueRef) -> Result<&mut Row> {
        self.rows
            .get_mut(value.node)
            .and_then(|r| r.get_mut(value.output))
            .ok_or_else(|| {
                Error::internal(&("RoleTable", ""), format!("no row for value {value:?}"))
            })
    }

    pub fn shape(&self, value: ValueRef) -> Result<&TensorShape> {
        Ok(&self.row(value)?.shape)
    }

    pub fn is_constant(&self, value: ValueRef) -> bool {
        self.row(value).map(|r| r.constant).unwrap_or(true)
    }

    pub fn role(&self, value: ValueRef, axis: usize) -> Option<Dim> {
        self.row(value)
            .ok()
            .and_then(|r| r.roles.get(axis).copied().flatten())
    }

    pub fn roles(&self, value: ValueRef) -> Result<&[Option<Dim>]> {
        Ok(&self.row(value)?.roles)
    }

    /// Whether every axis of `value` has a slot.
    pub fn is_resolved(&self, value: ValueRef) -> bool {
        self.row(value)
            .map(|r| r.roles.iter().all(Option::is_some))
            .unwrap_or(false)
    }

    /// Pin `axis` of `value` to `dim`. Returns whether anything changed.
    ///
    /// Re-pinning to the same slot is a no-op; pinning to a different slot, or
    /// to a slot another axis already holds, is an internal inconsistency.
    pub fn require<S: ErrorSite + ?Sized>(
        &mut self,
        site: &S,
        value: ValueRef,
        axis: usize,
        dim: Dim,
    ) -> Result<bool> {
        let row = self.row_mut(value)?;
        if row.constant {
            return Ok(false);
        }
        let rank = row.roles.len();
        let Some(current) = row.roles.get(axis).copied() else {
            return Err(Error::internal(
                site,
                format!("axis {axis} is out of range for rank {rank}"),
            ));
        };
        match current {
            Some(d) if d == dim => Ok(false),
            Some(d) => Err(Error::internal(
                site,
                format!("axis {axis} of {value:?} is already {d}, cannot become {dim}"),
            )),
            None => {
                if let Some(other) = row.roles.iter().position(|r| *r == Some(dim)) {
                    return Err(Error::internal(
                        site,
                        format!("slot {dim} of {value:?} is already taken by axis {other}"),
                    ));
                }
                row.roles[axis] = Some(dim);
                trace!(?value, axis, %dim, "role pinned");
                Ok(true)
            }
        }
    }

    /// Pin every axis of `value`.
    pub fn require_layout<S: ErrorSite + ?Sized>(
        &mut self,
        site: &S,
        value: ValueRef,
        dims: &[Dim],
    ) -> Result<()> {
        let rank = self.shape(value)?.rank();
        if rank != dims.len() {
            return Err(Error::internal(
                site,
                format!("cannot pin rank {rank} value to {} slots", dims.len()),
            ));
        }
        for (axis, dim) in dims.iter().enumerate() {
            self.require(site, value, axis, *dim)?;
        }
        Ok(())
    }

    /// Push known roles between `a_axis` of `a` and `b_axis` of `b`, in
    /// both directions.
    pub fn link_axis<S: ErrorSite + ?Sized>(
        &mut self,
        site: &S,
        a: ValueRef,
        a_axis: usize,
        b: ValueRef,
        b_axis: usize,
    ) -> Result<()> {
        if self.is_constant(a) || self.is_constant(b) {
            return Ok(());
        }
        self.links.entry((a, a_axis)).or_default().insert((b, b_axis));
        self.links.entry((b, b_axis)).or_default().insert((a, a_axis));
        if let Some(dim) = self.role(a, a_axis) {
            self.require(site, b, b_axis, dim)?;
        }
        if let Some(dim) = self.role(b, b_axis) {
            self.require(site, a, a_axis, dim)?;
        }
        Ok(())
    }

    /// Link every axis of two values of equal rank.
    pub fn link<S: ErrorSite + ?Sized>(&mut self, site: &S, a: ValueRef, b: ValueRef) -> Result<()> {
        if self.is_constant(a) || self.is_constant(b) {
            return Ok(());
        }
        let (ra, rb) = (self.shape(a)?.rank(), self.shape(b)?.rank());
        if ra != rb {
            return Err(Error::internal(
                site,
                format!("cannot link rank {ra} with rank {rb}"),
            ));
        }
        for axis in 0..ra {
            self.link_axis(site, a, axis, b, axis)?;
        }
        Ok(())
    }

    /// Link the axes of `input` with the output axes they land on after
    /// alignment at `offset`, skipping unit extents.
    pub fn link_aligned<S: ErrorSite + ?Sized>(
        &mut self,
        site: &S,
        input: ValueRef,
        offset: usize,
        output: ValueRef,
    ) -> Result<()> {
        if self.is_constant(input) || self.is_constant(output) {
            return Ok(());
        }
        let in_shape = self.shape(input)?.clone();
        let out_shape = self.shape(output)?.clone();
        for axis in 0..in_shape.rank() {
            let out_axis = offset + axis;
            if out_axis < out_shape.rank()
                && in_shape[axis] > 1
                && in_shape[axis] == out_shape[out_axis]
            {
                self.link_axis(site, input, axis, output, out_axis)?;
            }
        }
        Ok(())
    }

    /// Slots already given to axes reachable from `start` through links.
    fn linked_slots(&self, start: AxisRef) -> Vec<Dim> {
        let mut seen = BTreeSet::from([start]);
        let mut queue = vec![start];
        let mut slots = Vec::new();
        while let Some(axis) = queue.pop() {
            for peer in self.links.get(&axis).into_iter().flatten() {
                if seen.insert(*peer) {
                    if let Some(dim) = self.role(peer.0, peer.1) {
                        slots.push(dim);
                    }
                    queue.push(*peer);
                }
            }
        }
        slots
    }

    /// Fill the free axes of `value` and return the resulting layout.
    /// Constants commit to the empty layout.
    pub fn commit<S: ErrorSite + ?Sized>(
        &mut self,
        site: &S,
        value: ValueRef,
    ) -> Result<TensorLayout> {
        let row = self.row(value)?;
        if row.constant {
            return Ok(TensorLayout::empty());
        }
        let preferred: Vec<Vec<Dim>> = (0..row.roles.len())
            .map(|axis| match row.roles[axis] {
                Some(_) => Vec::new(),
                None => self.linked_slots((value, axis)),
            })
            .collect();
        let row = self.row_mut(value)?;
        if row.roles.len() > Dim::COUNT {
            return Err(Error::unsupported(
                site,
                format!(
                    "rank {} exceeds the {} physical dimensions",
                    row.roles.len(),
                    Dim::COUNT
                ),
            ));
        }
        for (axis, slots) in preferred.into_iter().enumerate() {
            if let Some(dim) = slots.into_iter().find(|d| !row.roles.contains(&Some(*d))) {
                row.roles[axis] = Some(dim);
            }
        }
        for axis in 0..row.roles.len() {
            if row.roles[axis].is_none() {
                let free = Dim::ALL
                    .into_iter()
                    .find(|d| !row.roles.contains(&Some(*d)))
                    .ok_or_else(|| Error::internal(site, "ran out of physical dimensions"))?;
                row.roles[axis] = Some(free);
            }
        }
        TensorLayout::new(row.roles.iter().flatten().copied().collect::<Vec<_>>())
    }
}
