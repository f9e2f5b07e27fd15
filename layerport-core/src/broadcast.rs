//! Broadcasting rules and layout reconciliation between tensors feeding the
//! same combining layer.

use crate::{
    dtype::map_data,
    error::ErrorSite,
    layer::{LayerGraph, LayerKind},
    tensor::expand,
    ConstantTensor, Error, Result, SymbolicTensor, Tensor, TensorLayout, TensorShape,
};

/// How the inputs of a multi-input operator are aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastMode {
    /// Shapes must match exactly.
    None,
    /// Right-aligned, unit extents repeat.
    Numpy,
    /// The second input is aligned at `axis` of the first (right-aligned when
    /// absent); only the second input may be expanded.
    Legacy { axis: Option<i64> },
}

/// Position of the first axis of a rank-`rank` input inside the broadcast
/// shape of rank `out_rank`.
pub fn axis_offset<S: ErrorSite + ?Sized>(
    site: &S,
    mode: BroadcastMode,
    rank: usize,
    out_rank: usize,
) -> Result<usize> {
    if rank > out_rank {
        return Err(Error::unsupported(
            site,
            format!("cannot broadcast rank {rank} into rank {out_rank}"),
        ));
    }
    match mode {
        BroadcastMode::Legacy { axis: Some(axis) } if rank < out_rank => {
            let resolved = if axis < 0 { axis + out_rank as i64 } else { axis };
            if resolved < 0 || resolved as usize + rank > out_rank {
                return Err(Error::unsupported(
                    site,
                    format!("cannot broadcast rank {rank} at axis {axis} of rank {out_rank}"),
                ));
            }
            Ok(resolved as usize)
        }
        _ => Ok(out_rank - rank),
    }
}

/// `shape` padded with unit axes so that it starts at `offset` of a rank
/// `out_rank` shape.
pub fn pad_shape(shape: &TensorShape, offset: usize, out_rank: usize) -> TensorShape {
    let mut dims = vec![1; offset];
    dims.extend_from_slice(shape.dims());
    dims.resize(out_rank, 1);
    TensorShape::new(dims)
}

/// Broadcast shape of `a` and `b`.
///
/// Incompatible shapes are an unsupported construct.
pub fn broadcast_shapes<S: ErrorSite + ?Sized>(
    site: &S,
    a: &TensorShape,
    b: &TensorShape,
    mode: BroadcastMode,
) -> Result<TensorShape> {
    let cannot = || Error::unsupported(site, format!("cannot broadcast {a} and {b}"));
    match mode {
        BroadcastMode::None => {
            if a == b {
                Ok(a.clone())
            } else {
                Err(cannot())
            }
        }
        BroadcastMode::Numpy => {
            let rank = a.rank().max(b.rank());
            let pa = pad_shape(a, rank - a.rank(), rank);
            let pb = pad_shape(b, rank - b.rank(), rank);
            let mut dims = Vec::with_capacity(rank);
            for (x, y) in pa.dims().iter().zip(pb.dims()) {
                dims.push(match (*x, *y) {
                    (x, y) if x == y => x,
                    (1, y) => y,
                    (x, 1) => x,
                    _ => return Err(cannot()),
                });
            }
            Ok(TensorShape::new(dims))
        }
        BroadcastMode::Legacy { .. } => {
            let offset = axis_offset(site, mode, b.rank(), a.rank()).map_err(|_| cannot())?;
            let pb = pad_shape(b, offset, a.rank());
            if a.dims().iter().zip(pb.dims()).all(|(x, y)| x == y || *y == 1) {
                Ok(a.clone())
            } else {
                Err(cannot())
            }
        }
    }
}

/// Layout of a tensor padded to `out_rank` with unit axes. The new axes take
/// the slot `preferred` gives them when it is free, otherwise the smallest
/// unused slot.
pub fn pad_layout<S: ErrorSite + ?Sized>(
    site: &S,
    layout: &TensorLayout,
    offset: usize,
    out_rank: usize,
    preferred: &TensorLayout,
) -> Result<TensorLayout> {
    let rank = layout.rank();
    if offset == 0 && rank == out_rank {
        return Ok(layout.clone());
    }
    let mut dims: Vec<Option<_>> = vec![None; out_rank];
    for (i, d) in layout.dims().iter().enumerate() {
        dims[offset + i] = Some(*d);
    }
    for axis in 0..out_rank {
        if dims[axis].is_some() {
            continue;
        }
        let wanted = preferred.dims().get(axis).copied();
        let slot = wanted
            .filter(|w| !dims.contains(&Some(*w)))
            .or_else(|| {
                crate::Dim::ALL
                    .into_iter()
                    .find(|d| !dims.contains(&Some(*d)))
            })
            .ok_or_else(|| {
                Error::unsupported(site, format!("rank {out_rank} exceeds the slot count"))
            })?;
        dims[axis] = Some(slot);
    }
    TensorLayout::new(dims.into_iter().flatten().collect::<Vec<_>>())
}

/// Expand a constant to `out_shape`, the constant's axes starting at `offset`.
/// The result is in source order.
pub fn broadcast_constant(
    tensor: &ConstantTensor,
    offset: usize,
    out_shape: &TensorShape,
) -> Result<ConstantTensor> {
    let padded = pad_shape(tensor.shape(), offset, out_shape.rank());
    if &padded == out_shape && !tensor.layout().is_transposed() {
        return tensor.reshaped(padded);
    }
    let source = tensor.source_data();
    let data = map_data!(&source, v => expand(v, padded.dims(), out_shape.dims()));
    ConstantTensor::from_data(out_shape.clone(), data)
}

/// Relabel a symbolic tensor under `target`, adding a conversion layer when
/// the memory image changes.
pub fn convert_symbolic(
    graph: &mut LayerGraph,
    name: &str,
    tensor: &SymbolicTensor,
    target: &TensorLayout,
) -> Result<SymbolicTensor> {
    if tensor.layout() == target {
        return Ok(tensor.clone());
    }
    if !tensor.layout().moves_data(target, tensor.shape().dims()) {
        return Ok(tensor.relabeled(tensor.shape().clone(), target.clone()));
    }
    let layer_name = graph.unique_name(&format!("{name}/convert"));
    let id = graph.add_layer(
        layer_name,
        LayerKind::LayoutConversion {
            from: tensor.layout().clone(),
            to: target.clone(),
        },
        vec![tensor.output()],
    )?;
    graph.output_of(
        crate::LayerOutput { layer: id, index: 0 },
        tensor.shape().clone(),
        target.clone(),
    )
}

/// Broadcast a symbolic tensor to `out_shape` and lay it out under `target`.
#[allow(clippy::too_many_arguments)]
pub fn broadcast_symbolic<S: ErrorSite + ?Sized>(
    site: &S,
    graph: &mut LayerGraph,
    name: &str,
    tensor: &SymbolicTensor,
    offset: usize,
    out_shape: &TensorShape,
    target: &TensorLayout,
) -> Result<SymbolicTensor> {
    let padded_shape = pad_shape(tensor.shape(), offset, out_shape.rank());
    let padded_layout = pad_layout(site, tensor.layout(), offset, out_shape.rank(), target)?;
    let mut current = tensor.relabeled(padded_shape.clone(), padded_layout.clone());
    if &padded_shape != out_shape {
        let layer_name = graph.unique_name(&format!("{name}/broadcast"));
        let id = graph.add_layer(
            layer_name,
            LayerKind::Broadcast {
                shape: out_shape.clone(),
            },
            vec![current.output()],
        )?;
        current = graph.output_of(
            crate::LayerOutput { layer: id, index: 0 },
            out_shape.clone(),
            padded_layout,
        )?;
    }
    convert_symbolic(graph, name, &current, target)
}

/// Bring any input of a combining layer to `out_shape` under `target`.
/// Constants are expanded and permuted in memory; no layer is added for them.
pub fn reconcile<S: ErrorSite + ?Sized>(
    site: &S,
    graph: &mut LayerGraph,
    name: &str,
    tensor: &Tensor,
    offset: usize,
    out_shape: &TensorShape,
    target: &TensorLayout,
) -> Result<Tensor> {
    match tensor {
        Tensor::Constant(c) => {
            let expanded = broadcast_constant(c, offset, out_shape)?;
            Ok(Tensor::Constant(expanded.to_layout(target)?))
        }
        Tensor::Symbolic(s) => Ok(Tensor::Symbolic(broadcast_symbolic(
            site, graph, name, s, offset, out_shape, target,
        )?)),
    }
}

/// Feed a constant into the layer graph as a blob laid out under `layout`.
pub fn constant_source(
    graph: &mut LayerGraph,
    name: &str,
    tensor: &ConstantTensor,
    layout: &TensorLayout,
) -> Result<SymbolicTensor> {
    let tensor = tensor.to_layout(layout)?;
    let layer_name = graph.unique_name(&format!("{name}/const"));
    let shape = tensor.shape().clone();
    let id = graph.add_layer(layer_name, LayerKind::ConstantSource { tensor }, vec![])?;
    graph.output_of(
        crate::LayerOutput { layer: id, index: 0 },
        shape,
        layout.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Dim, ErrorKind};

    const SITE: (&str, &str) = ("Add", "add0");

    fn shape(d: &[usize]) -> TensorShape {
        TensorShape::from(d)
    }

    #[test]
    fn numpy_broadcast() {
        let out = broadcast_shapes(&SITE, &shape(&[4, 1, 3]), &shape(&[1, 5, 3]), BroadcastMode::Numpy)
            .unwrap();
        assert_eq!(out, shape(&[4, 5, 3]));
        let out = broadcast_shapes(&SITE, &shape(&[2, 3]), &shape(&[3]), BroadcastMode::Numpy).unwrap();
        assert_eq!(out, shape(&[2, 3]));
    }

    #[test]
    fn incompatible_is_unsupported() {
        let err = broadcast_shapes(&SITE, &shape(&[4, 3]), &shape(&[5, 3]), BroadcastMode::Numpy)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(err.to_string().contains("cannot broadcast"));
    }

    #[test]
    fn legacy_axis_alignment() {
        let mode = BroadcastMode::Legacy { axis: Some(1) };
        let out = broadcast_shapes(&SITE, &shape(&[2, 3, 4, 5]), &shape(&[3]), mode).unwrap();
        assert_eq!(out, shape(&[2, 3, 4, 5]));
        assert_eq!(axis_offset(&SITE, mode, 1, 4).unwrap(), 1);
        // right-aligned [3] does not fit the trailing 5
        let right = BroadcastMode::Legacy { axis: None };
        assert!(broadcast_shapes(&SITE, &shape(&[2, 3, 4, 5]), &shape(&[3]), right).is_err());
        // only the second input may grow
        assert!(broadcast_shapes(&SITE, &shape(&[2, 1]), &shape(&[2, 3]), mode).is_err());
    }

    #[test]
    fn exact_mode_requires_equal_shapes() {
        assert!(broadcast_shapes(&SITE, &shape(&[2, 3]), &shape(&[3]), BroadcastMode::None).is_err());
        assert!(broadcast_shapes(&SITE, &shape(&[3]), &shape(&[3]), BroadcastMode::None).is_ok());
    }

    #[test]
    fn constant_expansion() {
        let b = ConstantTensor::from_data([3], vec![1f32, 2., 3.]).unwrap();
        let out = broadcast_constant(&b, 1, &shape(&[2, 3])).unwrap();
        assert_eq!(out.to_f32_vec(), vec![1., 2., 3., 1., 2., 3.]);
    }

    #[test]
    fn pad_layout_prefers_target_slots() {
        let layout = TensorLayout::new(vec![Dim::Channels]).unwrap();
        let target = TensorLayout::new(vec![Dim::BatchWidth, Dim::Channels]).unwrap();
        let padded = pad_layout(&SITE, &layout, 1, 2, &target).unwrap();
        assert_eq!(padded, target);
        let taken = TensorLayout::new(vec![Dim::BatchWidth]).unwrap();
        let padded = pad_layout(&SITE, &taken, 1, 2, &target).unwrap();
        assert_eq!(padded.dims(), &[Dim::BatchLength, Dim::BatchWidth]);
    }

    #[test]
    fn conversion_adds_layer_only_when_data_moves() {
        let mut graph = LayerGraph::new();
        let id = graph.add_layer("x", LayerKind::Source, vec![]).unwrap();
        let nchw =
            TensorLayout::new(vec![Dim::BatchWidth, Dim::Channels, Dim::Height, Dim::Width])
                .unwrap();
        let x = graph
            .output_of(
                crate::LayerOutput { layer: id, index: 0 },
                shape(&[1, 3, 8, 8]),
                nchw.clone(),
            )
            .unwrap();
        let same = convert_symbolic(&mut graph, "x", &x, &nchw).unwrap();
        assert_eq!(same, x);
        assert_eq!(graph.len(), 1);

        let converted = convert_symbolic(&mut graph, "x", &x, &nchw.sorted()).unwrap();
        assert_eq!(converted.layout(), &nchw.sorted());
        assert_eq!(graph.len(), 2);
    }
}
