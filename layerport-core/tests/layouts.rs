use layerport_core::{
    broadcast::{broadcast_shapes, BroadcastMode},
    Compiler, ConstantTensor, Dim, ErrorKind, GraphDescriptor, LayerKind, NodeDescriptor,
    TensorShape,
};
use proptest::prelude::*;

const SITE: (&str, &str) = ("Add", "add");

/// A shape and a second shape broadcastable into it: some extents replaced by
/// one and some leading axes dropped.
fn broadcastable_pair() -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
    proptest::collection::vec(1usize..5, 1..=4).prop_flat_map(|a| {
        let rank = a.len();
        (
            Just(a),
            proptest::collection::vec(any::<bool>(), rank),
            0..rank,
        )
            .prop_map(|(a, ones, drop)| {
                let b = a
                    .iter()
                    .zip(ones)
                    .skip(drop)
                    .map(|(d, one)| if one { 1 } else { *d })
                    .collect();
                (a, b)
            })
    })
}

proptest! {
    #[test]
    fn broadcast_is_symmetric((a, b) in broadcastable_pair()) {
        let (a, b) = (TensorShape::new(a), TensorShape::new(b));
        let ab = broadcast_shapes(&SITE, &a, &b, BroadcastMode::Numpy).unwrap();
        let ba = broadcast_shapes(&SITE, &b, &a, BroadcastMode::Numpy).unwrap();
        prop_assert_eq!(&ab, &ba);
        prop_assert_eq!(ab, a);
    }

    #[test]
    fn broadcast_takes_the_larger_extent(
        a in proptest::collection::vec(1usize..4, 0..=5),
        b in proptest::collection::vec(1usize..4, 0..=5),
    ) {
        let result = broadcast_shapes(
            &SITE,
            &TensorShape::new(a.clone()),
            &TensorShape::new(b.clone()),
            BroadcastMode::Numpy,
        );
        let rank = a.len().max(b.len());
        let pad = |s: &[usize]| {
            let mut v = vec![1; rank - s.len()];
            v.extend_from_slice(s);
            v
        };
        let (pa, pb) = (pad(&a), pad(&b));
        let compatible = pa.iter().zip(&pb).all(|(x, y)| x == y || *x == 1 || *y == 1);
        match result {
            Ok(shape) => {
                prop_assert!(compatible);
                let expected: Vec<usize> = pa.iter().zip(&pb).map(|(x, y)| *x.max(y)).collect();
                prop_assert_eq!(shape.dims(), expected.as_slice());
            }
            Err(err) => {
                prop_assert!(!compatible);
                prop_assert_eq!(err.kind(), ErrorKind::Unsupported);
            }
        }
    }

    #[test]
    fn constant_operands_expand_to_the_output((a, b) in broadcastable_pair()) {
        let n: usize = b.iter().product();
        let constant =
            ConstantTensor::from_data(b.clone(), (0..n).map(|i| i as f32).collect::<Vec<_>>())
                .unwrap();
        let desc = GraphDescriptor::new(11)
            .input("x", a.clone())
            .initializer("c", constant)
            .node(NodeDescriptor::new("Add", "add").input("x").input("c").output("y"))
            .output("y");
        let model = Compiler::new().compile(&desc).unwrap();
        let output = model.output("y").unwrap();
        prop_assert_eq!(output.shape.dims(), a.as_slice());
        prop_assert_eq!(output.layout.rank(), a.len());
        prop_assert_eq!(model.layers.count(|k| matches!(k, LayerKind::Broadcast { .. })), 0);
        let expanded = model
            .layers
            .layers()
            .iter()
            .find_map(|l| match &l.kind {
                LayerKind::ConstantSource { tensor } => Some(tensor.clone()),
                _ => None,
            })
            .unwrap();
        prop_assert_eq!(expanded.shape().dims(), a.as_slice());
        prop_assert_eq!(expanded.layout(), &output.layout);
    }
}

#[test]
fn legacy_broadcast_aligns_at_axis() {
    let a = TensorShape::from([2, 3, 4, 5]);
    let b = TensorShape::from([3, 4]);
    let mode = BroadcastMode::Legacy { axis: Some(1) };
    assert_eq!(broadcast_shapes(&SITE, &a, &b, mode).unwrap(), a);
    let err = broadcast_shapes(&SITE, &b, &a, mode).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn legacy_add_needs_the_broadcast_flag() {
    let desc = |broadcast: i64| {
        GraphDescriptor::new(6)
            .input("x", [2, 3, 4, 5])
            .initializer("c", ConstantTensor::from_data([3], vec![1f32, 2., 3.]).unwrap())
            .node(
                NodeDescriptor::new("Add", "add")
                    .input("x")
                    .input("c")
                    .output("y")
                    .attr("broadcast", broadcast)
                    .attr("axis", 1i64),
            )
            .output("y")
    };
    let err = Compiler::new().compile(&desc(0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    let model = Compiler::new().compile(&desc(1)).unwrap();
    let y = model.output("y").unwrap();
    assert_eq!(y.shape, TensorShape::from([2, 3, 4, 5]));
    assert_eq!(y.layout.rank(), 4);
    assert!(y.layout.dims().iter().all(|d| Dim::ALL.contains(d)));
}

#[test]
fn legacy_symbolic_operand_shares_the_aligned_slots() {
    let desc = GraphDescriptor::new(6)
        .input("x", [2, 3, 4, 5])
        .input("c", [3, 4])
        .node(
            NodeDescriptor::new("Add", "add")
                .input("x")
                .input("c")
                .output("y")
                .attr("broadcast", 1i64)
                .attr("axis", 1i64),
        )
        .output("y");
    let model = Compiler::new().compile(&desc).unwrap();
    let x = model.input("x").unwrap();
    let c = model.input("c").unwrap();
    assert_eq!(&c.layout.dims()[..], &x.layout.dims()[1..3]);
    assert_eq!(
        model.layers.count(|k| matches!(k, LayerKind::LayoutConversion { .. })),
        0
    );
    assert_eq!(model.layers.count(|k| matches!(k, LayerKind::Broadcast { .. })), 1);
    assert_eq!(model.output("y").unwrap().layout, x.layout);
}
