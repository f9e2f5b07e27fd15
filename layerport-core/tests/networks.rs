use layerport_core::{
    layer::{ActivationKind, PoolKind},
    CompiledModel, Compiler, ConstantTensor, Dim, ErrorKind, GraphDescriptor, LayerKind,
    NodeDescriptor, TensorShape,
};

fn floats(shape: &[usize]) -> ConstantTensor {
    let n = shape.iter().product::<usize>();
    ConstantTensor::from_data(shape, (0..n).map(|i| (i % 7) as f32 - 3.).collect::<Vec<_>>())
        .unwrap()
}

fn ints(values: &[i64]) -> ConstantTensor {
    ConstantTensor::ints(values.to_vec())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn compile(desc: &GraphDescriptor) -> CompiledModel {
    init_tracing();
    Compiler::new().compile(desc).unwrap()
}

fn kinds(model: &CompiledModel) -> Vec<&'static str> {
    model.layers.layers().iter().map(|l| l.kind.name()).collect()
}

fn find<'a, T>(model: &'a CompiledModel, f: impl Fn(&'a LayerKind) -> Option<T>) -> T {
    model.layers.layers().iter().find_map(|l| f(&l.kind)).unwrap()
}

#[test]
fn small_classifier() {
    let desc = GraphDescriptor::new(11)
        .input("image", [1, 3, 8, 8])
        .initializer("w0", floats(&[4, 3, 3, 3]))
        .initializer("b0", floats(&[4]))
        .initializer("w1", floats(&[10, 4]))
        .initializer("b1", floats(&[10]))
        .node(
            NodeDescriptor::new("Conv", "conv")
                .input("image")
                .input("w0")
                .input("b0")
                .output("c")
                .attr("kernel_shape", vec![3i64, 3])
                .attr("pads", vec![1i64, 1, 1, 1]),
        )
        .node(NodeDescriptor::new("Relu", "relu").input("c").output("r"))
        .node(
            NodeDescriptor::new("MaxPool", "pool")
                .input("r")
                .output("p")
                .attr("kernel_shape", vec![2i64, 2])
                .attr("strides", vec![2i64, 2]),
        )
        .node(NodeDescriptor::new("GlobalAveragePool", "gap").input("p").output("g"))
        .node(NodeDescriptor::new("Flatten", "flat").input("g").output("f"))
        .node(
            NodeDescriptor::new("Gemm", "fc")
                .input("f")
                .input("w1")
                .input("b1")
                .output("logits")
                .attr("transB", 1i64),
        )
        .node(NodeDescriptor::new("Softmax", "prob").input("logits").output("y"))
        .output("y");
    let model = compile(&desc);
    assert_eq!(
        kinds(&model),
        vec![
            "Source",
            "Conv",
            "Activation",
            "Pooling",
            "GlobalPooling",
            "Reshape",
            "FullyConnected",
            "Softmax",
            "Sink"
        ]
    );
    let y = model.output("y").unwrap();
    assert_eq!(y.shape, TensorShape::from([1, 10]));
    assert_eq!(y.layout.dims(), &[Dim::BatchWidth, Dim::Channels]);

    let (filter, params) = find(&model, |k| match k {
        LayerKind::Conv { filter, params, .. } => Some((filter.clone(), params.clone())),
        _ => None,
    });
    assert_eq!(filter.shape(), &TensorShape::from([4, 3, 3, 3]));
    assert_eq!(
        filter.layout().dims(),
        &[Dim::BatchWidth, Dim::Channels, Dim::Height, Dim::Width]
    );
    assert_eq!(params.filter_count, 4);
    assert_eq!(params.pads, [1, 1]);

    let pool = find(&model, |k| match k {
        LayerKind::Pooling { kind, params } => Some((*kind, params.kernel, params.strides)),
        _ => None,
    });
    assert_eq!(pool, (PoolKind::Max, [2, 2], [2, 2]));
}

#[test]
fn flatten_then_gemm_without_conv() {
    let desc = GraphDescriptor::new(11)
        .input("x", [2, 3, 2, 2])
        .initializer("w", floats(&[12, 5]))
        .node(NodeDescriptor::new("Flatten", "flat").input("x").output("f"))
        .node(NodeDescriptor::new("Gemm", "fc").input("f").input("w").output("y"))
        .output("y");
    let model = compile(&desc);
    let weights = find(&model, |k| match k {
        LayerKind::FullyConnected { weights, .. } => Some(weights.clone()),
        _ => None,
    });
    assert_eq!(weights.shape(), &TensorShape::from([12, 5]));
    assert_eq!(weights.layout().dims(), &[Dim::Channels, Dim::BatchWidth]);
    assert_eq!(model.output("y").unwrap().shape, TensorShape::from([2, 5]));
    assert_eq!(
        model.layers.count(|k| matches!(k, LayerKind::Reshape { .. })),
        1
    );
}

#[test]
fn gemm_scales_weights_by_alpha() {
    let w = ConstantTensor::from_data([2, 2], vec![1f32, 2., 3., 4.]).unwrap();
    let desc = GraphDescriptor::new(11)
        .input("x", [1, 2])
        .initializer("w", w)
        .node(
            NodeDescriptor::new("Gemm", "fc")
                .input("x")
                .input("w")
                .output("y")
                .attr("alpha", 2f32),
        )
        .output("y");
    let model = compile(&desc);
    let weights = find(&model, |k| match k {
        LayerKind::FullyConnected { weights, .. } => Some(weights.clone()),
        _ => None,
    });
    assert_eq!(weights.to_f32_vec(), vec![2., 4., 6., 8.]);
}

#[test]
fn matmul_with_constant_weights() {
    let desc = GraphDescriptor::new(11)
        .input("x", [2, 4])
        .initializer("w", floats(&[4, 3]))
        .node(NodeDescriptor::new("MatMul", "mm").input("x").input("w").output("y"))
        .output("y");
    let model = compile(&desc);
    assert_eq!(kinds(&model), vec!["Source", "FullyConnected", "Sink"]);
    assert_eq!(model.output("y").unwrap().shape, TensorShape::from([2, 3]));
}

#[test]
fn matmul_of_two_inputs_is_unsupported() {
    let desc = GraphDescriptor::new(11)
        .input("a", [2, 4])
        .input("b", [4, 3])
        .node(NodeDescriptor::new("MatMul", "mm").input("a").input("b").output("y"))
        .output("y");
    let err = Compiler::new().compile(&desc).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
}

#[test]
fn batch_norm_folds_statistics() {
    let desc = GraphDescriptor::new(9)
        .input("x", [1, 2, 4, 4])
        .initializer("scale", ConstantTensor::from_data([2], vec![2f32, 1.]).unwrap())
        .initializer("bias", ConstantTensor::from_data([2], vec![1f32, 0.]).unwrap())
        .initializer("mean", ConstantTensor::from_data([2], vec![3f32, -1.]).unwrap())
        .initializer("var", ConstantTensor::from_data([2], vec![4f32, 1.]).unwrap())
        .node(
            NodeDescriptor::new("BatchNormalization", "bn")
                .input("x")
                .input("scale")
                .input("bias")
                .input("mean")
                .input("var")
                .output("y")
                .attr("epsilon", 0f32),
        )
        .output("y");
    let model = compile(&desc);
    let (gamma, beta) = find(&model, |k| match k {
        LayerKind::BatchNorm { gamma, beta } => Some((gamma.clone(), beta.clone())),
        _ => None,
    });
    assert_eq!(gamma.to_f32_vec(), vec![1., 1.]);
    assert_eq!(beta.to_f32_vec(), vec![-2., 1.]);
    assert_eq!(model.input("x").unwrap().layout.dims()[1], Dim::Channels);
}

#[test]
fn depthwise_and_grouped_conv() {
    let depthwise = GraphDescriptor::new(11)
        .input("x", [1, 4, 6, 6])
        .initializer("w", floats(&[4, 1, 3, 3]))
        .node(
            NodeDescriptor::new("Conv", "dw")
                .input("x")
                .input("w")
                .output("y")
                .attr("group", 4i64),
        )
        .output("y");
    let model = compile(&depthwise);
    let filter = find(&model, |k| match k {
        LayerKind::ChannelwiseConv { filter, .. } => Some(filter.clone()),
        _ => None,
    });
    assert_eq!(
        filter.layout().dims(),
        &[Dim::Channels, Dim::BatchWidth, Dim::Height, Dim::Width]
    );
    assert_eq!(model.output("y").unwrap().shape, TensorShape::from([1, 4, 4, 4]));

    let grouped = GraphDescriptor::new(11)
        .input("x", [1, 4, 6, 6])
        .initializer("w", floats(&[4, 2, 3, 3]))
        .node(
            NodeDescriptor::new("Conv", "g2")
                .input("x")
                .input("w")
                .output("y")
                .attr("group", 2i64),
        )
        .output("y");
    let err = Compiler::new().compile(&grouped).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert!(err.to_string().contains("grouped convolution"));
}

#[test]
fn reshape_from_shape_subgraph() {
    let desc = GraphDescriptor::new(11)
        .input("x", [1, 3, 4, 4])
        .initializer(
            "zero",
            ConstantTensor::from_data(TensorShape::scalar(), vec![0i64]).unwrap(),
        )
        .initializer("rest", ints(&[-1]))
        .node(NodeDescriptor::new("Shape", "shape").input("x").output("s"))
        .node(
            NodeDescriptor::new("Gather", "batch")
                .input("s")
                .input("zero")
                .output("n"),
        )
        .node(
            NodeDescriptor::new("Unsqueeze", "unsq")
                .input("n")
                .output("n1")
                .attr("axes", vec![0i64]),
        )
        .node(
            NodeDescriptor::new("Concat", "target")
                .input("n1")
                .input("rest")
                .output("t")
                .attr("axis", 0i64),
        )
        .node(NodeDescriptor::new("Reshape", "reshape").input("x").input("t").output("y"))
        .output("y");
    let model = compile(&desc);
    assert_eq!(kinds(&model), vec!["Source", "Reshape", "Sink"]);
    assert_eq!(model.output("y").unwrap().shape, TensorShape::from([1, 48]));
}

#[test]
fn concat_along_channels() {
    let desc = GraphDescriptor::new(11)
        .input("a", [1, 2, 4, 4])
        .input("b", [1, 3, 4, 4])
        .node(
            NodeDescriptor::new("Concat", "cat")
                .input("a")
                .input("b")
                .output("y")
                .attr("axis", 1i64),
        )
        .output("y");
    let model = compile(&desc);
    let y = model.output("y").unwrap();
    assert_eq!(y.shape, TensorShape::from([1, 5, 4, 4]));
    let dim = find(&model, |k| match k {
        LayerKind::Concat { dim } => Some(*dim),
        _ => None,
    });
    assert_eq!(dim, y.layout.dims()[1]);
}

#[test]
fn slice_emits_one_layer_per_axis() {
    let desc = GraphDescriptor::new(11)
        .input("x", [2, 6, 5])
        .initializer("starts", ints(&[1, 0]))
        .initializer("ends", ints(&[4, -1]))
        .initializer("axes", ints(&[1, 2]))
        .node(
            NodeDescriptor::new("Slice", "s")
                .input("x")
                .input("starts")
                .input("ends")
                .input("axes")
                .output("y"),
        )
        .output("y");
    let model = compile(&desc);
    let y = model.output("y").unwrap();
    assert_eq!(y.shape, TensorShape::from([2, 3, 4]));
    let slices: Vec<_> = model
        .layers
        .layers()
        .iter()
        .filter_map(|l| match l.kind {
            LayerKind::Slice { dim, start, length } => Some((dim, start, length)),
            _ => None,
        })
        .collect();
    assert_eq!(
        slices,
        vec![(y.layout.dims()[1], 1, 3), (y.layout.dims()[2], 0, 4)]
    );
}

#[test]
fn reduce_mean_pools_spatial_axes() {
    let desc = GraphDescriptor::new(11)
        .input("x", [1, 3, 4, 4])
        .node(
            NodeDescriptor::new("ReduceMean", "mean")
                .input("x")
                .output("y")
                .attr("axes", vec![2i64, 3]),
        )
        .output("y");
    let model = compile(&desc);
    assert_eq!(kinds(&model), vec!["Source", "Pooling", "Sink"]);
    let (kind, kernel) = find(&model, |k| match k {
        LayerKind::Pooling { kind, params } => Some((*kind, params.kernel)),
        _ => None,
    });
    assert_eq!((kind, kernel), (PoolKind::Mean, [4, 4]));
    assert_eq!(model.output("y").unwrap().shape, TensorShape::from([1, 3, 1, 1]));
}

#[test]
fn clip_from_inputs() {
    let desc = GraphDescriptor::new(11)
        .input("x", [4])
        .initializer("lo", ConstantTensor::scalar(0.))
        .initializer("hi", ConstantTensor::scalar(6.))
        .node(
            NodeDescriptor::new("Clip", "relu6")
                .input("x")
                .input("lo")
                .input("hi")
                .output("y"),
        )
        .output("y");
    let model = compile(&desc);
    let kind = find(&model, |k| match k {
        LayerKind::Activation(kind) => Some(*kind),
        _ => None,
    });
    assert_eq!(kind, ActivationKind::Clip { min: 0., max: 6. });
}

#[test]
fn lstm_over_a_sequence() {
    let desc = GraphDescriptor::new(11)
        .input("x", [5, 2, 3])
        .initializer("w", floats(&[1, 8, 3]))
        .initializer("r", floats(&[1, 8, 2]))
        .initializer("b", floats(&[1, 16]))
        .initializer("h0", ConstantTensor::from_data([1, 2, 2], vec![0f32; 4]).unwrap())
        .node(
            NodeDescriptor::new("LSTM", "rnn")
                .input("x")
                .input("w")
                .input("r")
                .input("b")
                .input("")
                .input("h0")
                .output("y")
                .attr("hidden_size", 2i64),
        )
        .output("y");
    let model = compile(&desc);
    assert_eq!(kinds(&model), vec!["Source", "Lstm", "Sink"]);
    assert_eq!(
        model.input("x").unwrap().layout.dims(),
        &[Dim::BatchLength, Dim::BatchWidth, Dim::Channels]
    );
    let y = model.output("y").unwrap();
    assert_eq!(y.shape, TensorShape::from([5, 1, 2, 2]));
    assert_eq!(
        y.layout.dims(),
        &[Dim::BatchLength, Dim::ListSize, Dim::BatchWidth, Dim::Channels]
    );
    let (input_weights, recurrent_weights, free_term) = find(&model, |k| match k {
        LayerKind::Lstm {
            input_weights,
            recurrent_weights,
            free_term,
            ..
        } => Some((input_weights.clone(), recurrent_weights.clone(), free_term.clone())),
        _ => None,
    });
    assert_eq!(input_weights.shape(), &TensorShape::from([8, 3]));
    assert_eq!(recurrent_weights.shape(), &TensorShape::from([8, 2]));
    assert_eq!(input_weights.layout().dims(), &[Dim::BatchWidth, Dim::Channels]);
    assert_eq!(free_term.unwrap().shape(), &TensorShape::from([8]));
}

#[test]
fn lstm_with_nonzero_initial_state_is_unsupported() {
    let desc = GraphDescriptor::new(11)
        .input("x", [4, 1, 2])
        .initializer("w", floats(&[1, 4, 2]))
        .initializer("r", floats(&[1, 4, 1]))
        .initializer("c0", ConstantTensor::from_data([1, 1, 1], vec![0.5f32]).unwrap())
        .node(
            NodeDescriptor::new("LSTM", "rnn")
                .input("x")
                .input("w")
                .input("r")
                .input("")
                .input("")
                .input("")
                .input("c0")
                .output("y")
                .attr("hidden_size", 1i64),
        )
        .output("y");
    let err = Compiler::new().compile(&desc).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unsupported);
    assert!(err.to_string().contains("initial cell state"));
}

#[test]
fn lrn_after_conv_keeps_the_layout() {
    let desc = GraphDescriptor::new(11)
        .input("image", [1, 3, 8, 8])
        .initializer("w", floats(&[4, 3, 3, 3]))
        .node(
            NodeDescriptor::new("Conv", "conv")
                .input("image")
                .input("w")
                .output("c")
                .attr("kernel_shape", vec![3i64, 3]),
        )
        .node(
            NodeDescriptor::new("LRN", "norm")
                .input("c")
                .output("y")
                .attr("size", 3i64)
                .attr("alpha", 2e-4f32),
        )
        .output("y");
    let model = compile(&desc);
    assert_eq!(kinds(&model), vec!["Source", "Conv", "Lrn", "Sink"]);
    let (size, alpha, beta) = find(&model, |k| match k {
        LayerKind::Lrn {
            size, alpha, beta, ..
        } => Some((*size, *alpha, *beta)),
        _ => None,
    });
    assert_eq!((size, alpha, beta), (3, 2e-4, 0.75));
    let y = model.output("y").unwrap();
    assert_eq!(y.shape, TensorShape::from([1, 4, 6, 6]));
    assert_eq!(
        y.layout.dims(),
        &[Dim::BatchWidth, Dim::Channels, Dim::Height, Dim::Width]
    );
}
