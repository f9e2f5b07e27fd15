use criterion::{criterion_group, criterion_main, Criterion};
use layerport_core::{Compiler, ConstantTensor, GraphDescriptor, NodeDescriptor};

fn weights(shape: &[usize]) -> ConstantTensor {
    let n = shape.iter().product::<usize>();
    ConstantTensor::from_data(shape, (0..n).map(|i| (i % 13) as f32 * 0.1).collect::<Vec<_>>())
        .unwrap()
}

/// `depth` conv blocks followed by a classifier head.
fn conv_stack(depth: usize, channels: usize) -> GraphDescriptor {
    let mut desc = GraphDescriptor::new(11).input("x0", [1, channels, 32, 32]);
    for i in 0..depth {
        desc = desc
            .initializer(format!("w{i}"), weights(&[channels, channels, 3, 3]))
            .initializer(format!("b{i}"), weights(&[channels]))
            .node(
                NodeDescriptor::new("Conv", format!("conv{i}"))
                    .input(format!("x{i}"))
                    .input(format!("w{i}"))
                    .input(format!("b{i}"))
                    .output(format!("c{i}"))
                    .attr("pads", vec![1i64, 1, 1, 1]),
            )
            .node(
                NodeDescriptor::new("Relu", format!("relu{i}"))
                    .input(format!("c{i}"))
                    .output(format!("x{}", i + 1)),
            );
    }
    desc.initializer("fc_w", weights(&[10, channels]))
        .node(
            NodeDescriptor::new("GlobalAveragePool", "gap")
                .input(format!("x{depth}"))
                .output("g"),
        )
        .node(NodeDescriptor::new("Flatten", "flat").input("g").output("f"))
        .node(
            NodeDescriptor::new("Gemm", "fc")
                .input("f")
                .input("fc_w")
                .output("y")
                .attr("transB", 1i64),
        )
        .output("y")
}

/// A chain of constant arithmetic feeding a single add.
fn folding_chain(len: usize, width: usize) -> GraphDescriptor {
    let mut desc = GraphDescriptor::new(11)
        .input("x", [64, width])
        .initializer("k0", weights(&[width]));
    for i in 0..len {
        desc = desc
            .initializer(format!("m{i}"), weights(&[width]))
            .node(
                NodeDescriptor::new("Mul", format!("mul{i}"))
                    .input(format!("k{i}"))
                    .input(format!("m{i}"))
                    .output(format!("k{}", i + 1)),
            );
    }
    desc.node(
        NodeDescriptor::new("Add", "add")
            .input("x")
            .input(format!("k{len}"))
            .output("y"),
    )
    .output("y")
}

fn bench_compile_conv_stack_8(c: &mut Criterion) {
    let desc = conv_stack(8, 16);
    c.bench_function("compile_conv_stack_8", |bencher| {
        bencher.iter(|| Compiler::new().compile(&desc).unwrap());
    });
}

fn bench_compile_conv_stack_32(c: &mut Criterion) {
    let desc = conv_stack(32, 16);
    c.bench_function("compile_conv_stack_32", |bencher| {
        bencher.iter(|| Compiler::new().compile(&desc).unwrap());
    });
}

fn bench_compile_folding_chain(c: &mut Criterion) {
    let desc = folding_chain(64, 4096);
    c.bench_function("compile_folding_chain_64x4096", |bencher| {
        bencher.iter(|| Compiler::new().compile(&desc).unwrap());
    });
}

criterion_group!(
    benches,
    bench_compile_conv_stack_8,
    bench_compile_conv_stack_32,
    bench_compile_folding_chain
);
criterion_main!(benches);
