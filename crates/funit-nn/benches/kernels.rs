//! Benchmarks for the convolution path used by the generator and discriminator.
//!
//! Measures: Conv2d forward/backward, instance norm, activation-first
//! residual block, and one RMSprop step.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use funit_nn::*;
use funit_tensor::{Shape, Tensor};

fn image(n: usize, c: usize, hw: usize) -> Tensor {
    Tensor::from_fn(Shape::nchw(n, c, hw, hw), |i| {
        ((i[1] * 31 + i[2] * 7 + i[3]) % 17) as f64 * 0.05 - 0.4
    })
}

// ---------------------------------------------------------------------------
// Conv2d
// ---------------------------------------------------------------------------

fn bench_conv2d(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_conv2d");
    for &(channels, hw) in &[(8, 16), (16, 32), (32, 32)] {
        let mut conv = Conv2d::new(channels, channels, 3, 1, true, 42);
        let input = image(2, channels, hw);
        group.bench_with_input(
            BenchmarkId::new("fwd", format!("{channels}c{hw}")),
            &(),
            |b, _| {
                b.iter(|| black_box(conv.forward(&input)));
            },
        );

        let out = conv.forward(&input);
        let grad_out = Tensor::full(out.shape().clone(), 0.01);
        group.bench_with_input(
            BenchmarkId::new("bwd", format!("{channels}c{hw}")),
            &(),
            |b, _| {
                let _ = conv.forward(&input);
                b.iter(|| black_box(conv.backward(&grad_out)));
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Norms and blocks
// ---------------------------------------------------------------------------

fn bench_instance_norm(c: &mut Criterion) {
    let mut norm = InstanceNorm2d::new(16);
    let input = image(4, 16, 32);
    c.bench_function("cpu_instance_norm_fwd", |b| {
        b.iter(|| black_box(norm.forward(&input)));
    });
}

fn bench_act_first_block(c: &mut Criterion) {
    let mut block = ActFirstResBlock::new(16, 32, Activation::LRelu, NormKind::None, 7);
    let input = image(2, 16, 16);
    c.bench_function("cpu_actfirst_resblock_fwd_bwd", |b| {
        b.iter(|| {
            let out = block.forward(&input);
            black_box(block.backward(&Tensor::full(out.shape().clone(), 0.01)))
        });
    });
}

// ---------------------------------------------------------------------------
// Optimizer step
// ---------------------------------------------------------------------------

fn bench_rmsprop_step(c: &mut Criterion) {
    let mut conv = Conv2d::new(32, 32, 3, 1, true, 3);
    let input = image(2, 32, 8);
    let out = conv.forward(&input);
    conv.backward(&Tensor::full(out.shape().clone(), 0.01));
    let mut opt = Rmsprop::new(1e-4).with_weight_decay(1e-4);
    c.bench_function("cpu_rmsprop_step", |b| {
        b.iter(|| opt.step(&mut conv.parameters_mut()));
    });
}

criterion_group!(
    benches,
    bench_conv2d,
    bench_instance_norm,
    bench_act_first_block,
    bench_rmsprop_step,
);
criterion_main!(benches);
