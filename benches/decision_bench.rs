//! Benchmarks for the decision model forward pass and drivers.

use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::SeedableRng;

use decision_model_rs::{
    DecisionModel, DecisionModelConfig, ForwardOptions, GenerateOptions, LossOptions,
};

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward");
    let device = Device::Cpu;
    let config = DecisionModelConfig::test();
    let model = DecisionModel::new(&config, &device).unwrap();

    for (batch, steps) in [(1, 8), (4, 16), (8, 32)].iter() {
        let obs = Tensor::zeros((*batch, *steps), DType::U32, &device).unwrap();
        let act = Tensor::zeros((*batch, *steps), DType::U32, &device).unwrap();
        let rew = Tensor::zeros((*batch, *steps, 1), DType::F32, &device).unwrap();
        let options = ForwardOptions {
            need_cache: false,
            ..ForwardOptions::default()
        };

        let label = format!("{}x{}", batch, steps);
        group.bench_with_input(BenchmarkId::new("window", &label), &(), |bench, _| {
            bench.iter(|| {
                black_box(
                    model
                        .forward(None, &obs, &act, Some(&rew), None, &options)
                        .unwrap(),
                )
            })
        });
    }

    group.finish();
}

fn bench_sequential_loss(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_loss");
    let device = Device::Cpu;
    let config = DecisionModelConfig::test();
    let model = DecisionModel::new(&config, &device).unwrap();

    for (batch, steps) in [(1, 8), (4, 16)].iter() {
        let obs = Tensor::zeros((*batch, *steps + 1), DType::U32, &device).unwrap();
        let rew = Tensor::zeros((*batch, *steps), DType::F32, &device).unwrap();
        let act = Tensor::zeros((*batch, *steps), DType::U32, &device).unwrap();
        let labels = Tensor::zeros((*batch, *steps), DType::I64, &device).unwrap();
        // Leave the memory handle untouched so every iteration sees the
        // same window position.
        let options = LossOptions {
            update_memory: false,
            ..LossOptions::default()
        };

        let label = format!("{}x{}", batch, steps);
        group.bench_with_input(BenchmarkId::new("window", &label), &(), |bench, _| {
            bench.iter(|| {
                let mut memory = model.new_memory();
                black_box(
                    model
                        .sequential_loss(&mut memory, None, &obs, Some(&rew), &act, &labels, &options)
                        .unwrap(),
                )
            })
        });
    }

    group.finish();
}

fn bench_generate(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate");
    let device = Device::Cpu;
    let config = DecisionModelConfig::test();
    let model = DecisionModel::new(&config, &device).unwrap();
    let options = GenerateOptions::default();

    group.bench_function("single_step", |bench| {
        let mut rng = StdRng::seed_from_u64(0);
        let memory = model.new_memory();
        bench.iter(|| black_box(model.generate(&memory, None, 0, &options, &mut rng).unwrap()))
    });

    group.bench_function("after_context", |bench| {
        let mut rng = StdRng::seed_from_u64(0);
        let mut memory = model.new_memory();
        let obs = Tensor::zeros((1, 16), DType::U32, &device).unwrap();
        let act = Tensor::zeros((1, 16), DType::U32, &device).unwrap();
        let rew = Tensor::zeros((1, 16), DType::F32, &device).unwrap();
        model
            .in_context_learn(&mut memory, None, &obs, &act, Some(&rew), false, false)
            .unwrap();
        bench.iter(|| black_box(model.generate(&memory, None, 0, &options, &mut rng).unwrap()))
    });

    group.finish();
}

fn bench_in_context_learn(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_context_learn");
    let device = Device::Cpu;
    let config = DecisionModelConfig::test();
    let model = DecisionModel::new(&config, &device).unwrap();

    for steps in [1usize, 8, 32].iter() {
        let obs = Tensor::zeros((1, *steps), DType::U32, &device).unwrap();
        let act = Tensor::zeros((1, *steps), DType::U32, &device).unwrap();
        let rew = Tensor::zeros((1, *steps), DType::F32, &device).unwrap();

        group.bench_with_input(BenchmarkId::new("steps", steps), steps, |bench, _| {
            bench.iter(|| {
                let mut memory = model.new_memory();
                model
                    .in_context_learn(&mut memory, None, &obs, &act, Some(&rew), false, false)
                    .unwrap();
                black_box(memory.len())
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_forward,
    bench_sequential_loss,
    bench_generate,
    bench_in_context_learn
);
criterion_main!(benches);
