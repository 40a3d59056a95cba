use criterion::{black_box, criterion_group, criterion_main, Criterion};
use histboost::binning::BinnedDataset;
use histboost::data::Matrix;
use histboost::gpu::{DeviceConfig, GpuHistogramBuilder, SimulatedDevice};
use histboost::gradientbooster::GradientBooster;
use histboost::histogram::{CpuHistogramBuilder, HistogramBuilder};
use histboost::objective::{compute_gradients, GradientBuffer, ObjectiveType};
use histboost::splitter::HistogramSplitter;
use histboost::tree::{Tree, TreeParams};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

const ROWS: usize = 100_000;
const COLS: usize = 5;

fn synthetic_data() -> (Vec<f64>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(0);
    let data_vec: Vec<f64> = (0..(ROWS * COLS))
        .map(|_| rng.gen_range(-10.0..10.0))
        .collect();
    let y: Vec<f64> = (0..ROWS)
        .map(|i| {
            let noise: f64 = rng.gen_range(-2.0..2.0);
            if data_vec[i] + 0.5 * data_vec[ROWS + i] + noise > 0.0 {
                1.0
            } else {
                0.0
            }
        })
        .collect();
    (data_vec, y)
}

pub fn tree_benchmarks(c: &mut Criterion) {
    let (data_vec, y) = synthetic_data();
    let yhat = vec![0.0; y.len()];
    let w = vec![1.; y.len()];
    let data = Matrix::new(&data_vec, ROWS, COLS);
    let binned = BinnedDataset::build(&data, &w, 255, f64::NAN, &HashSet::new()).unwrap();
    let mut gradients = GradientBuffer::new(ROWS);
    compute_gradients(&ObjectiveType::LogLoss, &y, &yhat, &w, &mut gradients, true);
    let index: Vec<usize> = (0..ROWS).collect();

    c.bench_function("Bin Data", |b| {
        b.iter(|| {
            BinnedDataset::build(
                black_box(&data),
                black_box(&w),
                black_box(255),
                f64::NAN,
                &HashSet::new(),
            )
            .unwrap()
        })
    });

    let mut cpu = CpuHistogramBuilder::new(true);
    c.bench_function("Build Histograms (CPU)", |b| {
        b.iter(|| cpu.build(black_box(&binned), black_box(&gradients), black_box(&index)))
    });

    let device = SimulatedDevice::open(DeviceConfig::default()).unwrap();
    let mut gpu = GpuHistogramBuilder::new(Box::new(device));
    gpu.begin_session(&binned).unwrap();
    gpu.begin_iteration(&gradients).unwrap();
    c.bench_function("Build Histograms (Device)", |b| {
        b.iter(|| gpu.build(black_box(&binned), black_box(&gradients), black_box(&index)))
    });

    let splitter = HistogramSplitter::default();
    let params = TreeParams {
        max_leaves: 31,
        max_depth: usize::MAX,
    };
    let mut tree = Tree::new();
    tree.fit(&binned, &gradients, index.clone(), &mut cpu, &splitter, &params)
        .unwrap();
    println!("{}", tree.nodes.len());
    c.bench_function("Train Tree", |b| {
        b.iter(|| {
            let mut train_tree = Tree::new();
            train_tree
                .fit(
                    black_box(&binned),
                    black_box(&gradients),
                    black_box(index.clone()),
                    &mut cpu,
                    black_box(&splitter),
                    black_box(&params),
                )
                .unwrap();
        })
    });
    c.bench_function("Tree Predict (Single Threaded)", |b| {
        b.iter(|| tree.predict(black_box(&data), black_box(false), f64::NAN))
    });
    c.bench_function("Tree Predict (Multi Threaded)", |b| {
        b.iter(|| tree.predict(black_box(&data), black_box(true), f64::NAN))
    });

    // Gradient Booster
    let mut group = c.benchmark_group("Booster");
    group.sample_size(10);
    group.bench_function("Train Booster", |b| {
        b.iter(|| {
            let mut booster = GradientBooster::default()
                .set_objective_type(ObjectiveType::LogLoss)
                .set_num_iterations(10);
            booster
                .fit(black_box(&data), black_box(&y), black_box(&w), &[])
                .unwrap();
        })
    });
    group.finish();
    let mut booster = GradientBooster::default()
        .set_objective_type(ObjectiveType::LogLoss)
        .set_num_iterations(10);
    booster.fit(&data, &y, &w, &[]).unwrap();
    c.bench_function("Predict Booster", |b| {
        b.iter(|| booster.predict(black_box(&data), true))
    });
}

criterion_group!(benches, tree_benchmarks);
criterion_main!(benches);
