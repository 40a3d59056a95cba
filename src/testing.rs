//! Shared helpers for the unit tests.

use crate::binning::BinnedDataset;
use crate::data::Matrix;
use crate::objective::{compute_gradients, GradientBuffer, ObjectiveType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

/// Random column major data, with a small share of missing values.
pub fn random_matrix(rows: usize, cols: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..(rows * cols))
        .map(|_| {
            if rng.gen_range(0.0..1.0) < 0.02 {
                f64::NAN
            } else {
                rng.gen_range(-10.0..10.0)
            }
        })
        .collect()
}

/// A binary label that depends on the first two features.
pub fn binary_label(data: &[f64], rows: usize) -> Vec<f64> {
    (0..rows)
        .map(|i| {
            let a = data[i];
            let b = data[rows + i];
            if (a.is_nan() || a > 0.0) && (b.is_nan() || b < 5.0) {
                1.0
            } else {
                0.0
            }
        })
        .collect()
}

/// A binned dataset with log loss gradients, evaluated at
/// random predictions.
pub fn random_problem(rows: usize, cols: usize, seed: u64) -> (BinnedDataset, GradientBuffer) {
    let data_vec = random_matrix(rows, cols, seed);
    let mut rng = StdRng::seed_from_u64(seed + 1);
    let y = binary_label(&data_vec, rows);
    let yhat: Vec<f64> = (0..rows).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let w = vec![1.; rows];
    let data = Matrix::new(&data_vec, rows, cols);
    let b = BinnedDataset::build(&data, &w, 64, f64::NAN, &HashSet::new()).unwrap();
    let mut g = GradientBuffer::new(rows);
    compute_gradients(&ObjectiveType::LogLoss, &y, &yhat, &w, &mut g, false);
    (b, g)
}
