use crate::objective::GradientBuffer;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleMethod {
    #[default]
    None,
    Random,
    Goss,
}

// A sampler can be used to subset the data prior to fitting a new tree.
pub trait Sampler {
    /// Sample the data, returning a tuple, where the first item is the samples
    /// chosen for training, and the second are the samples excluded.
    /// Samplers may reweight the gradients of the chosen records.
    fn sample(
        &mut self,
        rng: &mut StdRng,
        index: &[usize],
        gradients: &mut GradientBuffer,
    ) -> (Vec<usize>, Vec<usize>);
}

/// Bagging, every record is kept with probability `subsample`.
pub struct RandomSampler {
    subsample: f64,
}

impl RandomSampler {
    pub fn new(subsample: f64) -> Self {
        RandomSampler { subsample }
    }
}

impl Sampler for RandomSampler {
    fn sample(
        &mut self,
        rng: &mut StdRng,
        index: &[usize],
        _gradients: &mut GradientBuffer,
    ) -> (Vec<usize>, Vec<usize>) {
        let subsample = self.subsample;
        let mut chosen = Vec::new();
        let mut excluded = Vec::new();
        for i in index {
            if rng.gen_range(0.0..1.0) < subsample {
                chosen.push(*i);
            } else {
                excluded.push(*i)
            }
        }
        (chosen, excluded)
    }
}

/// Gradient based one side sampling. The records with the largest
/// absolute gradients are always kept, a random share of the rest
/// is kept, and their gradients are amplified to stay unbiased.
pub struct GossSampler {
    top_rate: f64,
    other_rate: f64,
}

impl GossSampler {
    pub fn new(top_rate: f64, other_rate: f64) -> Self {
        GossSampler {
            top_rate,
            other_rate,
        }
    }
}

impl Sampler for GossSampler {
    fn sample(
        &mut self,
        rng: &mut StdRng,
        index: &[usize],
        gradients: &mut GradientBuffer,
    ) -> (Vec<usize>, Vec<usize>) {
        let n = index.len();
        let top_n = ((n as f64) * self.top_rate) as usize;
        let other_n = ((n as f64) * self.other_rate) as usize;
        if top_n + other_n >= n {
            return (index.to_vec(), Vec::new());
        }

        let magnitude = |i: usize| (gradients.grad[i] * gradients.hess[i]).abs();
        let mut ranked = index.to_vec();
        // Stable, so equal magnitudes keep the order of the index.
        ranked.sort_by(|a, b| magnitude(*b).total_cmp(&magnitude(*a)));

        let rest = &ranked[top_n..];
        let mut keep = vec![false; rest.len()];
        for i in sample(rng, rest.len(), other_n).into_iter() {
            keep[i] = true;
        }

        let amplify = ((1.0 - self.top_rate) / self.other_rate) as f32;
        let mut chosen: Vec<usize> = ranked[..top_n].to_vec();
        let mut excluded = Vec::with_capacity(rest.len() - other_n);
        for (row, k) in rest.iter().zip(keep) {
            if k {
                gradients.grad[*row] *= amplify;
                gradients.hess[*row] *= amplify;
                chosen.push(*row);
            } else {
                excluded.push(*row);
            }
        }
        chosen.sort_unstable();
        excluded.sort_unstable();
        (chosen, excluded)
    }
}
