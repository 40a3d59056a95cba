use crate::binning::BinnedDataset;
use crate::data::Matrix;
use crate::errors::HistBoostError;
use crate::gpu::{DeviceConfig, DeviceType, HybridHistogramBuilder};
use crate::histogram::HistogramBuilder;
use crate::metric::Metric;
use crate::objective::{compute_gradients, GradientBuffer, ObjectiveType};
use crate::sampler::{GossSampler, RandomSampler, SampleMethod, Sampler};
use crate::splitter::HistogramSplitter;
use crate::tree::{Tree, TreeParams};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::fmt;

/// A validation set, made of the data, the label and the sample weight.
pub type EvalSet<'a> = (&'a Matrix<'a, f64>, &'a [f64], &'a [f64]);

/// Where a training run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    AwaitingIteration,
    GrowingTree,
    TreeComplete,
    Finished,
}

impl TrainingState {
    fn can_move_to(&self, next: TrainingState) -> bool {
        use TrainingState::*;
        matches!(
            (self, next),
            (AwaitingIteration, GrowingTree)
                | (GrowingTree, TreeComplete)
                | (TreeComplete, AwaitingIteration)
                | (AwaitingIteration, Finished)
                | (TreeComplete, Finished)
        )
    }
}

impl fmt::Display for TrainingState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            TrainingState::AwaitingIteration => "awaiting iteration",
            TrainingState::GrowingTree => "growing tree",
            TrainingState::TreeComplete => "tree complete",
            TrainingState::Finished => "finished",
        };
        write!(f, "{}", name)
    }
}

/// Everything about a training run that is fixed for its duration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub objective_type: ObjectiveType,
    pub learning_rate: f64,
    pub tree_params: TreeParams,
    pub splitter: HistogramSplitter,
    pub max_bin: usize,
    pub missing: f64,
    pub categorical_features: HashSet<usize>,
    pub device: DeviceType,
    pub device_config: DeviceConfig,
    pub gpu_histogram_threshold: usize,
    pub sample_method: SampleMethod,
    pub bagging_fraction: f64,
    pub bagging_freq: usize,
    pub top_rate: f64,
    pub other_rate: f64,
    pub seed: u64,
    pub metric: Metric,
    pub parallel: bool,
}

struct EvalState<'a> {
    data: &'a Matrix<'a, f64>,
    y: &'a [f64],
    sample_weight: &'a [f64],
    yhat: Vec<f64>,
}

/// The mutable state of a single training run. The session owns the
/// binned data, the gradient buffer and the running predictions, and
/// hands out one tree per iteration.
pub struct TrainingSession<'a> {
    config: SessionConfig,
    state: TrainingState,
    iteration: usize,
    data: &'a Matrix<'a, f64>,
    y: &'a [f64],
    sample_weight: &'a [f64],
    binned: BinnedDataset,
    gradients: GradientBuffer,
    yhat: Vec<f64>,
    eval_sets: Vec<EvalState<'a>>,
    builder: HybridHistogramBuilder,
    rng: StdRng,
    bag: Vec<usize>,
}

impl<'a> TrainingSession<'a> {
    /// Bin the training data, and set every prediction to the base score.
    pub fn new(
        config: SessionConfig,
        data: &'a Matrix<'a, f64>,
        y: &'a [f64],
        sample_weight: &'a [f64],
        eval_sets: &[EvalSet<'a>],
        base_score: f64,
    ) -> Result<Self, HistBoostError> {
        let binned = BinnedDataset::build(
            data,
            sample_weight,
            config.max_bin,
            config.missing,
            &config.categorical_features,
        )?;
        let mut builder = HybridHistogramBuilder::new(
            config.device,
            config.device_config.clone(),
            config.gpu_histogram_threshold,
            config.parallel,
        );
        builder.begin_session(&binned)?;
        let eval_sets = eval_sets
            .iter()
            .map(|&(d, y_, w_)| EvalState {
                data: d,
                y: y_,
                sample_weight: w_,
                yhat: vec![base_score; d.rows],
            })
            .collect();
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(TrainingSession {
            state: TrainingState::AwaitingIteration,
            iteration: 0,
            data,
            y,
            sample_weight,
            gradients: GradientBuffer::new(data.rows),
            yhat: vec![base_score; data.rows],
            eval_sets,
            builder,
            rng,
            bag: (0..data.rows).collect(),
            binned,
            config,
        })
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// Is the compute device still building histograms.
    pub fn uses_device(&self) -> bool {
        self.builder.uses_device()
    }

    /// The number of histograms built on the device, and on the CPU.
    pub fn histogram_builds(&self) -> (usize, usize) {
        (self.builder.gpu_builds, self.builder.cpu_builds)
    }

    fn transition(&mut self, next: TrainingState) {
        debug_assert!(
            self.state.can_move_to(next),
            "invalid training state transition {} -> {}",
            self.state,
            next
        );
        log::debug!(
            "Iteration {}: {} -> {}",
            self.iteration,
            self.state,
            next
        );
        self.state = next;
    }

    /// The records the next tree is fit on.
    fn sample_index(&mut self) -> Vec<usize> {
        let all: Vec<usize> = (0..self.data.rows).collect();
        match self.config.sample_method {
            SampleMethod::None => all,
            SampleMethod::Random => {
                // A new bag is drawn every `bagging_freq` iterations.
                if self.config.bagging_freq > 0 && self.iteration % self.config.bagging_freq == 0
                {
                    let mut sampler = RandomSampler::new(self.config.bagging_fraction);
                    let (chosen, _) = sampler.sample(&mut self.rng, &all, &mut self.gradients);
                    self.bag = chosen;
                }
                self.bag.clone()
            }
            SampleMethod::Goss => {
                // No sampling for the first 1 / learning_rate iterations.
                let warmup = (1.0 / self.config.learning_rate) as usize;
                if self.iteration < warmup {
                    return all;
                }
                let mut sampler = GossSampler::new(self.config.top_rate, self.config.other_rate);
                let (chosen, _) = sampler.sample(&mut self.rng, &all, &mut self.gradients);
                chosen
            }
        }
    }

    /// Compute the gradients at the current predictions, and fit a
    /// new tree to them. The returned tree is already shrunk.
    pub fn grow_tree(&mut self) -> Result<Tree, HistBoostError> {
        self.transition(TrainingState::GrowingTree);
        compute_gradients(
            &self.config.objective_type,
            self.y,
            &self.yhat,
            self.sample_weight,
            &mut self.gradients,
            self.config.parallel,
        );
        let index = self.sample_index();
        self.builder.begin_iteration(&self.gradients)?;

        let mut tree = Tree::new();
        tree.fit(
            &self.binned,
            &self.gradients,
            index,
            &mut self.builder,
            &self.config.splitter,
            &self.config.tree_params,
        )?;
        tree.shrink(self.config.learning_rate);
        self.transition(TrainingState::TreeComplete);
        Ok(tree)
    }

    /// Add the new tree to the running predictions, and evaluate every
    /// evaluation set, returning the metric values.
    pub fn complete_iteration(&mut self, tree: &Tree) -> Vec<f64> {
        let parallel = self.config.parallel;
        let missing = self.config.missing;
        let update = tree.predict(self.data, parallel, missing);
        self.yhat
            .iter_mut()
            .zip(update)
            .for_each(|(p, u)| *p += u);

        let metric = self.config.metric;
        let evaluations = self
            .eval_sets
            .iter_mut()
            .map(|set| {
                let update = tree.predict(set.data, parallel, missing);
                set.yhat.iter_mut().zip(update).for_each(|(p, u)| *p += u);
                metric.evaluate(set.y, &set.yhat, set.sample_weight)
            })
            .collect();
        self.iteration += 1;
        self.transition(TrainingState::AwaitingIteration);
        evaluations
    }

    pub fn finish(&mut self) {
        self.transition(TrainingState::Finished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{binary_label, random_matrix};

    fn config() -> SessionConfig {
        SessionConfig {
            objective_type: ObjectiveType::LogLoss,
            learning_rate: 0.3,
            tree_params: TreeParams {
                max_leaves: 8,
                max_depth: usize::MAX,
            },
            splitter: HistogramSplitter::default(),
            max_bin: 64,
            missing: f64::NAN,
            categorical_features: HashSet::new(),
            device: DeviceType::Cpu,
            device_config: DeviceConfig::default(),
            gpu_histogram_threshold: 4096,
            sample_method: SampleMethod::None,
            bagging_fraction: 1.0,
            bagging_freq: 0,
            top_rate: 0.2,
            other_rate: 0.1,
            seed: 0,
            metric: Metric::LogLoss,
            parallel: true,
        }
    }

    #[test]
    fn test_session_lifecycle() {
        let rows = 1000;
        let data_vec = random_matrix(rows, 3, 11);
        let y = binary_label(&data_vec, rows);
        let w = vec![1.; rows];
        let data = Matrix::new(&data_vec, rows, 3);
        let eval_sets = [(&data, y.as_slice(), w.as_slice())];
        let mut session = TrainingSession::new(config(), &data, &y, &w, &eval_sets, 0.0).unwrap();
        assert_eq!(session.state(), TrainingState::AwaitingIteration);

        let mut losses = Vec::new();
        for _ in 0..5 {
            let tree = session.grow_tree().unwrap();
            assert_eq!(session.state(), TrainingState::TreeComplete);
            let evaluations = session.complete_iteration(&tree);
            assert_eq!(session.state(), TrainingState::AwaitingIteration);
            losses.push(evaluations[0]);
        }
        session.finish();
        assert_eq!(session.state(), TrainingState::Finished);
        // The training loss must go down on the training data.
        assert!(losses.windows(2).all(|w| w[1] < w[0]));
        assert_eq!(session.histogram_builds().0, 0);
    }

    #[test]
    fn test_bagging_reuses_bag() {
        let rows = 500;
        let data_vec = random_matrix(rows, 2, 12);
        let y = binary_label(&data_vec, rows);
        let w = vec![1.; rows];
        let data = Matrix::new(&data_vec, rows, 2);
        let c = SessionConfig {
            sample_method: SampleMethod::Random,
            bagging_fraction: 0.5,
            bagging_freq: 2,
            ..config()
        };
        let mut session = TrainingSession::new(c, &data, &y, &w, &[], 0.0).unwrap();
        let first = session.sample_index();
        session.iteration = 1;
        let second = session.sample_index();
        session.iteration = 2;
        let third = session.sample_index();
        assert_eq!(first, second);
        assert_ne!(first, third);
        assert!(first.len() < rows);
    }
}
