use crate::callback::{CallbackAction, EarlyStopping, IterationCallback, IterationInfo};
use crate::data::Matrix;
use crate::errors::HistBoostError;
use crate::gpu::{DeviceConfig, DeviceType};
use crate::metric::Metric;
use crate::objective::ObjectiveType;
use crate::sampler::SampleMethod;
use crate::session::{EvalSet, SessionConfig, TrainingSession};
use crate::splitter::{HistogramSplitter, MissingDirection};
use crate::tree::{Tree, TreeParams};
use crate::utils::{deserialize_float, serialize_float};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;

/// How the importance of a feature is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportanceType {
    /// The number of times the feature is used to split.
    Split,
    /// The total gain of the splits that use the feature.
    Gain,
}

/// Gradient Booster object
///
/// * `objective_type` - The name of objective function used to optimize.
///   Valid options include "SquaredError" and "LogLoss".
/// * `num_iterations` - Total number of trees to train in the ensemble.
/// * `learning_rate` - Step size to use at each iteration. Each
///   leaf weight is multiplied by this number.
/// * `max_leaves` - Maximum number of leaves allowed on a tree.
/// * `max_depth` - Maximum depth of an individual tree, the root is at depth 0.
/// * `min_data_in_leaf` - Minimum number of records a leaf must hold.
/// * `min_sum_hessian_in_leaf` - Minimum sum of the hessian a leaf must hold.
/// * `lambda` - L2 regularization term applied to the weights of the tree.
/// * `min_gain_to_split` - The minimum gain a split must reach.
/// * `max_bin` - Number of bins to calculate to partition the data, including the
///   bin reserved for missing values.
/// * `device` - Build histograms on the CPU, or on a GPU.
/// * `gpu_histogram_threshold` - Nodes with at least this many records have their
///   histograms built on the GPU.
/// * `missing` - Value to consider missing, in addition to NaN.
/// * `missing_direction` - Where missing values are sent when a numeric feature is split.
/// * `categorical_features` - Indices of the features that hold categories.
/// * `early_stopping_rounds` - Stop training when any evaluation set has not
///   improved for this many iterations.
/// * `metric` - Metric used on the evaluation sets, the objective's default if None.
/// * `parallel` - Should multiple cores be used when training and predicting
///   with this model?
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GradientBooster {
    pub objective_type: ObjectiveType,
    pub num_iterations: usize,
    pub learning_rate: f64,
    pub max_leaves: usize,
    pub max_depth: usize,
    pub min_data_in_leaf: usize,
    pub min_sum_hessian_in_leaf: f64,
    pub lambda: f64,
    pub min_gain_to_split: f64,
    pub max_bin: usize,
    pub device: DeviceType,
    pub gpu_histogram_threshold: usize,
    pub gpu_platform_id: usize,
    pub gpu_device_id: usize,
    pub gpu_use_dp: bool,
    #[serde(serialize_with = "serialize_float", deserialize_with = "deserialize_float")]
    pub missing: f64,
    pub missing_direction: MissingDirection,
    pub categorical_features: HashSet<usize>,
    pub max_cat_to_onehot: usize,
    pub max_cat_threshold: usize,
    pub cat_l2: f64,
    pub cat_smooth: f64,
    pub min_data_per_group: usize,
    pub bagging_fraction: f64,
    pub bagging_freq: usize,
    pub sample_method: SampleMethod,
    pub top_rate: f64,
    pub other_rate: f64,
    pub seed: u64,
    pub early_stopping_rounds: Option<usize>,
    pub metric: Option<Metric>,
    pub parallel: bool,
    /// Log the evaluation metrics every this many iterations, never if 0.
    pub log_iterations: usize,
    pub base_score: f64,
    /// The number of trees to use when predicting, all of them if None.
    pub prediction_iteration: Option<usize>,
    /// The iteration with the best evaluation value, when early stopping was used.
    pub best_iteration: Option<usize>,
    /// The metric value of every evaluation set, for each iteration.
    #[serde(skip)]
    pub evaluation_history: Vec<Vec<f64>>,
    pub trees: Vec<Tree>,
}

impl Default for GradientBooster {
    fn default() -> Self {
        GradientBooster {
            objective_type: ObjectiveType::SquaredError,
            num_iterations: 100,
            learning_rate: 0.1,
            max_leaves: 31,
            max_depth: usize::MAX,
            min_data_in_leaf: 20,
            min_sum_hessian_in_leaf: 1e-3,
            lambda: 0.0,
            min_gain_to_split: 0.0,
            max_bin: 255,
            device: DeviceType::Cpu,
            gpu_histogram_threshold: 4096,
            gpu_platform_id: 0,
            gpu_device_id: 0,
            gpu_use_dp: false,
            missing: f64::NAN,
            missing_direction: MissingDirection::Learn,
            categorical_features: HashSet::new(),
            max_cat_to_onehot: 4,
            max_cat_threshold: 32,
            cat_l2: 10.0,
            cat_smooth: 10.0,
            min_data_per_group: 100,
            bagging_fraction: 1.0,
            bagging_freq: 0,
            sample_method: SampleMethod::None,
            top_rate: 0.2,
            other_rate: 0.1,
            seed: 0,
            early_stopping_rounds: None,
            metric: None,
            parallel: true,
            log_iterations: 0,
            base_score: 0.0,
            prediction_iteration: None,
            best_iteration: None,
            evaluation_history: Vec::new(),
            trees: Vec::new(),
        }
    }
}

fn invalid(message: String) -> Result<(), HistBoostError> {
    Err(HistBoostError::Configuration(message))
}

fn in_unit_interval(name: &str, value: f64) -> Result<(), HistBoostError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        invalid(format!("{} must be in (0, 1], found {}", name, value))
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), HistBoostError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        invalid(format!("{} must be a finite value >= 0, found {}", name, value))
    }
}

impl GradientBooster {
    /// Check that the parameters are valid, and consistent with each other.
    pub fn validate_parameters(&self) -> Result<(), HistBoostError> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            invalid(format!(
                "learning_rate must be a finite value > 0, found {}",
                self.learning_rate
            ))?;
        }
        if self.max_leaves < 2 {
            invalid(format!("max_leaves must be >= 2, found {}", self.max_leaves))?;
        }
        if self.max_depth < 1 {
            invalid(format!("max_depth must be >= 1, found {}", self.max_depth))?;
        }
        non_negative("lambda", self.lambda)?;
        non_negative("min_gain_to_split", self.min_gain_to_split)?;
        non_negative("min_sum_hessian_in_leaf", self.min_sum_hessian_in_leaf)?;
        non_negative("cat_l2", self.cat_l2)?;
        non_negative("cat_smooth", self.cat_smooth)?;
        if !(2..=(u16::MAX as usize)).contains(&self.max_bin) {
            invalid(format!(
                "max_bin must be between 2 and {}, found {}",
                u16::MAX,
                self.max_bin
            ))?;
        }
        if self.max_cat_threshold < 1 {
            invalid("max_cat_threshold must be >= 1".to_string())?;
        }
        in_unit_interval("bagging_fraction", self.bagging_fraction)?;
        if self.sample_method == SampleMethod::Goss {
            in_unit_interval("top_rate", self.top_rate)?;
            in_unit_interval("other_rate", self.other_rate)?;
            if self.top_rate + self.other_rate > 1.0 {
                invalid(format!(
                    "top_rate + other_rate must be <= 1, found {}",
                    self.top_rate + self.other_rate
                ))?;
            }
        }
        if self.early_stopping_rounds == Some(0) {
            invalid("early_stopping_rounds must be >= 1".to_string())?;
        }
        Ok(())
    }

    fn validate_input(
        &self,
        data: &Matrix<f64>,
        y: &[f64],
        sample_weight: &[f64],
        name: &str,
    ) -> Result<(), HistBoostError> {
        if data.rows == 0 || data.cols == 0 {
            return Err(HistBoostError::EmptyData(name.to_string()));
        }
        if y.len() != data.rows {
            return Err(HistBoostError::MismatchedLength(
                format!("{} labels", name),
                data.rows,
                y.len(),
            ));
        }
        if sample_weight.len() != data.rows {
            return Err(HistBoostError::MismatchedLength(
                format!("{} sample_weight", name),
                data.rows,
                sample_weight.len(),
            ));
        }
        self.objective_type.validate_labels(y)?;
        if let Some((i, w)) = sample_weight
            .iter()
            .enumerate()
            .find(|(_, w)| !(w.is_finite() && **w >= 0.0))
        {
            return Err(HistBoostError::InvalidWeight(*w, i));
        }
        Ok(())
    }

    /// The sampling method actually used, bagging is turned on by
    /// `bagging_freq` and `bagging_fraction` alone.
    fn effective_sample_method(&self) -> SampleMethod {
        match self.sample_method {
            SampleMethod::None if self.bagging_freq > 0 && self.bagging_fraction < 1.0 => {
                SampleMethod::Random
            }
            m => m,
        }
    }

    fn session_config(&self, metric: Metric) -> SessionConfig {
        SessionConfig {
            objective_type: self.objective_type,
            learning_rate: self.learning_rate,
            tree_params: TreeParams {
                max_leaves: self.max_leaves,
                max_depth: self.max_depth,
            },
            splitter: HistogramSplitter {
                l2: self.lambda,
                gamma: self.min_gain_to_split,
                min_data_in_leaf: self.min_data_in_leaf,
                min_sum_hessian_in_leaf: self.min_sum_hessian_in_leaf,
                missing_direction: self.missing_direction,
                max_cat_to_onehot: self.max_cat_to_onehot,
                max_cat_threshold: self.max_cat_threshold,
                cat_l2: self.cat_l2,
                cat_smooth: self.cat_smooth,
                min_data_per_group: self.min_data_per_group,
                parallel: self.parallel,
            },
            max_bin: self.max_bin,
            missing: self.missing,
            categorical_features: self.categorical_features.clone(),
            device: self.device,
            device_config: DeviceConfig {
                platform_id: self.gpu_platform_id,
                device_id: self.gpu_device_id,
                use_dp: self.gpu_use_dp,
                ..Default::default()
            },
            gpu_histogram_threshold: self.gpu_histogram_threshold,
            sample_method: self.effective_sample_method(),
            bagging_fraction: self.bagging_fraction,
            bagging_freq: self.bagging_freq.max(1),
            top_rate: self.top_rate,
            other_rate: self.other_rate,
            seed: self.seed,
            metric,
            parallel: self.parallel,
        }
    }

    /// Fit the gradient booster on a provided dataset.
    ///
    /// * `data` - Column major matrix of the training data.
    /// * `y` - The labels of the training data.
    /// * `sample_weight` - Weight of each record.
    /// * `eval_sets` - Validation sets evaluated after every iteration,
    ///   required by early stopping.
    pub fn fit(
        &mut self,
        data: &Matrix<f64>,
        y: &[f64],
        sample_weight: &[f64],
        eval_sets: &[EvalSet],
    ) -> Result<(), HistBoostError> {
        self.fit_with_callbacks(data, y, sample_weight, eval_sets, &mut [])
    }

    /// Fit the gradient booster, calling every callback at the end of each
    /// iteration. Training stops as soon as any callback asks it to.
    pub fn fit_with_callbacks(
        &mut self,
        data: &Matrix<f64>,
        y: &[f64],
        sample_weight: &[f64],
        eval_sets: &[EvalSet],
        callbacks: &mut [&mut dyn IterationCallback],
    ) -> Result<(), HistBoostError> {
        self.validate_parameters()?;
        self.validate_input(data, y, sample_weight, "training data")?;
        for (i, (eval_data, eval_y, eval_w)) in eval_sets.iter().enumerate() {
            let name = format!("evaluation set {}", i);
            self.validate_input(eval_data, eval_y, eval_w, &name)?;
            if eval_data.cols != data.cols {
                return Err(HistBoostError::MismatchedLength(
                    format!("{} columns", name),
                    data.cols,
                    eval_data.cols,
                ));
            }
        }
        if self.early_stopping_rounds.is_some() && eval_sets.is_empty() {
            return Err(HistBoostError::Configuration(
                "early_stopping_rounds requires at least one evaluation set".to_string(),
            ));
        }

        let metric = self
            .metric
            .unwrap_or_else(|| self.objective_type.default_metric());
        self.base_score = self.objective_type.initial_score(y, sample_weight);
        self.trees = Vec::new();
        self.best_iteration = None;
        self.evaluation_history = Vec::new();

        let mut session = TrainingSession::new(
            self.session_config(metric),
            data,
            y,
            sample_weight,
            eval_sets,
            self.base_score,
        )?;
        let mut early_stopping = self.early_stopping_rounds.map(EarlyStopping::new);

        for _ in 0..self.num_iterations {
            let tree = session.grow_tree()?;
            let evaluations = session.complete_iteration(&tree);
            self.trees.push(tree);

            let info = IterationInfo {
                iteration: self.trees.len(),
                metric,
                evaluations,
            };
            if self.log_iterations > 0 && info.iteration % self.log_iterations == 0 {
                log::info!(
                    "Iteration {}, {:?}: {:?}",
                    info.iteration,
                    info.metric,
                    info.evaluations
                );
            }

            let mut stop = false;
            if let Some(stopper) = early_stopping.as_mut() {
                stop |= stopper.after_iteration(&info) == CallbackAction::Stop;
            }
            for callback in callbacks.iter_mut() {
                stop |= callback.after_iteration(&info) == CallbackAction::Stop;
            }
            self.evaluation_history.push(info.evaluations);
            if stop {
                break;
            }
        }
        if let Some(stopper) = &early_stopping {
            self.best_iteration = stopper.best_iteration();
        }
        let (gpu_builds, cpu_builds) = session.histogram_builds();
        log::debug!(
            "Trained {} trees, {} histograms built on the device, {} on the CPU.",
            self.trees.len(),
            gpu_builds,
            cpu_builds
        );
        session.finish();
        Ok(())
    }

    /// The trees used for prediction.
    fn prediction_trees(&self) -> &[Tree] {
        let n = self
            .prediction_iteration
            .unwrap_or(self.trees.len())
            .min(self.trees.len());
        &self.trees[..n]
    }

    /// Generate raw predictions on data using the gradient booster.
    ///
    /// * `data` - Column major matrix, with the same columns as the training data.
    /// * `parallel` - Predict with multiple threads.
    pub fn predict(&self, data: &Matrix<f64>, parallel: bool) -> Vec<f64> {
        let mut init_preds = vec![self.base_score; data.rows];
        self.prediction_trees().iter().for_each(|tree| {
            for (p_, val) in init_preds
                .iter_mut()
                .zip(tree.predict(data, parallel, self.missing))
            {
                *p_ += val;
            }
        });
        init_preds
    }

    /// Predictions on the scale of the label, for LogLoss these are probabilities.
    pub fn predict_transformed(&self, data: &Matrix<f64>, parallel: bool) -> Vec<f64> {
        let objective = self.objective_type;
        let preds = self.predict(data, parallel);
        if parallel {
            preds.into_par_iter().map(|p| objective.transform(p)).collect()
        } else {
            preds.into_iter().map(|p| objective.transform(p)).collect()
        }
    }

    /// The node number of the leaf each record falls into, for every tree.
    /// Indexed by record, then by tree.
    pub fn predict_leaf_indices(&self, data: &Matrix<f64>, parallel: bool) -> Vec<Vec<usize>> {
        let per_tree: Vec<Vec<usize>> = self
            .prediction_trees()
            .iter()
            .map(|tree| tree.predict_leaf_indices(data, parallel, self.missing))
            .collect();
        (0..data.rows)
            .map(|i| per_tree.iter().map(|leaves| leaves[i]).collect())
            .collect()
    }

    /// Calculate the importance of every feature used in the model.
    pub fn feature_importance(&self, importance_type: ImportanceType) -> HashMap<usize, f64> {
        let mut importance: HashMap<usize, f64> = HashMap::new();
        for tree in self.prediction_trees() {
            for node in tree.nodes.iter().filter(|n| !n.is_leaf) {
                let value = match importance_type {
                    ImportanceType::Split => 1.0,
                    ImportanceType::Gain => node.split_gain,
                };
                *importance.entry(node.split_feature).or_insert(0.0) += value;
            }
        }
        importance
    }

    /// Every threshold used to split a numeric feature, across all trees.
    /// Splits that only separate the missing values have no threshold.
    pub fn split_values(&self, feature: usize) -> Vec<f64> {
        self.prediction_trees()
            .iter()
            .flat_map(|tree| tree.nodes.iter())
            .filter(|n| !n.is_leaf && n.split_feature == feature && n.left_categories.is_none())
            .map(|n| n.split_value)
            .filter(|v| v.is_finite())
            .collect()
    }

    /// Dump a booster as a json object
    pub fn json_dump(&self) -> Result<String, HistBoostError> {
        serde_json::to_string(self).map_err(|e| HistBoostError::UnableToWrite(e.to_string()))
    }

    /// Load a booster from a json string
    pub fn from_json(json_str: &str) -> Result<Self, HistBoostError> {
        serde_json::from_str::<GradientBooster>(json_str)
            .map_err(|e| HistBoostError::UnableToRead(e.to_string()))
    }

    /// Save a booster as a json object to a file.
    pub fn save_booster(&self, path: &str) -> Result<(), HistBoostError> {
        let model = self.json_dump()?;
        fs::write(path, model).map_err(|e| HistBoostError::UnableToWrite(e.to_string()))
    }

    /// Load a booster from a path to a json booster object.
    pub fn load_booster(path: &str) -> Result<Self, HistBoostError> {
        let json_str =
            fs::read_to_string(path).map_err(|e| HistBoostError::UnableToRead(e.to_string()))?;
        Self::from_json(&json_str)
    }

    pub fn set_objective_type(mut self, objective_type: ObjectiveType) -> Self {
        self.objective_type = objective_type;
        self
    }

    pub fn set_num_iterations(mut self, num_iterations: usize) -> Self {
        self.num_iterations = num_iterations;
        self
    }

    pub fn set_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn set_max_leaves(mut self, max_leaves: usize) -> Self {
        self.max_leaves = max_leaves;
        self
    }

    pub fn set_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn set_min_data_in_leaf(mut self, min_data_in_leaf: usize) -> Self {
        self.min_data_in_leaf = min_data_in_leaf;
        self
    }

    pub fn set_min_sum_hessian_in_leaf(mut self, min_sum_hessian_in_leaf: f64) -> Self {
        self.min_sum_hessian_in_leaf = min_sum_hessian_in_leaf;
        self
    }

    pub fn set_lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }

    pub fn set_min_gain_to_split(mut self, min_gain_to_split: f64) -> Self {
        self.min_gain_to_split = min_gain_to_split;
        self
    }

    pub fn set_max_bin(mut self, max_bin: usize) -> Self {
        self.max_bin = max_bin;
        self
    }

    pub fn set_device(mut self, device: DeviceType) -> Self {
        self.device = device;
        self
    }

    pub fn set_gpu_histogram_threshold(mut self, gpu_histogram_threshold: usize) -> Self {
        self.gpu_histogram_threshold = gpu_histogram_threshold;
        self
    }

    pub fn set_gpu_platform_id(mut self, gpu_platform_id: usize) -> Self {
        self.gpu_platform_id = gpu_platform_id;
        self
    }

    pub fn set_gpu_device_id(mut self, gpu_device_id: usize) -> Self {
        self.gpu_device_id = gpu_device_id;
        self
    }

    pub fn set_gpu_use_dp(mut self, gpu_use_dp: bool) -> Self {
        self.gpu_use_dp = gpu_use_dp;
        self
    }

    pub fn set_missing(mut self, missing: f64) -> Self {
        self.missing = missing;
        self
    }

    pub fn set_missing_direction(mut self, missing_direction: MissingDirection) -> Self {
        self.missing_direction = missing_direction;
        self
    }

    pub fn set_categorical_features(mut self, categorical_features: HashSet<usize>) -> Self {
        self.categorical_features = categorical_features;
        self
    }

    pub fn set_max_cat_to_onehot(mut self, max_cat_to_onehot: usize) -> Self {
        self.max_cat_to_onehot = max_cat_to_onehot;
        self
    }

    pub fn set_max_cat_threshold(mut self, max_cat_threshold: usize) -> Self {
        self.max_cat_threshold = max_cat_threshold;
        self
    }

    pub fn set_cat_l2(mut self, cat_l2: f64) -> Self {
        self.cat_l2 = cat_l2;
        self
    }

    pub fn set_cat_smooth(mut self, cat_smooth: f64) -> Self {
        self.cat_smooth = cat_smooth;
        self
    }

    pub fn set_min_data_per_group(mut self, min_data_per_group: usize) -> Self {
        self.min_data_per_group = min_data_per_group;
        self
    }

    pub fn set_bagging_fraction(mut self, bagging_fraction: f64) -> Self {
        self.bagging_fraction = bagging_fraction;
        self
    }

    pub fn set_bagging_freq(mut self, bagging_freq: usize) -> Self {
        self.bagging_freq = bagging_freq;
        self
    }

    pub fn set_sample_method(mut self, sample_method: SampleMethod) -> Self {
        self.sample_method = sample_method;
        self
    }

    pub fn set_top_rate(mut self, top_rate: f64) -> Self {
        self.top_rate = top_rate;
        self
    }

    pub fn set_other_rate(mut self, other_rate: f64) -> Self {
        self.other_rate = other_rate;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn set_early_stopping_rounds(mut self, early_stopping_rounds: Option<usize>) -> Self {
        self.early_stopping_rounds = early_stopping_rounds;
        self
    }

    pub fn set_metric(mut self, metric: Option<Metric>) -> Self {
        self.metric = metric;
        self
    }

    pub fn set_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn set_log_iterations(mut self, log_iterations: usize) -> Self {
        self.log_iterations = log_iterations;
        self
    }

    pub fn set_prediction_iteration(mut self, prediction_iteration: Option<usize>) -> Self {
        self.prediction_iteration = prediction_iteration;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{binary_label, random_matrix};
    use crate::utils::precision_round;

    fn problem(rows: usize, seed: u64) -> (Vec<f64>, Vec<f64>) {
        let data_vec = random_matrix(rows, 5, seed);
        let y = binary_label(&data_vec, rows);
        (data_vec, y)
    }

    #[test]
    fn test_booster_fit() {
        let (data_vec, y) = problem(2000, 0);
        let data = Matrix::new(&data_vec, 2000, 5);
        let w = vec![1.; y.len()];
        let mut booster = GradientBooster::default()
            .set_objective_type(ObjectiveType::LogLoss)
            .set_num_iterations(10)
            .set_learning_rate(0.3)
            .set_max_leaves(8);
        booster.fit(&data, &y, &w, &[]).unwrap();
        assert_eq!(booster.trees.len(), 10);
        assert!(booster.trees.iter().all(|t| t.n_leaves() <= 8));

        let preds = booster.predict_transformed(&data, true);
        let correct = preds
            .iter()
            .zip(y.iter())
            .filter(|(p, y_)| (**p > 0.5) == (**y_ == 1.0))
            .count();
        assert!(correct as f64 / y.len() as f64 > 0.9);

        let importance = booster.feature_importance(ImportanceType::Split);
        // The label only depends on the first two features.
        let top: f64 = importance.get(&0).unwrap_or(&0.0) + importance.get(&1).unwrap_or(&0.0);
        let total: f64 = importance.values().sum();
        assert!(top / total > 0.5);
        assert!(!booster.split_values(0).is_empty());
    }

    #[test]
    fn test_base_score() {
        let (data_vec, _) = problem(100, 1);
        let data = Matrix::new(&data_vec, 100, 5);
        let y: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let w = vec![1.; y.len()];
        let mut booster = GradientBooster::default().set_num_iterations(1);
        booster.fit(&data, &y, &w, &[]).unwrap();
        assert_eq!(precision_round(booster.base_score, 6), 49.5);
    }

    #[test]
    fn test_invalid_parameters() {
        let bad = [
            GradientBooster::default().set_learning_rate(0.0),
            GradientBooster::default().set_learning_rate(f64::NAN),
            GradientBooster::default().set_max_leaves(1),
            GradientBooster::default().set_max_depth(0),
            GradientBooster::default().set_lambda(-1.0),
            GradientBooster::default().set_max_bin(1),
            GradientBooster::default().set_bagging_fraction(0.0),
            GradientBooster::default().set_early_stopping_rounds(Some(0)),
            GradientBooster::default()
                .set_sample_method(SampleMethod::Goss)
                .set_top_rate(0.7)
                .set_other_rate(0.5),
        ];
        for b in bad.iter() {
            assert!(matches!(
                b.validate_parameters(),
                Err(HistBoostError::Configuration(_))
            ));
        }
        assert!(GradientBooster::default().validate_parameters().is_ok());
    }

    #[test]
    fn test_invalid_input() {
        let (data_vec, y) = problem(100, 2);
        let data = Matrix::new(&data_vec, 100, 5);
        let w = vec![1.; 100];
        let mut booster = GradientBooster::default().set_num_iterations(1);

        let r = booster.fit(&data, &y[..50], &w, &[]);
        assert!(matches!(r, Err(HistBoostError::MismatchedLength(..))));

        let mut nan_y = y.clone();
        nan_y[3] = f64::NAN;
        let r = booster.fit(&data, &nan_y, &w, &[]);
        assert!(matches!(r, Err(HistBoostError::InvalidLabel(_, 3, _))));

        let mut bad_w = w.clone();
        bad_w[7] = -1.0;
        let r = booster.fit(&data, &y, &bad_w, &[]);
        assert!(matches!(r, Err(HistBoostError::InvalidWeight(_, 7))));

        let mut logloss = GradientBooster::default().set_objective_type(ObjectiveType::LogLoss);
        let y2: Vec<f64> = y.iter().map(|v| v * 2.0).collect();
        let r = logloss.fit(&data, &y2, &w, &[]);
        assert!(matches!(r, Err(HistBoostError::InvalidLabel(..))));

        let r = booster
            .clone()
            .set_early_stopping_rounds(Some(2))
            .fit(&data, &y, &w, &[]);
        assert!(matches!(r, Err(HistBoostError::Configuration(_))));
    }

    #[test]
    fn test_prediction_iteration() {
        let (data_vec, y) = problem(500, 3);
        let data = Matrix::new(&data_vec, 500, 5);
        let w = vec![1.; y.len()];
        let mut booster = GradientBooster::default()
            .set_objective_type(ObjectiveType::LogLoss)
            .set_num_iterations(5);
        booster.fit(&data, &y, &w, &[]).unwrap();
        let full = booster.predict(&data, true);
        let limited = booster.clone().set_prediction_iteration(Some(2));
        let partial = limited.predict(&data, true);
        let manual: Vec<f64> = (0..500)
            .map(|i| {
                booster.base_score
                    + booster.trees[0].predict_row(&data, i, f64::NAN)
                    + booster.trees[1].predict_row(&data, i, f64::NAN)
            })
            .collect();
        assert_eq!(partial, manual);
        assert_ne!(partial, full);
        let leaves = limited.predict_leaf_indices(&data, false);
        assert_eq!(leaves.len(), 500);
        assert!(leaves.iter().all(|l| l.len() == 2));
    }

    #[test]
    fn test_booster_saving() {
        let (data_vec, y) = problem(500, 4);
        let data = Matrix::new(&data_vec, 500, 5);
        let w = vec![1.; y.len()];
        let mut booster = GradientBooster::default()
            .set_objective_type(ObjectiveType::LogLoss)
            .set_num_iterations(5)
            .set_max_leaves(6);
        booster.fit(&data, &y, &w, &[]).unwrap();
        let preds = booster.predict(&data, true);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("booster.json");
        let path = path.to_str().unwrap();
        booster.save_booster(path).unwrap();
        let loaded = GradientBooster::load_booster(path).unwrap();
        assert!(loaded.missing.is_nan());
        assert_eq!(loaded.trees.len(), 5);
        assert_eq!(preds, loaded.predict(&data, true));

        let json = booster.json_dump().unwrap();
        let from_json = GradientBooster::from_json(&json).unwrap();
        assert_eq!(preds, from_json.predict(&data, false));
        assert!(GradientBooster::from_json("{").is_err());
    }
}
