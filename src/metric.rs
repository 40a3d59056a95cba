use crate::errors::HistBoostError;
use crate::objective::sigmoid;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

type MetricFn = fn(&[f64], &[f64], &[f64]) -> f64;

/// Metrics used to evaluate a model on a validation set. Predictions
/// passed to the metric are raw scores.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    LogLoss,
    AUC,
    RootMeanSquaredLogError,
    RootMeanSquaredError,
}

impl FromStr for Metric {
    type Err = HistBoostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary_logloss" | "logloss" | "LogLoss" => Ok(Metric::LogLoss),
            "auc" | "AUC" => Ok(Metric::AUC),
            "rmsle" | "RootMeanSquaredLogError" => Ok(Metric::RootMeanSquaredLogError),
            "rmse" | "l2_root" | "RootMeanSquaredError" => Ok(Metric::RootMeanSquaredError),
            _ => Err(HistBoostError::UnsupportedMetric(s.to_string())),
        }
    }
}

impl Metric {
    /// Should this metric be maximized, rather than minimized.
    pub fn maximize(&self) -> bool {
        matches!(self, Metric::AUC)
    }

    pub fn evaluate(&self, y: &[f64], yhat: &[f64], sample_weight: &[f64]) -> f64 {
        metric_callables(self)(y, yhat, sample_weight)
    }

    /// Is the new value an improvement over the old value.
    pub fn is_better(&self, new: f64, old: f64) -> bool {
        if self.maximize() {
            new > old
        } else {
            new < old
        }
    }
}

pub fn metric_callables(metric_type: &Metric) -> MetricFn {
    match metric_type {
        Metric::LogLoss => log_loss,
        Metric::AUC => auc,
        Metric::RootMeanSquaredLogError => root_mean_squared_log_error,
        Metric::RootMeanSquaredError => root_mean_squared_error,
    }
}

/// Weighted mean log loss, of raw log odds predictions.
pub fn log_loss(y: &[f64], yhat: &[f64], sample_weight: &[f64]) -> f64 {
    let mut w_sum = 0.;
    let res = y
        .iter()
        .zip(yhat)
        .zip(sample_weight)
        .map(|((y_, yhat_), w_)| {
            w_sum += *w_;
            let p = sigmoid(*yhat_).clamp(1e-15, 1.0 - 1e-15);
            -(*y_ * p.ln() + (1.0 - *y_) * ((1.0 - p).ln())) * *w_
        })
        .sum::<f64>();
    res / w_sum
}

pub fn root_mean_squared_log_error(y: &[f64], yhat: &[f64], sample_weight: &[f64]) -> f64 {
    let mut w_sum = 0.;
    let res = y
        .iter()
        .zip(yhat)
        .zip(sample_weight)
        .map(|((y_, yhat_), w_)| {
            w_sum += *w_;
            (y_.ln_1p() - yhat_.ln_1p()).powi(2) * *w_
        })
        .sum::<f64>();
    (res / w_sum).sqrt()
}

pub fn root_mean_squared_error(y: &[f64], yhat: &[f64], sample_weight: &[f64]) -> f64 {
    let mut w_sum = 0.;
    let res = y
        .iter()
        .zip(yhat)
        .zip(sample_weight)
        .map(|((y_, yhat_), w_)| {
            w_sum += *w_;
            (y_ - yhat_).powi(2) * *w_
        })
        .sum::<f64>();
    (res / w_sum).sqrt()
}

fn trapezoid_area(x0: f64, x1: f64, y0: f64, y1: f64) -> f64 {
    (x0 - x1).abs() * (y0 + y1) * 0.5
}

pub fn auc(y: &[f64], yhat: &[f64], sample_weight: &[f64]) -> f64 {
    let mut indices = (0..y.len()).collect::<Vec<_>>();
    indices.sort_unstable_by(|&a, &b| yhat[b].total_cmp(&yhat[a]));
    let mut auc: f64 = 0.0;

    let mut label = y[indices[0]];
    let mut w = sample_weight[indices[0]];
    let mut fp = (1.0 - label) * w;
    let mut tp: f64 = label * w;
    let mut tp_prev: f64 = 0.0;
    let mut fp_prev: f64 = 0.0;

    for i in 1..indices.len() {
        if yhat[indices[i]] != yhat[indices[i - 1]] {
            auc += trapezoid_area(fp_prev, fp, tp_prev, tp);
            tp_prev = tp;
            fp_prev = fp;
        }
        label = y[indices[i]];
        w = sample_weight[indices[i]];
        fp += (1.0 - label) * w;
        tp += label * w;
    }

    auc += trapezoid_area(fp_prev, fp, tp_prev, tp);
    if fp <= 0.0 || tp <= 0.0 {
        auc = 0.0;
        fp = 0.0;
        tp = 0.0;
    }

    auc / (tp * fp)
}
