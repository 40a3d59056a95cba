use crate::errors::HistBoostError;
use crate::metric::Metric;
use crate::utils::weighted_mean;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Supported loss functions. Kept as a closed set of variants,
/// so the per record gradient loop never goes through dynamic dispatch.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum ObjectiveType {
    SquaredError,
    LogLoss,
}

impl FromStr for ObjectiveType {
    type Err = HistBoostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regression" | "l2" | "squared_error" | "SquaredError" => {
                Ok(ObjectiveType::SquaredError)
            }
            "binary" | "logloss" | "log_loss" | "LogLoss" => Ok(ObjectiveType::LogLoss),
            _ => Err(HistBoostError::UnsupportedLoss(s.to_string())),
        }
    }
}

/// The first and second order derivatives of the loss, for every record.
/// Recomputed every boosting iteration.
#[derive(Debug, Clone, Default)]
pub struct GradientBuffer {
    pub grad: Vec<f32>,
    pub hess: Vec<f32>,
}

impl GradientBuffer {
    pub fn new(n_records: usize) -> Self {
        GradientBuffer {
            grad: vec![0.0; n_records],
            hess: vec![0.0; n_records],
        }
    }

    pub fn len(&self) -> usize {
        self.grad.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grad.is_empty()
    }
}

/// Numerically stable logistic function.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

impl ObjectiveType {
    /// Calculate the gradient and hessian of a single record.
    #[inline]
    pub fn grad_hess(&self, y: f64, yhat: f64, w: f64) -> (f64, f64) {
        match self {
            ObjectiveType::SquaredError => ((yhat - y) * w, w),
            ObjectiveType::LogLoss => {
                let p = sigmoid(yhat);
                ((p - y) * w, p * (1.0 - p) * w)
            }
        }
    }

    /// The score every record starts from, before any trees are added.
    pub fn initial_score(&self, y: &[f64], sample_weight: &[f64]) -> f64 {
        let mean = weighted_mean(y, sample_weight);
        match self {
            ObjectiveType::SquaredError => mean,
            ObjectiveType::LogLoss => {
                let p = mean.clamp(1e-15, 1.0 - 1e-15);
                (p / (1.0 - p)).ln()
            }
        }
    }

    /// Inverse link function, mapping a raw score to the scale of the label.
    #[inline]
    pub fn transform(&self, raw: f64) -> f64 {
        match self {
            ObjectiveType::SquaredError => raw,
            ObjectiveType::LogLoss => sigmoid(raw),
        }
    }

    /// Metric used for evaluation when none is specified.
    pub fn default_metric(&self) -> Metric {
        match self {
            ObjectiveType::SquaredError => Metric::RootMeanSquaredError,
            ObjectiveType::LogLoss => Metric::LogLoss,
        }
    }

    /// Confirm the labels are valid for this objective.
    pub fn validate_labels(&self, y: &[f64]) -> Result<(), HistBoostError> {
        for (i, v) in y.iter().enumerate() {
            if !v.is_finite() {
                return Err(HistBoostError::InvalidLabel(
                    *v,
                    i,
                    "labels must be finite".to_string(),
                ));
            }
            if (*self == ObjectiveType::LogLoss) && (*v != 0.0) && (*v != 1.0) {
                return Err(HistBoostError::InvalidLabel(
                    *v,
                    i,
                    "labels must be 0 or 1 for the LogLoss objective".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Fill the gradient buffer, given the current predictions.
/// This is a pure function of its inputs, the result does not depend
/// on how rayon schedules the records.
pub fn compute_gradients(
    objective: &ObjectiveType,
    y: &[f64],
    yhat: &[f64],
    sample_weight: &[f64],
    buffer: &mut GradientBuffer,
    parallel: bool,
) {
    let fill = |((g, h), ((y_, yhat_), w_)): ((&mut f32, &mut f32), ((&f64, &f64), &f64))| {
        let (g_, h_) = objective.grad_hess(*y_, *yhat_, *w_);
        *g = g_ as f32;
        *h = h_ as f32;
    };
    if parallel {
        buffer
            .grad
            .par_iter_mut()
            .zip(buffer.hess.par_iter_mut())
            .zip(y.par_iter().zip(yhat.par_iter()).zip(sample_weight.par_iter()))
            .for_each(fill);
    } else {
        buffer
            .grad
            .iter_mut()
            .zip(buffer.hess.iter_mut())
            .zip(y.iter().zip(yhat.iter()).zip(sample_weight.iter()))
            .for_each(fill);
    }
}
