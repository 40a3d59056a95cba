use crate::metric::Metric;

/// What the booster should do after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// The state of training handed to callbacks at the end of every iteration.
#[derive(Debug)]
pub struct IterationInfo {
    /// The number of trees in the ensemble, so the first iteration is 1.
    pub iteration: usize,
    pub metric: Metric,
    /// The metric value of every evaluation set, in the order they
    /// were provided.
    pub evaluations: Vec<f64>,
}

/// Called by the booster between iterations. Training can only be
/// halted at iteration boundaries.
pub trait IterationCallback {
    fn after_iteration(&mut self, info: &IterationInfo) -> CallbackAction;
}

impl<F> IterationCallback for F
where
    F: FnMut(&IterationInfo) -> CallbackAction,
{
    fn after_iteration(&mut self, info: &IterationInfo) -> CallbackAction {
        self(info)
    }
}

/// Stop training once an evaluation set has gone `rounds` iterations
/// without improving on its best value.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    rounds: usize,
    best: Vec<Option<(f64, usize)>>,
    best_iteration: Option<usize>,
}

impl EarlyStopping {
    pub fn new(rounds: usize) -> Self {
        EarlyStopping {
            rounds,
            best: Vec::new(),
            best_iteration: None,
        }
    }

    /// The iteration with the best value, for the evaluation set that
    /// triggered the stop, or the first evaluation set otherwise.
    pub fn best_iteration(&self) -> Option<usize> {
        self.best_iteration
    }
}

impl IterationCallback for EarlyStopping {
    fn after_iteration(&mut self, info: &IterationInfo) -> CallbackAction {
        if self.best.len() < info.evaluations.len() {
            self.best.resize(info.evaluations.len(), None);
        }
        for (best, value) in self.best.iter_mut().zip(info.evaluations.iter()) {
            let improved = match best {
                Some((best_value, _)) => info.metric.is_better(*value, *best_value),
                None => !value.is_nan(),
            };
            if improved {
                *best = Some((*value, info.iteration));
            }
        }
        self.best_iteration = self.best.first().and_then(|b| b.map(|(_, i)| i));

        for (set, best) in self.best.iter().enumerate() {
            let best_iteration = best.map(|(_, i)| i).unwrap_or(0);
            if info.iteration - best_iteration >= self.rounds {
                if let Some((value, _)) = best {
                    log::info!(
                        "Early stopping at iteration {}, best iteration {} with {:?} of {} on evaluation set {}.",
                        info.iteration,
                        best_iteration,
                        info.metric,
                        value,
                        set
                    );
                }
                self.best_iteration = Some(best_iteration);
                return CallbackAction::Stop;
            }
        }
        CallbackAction::Continue
    }
}
