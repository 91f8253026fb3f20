//! Bayesian parameter tuning: a Gaussian-process surrogate proposes trial
//! parameter sets, an objective (typically a backtest statistic) scores
//! them, and the best validated set per regime is installed in the
//! parameter store.

pub mod gp;
pub mod space;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::{Error, ParameterBounds, ParameterSet, ParameterStore, RegimeLabel, Result};

use crate::gp::GaussianProcess;
use crate::space::{SearchSpace, DIM};

/// Candidate pool scored by expected improvement at each acquisition step.
const ACQUISITION_CANDIDATES: usize = 256;

/// Exploration margin inside the expected-improvement acquisition.
const ACQUISITION_XI: f64 = 0.01;

/// One evaluated parameter set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub iteration: usize,
    pub params: ParameterSet,
    pub objective: f64,
}

#[derive(Debug, Clone)]
pub struct OptimizerSettings {
    /// Total objective evaluations, random starts included.
    pub n_calls: usize,
    /// Purely random trials evaluated in parallel before the surrogate
    /// takes over.
    pub n_random_starts: usize,
    pub seed: u64,
    /// Objective recorded for a failed evaluation. Finite so the
    /// surrogate stays well conditioned.
    pub penalty: f64,
    /// Early stop after this many consecutive calls without an
    /// improvement above `epsilon`. 0 disables.
    pub patience: usize,
    pub epsilon: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            n_calls: 30,
            n_random_starts: 10,
            seed: 42,
            penalty: -1e6,
            patience: 10,
            epsilon: 1e-6,
        }
    }
}

/// Result of one `optimize` run. The objective is maximized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub best_params: ParameterSet,
    pub best_objective: f64,
    pub trials: Vec<Trial>,
}

pub struct BayesianOptimizer {
    settings: OptimizerSettings,
    space: SearchSpace,
}

impl BayesianOptimizer {
    pub fn new(settings: OptimizerSettings, bounds: ParameterBounds) -> Self {
        Self {
            settings,
            space: SearchSpace::new(bounds),
        }
    }

    /// Maximize the objective over the parameter space.
    ///
    /// Failed evaluations are recorded at the penalty value and the run
    /// continues. Fully deterministic for a given seed and objective.
    pub fn optimize<F>(&self, objective: F) -> Result<OptimizationOutcome>
    where
        F: Fn(&ParameterSet) -> Result<f64> + Sync,
    {
        if self.settings.n_calls == 0 {
            return Err(Error::ObjectiveEvaluationFailed(
                "optimizer configured with zero calls".into(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(self.settings.seed);
        let n_starts = self.settings.n_random_starts.min(self.settings.n_calls).max(1);
        let starts: Vec<[f64; DIM]> = (0..n_starts).map(|_| self.space.sample(&mut rng)).collect();

        // Random starts are independent, so they evaluate in parallel;
        // sorting by iteration afterwards keeps the trial log stable.
        let evaluated: Mutex<Vec<([f64; DIM], Trial)>> = Mutex::new(Vec::new());
        starts.par_iter().enumerate().for_each(|(iteration, point)| {
            let params = self.space.decode(point);
            let objective_value = self.evaluate(&objective, &params);
            evaluated.lock().expect("trial lock poisoned").push((
                *point,
                Trial {
                    iteration,
                    params,
                    objective: objective_value,
                },
            ));
        });
        let mut evaluated = evaluated.into_inner().expect("trial lock poisoned");
        evaluated.sort_by_key(|(_, t)| t.iteration);

        let mut best = evaluated
            .iter()
            .map(|(_, t)| t.objective)
            .fold(f64::NEG_INFINITY, f64::max);
        let mut stall = 0usize;

        for iteration in evaluated.len()..self.settings.n_calls {
            let x: Vec<[f64; DIM]> = evaluated.iter().map(|(p, _)| *p).collect();
            let y: Vec<f64> = evaluated.iter().map(|(_, t)| t.objective).collect();

            let next = match GaussianProcess::fit(x, &y) {
                Some(gp) => {
                    let mut best_candidate = self.space.sample(&mut rng);
                    let mut best_ei = gp.expected_improvement(&best_candidate, best, ACQUISITION_XI);
                    for _ in 1..ACQUISITION_CANDIDATES {
                        let candidate = self.space.sample(&mut rng);
                        let ei = gp.expected_improvement(&candidate, best, ACQUISITION_XI);
                        if ei > best_ei {
                            best_ei = ei;
                            best_candidate = candidate;
                        }
                    }
                    best_candidate
                }
                None => {
                    warn!("Surrogate fit failed, falling back to a random trial");
                    self.space.sample(&mut rng)
                }
            };

            let params = self.space.decode(&next);
            let objective_value = self.evaluate(&objective, &params);
            evaluated.push((
                next,
                Trial {
                    iteration,
                    params,
                    objective: objective_value,
                },
            ));

            if objective_value > best + self.settings.epsilon {
                best = objective_value;
                stall = 0;
            } else {
                stall += 1;
                if self.settings.patience > 0 && stall >= self.settings.patience {
                    info!(
                        iteration,
                        stall, "No improvement within patience, stopping early"
                    );
                    break;
                }
            }
        }

        let trials: Vec<Trial> = evaluated.into_iter().map(|(_, t)| t).collect();
        let best_trial = trials
            .iter()
            .max_by(|a, b| a.objective.total_cmp(&b.objective))
            .expect("at least one trial was evaluated");

        info!(
            trials = trials.len(),
            best_objective = best_trial.objective,
            "Optimization run finished"
        );
        Ok(OptimizationOutcome {
            best_params: best_trial.params.clone(),
            best_objective: best_trial.objective,
            trials,
        })
    }

    fn evaluate<F>(&self, objective: &F, params: &ParameterSet) -> f64
    where
        F: Fn(&ParameterSet) -> Result<f64> + Sync,
    {
        match objective(params) {
            Ok(value) if value.is_finite() => value,
            Ok(value) => {
                warn!(value, "Non-finite objective, recording penalty");
                self.settings.penalty
            }
            Err(e) => {
                warn!(error = %e, "Objective evaluation failed, recording penalty");
                self.settings.penalty
            }
        }
    }
}

/// Tuning result for one regime, as persisted in the JSON report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeOutcome {
    pub best_params: ParameterSet,
    pub best_objective: f64,
    pub trials: Vec<Trial>,
}

/// Full tuning report across regimes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub regimes: BTreeMap<String, RegimeOutcome>,
}

impl OptimizationReport {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }
}

/// Run one optimization per regime and install each winner in the store.
///
/// The objective receives the regime so it can replay regime-specific
/// history. Bounds violations cannot normally happen (the space decodes
/// inside them) but an install failure is logged rather than fatal.
pub fn tune_regimes<F>(
    optimizer: &BayesianOptimizer,
    store: &ParameterStore,
    objective: F,
) -> Result<OptimizationReport>
where
    F: Fn(RegimeLabel, &ParameterSet) -> Result<f64> + Sync,
{
    let mut report = OptimizationReport::default();
    for regime in RegimeLabel::ALL {
        info!(regime = %regime, "Tuning regime parameters");
        let outcome = optimizer.optimize(|set| objective(regime, set))?;
        match store.update(regime, outcome.best_params.clone()) {
            Ok(()) => info!(regime = %regime, objective = outcome.best_objective, "Tuned set installed"),
            Err(e) => warn!(regime = %regime, error = %e, "Tuned set rejected, previous set stays active"),
        }
        report.regimes.insert(
            regime.key().to_string(),
            RegimeOutcome {
                best_params: outcome.best_params,
                best_objective: outcome.best_objective,
                trials: outcome.trials,
            },
        );
    }
    Ok(report)
}
