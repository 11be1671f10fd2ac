//! Post-run inspection of an experiment.

use bt_types::{Config, Mode, TuneResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runner::ExperimentConfig;
use crate::trial::{Trial, TrialResult, TrialStatus};

/// Which reported value of a trial counts when ranking trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// The trial's final report.
    Last,
    /// The best report over the trial's whole history.
    All,
}

/// Everything an experiment run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentAnalysis {
    pub experiment: ExperimentConfig,
    /// Trials in launch order.
    pub trials: Vec<Trial>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExperimentAnalysis {
    pub fn new(
        experiment: ExperimentConfig,
        trials: Vec<Trial>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            experiment,
            trials,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Best trial by the experiment's own metric and mode, last-result scope.
    pub fn best_trial(&self) -> Option<&Trial> {
        self.best_trial_by(&self.experiment.metric, self.experiment.mode, Scope::Last)
    }

    /// Configuration of [`ExperimentAnalysis::best_trial`].
    pub fn best_config(&self) -> Option<&Config> {
        self.best_trial().map(|t| &t.config)
    }

    /// Last result of [`ExperimentAnalysis::best_trial`].
    pub fn best_result(&self) -> Option<&TrialResult> {
        self.best_trial().and_then(|t| t.last_result())
    }

    /// Rank terminated trials by `metric`. Errored trials and trials that
    /// never reported the metric are skipped; ties keep the earlier trial.
    pub fn best_trial_by(&self, metric: &str, mode: Mode, scope: Scope) -> Option<&Trial> {
        let mut best: Option<(&Trial, f64)> = None;
        for trial in self
            .trials
            .iter()
            .filter(|t| t.status == TrialStatus::Terminated)
        {
            let Some(value) = trial_value(trial, metric, mode, scope) else {
                continue;
            };
            match best {
                Some((_, incumbent)) if !mode.is_better(value, incumbent) => {}
                _ => best = Some((trial, value)),
            }
        }
        best.map(|(t, _)| t)
    }

    pub fn completed_trials(&self) -> impl Iterator<Item = &Trial> {
        self.trials
            .iter()
            .filter(|t| t.status == TrialStatus::Terminated)
    }

    pub fn errored_trials(&self) -> impl Iterator<Item = &Trial> {
        self.trials
            .iter()
            .filter(|t| t.status == TrialStatus::Errored)
    }

    /// Completed configurations and their final metric values, in the shape
    /// `BayesOptSearch::with_points_to_evaluate` / `with_evaluated_rewards`
    /// expect.
    pub fn warm_start_points(&self) -> (Vec<Config>, Vec<f64>) {
        let metric = &self.experiment.metric;
        self.completed_trials()
            .filter_map(|t| {
                let value = t.last_result()?.metric(metric)?;
                value.is_finite().then(|| (t.config.clone(), value))
            })
            .unzip()
    }

    pub fn to_json(&self) -> TuneResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> TuneResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn trial_value(trial: &Trial, metric: &str, mode: Mode, scope: Scope) -> Option<f64> {
    match scope {
        Scope::Last => trial
            .last_result()?
            .metric(metric)
            .filter(|v| !v.is_nan()),
        Scope::All => trial
            .metric_history(metric)
            .into_iter()
            .filter(|v| !v.is_nan())
            .reduce(|best, v| if mode.is_better(v, best) { v } else { best }),
    }
}
