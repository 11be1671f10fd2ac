//! The objective contract and the reporting sink trials write progress to.

use bt_types::{Config, Metrics, TrialError};
use chrono::Utc;
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::trial::{TrialId, TrialResult};

/// Metric key the reporter adds to every result.
pub const TRAINING_ITERATION: &str = "training_iteration";

/// A function evaluated once per trial.
///
/// Implemented for any `Fn(&Config, &mut Reporter) -> Result<(), TrialError>`.
pub trait Objective: Send + Sync + 'static {
    fn run(&self, config: &Config, reporter: &mut Reporter) -> Result<(), TrialError>;
}

impl<F> Objective for F
where
    F: Fn(&Config, &mut Reporter) -> Result<(), TrialError> + Send + Sync + 'static,
{
    fn run(&self, config: &Config, reporter: &mut Reporter) -> Result<(), TrialError> {
        self(config, reporter)
    }
}

/// What a trial should do after reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialDecision {
    Continue,
    Stop,
}

/// Conditions that end a trial early.
///
/// A metric threshold is met once a reported value is greater than or equal
/// to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopCriteria {
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub metric_thresholds: HashMap<String, f64>,
}

impl StopCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, n: u64) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn with_threshold(mut self, metric: impl Into<String>, value: f64) -> Self {
        self.metric_thresholds.insert(metric.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.max_iterations.is_none() && self.metric_thresholds.is_empty()
    }

    pub fn is_met(&self, result: &TrialResult) -> bool {
        if self
            .max_iterations
            .is_some_and(|max| result.training_iteration >= max)
        {
            return true;
        }
        self.metric_thresholds
            .iter()
            .any(|(metric, threshold)| result.metric(metric).is_some_and(|v| v >= *threshold))
    }
}

/// Messages from trial workers to the experiment driver.
#[derive(Debug, Clone)]
pub(crate) enum TrialEvent {
    Started {
        trial_id: TrialId,
        worker_id: Option<String>,
    },
    Progress {
        trial_id: TrialId,
        result: TrialResult,
    },
    Finished {
        trial_id: TrialId,
        stopped_early: bool,
    },
    Failed {
        trial_id: TrialId,
        error: TrialError,
    },
}

/// Handed to the objective; forwards progress records to the driver.
#[derive(Debug)]
pub struct Reporter {
    trial_id: TrialId,
    iteration: u64,
    stop: Arc<StopCriteria>,
    tx: Sender<TrialEvent>,
    stopped: bool,
}

impl Reporter {
    pub(crate) fn new(trial_id: TrialId, stop: Arc<StopCriteria>, tx: Sender<TrialEvent>) -> Self {
        Self {
            trial_id,
            iteration: 0,
            stop,
            tx,
            stopped: false,
        }
    }

    pub fn trial_id(&self) -> TrialId {
        self.trial_id
    }

    /// Number of reports made so far.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// True once a stop criterion was met or the driver went away.
    pub fn should_stop(&self) -> bool {
        self.stopped
    }

    /// Record one progress report.
    ///
    /// ```ignore
    /// reporter.report([("iterations", step as f64), ("mean_loss", score)]);
    /// ```
    pub fn report<I, K>(&mut self, metrics: I) -> TrialDecision
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        self.iteration += 1;
        let mut metrics: Metrics = metrics.into_iter().map(|(k, v)| (k.into(), v)).collect();
        metrics.insert(TRAINING_ITERATION.to_string(), self.iteration as f64);

        let result = TrialResult {
            training_iteration: self.iteration,
            metrics,
            timestamp: Utc::now(),
        };
        if self.stop.is_met(&result) {
            self.stopped = true;
        }

        let event = TrialEvent::Progress {
            trial_id: self.trial_id,
            result,
        };
        if self.tx.send(event).is_err() {
            self.stopped = true;
        }

        if self.stopped {
            TrialDecision::Stop
        } else {
            TrialDecision::Continue
        }
    }
}
