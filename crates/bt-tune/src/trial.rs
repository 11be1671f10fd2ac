//! Trial tracking.

use bt_types::{Config, Metrics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique trial identifier.
pub type TrialId = Uuid;

/// Unique experiment identifier.
pub type ExperimentId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialStatus {
    Pending,
    Running,
    /// The objective returned normally.
    Terminated,
    Errored,
}

/// One progress record reported by a running trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    /// 1-based count of reports made by this trial.
    pub training_iteration: u64,
    pub metrics: Metrics,
    pub timestamp: DateTime<Utc>,
}

impl TrialResult {
    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }
}

/// A single trial (one configuration evaluated by the objective).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub experiment_id: ExperimentId,
    pub trial_number: usize,
    pub config: Config,
    pub status: TrialStatus,
    pub results: Vec<TrialResult>,
    /// Set when a stop criterion ended the trial.
    pub stopped_early: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub error: Option<String>,
}

impl Trial {
    pub fn new(
        id: TrialId,
        experiment_id: ExperimentId,
        trial_number: usize,
        config: Config,
    ) -> Self {
        Self {
            id,
            experiment_id,
            trial_number,
            config,
            status: TrialStatus::Pending,
            results: Vec::new(),
            stopped_early: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            worker_id: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self, worker_id: Option<String>) {
        self.status = TrialStatus::Running;
        self.started_at = Some(Utc::now());
        self.worker_id = worker_id;
    }

    pub fn record(&mut self, result: TrialResult) {
        self.results.push(result);
    }

    pub fn mark_terminated(&mut self, stopped_early: bool) {
        self.status = TrialStatus::Terminated;
        self.stopped_early = stopped_early;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_errored(&mut self, error: String) {
        self.status = TrialStatus::Errored;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, TrialStatus::Terminated | TrialStatus::Errored)
    }

    pub fn last_result(&self) -> Option<&TrialResult> {
        self.results.last()
    }

    /// Every reported value of `metric`, in report order.
    pub fn metric_history(&self, metric: &str) -> Vec<f64> {
        self.results.iter().filter_map(|r| r.metric(metric)).collect()
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        Some((finished - started).num_milliseconds() as f64 / 1000.0)
    }
}
