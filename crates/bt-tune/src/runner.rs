//! Experiment configuration and the driver loop that runs trials.

use bt_types::{format_config, Mode, SearchError, TrialError, TuneError, TuneResult};
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::ExperimentAnalysis;
use crate::report::{Objective, Reporter, StopCriteria, TrialEvent};
use crate::runtime::Runtime;
use crate::search::{SearchAlgorithm, SearchSpace, Suggestion};
use crate::trial::{ExperimentId, Trial, TrialId, TrialStatus};

/// Top-level configuration for an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "Uuid::new_v4")]
    pub id: ExperimentId,
    pub name: String,

    /// Metric to optimize (e.g. "mean_loss").
    pub metric: String,

    /// Direction of optimization; minimize when omitted.
    #[serde(default)]
    pub mode: Mode,

    /// Number of trials to launch.
    pub num_samples: usize,

    /// Conditions that end an individual trial early.
    #[serde(default)]
    pub stop: StopCriteria,

    /// Return an error after the run if any trial errored.
    #[serde(default = "default_raise_on_failed_trial")]
    pub raise_on_failed_trial: bool,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_raise_on_failed_trial() -> bool {
    true
}

impl ExperimentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            metric: "mean_loss".to_string(),
            mode: Mode::default(),
            num_samples: 1,
            stop: StopCriteria::default(),
            raise_on_failed_trial: true,
            created_at: Utc::now(),
        }
    }

    /// Load from a JSON file; fields other than name, metric, and
    /// num_samples may be omitted.
    pub fn from_json_file(path: impl AsRef<Path>) -> TuneResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_metric(mut self, metric: impl Into<String>, mode: Mode) -> Self {
        self.metric = metric.into();
        self.mode = mode;
        self
    }

    pub fn with_num_samples(mut self, n: usize) -> Self {
        self.num_samples = n;
        self
    }

    pub fn with_stop(mut self, stop: StopCriteria) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_raise_on_failed_trial(mut self, raise: bool) -> Self {
        self.raise_on_failed_trial = raise;
        self
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.metric.trim().is_empty() {
            return Err(bt_types::config_error!("experiment {} has no metric", self.name));
        }
        if self.num_samples == 0 {
            return Err(bt_types::config_error!(
                "experiment {} must run at least one sample",
                self.name
            ));
        }
        Ok(())
    }
}

/// Run `objective` for up to `config.num_samples` trials whose
/// configurations come from `search_alg`, and collect the results.
///
/// At most `min(runtime workers, search_alg.max_concurrent())` trials run at
/// once. Blocks until every launched trial has finished.
pub fn run_experiment<O: Objective>(
    runtime: &Runtime,
    objective: O,
    search_alg: &mut dyn SearchAlgorithm,
    space: &SearchSpace,
    config: &ExperimentConfig,
) -> TuneResult<ExperimentAnalysis> {
    config.validate()?;
    space.validate()?;
    let pool = runtime.pool()?;
    search_alg.set_search_properties(&config.metric, config.mode, space)?;

    let workers = runtime.num_workers();
    let capacity = search_alg
        .max_concurrent()
        .map_or(workers, |limit| limit.min(workers))
        .max(1);
    let started_at = Utc::now();

    info!(
        experiment = %config.name,
        search = search_alg.name(),
        metric = %config.metric,
        mode = %config.mode,
        samples = config.num_samples,
        capacity,
        "starting experiment"
    );

    let objective: Arc<dyn Objective> = Arc::new(objective);
    let stop = Arc::new(config.stop.clone());
    let prefix = runtime.config().thread_name_prefix.clone();
    let (tx, rx) = unbounded();

    let mut trials: Vec<Trial> = Vec::with_capacity(config.num_samples);
    let mut index: HashMap<TrialId, usize> = HashMap::new();
    let mut running = 0usize;
    let mut exhausted = false;

    loop {
        while !exhausted && trials.len() < config.num_samples && running < capacity {
            let trial_id = Uuid::new_v4();
            let suggestion = match search_alg.suggest(trial_id) {
                Ok(suggestion) => suggestion,
                Err(e) => {
                    warn!(
                        search = search_alg.name(),
                        error = %e,
                        running,
                        "search algorithm failed, waiting for running trials"
                    );
                    drain_running(&rx, running);
                    return Err(e);
                }
            };
            match suggestion {
                Suggestion::Config(trial_config) => {
                    let trial_number = trials.len();
                    debug!(
                        trial = %trial_id,
                        number = trial_number,
                        config = %format_config(&trial_config),
                        "launching trial"
                    );
                    let job_config = trial_config.clone();
                    let job_objective = Arc::clone(&objective);
                    let job_stop = Arc::clone(&stop);
                    let job_tx = tx.clone();
                    let job_prefix = prefix.clone();
                    pool.spawn(move || {
                        run_trial(
                            trial_id,
                            &job_config,
                            job_objective.as_ref(),
                            job_stop,
                            job_tx,
                            &job_prefix,
                        )
                    });
                    index.insert(trial_id, trial_number);
                    trials.push(Trial::new(trial_id, config.id, trial_number, trial_config));
                    running += 1;
                }
                Suggestion::Wait => break,
                Suggestion::Finished => {
                    info!(search = search_alg.name(), "search algorithm finished");
                    exhausted = true;
                }
            }
        }

        if running == 0 {
            if exhausted || trials.len() >= config.num_samples {
                break;
            }
            return Err(SearchError::Stalled {
                algorithm: search_alg.name().to_string(),
            }
            .into());
        }

        let event = match rx.recv() {
            Ok(event) => event,
            Err(e) => {
                warn!(abandoned = running, "trial channel closed with trials running");
                return Err(bt_types::internal_error!("trial channel closed: {e}"));
            }
        };
        let trial_id = event_trial(&event);
        let Some(trial) = index.get(&trial_id).and_then(|&i| trials.get_mut(i)) else {
            warn!(trial = %trial_id, "event for unknown trial");
            continue;
        };

        match event {
            TrialEvent::Started { worker_id, .. } => {
                trial.mark_running(worker_id);
            }
            TrialEvent::Progress { result, .. } => {
                search_alg.on_trial_result(trial_id, &result.metrics);
                trial.record(result);
            }
            TrialEvent::Finished { stopped_early, .. } => {
                trial.mark_terminated(stopped_early);
                running -= 1;
                let last = trial.last_result().map(|r| &r.metrics);
                search_alg.on_trial_complete(trial_id, last, false);
                info!(
                    trial = %trial_id,
                    number = trial.trial_number,
                    iterations = trial.results.len(),
                    metric = ?trial.last_result().and_then(|r| r.metric(&config.metric)),
                    stopped_early,
                    "trial terminated"
                );
            }
            TrialEvent::Failed { error, .. } => {
                trial.mark_errored(error.to_string());
                running -= 1;
                let last = trial.last_result().map(|r| &r.metrics);
                search_alg.on_trial_complete(trial_id, last, true);
                warn!(
                    trial = %trial_id,
                    number = trial.trial_number,
                    error = %error,
                    "trial errored"
                );
            }
        }
    }

    let analysis = ExperimentAnalysis::new(config.clone(), trials, started_at);
    let failed: Vec<String> = analysis
        .errored_trials()
        .map(|t| t.id.to_string())
        .collect();

    info!(
        experiment = %config.name,
        completed = analysis.completed_trials().count(),
        errored = failed.len(),
        best = %analysis
            .best_config()
            .map(format_config)
            .unwrap_or_else(|| "<none>".to_string()),
        "experiment finished"
    );

    if config.raise_on_failed_trial && !failed.is_empty() {
        return Err(TuneError::TrialsFailed {
            failed: failed.len(),
            total: analysis.trials.len(),
            trial_ids: failed,
        });
    }

    debug_assert!(analysis
        .trials
        .iter()
        .all(|t| t.status != TrialStatus::Pending));
    Ok(analysis)
}

/// Block until `running` trials have sent their final event.
fn drain_running(rx: &Receiver<TrialEvent>, mut running: usize) {
    while running > 0 {
        match rx.recv() {
            Ok(TrialEvent::Finished { .. } | TrialEvent::Failed { .. }) => running -= 1,
            Ok(_) => {}
            Err(_) => {
                warn!(abandoned = running, "trial channel closed while draining");
                return;
            }
        }
    }
}

fn event_trial(event: &TrialEvent) -> TrialId {
    match event {
        TrialEvent::Started { trial_id, .. }
        | TrialEvent::Progress { trial_id, .. }
        | TrialEvent::Finished { trial_id, .. }
        | TrialEvent::Failed { trial_id, .. } => *trial_id,
    }
}

/// Body of one trial on a worker thread. Never panics: objective panics are
/// caught and reported as failures.
fn run_trial(
    trial_id: TrialId,
    config: &bt_types::Config,
    objective: &dyn Objective,
    stop: Arc<StopCriteria>,
    tx: Sender<TrialEvent>,
    prefix: &str,
) {
    let worker_id = rayon::current_thread_index().map(|i| format!("{prefix}-{i}"));
    let _ = tx.send(TrialEvent::Started {
        trial_id,
        worker_id,
    });

    let mut reporter = Reporter::new(trial_id, stop, tx.clone());
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| objective.run(config, &mut reporter)));

    let event = match outcome {
        Ok(Ok(())) => TrialEvent::Finished {
            trial_id,
            stopped_early: reporter.should_stop(),
        },
        Ok(Err(error)) => TrialEvent::Failed { trial_id, error },
        Err(payload) => TrialEvent::Failed {
            trial_id,
            error: TrialError::Panicked {
                message: panic_message(payload.as_ref()),
            },
        },
    };
    // Receiver is gone only if the driver bailed out early.
    let _ = tx.send(event);
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::ConcurrencyLimiter;
    use crate::report::TrialDecision;
    use crate::runtime::RuntimeConfig;
    use crate::search::RandomSearch;
    use bt_types::{Config, Metrics};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn runtime(workers: usize) -> Runtime {
        Runtime::init(RuntimeConfig::default().with_num_workers(workers)).unwrap()
    }

    fn space() -> SearchSpace {
        SearchSpace::new()
            .add_constant("steps", 5i64)
            .add_float("x", -1.0, 1.0)
    }

    fn quadratic(config: &Config, reporter: &mut Reporter) -> Result<(), TrialError> {
        let x = config
            .get("x")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| TrialError::MissingKey { key: "x".into() })?;
        let steps = config.get("steps").and_then(|v| v.as_i64()).unwrap_or(1);
        for step in 0..steps {
            let loss = x * x + 1.0 / (step as f64 + 1.0);
            if reporter.report([("iterations", step as f64), ("mean_loss", loss)])
                == TrialDecision::Stop
            {
                break;
            }
        }
        Ok(())
    }

    #[test]
    fn runs_the_sample_budget() {
        let rt = runtime(3);
        let mut search = RandomSearch::default().with_seed(11);
        let config = ExperimentConfig::new("budget").with_num_samples(7);
        let analysis = run_experiment(&rt, quadratic, &mut search, &space(), &config).unwrap();

        assert_eq!(analysis.trials.len(), 7);
        assert_eq!(analysis.completed_trials().count(), 7);
        for trial in &analysis.trials {
            assert_eq!(trial.results.len(), 5);
            assert!(trial.worker_id.as_deref().unwrap().starts_with("bt-worker-"));
        }
        let best = analysis.best_result().unwrap().metric("mean_loss").unwrap();
        for trial in &analysis.trials {
            assert!(best <= trial.last_result().unwrap().metric("mean_loss").unwrap());
        }
    }

    #[test]
    fn concurrency_never_exceeds_the_limit() {
        let rt = runtime(4);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (flight, high) = (Arc::clone(&in_flight), Arc::clone(&peak));

        let objective = move |_: &Config, reporter: &mut Reporter| -> Result<(), TrialError> {
            let now = flight.fetch_add(1, Ordering::SeqCst) + 1;
            high.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            reporter.report([("mean_loss", 1.0)]);
            flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        };

        let mut search = ConcurrencyLimiter::new(RandomSearch::default().with_seed(2), 2);
        let config = ExperimentConfig::new("limited").with_num_samples(8);
        let analysis = run_experiment(&rt, objective, &mut search, &space(), &config).unwrap();

        assert_eq!(analysis.trials.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(search.live_trials(), 0);
    }

    #[test]
    fn errored_trials_fail_the_run() {
        let rt = runtime(2);
        let objective = |config: &Config, _: &mut Reporter| -> Result<(), TrialError> {
            if config.get("x").and_then(|v| v.as_f64()).unwrap_or(0.0) > 0.0 {
                return Err(TrialError::objective("positive x"));
            }
            Ok(())
        };
        let space = SearchSpace::new().add_float("x", 0.5, 1.0);
        let mut search = RandomSearch::default().with_seed(5);
        let config = ExperimentConfig::new("failing").with_num_samples(3);

        let err = run_experiment(&rt, objective, &mut search, &space, &config).unwrap_err();
        match err {
            TuneError::TrialsFailed { failed, total, .. } => {
                assert_eq!(failed, 3);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn panics_are_recorded_when_not_raising() {
        let rt = runtime(2);
        let objective = |_: &Config, _: &mut Reporter| -> Result<(), TrialError> {
            panic!("objective blew up");
        };
        let mut search = RandomSearch::default().with_seed(5);
        let config = ExperimentConfig::new("panicky")
            .with_num_samples(2)
            .with_raise_on_failed_trial(false);

        let analysis = run_experiment(&rt, objective, &mut search, &space(), &config).unwrap();
        assert_eq!(analysis.errored_trials().count(), 2);
        assert!(analysis.trials[0]
            .error
            .as_deref()
            .unwrap()
            .contains("objective blew up"));
        assert!(analysis.best_config().is_none());
    }

    #[test]
    fn stop_criteria_end_trials_early() {
        let rt = runtime(2);
        let mut search = RandomSearch::default().with_seed(8);
        let config = ExperimentConfig::new("stopping")
            .with_num_samples(2)
            .with_stop(StopCriteria::new().with_max_iterations(2));

        let analysis = run_experiment(&rt, quadratic, &mut search, &space(), &config).unwrap();
        for trial in &analysis.trials {
            assert_eq!(trial.results.len(), 2);
            assert!(trial.stopped_early);
        }
    }

    struct Exhausting {
        left: usize,
    }

    impl SearchAlgorithm for Exhausting {
        fn set_search_properties(&mut self, _: &str, _: Mode, _: &SearchSpace) -> TuneResult<()> {
            Ok(())
        }

        fn suggest(&mut self, _: Uuid) -> TuneResult<Suggestion> {
            if self.left == 0 {
                return Ok(Suggestion::Finished);
            }
            self.left -= 1;
            let mut config = Config::new();
            config.insert("x".into(), bt_types::ParameterValue::Float(0.0));
            Ok(Suggestion::Config(config))
        }

        fn on_trial_complete(&mut self, _: Uuid, _: Option<&Metrics>, _: bool) {}

        fn name(&self) -> &str {
            "exhausting"
        }
    }

    struct AlwaysWait;

    impl SearchAlgorithm for AlwaysWait {
        fn set_search_properties(&mut self, _: &str, _: Mode, _: &SearchSpace) -> TuneResult<()> {
            Ok(())
        }

        fn suggest(&mut self, _: Uuid) -> TuneResult<Suggestion> {
            Ok(Suggestion::Wait)
        }

        fn on_trial_complete(&mut self, _: Uuid, _: Option<&Metrics>, _: bool) {}

        fn name(&self) -> &str {
            "always-wait"
        }
    }

    /// Hands out one config, then fails.
    struct FailsSecond {
        calls: usize,
    }

    impl SearchAlgorithm for FailsSecond {
        fn set_search_properties(&mut self, _: &str, _: Mode, _: &SearchSpace) -> TuneResult<()> {
            Ok(())
        }

        fn suggest(&mut self, _: Uuid) -> TuneResult<Suggestion> {
            self.calls += 1;
            if self.calls > 1 {
                return Err(SearchError::Surrogate {
                    message: "broken".into(),
                }
                .into());
            }
            let mut config = Config::new();
            config.insert("x".into(), bt_types::ParameterValue::Float(0.0));
            Ok(Suggestion::Config(config))
        }

        fn on_trial_complete(&mut self, _: Uuid, _: Option<&Metrics>, _: bool) {}

        fn name(&self) -> &str {
            "fails-second"
        }
    }

    #[test]
    fn search_errors_wait_for_running_trials() {
        let rt = runtime(2);
        let finished = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&finished);
        let objective = move |_: &Config, reporter: &mut Reporter| -> Result<(), TrialError> {
            std::thread::sleep(Duration::from_millis(50));
            reporter.report([("mean_loss", 1.0)]);
            done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        let mut search = FailsSecond { calls: 0 };
        let config = ExperimentConfig::new("broken-search").with_num_samples(4);

        let err = run_experiment(&rt, objective, &mut search, &space(), &config).unwrap_err();
        assert!(matches!(err, TuneError::Search(SearchError::Surrogate { .. })));
        assert_eq!(search.calls, 2);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn finished_search_ends_the_run_early() {
        let rt = runtime(2);
        let mut search = Exhausting { left: 3 };
        let config = ExperimentConfig::new("short").with_num_samples(10);
        let analysis = run_experiment(&rt, quadratic, &mut search, &space(), &config).unwrap();
        assert_eq!(analysis.trials.len(), 3);
    }

    #[test]
    fn waiting_with_nothing_running_is_a_stall() {
        let rt = runtime(1);
        let config = ExperimentConfig::new("stalled");
        let err =
            run_experiment(&rt, quadratic, &mut AlwaysWait, &space(), &config).unwrap_err();
        assert!(matches!(err, TuneError::Search(SearchError::Stalled { .. })));
    }

    #[test]
    fn shut_down_runtime_rejects_runs() {
        let rt = runtime(1);
        rt.shutdown();
        let mut search = RandomSearch::default();
        let config = ExperimentConfig::new("late");
        let err = run_experiment(&rt, quadratic, &mut search, &space(), &config).unwrap_err();
        assert!(matches!(err, TuneError::Runtime(_)));
    }

    #[test]
    fn config_validation() {
        assert!(ExperimentConfig::new("x").with_num_samples(0).validate().is_err());
        assert!(ExperimentConfig::new("x")
            .with_metric("", Mode::Max)
            .validate()
            .is_err());
    }

    #[test]
    fn config_loads_from_minimal_json() {
        let json = r#"{"name": "from-file", "metric": "mean_loss", "mode": "min", "num_samples": 4}"#;
        let config: ExperimentConfig = serde_json::from_str(json).unwrap();
        assert!(config.raise_on_failed_trial);
        assert!(config.stop.is_empty());
        assert_eq!(config.num_samples, 4);
    }

    #[test]
    fn config_loads_from_json_file() {
        let dir = std::env::temp_dir();
        let good = dir.join(format!("bt-experiment-{}.json", Uuid::new_v4()));
        let empty = dir.join(format!("bt-experiment-{}.json", Uuid::new_v4()));
        std::fs::write(
            &good,
            r#"{"name": "from-file", "metric": "score", "num_samples": 3,
                "stop": {"max_iterations": 5}, "raise_on_failed_trial": false}"#,
        )
        .unwrap();
        std::fs::write(
            &empty,
            r#"{"name": "empty", "metric": "score", "mode": "max", "num_samples": 0}"#,
        )
        .unwrap();

        let config = ExperimentConfig::from_json_file(&good).unwrap();
        assert_eq!(config.name, "from-file");
        assert_eq!(config.metric, "score");
        assert_eq!(config.mode, Mode::Min);
        assert_eq!(config.num_samples, 3);
        assert!(!config.raise_on_failed_trial);
        assert!(!config.stop.is_empty());

        let err = ExperimentConfig::from_json_file(&empty).unwrap_err();
        assert!(matches!(err, TuneError::Config(_)));

        let missing = dir.join(format!("bt-missing-{}.json", Uuid::new_v4()));
        let err = ExperimentConfig::from_json_file(&missing).unwrap_err();
        assert!(matches!(err, TuneError::Io(_)));

        std::fs::remove_file(&good).unwrap();
        std::fs::remove_file(&empty).unwrap();
    }
}
