//! Warm-started Bayesian optimization of a toy objective.
//!
//! Used by the `warmstart-demo` binary and the smoke test.

use bt_types::{Config, Mode, ParameterValue, TrialError, TuneResult};
use serde_json::json;
use std::time::Duration;
use tracing::info;

use crate::analysis::ExperimentAnalysis;
use crate::bayes::BayesOptSearch;
use crate::report::{Reporter, TrialDecision};
use crate::runner::{run_experiment, ExperimentConfig};
use crate::runtime::Runtime;
use crate::search::SearchSpace;

pub const METRIC: &str = "mean_loss";

/// Knobs for one demo run.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoSettings {
    /// Run a handful of samples instead of the full budget.
    pub smoke_test: bool,
    /// Sleep between reported steps, standing in for real work.
    pub step_delay: Duration,
    /// Value of the fixed `steps` parameter.
    pub steps: i64,
    pub seed: u64,
    pub max_concurrent: usize,
    /// Replaces the built-in experiment config when set.
    pub experiment: Option<ExperimentConfig>,
}

impl Default for DemoSettings {
    fn default() -> Self {
        Self {
            smoke_test: false,
            step_delay: Duration::from_millis(100),
            steps: 100,
            seed: 123,
            max_concurrent: 8,
            experiment: None,
        }
    }
}

impl DemoSettings {
    /// Defaults overridden by `BT_SMOKE_TEST`, `BT_STEP_DELAY_MS`, and
    /// `BT_EXPERIMENT_CONFIG` (path to an experiment JSON file).
    pub fn from_env() -> TuneResult<Self> {
        let mut settings = Self::default();
        if let Ok(raw) = std::env::var("BT_SMOKE_TEST") {
            settings.smoke_test = matches!(raw.trim(), "1" | "true" | "yes");
        }
        if let Ok(raw) = std::env::var("BT_STEP_DELAY_MS") {
            let ms: u64 = raw.trim().parse().map_err(|_| {
                bt_types::config_error!("BT_STEP_DELAY_MS must be milliseconds, got {raw:?}")
            })?;
            settings.step_delay = Duration::from_millis(ms);
        }
        if let Ok(path) = std::env::var("BT_EXPERIMENT_CONFIG") {
            settings.experiment = Some(ExperimentConfig::from_json_file(path)?);
        }
        Ok(settings)
    }

    pub fn num_samples(&self) -> usize {
        if self.smoke_test {
            10
        } else {
            50
        }
    }

    pub fn experiment_config(&self) -> ExperimentConfig {
        self.experiment.clone().unwrap_or_else(|| {
            ExperimentConfig::new("bayesopt_exp_with_warmstart")
                .with_metric(METRIC, Mode::Min)
                .with_num_samples(self.num_samples())
        })
    }
}

/// Loss after `step` steps of a made-up training run.
pub fn evaluate(step: i64, width: f64, height: f64, activation: &str) -> f64 {
    let activation_boost = if activation == "relu" { 10.0 } else { 0.0 };
    1.0 / (0.1 + width * step as f64 / 100.0) + height * 0.1 + activation_boost
}

fn float_key(config: &Config, key: &str) -> Result<f64, TrialError> {
    config
        .get(key)
        .ok_or_else(|| TrialError::MissingKey { key: key.into() })?
        .as_f64()
        .ok_or_else(|| TrialError::WrongType {
            key: key.into(),
            expected: "number".into(),
        })
}

/// The objective: report the loss at every step.
pub fn objective(
    config: &Config,
    reporter: &mut Reporter,
    step_delay: Duration,
) -> Result<(), TrialError> {
    let steps = config
        .get("steps")
        .and_then(ParameterValue::as_i64)
        .ok_or_else(|| TrialError::WrongType {
            key: "steps".into(),
            expected: "integer".into(),
        })?;
    let width = float_key(config, "width")?;
    let height = float_key(config, "height")?;
    let activation = config
        .get("activation")
        .and_then(ParameterValue::as_str)
        .ok_or_else(|| TrialError::WrongType {
            key: "activation".into(),
            expected: "string".into(),
        })?;

    for step in 0..steps {
        let score = evaluate(step, width, height, activation);
        if reporter.report([("iterations", step as f64), (METRIC, score)]) == TrialDecision::Stop
        {
            break;
        }
        if !step_delay.is_zero() {
            std::thread::sleep(step_delay);
        }
    }
    Ok(())
}

pub fn search_space(steps: i64) -> SearchSpace {
    SearchSpace::new()
        .add_constant("steps", steps)
        .add_float("width", 0.0, 20.0)
        .add_float("height", -100.0, 100.0)
        .add_choice("activation", vec![json!("relu"), json!("tanh")])
}

/// Configurations evaluated in an earlier run, with their known losses.
pub fn previous_results() -> (Vec<Config>, Vec<f64>) {
    let point = |width: i64, height: i64, activation: &str| -> Config {
        [
            ("width".to_string(), ParameterValue::Int(width)),
            ("height".to_string(), ParameterValue::Int(height)),
            ("activation".to_string(), ParameterValue::from(activation)),
        ]
        .into_iter()
        .collect()
    };
    (
        vec![point(10, 0, "relu"), point(15, -20, "tanh")],
        vec![-189.0, -1144.0],
    )
}

pub fn search_algorithm(settings: &DemoSettings) -> BayesOptSearch {
    let (points, rewards) = previous_results();
    BayesOptSearch::new()
        .with_metric(METRIC, Mode::Min)
        .with_points_to_evaluate(points)
        .with_evaluated_rewards(rewards)
        .with_random_seed(settings.seed)
        .with_max_concurrent(settings.max_concurrent)
}

/// Build the searcher and space, then run the experiment on `runtime`.
pub fn run(runtime: &Runtime, settings: &DemoSettings) -> TuneResult<ExperimentAnalysis> {
    let mut search = search_algorithm(settings);
    let space = search_space(settings.steps);
    let experiment = settings.experiment_config();
    let delay = settings.step_delay;

    info!(
        samples = experiment.num_samples,
        smoke_test = settings.smoke_test,
        "running warm-started bayesopt demo"
    );

    run_experiment(
        runtime,
        move |config: &Config, reporter: &mut Reporter| objective(config, reporter, delay),
        &mut search,
        &space,
        &experiment,
    )
}
