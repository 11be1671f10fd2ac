//! Search space definitions and the pluggable search-algorithm interface.

use bt_types::{Config, Metrics, Mode, ParameterValue, SearchError, TuneResult};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Name the objective reads the value under (e.g. "width").
    pub name: String,
    /// The kind of domain.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Passed through to every trial unchanged.
    Constant { value: ParameterValue },
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

impl ParameterKind {
    pub fn is_tunable(&self) -> bool {
        !matches!(self, ParameterKind::Constant { .. })
    }

    fn validate(&self, name: &str) -> Result<(), SearchError> {
        let invalid = |message: String| SearchError::InvalidDomain {
            parameter: name.to_string(),
            message,
        };
        match self {
            ParameterKind::Constant { .. } => Ok(()),
            ParameterKind::FloatRange { low, high } => {
                if !low.is_finite() || !high.is_finite() {
                    Err(invalid("bounds must be finite".into()))
                } else if low > high {
                    Err(invalid(format!("low {low} is above high {high}")))
                } else {
                    Ok(())
                }
            }
            ParameterKind::IntRange { low, high } => {
                if low > high {
                    Err(invalid(format!("low {low} is above high {high}")))
                } else {
                    Ok(())
                }
            }
            ParameterKind::LogUniform { low, high } => {
                if !(low.is_finite() && *low > 0.0) || !high.is_finite() {
                    Err(invalid("log-uniform bounds must be positive and finite".into()))
                } else if low > high {
                    Err(invalid(format!("low {low} is above high {high}")))
                } else {
                    Ok(())
                }
            }
            ParameterKind::Choice { values } => {
                if values.is_empty() {
                    Err(invalid("choice needs at least one value".into()))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Draw one value from the domain.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValue {
        match self {
            ParameterKind::Constant { value } => value.clone(),
            ParameterKind::FloatRange { low, high } => {
                ParameterValue::Float(rng.gen_range(*low..=*high))
            }
            ParameterKind::IntRange { low, high } => {
                ParameterValue::Int(rng.gen_range(*low..=*high))
            }
            ParameterKind::LogUniform { low, high } => {
                let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
                ParameterValue::Float(log_val.exp().clamp(*low, *high))
            }
            ParameterKind::Choice { values } => {
                let idx = rng.gen_range(0..values.len());
                ParameterValue::from(values[idx].clone())
            }
        }
    }

    /// Whether `value` lies inside the domain.
    pub fn contains(&self, value: &ParameterValue) -> bool {
        match self {
            ParameterKind::Constant { value: fixed } => fixed == value,
            ParameterKind::FloatRange { low, high } | ParameterKind::LogUniform { low, high } => {
                value.as_f64().is_some_and(|v| v >= *low && v <= *high)
            }
            ParameterKind::IntRange { low, high } => value
                .as_f64()
                .is_some_and(|v| v.fract() == 0.0 && v >= *low as f64 && v <= *high as f64),
            ParameterKind::Choice { values } => {
                let json = value.to_json();
                values.iter().any(|candidate| *candidate == json)
            }
        }
    }
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    fn push(mut self, name: impl Into<String>, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn add_constant(self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.push(
            name,
            ParameterKind::Constant {
                value: value.into(),
            },
        )
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::FloatRange { low, high })
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.push(name, ParameterKind::IntRange { low, high })
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::LogUniform { low, high })
    }

    pub fn add_choice(self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.push(name, ParameterKind::Choice { values })
    }

    pub fn get(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Dimensions a search algorithm actually has to pick.
    pub fn tunable(&self) -> impl Iterator<Item = &ParameterDef> {
        self.parameters.iter().filter(|p| p.kind.is_tunable())
    }

    pub fn validate(&self) -> TuneResult<()> {
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(SearchError::DuplicateParameter {
                    parameter: param.name.clone(),
                }
                .into());
            }
            param.kind.validate(&param.name)?;
        }
        Ok(())
    }

    /// Sample a complete configuration, constants included.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Config {
        self.parameters
            .iter()
            .map(|p| (p.name.clone(), p.kind.sample(rng)))
            .collect()
    }

    /// Check that `config` assigns an in-domain value to every tunable
    /// dimension. Missing constants are tolerated; see [`SearchSpace::complete`].
    pub fn contains(&self, config: &Config) -> TuneResult<()> {
        for param in self.tunable() {
            let value = config
                .get(&param.name)
                .ok_or_else(|| SearchError::MissingParameter {
                    parameter: param.name.clone(),
                })?;
            if !param.kind.contains(value) {
                return Err(SearchError::OutOfDomain {
                    parameter: param.name.clone(),
                    value: value.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Fill in constant dimensions a partial config leaves out.
    pub fn complete(&self, mut config: Config) -> Config {
        for param in &self.parameters {
            if let ParameterKind::Constant { value } = &param.kind {
                config
                    .entry(param.name.clone())
                    .or_insert_with(|| value.clone());
            }
        }
        config
    }
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Search algorithms
// ---------------------------------------------------------------------------

/// Answer to a request for the next trial configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Suggestion {
    /// Run a trial with this configuration.
    Config(Config),
    /// Nothing to hand out right now; ask again after a trial completes.
    Wait,
    /// The algorithm will never suggest anything again.
    Finished,
}

/// Common trait for all search algorithms.
///
/// The experiment runner calls these from a single driver thread: first
/// `set_search_properties`, then `suggest` per trial, and `on_trial_complete`
/// exactly once for every trial that was suggested.
pub trait SearchAlgorithm: Send {
    /// Fill in metric, mode, and space the algorithm was not constructed with.
    fn set_search_properties(
        &mut self,
        metric: &str,
        mode: Mode,
        space: &SearchSpace,
    ) -> TuneResult<()>;

    /// Produce the configuration for trial `trial_id`.
    fn suggest(&mut self, trial_id: Uuid) -> TuneResult<Suggestion>;

    /// Intermediate result from a running trial.
    fn on_trial_result(&mut self, _trial_id: Uuid, _metrics: &Metrics) {}

    /// Final notification; `metrics` is the last reported result, if any.
    fn on_trial_complete(&mut self, trial_id: Uuid, metrics: Option<&Metrics>, errored: bool);

    /// Upper bound on live trials this algorithm will hand out, if any.
    fn max_concurrent(&self) -> Option<usize> {
        None
    }

    /// Human-readable algorithm name.
    fn name(&self) -> &str;
}

/// Reject a metric/mode the algorithm was built with that the experiment
/// disagrees with.
pub(crate) fn check_property<T: PartialEq + std::fmt::Display>(
    algorithm: &str,
    configured: Option<&T>,
    requested: &T,
) -> TuneResult<()> {
    match configured {
        Some(existing) if existing != requested => Err(SearchError::PropertyConflict {
            algorithm: algorithm.to_string(),
            expected: existing.to_string(),
            actual: requested.to_string(),
        }
        .into()),
        _ => Ok(()),
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    space: Option<SearchSpace>,
    rng: ChaCha8Rng,
}

impl RandomSearch {
    pub fn new(space: SearchSpace) -> Self {
        Self {
            space: Some(space),
            rng: ChaCha8Rng::from_entropy(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }
}

impl Default for RandomSearch {
    /// A searcher that takes its space from the experiment.
    fn default() -> Self {
        Self {
            space: None,
            rng: ChaCha8Rng::from_entropy(),
        }
    }
}

impl SearchAlgorithm for RandomSearch {
    fn set_search_properties(
        &mut self,
        _metric: &str,
        _mode: Mode,
        space: &SearchSpace,
    ) -> TuneResult<()> {
        if self.space.is_none() {
            space.validate()?;
            self.space = Some(space.clone());
        }
        Ok(())
    }

    fn suggest(&mut self, _trial_id: Uuid) -> TuneResult<Suggestion> {
        let space = self.space.as_ref().ok_or_else(|| SearchError::MissingSpace {
            algorithm: "random".to_string(),
        })?;
        Ok(Suggestion::Config(space.sample(&mut self.rng)))
    }

    fn on_trial_complete(&mut self, _trial_id: Uuid, _metrics: Option<&Metrics>, _errored: bool) {}

    fn name(&self) -> &str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_space() -> SearchSpace {
        SearchSpace::new()
            .add_constant("steps", 100i64)
            .add_float("width", 0.0, 20.0)
            .add_float("height", -100.0, 100.0)
            .add_choice(
                "activation",
                vec![serde_json::json!("relu"), serde_json::json!("tanh")],
            )
    }

    fn config_of(suggestion: Suggestion) -> Config {
        match suggestion {
            Suggestion::Config(c) => c,
            other => panic!("expected a config, got {other:?}"),
        }
    }

    #[test]
    fn random_search_respects_bounds() {
        let mut rs = RandomSearch::new(sample_space()).with_seed(7);
        for _ in 0..50 {
            let params = config_of(rs.suggest(Uuid::new_v4()).unwrap());
            assert_eq!(params.get("steps"), Some(&ParameterValue::Int(100)));
            match params.get("width") {
                Some(ParameterValue::Float(v)) => assert!(*v >= 0.0 && *v <= 20.0),
                other => panic!("unexpected width value: {other:?}"),
            }
            let activation = params.get("activation").and_then(|v| v.as_str()).unwrap();
            assert!(["relu", "tanh"].contains(&activation));
        }
    }

    #[test]
    fn seeded_random_search_is_reproducible() {
        let mut a = RandomSearch::new(sample_space()).with_seed(42);
        let mut b = RandomSearch::new(sample_space()).with_seed(42);
        for _ in 0..5 {
            assert_eq!(
                a.suggest(Uuid::new_v4()).unwrap(),
                b.suggest(Uuid::new_v4()).unwrap()
            );
        }
    }

    #[test]
    fn default_random_search_needs_a_space() {
        let mut rs = RandomSearch::default();
        assert!(rs.suggest(Uuid::new_v4()).is_err());
        rs.set_search_properties("loss", Mode::Min, &sample_space())
            .unwrap();
        assert!(matches!(
            rs.suggest(Uuid::new_v4()).unwrap(),
            Suggestion::Config(_)
        ));
    }

    #[test]
    fn log_uniform_stays_in_bounds() {
        let space = SearchSpace::new().add_log_uniform("lr", 1e-5, 1e-1);
        let mut rs = RandomSearch::new(space).with_seed(1);
        for _ in 0..100 {
            let params = config_of(rs.suggest(Uuid::new_v4()).unwrap());
            match params.get("lr") {
                Some(ParameterValue::Float(v)) => {
                    assert!(*v >= 1e-5 && *v <= 1e-1, "lr out of bounds: {v}");
                }
                other => panic!("unexpected lr value: {other:?}"),
            }
        }
    }

    #[test]
    fn validate_rejects_bad_domains() {
        assert!(SearchSpace::new().add_float("x", 1.0, 0.0).validate().is_err());
        assert!(SearchSpace::new()
            .add_log_uniform("lr", 0.0, 1.0)
            .validate()
            .is_err());
        assert!(SearchSpace::new().add_choice("c", vec![]).validate().is_err());
        assert!(SearchSpace::new()
            .add_log_uniform("lr", f64::NAN, 1.0)
            .validate()
            .is_err());
        assert!(SearchSpace::new()
            .add_log_uniform("lr", 1e-4, f64::NAN)
            .validate()
            .is_err());
        assert!(SearchSpace::new()
            .add_float("x", f64::NAN, 1.0)
            .validate()
            .is_err());
        assert!(SearchSpace::new()
            .add_int("a", 0, 3)
            .add_float("a", 0.0, 1.0)
            .validate()
            .is_err());
        assert!(sample_space().validate().is_ok());
    }

    #[test]
    fn contains_checks_every_tunable_key() {
        let space = sample_space();
        let mut config = Config::new();
        config.insert("width".into(), ParameterValue::Int(10));
        config.insert("height".into(), ParameterValue::Int(0));
        config.insert("activation".into(), "relu".into());
        assert!(space.contains(&config).is_ok());

        config.insert("height".into(), ParameterValue::Float(250.0));
        assert!(space.contains(&config).is_err());

        config.remove("height");
        assert!(space.contains(&config).is_err());
    }

    #[test]
    fn complete_fills_constants_only() {
        let space = sample_space();
        let config = space.complete(Config::new());
        assert_eq!(config.len(), 1);
        assert_eq!(config.get("steps"), Some(&ParameterValue::Int(100)));
    }

    #[test]
    fn property_conflicts_are_reported() {
        assert!(check_property("bayesopt", Some(&Mode::Max), &Mode::Min).is_err());
        assert!(check_property("bayesopt", None, &Mode::Min).is_ok());
        assert!(check_property("bayesopt", Some(&Mode::Min), &Mode::Min).is_ok());
    }
}
