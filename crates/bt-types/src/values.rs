//! Concrete values flowing between search spaces, objectives, and results.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::errors::TuneError;

/// A concrete parameter value produced by a search algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    /// Numeric view; ints widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Json(v) => v.as_f64(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Float(_) => None,
            Self::Json(v) => v.as_i64(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Float(v) => serde_json::json!(v),
            Self::Int(v) => serde_json::json!(v),
            Self::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        Self::Json(serde_json::Value::String(v.to_string()))
    }
}

impl From<serde_json::Value> for ParameterValue {
    fn from(v: serde_json::Value) -> Self {
        if let Some(i) = v.as_i64() {
            return Self::Int(i);
        }
        if v.is_f64() {
            if let Some(f) = v.as_f64() {
                return Self::Float(f);
            }
        }
        Self::Json(v)
    }
}

/// One concrete hyperparameter assignment.
pub type Config = HashMap<String, ParameterValue>;

/// Scalar metrics reported by an objective.
pub type Metrics = HashMap<String, f64>;

/// Render a config with sorted keys, for logs and the final printout.
pub fn format_config(config: &Config) -> String {
    let mut keys: Vec<&String> = config.keys().collect();
    keys.sort();
    let body: Vec<String> = keys
        .into_iter()
        .map(|k| format!("'{k}': {}", config[k]))
        .collect();
    format!("{{{}}}", body.join(", "))
}

/// Whether we are minimizing or maximizing the metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Min,
    Max,
}

impl Mode {
    /// True when `candidate` improves on `incumbent`.
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Mode::Min => candidate < incumbent,
            Mode::Max => candidate > incumbent,
        }
    }

    /// Multiplier that turns the metric into a quantity to maximize.
    pub fn sign(&self) -> f64 {
        match self {
            Mode::Min => -1.0,
            Mode::Max => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Min => "min",
            Mode::Max => "max",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "min" => Ok(Mode::Min),
            "max" => Ok(Mode::Max),
            other => Err(TuneError::Config(format!(
                "mode must be \"min\" or \"max\", got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_comparisons() {
        assert!(Mode::Min.is_better(1.0, 2.0));
        assert!(!Mode::Min.is_better(2.0, 1.0));
        assert!(Mode::Max.is_better(2.0, 1.0));
        assert_eq!(Mode::Min.sign(), -1.0);
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("MIN".parse::<Mode>().unwrap(), Mode::Min);
        assert_eq!("max".parse::<Mode>().unwrap(), Mode::Max);
        assert!("minimize".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_defaults_to_min() {
        assert_eq!(Mode::default(), Mode::Min);
    }

    #[test]
    fn mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::Max).unwrap(), "\"max\"");
    }

    #[test]
    fn untagged_values_keep_ints_as_ints() {
        let value: ParameterValue = serde_json::from_str("100").unwrap();
        assert_eq!(value, ParameterValue::Int(100));
        let value: ParameterValue = serde_json::from_str("0.5").unwrap();
        assert_eq!(value, ParameterValue::Float(0.5));
        let value: ParameterValue = serde_json::from_str("\"relu\"").unwrap();
        assert_eq!(value.as_str(), Some("relu"));
    }

    #[test]
    fn format_config_sorts_keys() {
        let mut config = Config::new();
        config.insert("width".into(), ParameterValue::Float(2.5));
        config.insert("activation".into(), "relu".into());
        assert_eq!(format_config(&config), "{'activation': \"relu\", 'width': 2.5}");
    }
}
