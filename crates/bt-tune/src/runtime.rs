//! Runtime context: the worker pool trials execute on.

use bt_types::{RuntimeError, TuneResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Configuration for starting a [`Runtime`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker threads, i.e. the most trials that can run at once.
    pub num_workers: usize,

    /// Label used in logs and error messages.
    pub namespace: String,

    /// Worker threads are named `{prefix}-{index}`.
    pub thread_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            namespace: "default".to_string(),
            thread_name_prefix: "bt-worker".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `BT_NUM_WORKERS` and `BT_NAMESPACE`.
    pub fn from_env() -> TuneResult<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("BT_NUM_WORKERS") {
            config.num_workers = raw.trim().parse().map_err(|_| {
                RuntimeError::InvalidConfig {
                    message: format!("BT_NUM_WORKERS must be a positive integer, got {raw:?}"),
                }
            })?;
        }
        if let Ok(namespace) = std::env::var("BT_NAMESPACE") {
            config.namespace = namespace;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn validate(&self) -> TuneResult<()> {
        if self.num_workers == 0 {
            return Err(RuntimeError::InvalidConfig {
                message: "num_workers must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// A started worker pool. Cheap to share by reference; `shutdown` may be
/// called from any thread and more than once.
#[derive(Debug)]
pub struct Runtime {
    config: RuntimeConfig,
    pool: RwLock<Option<Arc<ThreadPool>>>,
    started_at: DateTime<Utc>,
}

impl Runtime {
    /// Start the worker pool.
    pub fn init(config: RuntimeConfig) -> TuneResult<Self> {
        config.validate()?;
        let prefix = config.thread_name_prefix.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.num_workers)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()
            .map_err(|e| RuntimeError::PoolBuild {
                message: e.to_string(),
            })?;

        info!(
            namespace = %config.namespace,
            workers = config.num_workers,
            "runtime initialized"
        );

        Ok(Self {
            config,
            pool: RwLock::new(Some(Arc::new(pool))),
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_running(&self) -> bool {
        self.pool.read().is_some()
    }

    /// The pool, unless the runtime has been shut down.
    pub(crate) fn pool(&self) -> TuneResult<Arc<ThreadPool>> {
        self.pool.read().clone().ok_or_else(|| {
            RuntimeError::ShutDown {
                namespace: self.config.namespace.clone(),
            }
            .into()
        })
    }

    /// Release the worker pool. Jobs already queued still run to completion.
    pub fn shutdown(&self) {
        if self.pool.write().take().is_some() {
            info!(namespace = %self.config.namespace, "runtime shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_runtime_config() {
        let config = RuntimeConfig::default();
        assert!(config.num_workers >= 1);
        assert_eq!(config.namespace, "default");
        assert_eq!(config.thread_name_prefix, "bt-worker");
    }

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("BT_NUM_WORKERS", "3");
        std::env::set_var("BT_NAMESPACE", "env-test");
        let config = RuntimeConfig::from_env().unwrap();
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.namespace, "env-test");

        std::env::set_var("BT_NUM_WORKERS", "abc");
        let err = RuntimeConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("BT_NUM_WORKERS"));

        std::env::set_var("BT_NUM_WORKERS", "0");
        assert!(RuntimeConfig::from_env().is_err());

        std::env::remove_var("BT_NUM_WORKERS");
        std::env::remove_var("BT_NAMESPACE");
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = RuntimeConfig::default().with_num_workers(0);
        assert!(config.validate().is_err());
        assert!(Runtime::init(config).is_err());
    }

    #[test]
    fn shutdown_is_idempotent_and_final() {
        let runtime = Runtime::init(RuntimeConfig::default().with_num_workers(2)).unwrap();
        assert!(runtime.is_running());
        assert!(runtime.pool().is_ok());

        runtime.shutdown();
        runtime.shutdown();
        assert!(!runtime.is_running());
        let err = runtime.pool().unwrap_err();
        assert!(err.to_string().contains("shut down"));
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = RuntimeConfig::default()
            .with_num_workers(3)
            .with_namespace("tuning");
        let json = serde_json::to_string(&config).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
