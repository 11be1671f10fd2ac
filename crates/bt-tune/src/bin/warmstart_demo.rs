//! Warm-started Bayesian optimization of a toy objective.
//!
//! `warmstart-demo [--smoke-test]`; see `DemoSettings::from_env` for the
//! environment overrides.

use bt_tune::demo::{self, DemoSettings};
use bt_tune::{format_config, Runtime, RuntimeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut settings = DemoSettings::from_env()?;
    if std::env::args().skip(1).any(|arg| arg == "--smoke-test") {
        settings.smoke_test = true;
    }

    let runtime = Runtime::init(RuntimeConfig::from_env()?)?;
    let outcome = demo::run(&runtime, &settings);
    runtime.shutdown();
    let analysis = outcome?;

    match analysis.best_config() {
        Some(best) => println!("Best hyperparameters found were: {}", format_config(best)),
        None => anyhow::bail!("no trial reported {}", demo::METRIC),
    }

    Ok(())
}
