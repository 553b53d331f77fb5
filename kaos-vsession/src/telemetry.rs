//! Log output setup.
//!
//! ```rust,ignore
//! use kaos_vsession::telemetry::{init_tracing, TracingConfig};
//!
//! init_tracing(&TracingConfig::default().with_level("kaos_vsession=debug"));
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing configuration.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Log level filter (e.g., "info", "kaos_vsession=debug"). `RUST_LOG` wins
    /// when set.
    pub log_level: String,
    /// Output logs as JSON (useful for log aggregation).
    pub json_output: bool,
    pub with_target: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            json_output: false,
            with_target: true,
        }
    }
}

impl TracingConfig {
    /// Set log level filter.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Enable JSON output.
    pub fn with_json(mut self) -> Self {
        self.json_output = true;
        self
    }

    pub fn without_target(mut self) -> Self {
        self.with_target = false;
        self
    }
}

/// Install a global subscriber. Returns false if one was already installed.
pub fn init_tracing(config: &TracingConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    if config.json_output {
        registry
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init()
            .is_ok()
    } else {
        registry
            .with(fmt::layer().compact().with_target(config.with_target))
            .try_init()
            .is_ok()
    }
}
