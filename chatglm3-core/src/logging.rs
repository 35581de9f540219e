//! Structured logging setup for training launchers and tests.
//!
//! `RUST_LOG` controls the filter (default `info`). Set
//! `CHATGLM3_LOG_FORMAT=json` for machine-readable output.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FORMAT_ENV: &str = "CHATGLM3_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init() -> bool {
    init_with_level_and_format(None, LogFormat::from_env())
}

/// `level` is used when `RUST_LOG` is unset.
pub fn init_with_level(level: &str) -> bool {
    init_with_level_and_format(Some(level), LogFormat::from_env())
}

pub fn init_with_level_and_format(level: Option<&str>, format: LogFormat) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };
    installed.is_ok()
}
