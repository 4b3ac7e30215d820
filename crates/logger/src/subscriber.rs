use std::env::var;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    Layer,
    filter::{Directive, EnvFilter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Output format of the log layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    /// Resolve a format name. Unknown names fall back to compact output.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

pub fn init() {
    init_with("info", LogFormat::Compact);
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` overrides `default_directive`, `RUST_LOG_FORMAT` overrides `format`.
/// Calling this twice is harmless; the second subscriber is discarded.
pub fn init_with(default_directive: &str, format: LogFormat) {
    let directive: Directive =
        default_directive.parse().unwrap_or_else(|_| LevelFilter::INFO.into());
    let env_filter = EnvFilter::builder().with_default_directive(directive).from_env_lossy();

    let format = var("RUST_LOG_FORMAT").map(|name| LogFormat::from_name(&name)).unwrap_or(format);

    let log_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().with_filter(env_filter).boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_filter(env_filter)
            .boxed(),
    };

    let _ = tracing_subscriber::registry().with(log_layer).try_init();
}
