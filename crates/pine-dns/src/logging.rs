use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt::layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const LOGGING_ENV: &str = "PINE_DNS_LOG";

/// Installs the global subscriber: the env filter wins, the CLI-provided
/// level is the default directive, INFO the fallback.
pub fn setup_logging(default_level: Option<&str>) -> anyhow::Result<()> {
    let default_directive: tracing_subscriber::filter::Directive = match default_level {
        Some(level) => level
            .parse()
            .with_context(|| format!("invalid log level '{}'", level))?,
        None => LevelFilter::INFO.into(),
    };

    tracing_subscriber::registry()
        .with(
            layer().with_filter(
                EnvFilter::builder()
                    .with_env_var(LOGGING_ENV)
                    .with_default_directive(default_directive)
                    .from_env_lossy(),
            ),
        )
        .try_init()
        .context("failed to initialize tracing_subscriber")
}
