//! Logging.

use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{
    layer::SubscriberExt as _, registry::LookupSpan, util::SubscriberInitExt as _, EnvFilter, Layer,
};

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// The `DYNAMO_LOCAL_LOG_LEVEL` environment variable holds the filtering directives, falling back to `default_level`
/// (or `INFO`) when unset. When `DYNAMO_LOCAL_LOG_FORMAT_JSON` is `true` or `1`, logs are formatted as JSON.
///
/// Logs are written to standard error, leaving standard output to command results.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(default_level: Option<LevelFilter>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let is_json = std::env::var("DYNAMO_LOCAL_LOG_FORMAT_JSON")
        .map(|s| s.trim().to_lowercase())
        .map(|s| s == "true" || s == "1")
        .unwrap_or(false);

    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var("DYNAMO_LOCAL_LOG_LEVEL")
        .from_env_lossy();

    if is_json {
        tracing_subscriber::registry()
            .with(initialize_tracing_json().with_filter(level_filter))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(initialize_tracing_pretty().with_filter(level_filter))
            .try_init()?;
    }

    Ok(())
}

fn initialize_tracing_json<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_writer(std::io::stderr)
}

fn initialize_tracing_pretty<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .with_target(false)
        .with_writer(std::io::stderr)
}
