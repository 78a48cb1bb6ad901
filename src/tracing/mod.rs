//! Logging setup.
//!
//! Log events are emitted with the `tracing` macros throughout the
//! crate. Nothing is printed until [`setup_tracing`] installs a global
//! subscriber writing compact lines to stdout.
//!
//! The filter comes from the `STATEFLOW_LOG` environment variable when
//! it is set, in `tracing_subscriber::EnvFilter` syntax (for example
//! `stateflow=debug,stateflow::state=trace`). Otherwise only events
//! from this crate at or above the given level are shown.

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::{EnvFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{Layer, Registry};

use crate::errors::{config_err, EngineException, EngineResult};

/// Environment variable holding log filter directives.
pub const LOG_ENV: &str = "STATEFLOW_LOG";

fn get_log_level(level: Option<&str>) -> EngineResult<LevelFilter> {
    match level.map(str::to_lowercase).as_deref() {
        None => Ok(LevelFilter::ERROR),
        Some("trace") => Ok(LevelFilter::TRACE),
        Some("debug") => Ok(LevelFilter::DEBUG),
        Some("info") => Ok(LevelFilter::INFO),
        Some("warn") => Ok(LevelFilter::WARN),
        Some("error") => Ok(LevelFilter::ERROR),
        Some(level) => Err(config_err(&format!("wrong log level: {level}"))),
    }
}

/// Install the global log subscriber.
///
/// `log_level` is used when `STATEFLOW_LOG` is not set; it defaults to
/// errors only.
pub fn setup_tracing(log_level: Option<&str>) -> EngineResult<()> {
    // Prepare the log layer
    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID an event was recorded on
        .with_thread_ids(true);

    match std::env::var(LOG_ENV) {
        Ok(directives) => {
            let filter = EnvFilter::try_new(&directives)
                .map_err(|err| config_err(&format!("invalid {LOG_ENV} {directives:?}: {err}")))?;
            set_global_subscriber(Registry::default().with(logs.with_filter(filter)))
        }
        Err(_) => {
            let level = get_log_level(log_level)?;
            let filter = Targets::new().with_target("stateflow", level);
            set_global_subscriber(Registry::default().with(logs.with_filter(filter)))
        }
    }
}

/// Set the global subscriber, only warning if one was already
/// installed (tests and embedding applications may have done so).
fn set_global_subscriber<S>(subscriber: S) -> EngineResult<()>
where
    S: Subscriber + Send + Sync + 'static,
{
    if tracing::dispatcher::has_been_set() {
        tracing::warn!("Global tracing subscriber already set; keeping it");
        return Ok(());
    }
    tracing::subscriber::set_global_default(subscriber)
        .reraise("error setting global tracing subscriber")
}

#[test]
fn log_levels_parse() {
    assert_eq!(get_log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(get_log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert!(get_log_level(Some("loud")).is_err());
}
