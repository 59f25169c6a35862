//! Ambient logging setup. There's no dashboard here to protect from garbled
//! output, so this is only ever the headless path: a `fmt` layer plus an
//! `EnvFilter`, with an optional non-blocking rotating file sink when
//! `debug.logDir` is configured. `RUST_LOG` always wins over the configured
//! level so operators can override without editing the config file.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Must be kept alive for the lifetime of the process; dropping it stops the
/// background writer thread and any buffered lines are lost.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init(config: &Config) -> LoggingGuard {
    let default_filter = format!("llm_gateway={},tower_http=info,axum=info", config.debug.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(true);

    let (file_layer, file_guard) = match &config.debug.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "gateway.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    LoggingGuard { _file_guard: file_guard }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_includes_configured_level() {
        let level = "debug";
        let default_filter = format!("llm_gateway={},tower_http=info,axum=info", level);
        assert!(default_filter.contains("llm_gateway=debug"));
    }
}
