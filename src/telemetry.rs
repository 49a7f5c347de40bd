//! Shared tracing bootstrap for lodestone binaries.

use crate::{Error, Result};

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Initialized telemetry for one process.
///
/// Holding the value keeps the subscriber installed; there is nothing to
/// flush on drop since export plumbing lives outside this crate.
pub struct Telemetry {
    service_name: String,
}

impl Telemetry {
    /// Install the global tracing subscriber for a binary.
    pub fn init_for_component(default_service_name: &str, log_level: &str) -> Result<Self> {
        let service_name = std::env::var("LODESTONE_SERVICE_NAME")
            .unwrap_or_else(|_| default_service_name.to_string());
        let service_name = service_name.trim().to_string();
        if service_name.is_empty() {
            return Err(Error::Config(
                "LODESTONE_SERVICE_NAME cannot be empty".to_string(),
            ));
        }

        let level = parse_log_level(log_level)?;
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|e| Error::Config(format!("failed to install tracing subscriber: {e}")))?;

        info!(service = %service_name, "telemetry initialized");
        Ok(Self { service_name })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

fn parse_log_level(level: &str) -> Result<Level> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!("unknown log level: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("loud").is_err());
    }
}
