//! Logging setup
//!
//! A single process may host a whole class (the `classroom` binary runs
//! every participant side by side), so events carry `participant`,
//! `local`/`remote` or `connection` fields rather than relying on the
//! process to tell participants apart. `compact` output keeps one line per
//! event for reading such runs; `json` is for collection.

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::anyhow;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG` overrides `config.level` when set. Fails if the level is
/// malformed or a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(&config.level)?;

    let to_file = config.file_path.is_some();
    let writer = match &config.file_path {
        Some(path) => BoxMakeWriter::new(Arc::new(
            OpenOptions::new().create(true).append(true).open(path)?,
        )),
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format.as_str() {
        "json" => Box::new(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true)
                .with_writer(writer),
        ),
        "compact" => Box::new(
            fmt::layer()
                .compact()
                .with_target(false)
                .with_ansi(!to_file)
                .with_writer(writer),
        ),
        _ => Box::new(
            fmt::layer()
                .pretty()
                .with_line_number(true)
                .with_file(false)
                .with_ansi(!to_file)
                .with_writer(writer),
        ),
    };

    tracing_subscriber::registry().with(layer).with(filter).try_init()?;
    Ok(())
}

/// `level` is a bare level or a directive list such as
/// `info,classroom_core::negotiation=debug`. Bare entries must name a level;
/// otherwise a typo would silently become a target filter.
fn build_filter(level: &str) -> anyhow::Result<EnvFilter> {
    for directive in level.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        if !directive.contains('=') {
            directive
                .parse::<Level>()
                .map_err(|_| anyhow!("Invalid log level: {directive}"))?;
        }
    }
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_and_directives() {
        assert!(build_filter("trace").is_ok());
        assert!(build_filter("INFO").is_ok());
        assert!(build_filter("warn,classroom_core::negotiation=debug").is_ok());
        assert!(build_filter("loud").is_err());
        assert!(build_filter("info,loud").is_err());
    }

    #[test]
    fn test_invalid_level_is_rejected_before_install() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
