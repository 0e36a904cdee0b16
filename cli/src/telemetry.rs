// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Logging and metrics setup for the `conductor` binary.

use anyhow::{Context, Result};
use conductor_core::domain::config::{LoggingConfig, MetricsConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` wins over `level_override`, which wins over the configured
/// level. Logs go to stderr so command output on stdout stays clean.
pub fn init_logging(logging: &LoggingConfig, level_override: Option<&str>) -> Result<()> {
    let level = level_override.unwrap_or(&logging.level);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}

/// Start the Prometheus scrape endpoint if metrics are enabled.
pub fn init_metrics(metrics: &MetricsConfig) -> Result<()> {
    if !metrics.enabled {
        return Ok(());
    }

    let address: SocketAddr = format!("{}:{}", metrics.bind_address, metrics.port)
        .parse()
        .with_context(|| format!("Invalid metrics address {}:{}", metrics.bind_address, metrics.port))?;

    PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(%address, "Prometheus metrics endpoint listening");
    Ok(())
}
