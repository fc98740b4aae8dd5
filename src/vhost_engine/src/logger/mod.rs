// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logging and metrics for the vhost engine.

mod logging;
mod metrics;

pub use log::Level::*;
pub use log::*;

pub use crate::logger::logging::{
    DEFAULT_INSTANCE_ID, DEFAULT_LEVEL, INSTANCE_ID, LOGGER, LevelFilter, LevelFilterFromStrError,
    Logger, LoggerConfig, LoggerInitError, LoggerUpdateError,
};
pub use crate::logger::metrics::{
    EngineMetrics, IncMetric, METRICS, Metrics, MetricsError, SharedIncMetric, SharedStoreMetric,
    StoreMetric, VhostDeviceMetrics, VhostMetricsPerDevice,
};

/// Alias for `std::io::LineWriter<std::fs::File>`.
pub type EngineLineWriter = std::io::LineWriter<std::fs::File>;

/// Writes one line of [`METRICS`] to its destination, counting failures.
///
/// Returns `Ok(false)` if no destination was set with [`Metrics::init`].
pub fn flush_metrics() -> Result<bool, MetricsError> {
    METRICS.write().inspect_err(|err| {
        METRICS.logger.metrics_fails.inc();
        warn!("failed to flush metrics: {err}");
    })
}
