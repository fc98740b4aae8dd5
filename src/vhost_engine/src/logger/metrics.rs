// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines the metrics system.
//!
//! # Metrics format
//! Metrics are flushed as one JSON object per line whenever [`Metrics::write`] is called. The
//! first field is the UTC timestamp, followed by the logger metrics and one entry per vhost
//! device, keyed `vhost_<id>`:
//!
//! ```json
//! {
//!  "utc_timestamp_ms": 1541591155180,
//!  "logger": { "metrics_fails": 0, "missed_log_count": 0 },
//!  "vhost_net0": { "kick_count": 12, "chain_count": 30, "used_count": 30, ... }
//! }
//! ```
//!
//! Counters are [`SharedIncMetric`]s: they keep the current and the previously flushed value
//! and serialize the delta, so every flush reports what happened since the last one.
//! Persistent values are [`SharedStoreMetric`]s.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::Write;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use super::EngineLineWriter;

/// Process-wide engine metrics.
pub static METRICS: Metrics<EngineMetrics, EngineLineWriter> =
    Metrics::<EngineMetrics, EngineLineWriter>::new(EngineMetrics::new());

/// A serializable set of metrics and the sink it is flushed to.
#[derive(Debug)]
pub struct Metrics<T: Serialize, M: Write + Send> {
    metrics_buf: OnceLock<Mutex<M>>,
    app_metrics: T,
}

impl<T: Serialize + Debug, M: Write + Send + Debug> Metrics<T, M> {
    /// Wraps `app_metrics`; nothing is flushed until [`Metrics::init`] sets a sink.
    pub const fn new(app_metrics: T) -> Metrics<T, M> {
        Metrics {
            metrics_buf: OnceLock::new(),
            app_metrics,
        }
    }

    /// Sets the destination for flushed metrics. Only the first call succeeds.
    pub fn init(&self, metrics_dest: M) -> Result<(), MetricsError> {
        self.metrics_buf
            .set(Mutex::new(metrics_dest))
            .map_err(|_| MetricsError::AlreadyInitialized)
    }

    /// Serializes the metrics and writes them, newline terminated, to the destination set by
    /// [`Metrics::init`].
    ///
    /// Returns `Ok(false)` if the metrics system was never initialized.
    pub fn write(&self) -> Result<bool, MetricsError> {
        let Some(lock) = self.metrics_buf.get() else {
            return Ok(false);
        };
        let msg = serde_json::to_string(&self.app_metrics)
            .map_err(|err| MetricsError::Serde(err.to_string()))?;
        // The destination stays usable if a writer panicked mid-line.
        let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .write_all(format!("{msg}\n").as_bytes())
            .map_err(MetricsError::Write)
            .map(|_| true)
    }
}

impl<T: Serialize + Debug, M: Write + Send + Debug> Deref for Metrics<T, M> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.app_metrics
    }
}

/// Errors of [`Metrics`].
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MetricsError {
    /// Reinitialization of metrics not allowed.
    AlreadyInitialized,
    /// {0}
    Serde(String),
    /// Failed to write metrics: {0}
    Write(std::io::Error),
}

/// Monotonic counter.
pub trait IncMetric {
    /// Bumps the counter by `value`.
    fn add(&self, value: u64);
    /// Bumps the counter by one.
    fn inc(&self) {
        self.add(1);
    }
    /// Total since creation.
    fn count(&self) -> u64;
    /// Amount counted since the last flush.
    fn fetch_diff(&self) -> u64;
}

/// Gauge holding the last stored value.
pub trait StoreMetric {
    /// Last stored value.
    fn fetch(&self) -> u64;
    /// Replaces the value.
    fn store(&self, value: u64);
}

/// Atomic [`IncMetric`]. Holds the running total and the total at the last flush.
#[derive(Debug, Default)]
pub struct SharedIncMetric(AtomicU64, AtomicU64);
impl SharedIncMetric {
    /// Zeroed counter, usable in statics.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0), AtomicU64::new(0))
    }
}

/// Atomic [`StoreMetric`].
#[derive(Debug, Default)]
pub struct SharedStoreMetric(AtomicU64);
impl SharedStoreMetric {
    /// Zeroed gauge, usable in statics.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }
}

impl IncMetric for SharedIncMetric {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn fetch_diff(&self) -> u64 {
        self.0.load(Ordering::Relaxed) - self.1.load(Ordering::Relaxed)
    }
}

impl StoreMetric for SharedStoreMetric {
    fn fetch(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn store(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

impl Serialize for SharedIncMetric {
    /// Serializes the delta since the last flush and makes the current value the new base.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let snapshot = self.0.load(Ordering::Relaxed);
        let res = serializer.serialize_u64(snapshot - self.1.load(Ordering::Relaxed));

        if res.is_ok() {
            self.1.store(snapshot, Ordering::Relaxed);
        }
        res
    }
}

impl Serialize for SharedStoreMetric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0.load(Ordering::Relaxed))
    }
}

/// Metrics of the logging subsystem.
#[derive(Debug, Default, Serialize)]
pub struct LoggerSystemMetrics {
    /// Number of metric flushes that failed.
    pub metrics_fails: SharedIncMetric,
    /// Number of log lines that could not be written.
    pub missed_log_count: SharedIncMetric,
}
impl LoggerSystemMetrics {
    /// Zeroed logger metrics, usable in statics.
    pub const fn new() -> Self {
        Self {
            metrics_fails: SharedIncMetric::new(),
            missed_log_count: SharedIncMetric::new(),
        }
    }
}

/// Per-device statistics of a vhost device.
#[derive(Debug, Default, Serialize)]
pub struct VhostDeviceMetrics {
    /// Number of guest kicks received through kick eventfds.
    pub kick_count: SharedIncMetric,
    /// Number of work items executed by the worker thread.
    pub work_count: SharedIncMetric,
    /// Number of flush requests served.
    pub flush_count: SharedIncMetric,
    /// Number of descriptor chains popped from avail rings.
    pub chain_count: SharedIncMetric,
    /// Number of used ring entries published.
    pub used_count: SharedIncMetric,
    /// Number of guest signals sent through call eventfds.
    pub signal_count: SharedIncMetric,
    /// Number of guest signals suppressed by the guest.
    pub signal_suppressed_count: SharedIncMetric,
    /// Number of guest ring protocol violations.
    pub protocol_fails: SharedIncMetric,
    /// Number of guest addresses that did not translate.
    pub address_fails: SharedIncMetric,
    /// Number of dirty log writes.
    pub log_writes: SharedIncMetric,
    /// Number of dirty log write failures.
    pub log_fails: SharedIncMetric,
    /// Number of zero-copy sends started.
    pub zerocopy_started: SharedIncMetric,
    /// Number of zero-copy sends completed by the backend.
    pub zerocopy_completed: SharedIncMetric,
    /// Number of rejected control-plane requests.
    pub cfg_fails: SharedIncMetric,
    /// Number of worker thread failures.
    pub worker_fails: SharedIncMetric,
    /// Number of virtqueues with a backend attached.
    pub active_queues: SharedStoreMetric,
}

/// Vhost device metrics keyed by device id.
#[derive(Debug)]
pub struct VhostMetricsPerDevice {
    /// Per device metrics.
    pub metrics: BTreeMap<String, Arc<VhostDeviceMetrics>>,
}

impl VhostMetricsPerDevice {
    /// Returns the metrics of device `id`, allocating them on first use so a re-created
    /// device keeps counting into the same entry.
    pub fn alloc(id: String) -> Arc<VhostDeviceMetrics> {
        Arc::clone(
            VHOST_METRICS
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .metrics
                .entry(id)
                .or_insert_with(|| Arc::new(VhostDeviceMetrics::default())),
        )
    }
}

static VHOST_METRICS: RwLock<VhostMetricsPerDevice> = RwLock::new(VhostMetricsPerDevice {
    metrics: BTreeMap::new(),
});

fn flush_vhost_metrics<S: Serializer>(serializer: S) -> Result<S::Ok, S::Error> {
    let vhost_metrics = VHOST_METRICS.read().unwrap_or_else(PoisonError::into_inner);
    let mut map = serializer.serialize_map(Some(vhost_metrics.metrics.len()))?;
    for (id, metrics) in vhost_metrics.metrics.iter() {
        map.serialize_entry(&format!("vhost_{id}"), metrics)?;
    }
    map.end()
}

// Flattens the per-device map into the top level object.
#[derive(Debug, Default)]
struct VhostMetricsSerializeProxy;

impl Serialize for VhostMetricsSerializeProxy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        flush_vhost_metrics(serializer)
    }
}

// Produces a UTC timestamp when serialized.
#[derive(Debug, Default)]
struct SerializeToUtcTimestampMs;

impl Serialize for SerializeToUtcTimestampMs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        serializer.serialize_u64(u64::try_from(ms).unwrap_or(u64::MAX))
    }
}

/// Root of the flushed metrics object.
#[derive(Debug, Default, Serialize)]
pub struct EngineMetrics {
    utc_timestamp_ms: SerializeToUtcTimestampMs,
    /// Logging related metrics.
    pub logger: LoggerSystemMetrics,
    #[serde(flatten)]
    vhost_ser: VhostMetricsSerializeProxy,
}
impl EngineMetrics {
    /// Empty metrics, usable in statics.
    pub const fn new() -> Self {
        Self {
            utc_timestamp_ms: SerializeToUtcTimestampMs,
            logger: LoggerSystemMetrics::new(),
            vhost_ser: VhostMetricsSerializeProxy,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{ErrorKind, LineWriter};
    use std::thread;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_init_and_write() {
        // Local instance: the global one is shared with other tests.
        let metrics = Metrics::<_, EngineLineWriter>::new(EngineMetrics::new());
        assert!(!metrics.write().unwrap());

        let sink = TempFile::new().unwrap();
        let path = sink.as_path().to_path_buf();
        metrics
            .init(LineWriter::new(sink.as_file().try_clone().unwrap()))
            .unwrap();
        metrics.logger.missed_log_count.inc();
        assert!(metrics.write().unwrap());
        assert!(metrics.write().unwrap());

        let contents = std::fs::read_to_string(path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["logger"]["missed_log_count"], 1);
        assert_eq!(lines[1]["logger"]["missed_log_count"], 0);

        let other = TempFile::new().unwrap();
        assert!(matches!(
            metrics.init(LineWriter::new(other.into_file())),
            Err(MetricsError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_shared_inc_metric_flush_delta() {
        let kicks = SharedIncMetric::new();
        kicks.add(7);
        // One incrementer per vq, like kick handlers on the worker.
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| (0..50_000).for_each(|_| kicks.inc()));
            }
        });

        assert_eq!(kicks.count(), 200_007);
        assert_eq!(kicks.fetch_diff(), 200_007);
        assert_eq!(serde_json::to_string(&kicks).unwrap(), "200007");
        assert_eq!(kicks.fetch_diff(), 0);

        kicks.add(3);
        assert_eq!(serde_json::to_string(&kicks).unwrap(), "3");
        assert_eq!(kicks.count(), 200_010);
    }

    #[test]
    fn test_shared_store_metric_not_reset() {
        let active = SharedStoreMetric::new();
        active.store(2);
        assert_eq!(serde_json::to_string(&active).unwrap(), "2");
        assert_eq!(serde_json::to_string(&active).unwrap(), "2");
        active.store(0);
        assert_eq!(active.fetch(), 0);
    }

    #[test]
    fn test_vhost_device_metrics() {
        let id = String::from("metrics_test_dev");
        let metrics = VhostMetricsPerDevice::alloc(id.clone());
        metrics.kick_count.inc();
        metrics.used_count.add(4);
        assert!(Arc::ptr_eq(&metrics, &VhostMetricsPerDevice::alloc(id)));

        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&EngineMetrics::new()).unwrap()).unwrap();
        assert_eq!(json["vhost_metrics_test_dev"]["kick_count"], 1);
        assert_eq!(json["vhost_metrics_test_dev"]["used_count"], 4);
        assert!(json["utc_timestamp_ms"].as_u64().unwrap() > 0);
        assert_eq!(metrics.kick_count.fetch_diff(), 0);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            MetricsError::AlreadyInitialized.to_string(),
            "Reinitialization of metrics not allowed."
        );
        assert_eq!(
            MetricsError::Write(std::io::Error::new(ErrorKind::Interrupted, "write")).to_string(),
            "Failed to write metrics: write"
        );
        assert_eq!(
            MetricsError::Serde(String::from("bad data")).to_string(),
            "bad data"
        );
    }
}
