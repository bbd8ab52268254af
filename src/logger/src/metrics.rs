// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines the metrics system.
//!
//! # Metrics format
//! Each call to [`Metrics::write`] flushes one JSON line. The first field is always the
//! timestamp, followed by one object per group of counters:
//!
//! ```json
//! {
//!  "utc_timestamp_ms": 1541591155180,
//!  "logger": { "missed_metrics_count": 0, "metrics_fails": 0, "missed_log_count": 0 },
//!  "rx": { "packets": 12, "bytes": 640, "bad_ip": 0, "bad_segment": 1, ... },
//!  "tx": { "segments": 9, "bytes": 468, "errors": 0, "resets": 1, "retransmissions": 0 },
//!  "connections": { "established": 1, "closed": 0, "aborted": 0, "timed_out": 0 }
//! }
//! ```
//!
//! # Design
//! Counters are lockless `SharedIncMetric`s living in a global non-mut static, so the receive
//! dispatcher, the retransmission timer and user threads can all bump them. They store two
//! values (current and previous) and serialization reports the delta since the last flush.

use std::fmt::Debug;
use std::io::Write;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use serde::{Serialize, Serializer};

use crate::{extract_guard, MetricsLineWriter};

/// Static instance used for handling metrics.
pub static METRICS: Metrics<TcpStackMetrics, MetricsLineWriter> =
    Metrics::<TcpStackMetrics, MetricsLineWriter>::new(TcpStackMetrics::new());

/// Metrics system.
// All member fields have types which are Sync, and exhibit interior mutability, so
// we can call operations on metrics using a non-mut static global variable.
#[derive(Debug)]
pub struct Metrics<T: Serialize, M: Write + Send> {
    // Metrics will get flushed here.
    metrics_buf: OnceLock<Mutex<M>>,
    /// The counters themselves.
    pub app_metrics: T,
}

impl<T: Serialize + Debug, M: Write + Send + Debug> Metrics<T, M> {
    /// Creates a new instance of the current metrics.
    pub const fn new(app_metrics: T) -> Metrics<T, M> {
        Metrics {
            metrics_buf: OnceLock::new(),
            app_metrics,
        }
    }

    /// Initialize metrics system (once and only once).
    ///
    /// * `metrics_dest` - Buffer for JSON formatted metrics. Needs to implement `Write` and `Send`.
    pub fn init(&self, metrics_dest: M) -> Result<(), MetricsError> {
        self.metrics_buf
            .set(Mutex::new(metrics_dest))
            .map_err(|_| MetricsError::AlreadyInitialized)
    }

    /// Writes metrics to the destination provided upon initialization.
    ///
    /// Returns `Ok(true)` when the metrics were written and `Ok(false)` when the system was
    /// never initialized.
    pub fn write(&self) -> Result<bool, MetricsError> {
        let Some(lock) = self.metrics_buf.get() else {
            return Ok(false);
        };

        let msg = serde_json::to_string(&self.app_metrics)
            .map_err(|err| MetricsError::Serde(err.to_string()))?;
        // No need to explicitly call flush because the underlying LineWriter flushes
        // automatically whenever a newline is detected.
        extract_guard(lock.lock())
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

/// Describes the errors which may occur while handling metrics scenarios.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MetricsError {
    /// Reinitialization of metrics not allowed.
    AlreadyInitialized,
    /// {0}
    Serde(String),
    /// Failed to write metrics: {0}
    Write(std::io::Error),
}

/// Used for defining new types of metrics that act as a counter (i.e they are continuously updated
/// by incrementing their value).
pub trait IncMetric {
    /// Adds `value` to the current counter.
    fn add(&self, value: u64);
    /// Increments by 1 unit the current counter.
    fn inc(&self) {
        self.add(1);
    }
    /// Returns current value of the counter.
    fn count(&self) -> u64;
}

/// Representation of a metric that is expected to be incremented from more than one thread, so more
/// synchronization is necessary.
// 1st member - current value being updated
// 2nd member - old value that gets the current value whenever metrics is flushed
#[derive(Debug, Default)]
pub struct SharedIncMetric(AtomicU64, AtomicU64);
impl SharedIncMetric {
    /// Const default construction.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0), AtomicU64::new(0))
    }
}

impl IncMetric for SharedIncMetric {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Serialize for SharedIncMetric {
    /// Reset counters of each metrics. Here we suppose that Serialize's goal is to help with the
    /// flushing of metrics.
    /// !!! Any print of the metrics will also reset them. Use with caution !!!
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let snapshot = self.0.load(Ordering::Relaxed);
        let res = serializer.serialize_u64(snapshot - self.1.load(Ordering::Relaxed));

        if res.is_ok() {
            self.1.store(snapshot, Ordering::Relaxed);
        }
        res
    }
}

/// Metrics for the logging subsystem.
#[derive(Debug, Default, Serialize)]
pub struct LoggerSystemMetrics {
    /// Number of misses on flushing metrics.
    pub missed_metrics_count: SharedIncMetric,
    /// Number of errors during metrics handling.
    pub metrics_fails: SharedIncMetric,
    /// Number of misses on logging human readable content.
    pub missed_log_count: SharedIncMetric,
}
impl LoggerSystemMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            missed_metrics_count: SharedIncMetric::new(),
            metrics_fails: SharedIncMetric::new(),
            missed_log_count: SharedIncMetric::new(),
        }
    }
}

/// Inbound path counters, maintained by the receive dispatcher.
#[derive(Debug, Default, Serialize)]
pub struct ReceiveMetrics {
    /// Packets read from the transport.
    pub packets: SharedIncMetric,
    /// Bytes read from the transport.
    pub bytes: SharedIncMetric,
    /// Packets dropped because of an invalid IPv4 header.
    pub bad_ip: SharedIncMetric,
    /// Segments dropped because of a bad checksum or header length.
    pub bad_segment: SharedIncMetric,
    /// Packets carrying another protocol or addressed to someone else.
    pub not_for_us: SharedIncMetric,
    /// Segments that matched no socket.
    pub no_socket: SharedIncMetric,
    /// Segments dropped by a connection for being out of order or out of window.
    pub out_of_window: SharedIncMetric,
    /// Duplicate acknowledgements.
    pub dup_acks: SharedIncMetric,
    /// Valid resets received.
    pub resets: SharedIncMetric,
    /// Transport read failures.
    pub errors: SharedIncMetric,
}
impl ReceiveMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            packets: SharedIncMetric::new(),
            bytes: SharedIncMetric::new(),
            bad_ip: SharedIncMetric::new(),
            bad_segment: SharedIncMetric::new(),
            not_for_us: SharedIncMetric::new(),
            no_socket: SharedIncMetric::new(),
            out_of_window: SharedIncMetric::new(),
            dup_acks: SharedIncMetric::new(),
            resets: SharedIncMetric::new(),
            errors: SharedIncMetric::new(),
        }
    }
}

/// Outbound path counters.
#[derive(Debug, Default, Serialize)]
pub struct TransmitMetrics {
    /// Segments handed to the transport.
    pub segments: SharedIncMetric,
    /// Bytes handed to the transport.
    pub bytes: SharedIncMetric,
    /// Segments the transport failed to send.
    pub errors: SharedIncMetric,
    /// Resets sent.
    pub resets: SharedIncMetric,
    /// Segments sent again by the retransmission timer.
    pub retransmissions: SharedIncMetric,
}
impl TransmitMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            segments: SharedIncMetric::new(),
            bytes: SharedIncMetric::new(),
            errors: SharedIncMetric::new(),
            resets: SharedIncMetric::new(),
            retransmissions: SharedIncMetric::new(),
        }
    }
}

/// Connection lifecycle counters.
#[derive(Debug, Default, Serialize)]
pub struct ConnectionMetrics {
    /// Connections that reached ESTABLISHED.
    pub established: SharedIncMetric,
    /// Connections that reached CLOSED in an orderly way.
    pub closed: SharedIncMetric,
    /// Connections aborted by a reset.
    pub aborted: SharedIncMetric,
    /// Connections aborted after running out of retransmissions.
    pub timed_out: SharedIncMetric,
}
impl ConnectionMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            established: SharedIncMetric::new(),
            closed: SharedIncMetric::new(),
            aborted: SharedIncMetric::new(),
            timed_out: SharedIncMetric::new(),
        }
    }
}

// Serializes as the current wall clock time.
#[derive(Debug, Default)]
struct SerializeToUtcTimestampMs;
impl SerializeToUtcTimestampMs {
    /// Const default construction.
    pub const fn new() -> Self {
        SerializeToUtcTimestampMs
    }
}

impl Serialize for SerializeToUtcTimestampMs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(utils::time::unix_time_ms())
    }
}

/// Structure storing all metrics while enforcing serialization support on them.
#[derive(Debug, Default, Serialize)]
pub struct TcpStackMetrics {
    utc_timestamp_ms: SerializeToUtcTimestampMs,
    /// Logging related metrics.
    pub logger: LoggerSystemMetrics,
    /// Inbound path metrics.
    pub rx: ReceiveMetrics,
    /// Outbound path metrics.
    pub tx: TransmitMetrics,
    /// Connection lifecycle metrics.
    pub connections: ConnectionMetrics,
}
impl TcpStackMetrics {
    /// Const default construction.
    pub const fn new() -> Self {
        Self {
            utc_timestamp_ms: SerializeToUtcTimestampMs::new(),
            logger: LoggerSystemMetrics::new(),
            rx: ReceiveMetrics::new(),
            tx: TransmitMetrics::new(),
            connections: ConnectionMetrics::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::LineWriter;
    use std::sync::Arc;
    use std::thread;

    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    #[test]
    fn test_init() {
        // Use a local instance so the test does not race with anything touching METRICS.
        let m = &Metrics::<_, MetricsLineWriter>::new(TcpStackMetrics::new());

        // Trying to write metrics, when metrics system is not initialized, should not throw error.
        assert!(!m.write().unwrap());

        let f = TempFile::new().expect("Failed to create temporary metrics file");
        m.init(LineWriter::new(f.into_file())).unwrap();
        assert!(m.write().unwrap());

        let f = TempFile::new().expect("Failed to create temporary metrics file");
        m.init(LineWriter::new(f.into_file())).unwrap_err();
    }

    #[test]
    fn test_shared_inc_metric() {
        let metric = Arc::new(SharedIncMetric::default());

        const NUM_THREADS_TO_SPAWN: usize = 4;
        const NUM_INCREMENTS_PER_THREAD: u64 = 10_000;
        const M2_INITIAL_COUNT: u64 = 123;

        metric.add(M2_INITIAL_COUNT);

        let mut v = Vec::with_capacity(NUM_THREADS_TO_SPAWN);
        for _ in 0..NUM_THREADS_TO_SPAWN {
            let r = metric.clone();
            v.push(thread::spawn(move || {
                for _ in 0..NUM_INCREMENTS_PER_THREAD {
                    r.inc();
                }
            }));
        }

        for handle in v {
            handle.join().unwrap();
        }

        assert_eq!(
            metric.count(),
            M2_INITIAL_COUNT + NUM_THREADS_TO_SPAWN as u64 * NUM_INCREMENTS_PER_THREAD
        );
    }

    #[test]
    fn test_serialize_reports_delta() {
        let m = TcpStackMetrics::new();
        m.rx.packets.add(3);
        m.tx.retransmissions.inc();

        let first: serde_json::Value = serde_json::to_value(&m).unwrap();
        assert_eq!(first["rx"]["packets"], 3);
        assert_eq!(first["tx"]["retransmissions"], 1);
        assert_eq!(first["connections"]["established"], 0);
        assert!(first["utc_timestamp_ms"].as_u64().unwrap() > 0);

        // Serializing resets the reported values but not the running count.
        m.rx.packets.inc();
        let second: serde_json::Value = serde_json::to_value(&m).unwrap();
        assert_eq!(second["rx"]["packets"], 1);
        assert_eq!(second["tx"]["retransmissions"], 0);
        assert_eq!(m.rx.packets.count(), 4);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            format!("{}", MetricsError::AlreadyInitialized),
            "Reinitialization of metrics not allowed."
        );
        assert_eq!(
            format!(
                "{}",
                MetricsError::Write(std::io::Error::from_raw_os_error(libc::EAGAIN))
            ),
            format!(
                "Failed to write metrics: {}",
                std::io::Error::from_raw_os_error(libc::EAGAIN)
            )
        );
    }
}
