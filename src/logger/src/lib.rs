// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! Logging and metrics for the user-space TCP stack.

mod logging;
mod metrics;

use std::sync::LockResult;

pub use log::Level::*;
pub use log::*;

pub use crate::logging::{
    LevelFilter, LevelFilterFromStrError, Logger, LoggerConfig, LoggerUpdateError, DEFAULT_LEVEL,
    LOGGER,
};
pub use crate::metrics::{
    ConnectionMetrics, IncMetric, LoggerSystemMetrics, Metrics, MetricsError, ReceiveMetrics,
    SharedIncMetric, TcpStackMetrics, TransmitMetrics, METRICS,
};

/// Alias for `std::io::LineWriter<std::fs::File>`.
pub type MetricsLineWriter = std::io::LineWriter<std::fs::File>;

/// Recovers the guard of a lock whose holder panicked.
pub fn extract_guard<G>(lock_result: LockResult<G>) -> G {
    match lock_result {
        Ok(guard) => guard,
        // If a thread panics while holding this lock, the data within should still be usable.
        Err(poisoned) => poisoned.into_inner(),
    }
}
