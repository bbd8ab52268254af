// Copyright 2019 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Wall clock helpers for log lines and metrics timestamps.

use std::fmt;

const MILLIS_PER_SECOND: u64 = 1_000;
const NANOS_PER_MILLISECOND: i64 = 1_000_000;

fn realtime() -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `now` is a valid timespec to write to, and CLOCK_REALTIME always exists.
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
    now
}

/// Milliseconds since the Unix epoch.
pub fn unix_time_ms() -> u64 {
    let now = realtime();
    u64::try_from(now.tv_sec)
        .unwrap_or(0)
        .saturating_mul(MILLIS_PER_SECOND)
        .saturating_add(u64::try_from(now.tv_nsec / NANOS_PER_MILLISECOND).unwrap_or(0))
}

/// A broken-down local date and time, with nanoseconds.
#[derive(Debug, Default)]
pub struct LocalTime {
    year: i32,
    // 0 to 11.
    month: i32,
    day: i32,
    hour: i32,
    min: i32,
    sec: i32,
    nsec: i64,
}

impl LocalTime {
    /// Reads the wall clock.
    pub fn now() -> LocalTime {
        let now = realtime();
        // SAFETY: `tm` is plain old data; all-zeroes is a valid value for it.
        let mut tm: libc::tm = unsafe { std::mem::zeroed() };
        // SAFETY: Both pointers are valid for the duration of the call.
        unsafe { libc::localtime_r(&now.tv_sec, &mut tm) };
        LocalTime {
            year: tm.tm_year + 1900,
            month: tm.tm_mon,
            day: tm.tm_mday,
            hour: tm.tm_hour,
            min: tm.tm_min,
            sec: tm.tm_sec,
            nsec: now.tv_nsec,
        }
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}",
            self.year,
            self.month + 1,
            self.day,
            self.hour,
            self.min,
            self.sec,
            self.nsec
        )
    }
}
