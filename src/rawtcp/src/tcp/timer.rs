// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The retransmission timer thread.
//!
//! A periodic `timerfd` wakes the thread up, which then visits every TCB in use with a
//! `RetransmitTimeout` event. The state machine decides whether a deadline actually passed.
//! A second, slower `timerfd` flushes the metrics.

use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use logger::{debug, error, warn, IncMetric, METRICS};
use timerfd::{ClockId, SetTimeFlags, TimerFd, TimerState};
use utils::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use utils::eventfd::EventFd;

use crate::tcp::engine::{Event, TimingConfig};
use crate::tcp::process;
use crate::tcp::table::SocketTable;
use crate::transport::Transport;

const TIMER_TOKEN: u64 = 0;
const EXIT_TOKEN: u64 = 1;
const METRICS_TOKEN: u64 = 2;

/// Appends one JSON line with the current counters to the metrics file, if there is one.
pub(crate) fn write_metrics() {
    if let Err(err) = METRICS.write() {
        METRICS.logger.missed_metrics_count.inc();
        error!("Failed to write metrics: {}", err);
    }
}

fn periodic_timer(period: Duration) -> Result<TimerFd, io::Error> {
    let mut timer_fd = TimerFd::new_custom(ClockId::Monotonic, true, true)?;
    timer_fd.set_state(
        TimerState::Periodic {
            current: period,
            interval: period,
        },
        SetTimeFlags::Default,
    );
    Ok(timer_fd)
}

/// Drives retransmissions and `TIME_WAIT` expiry for every socket of a stack.
#[derive(Debug)]
pub struct RetransmitTimer {
    table: Arc<SocketTable>,
    transport: Arc<dyn Transport>,
    timing: TimingConfig,
    timer_fd: TimerFd,
    metrics_fd: TimerFd,
    epoll: Epoll,
}

impl RetransmitTimer {
    /// Creates a timer firing every `tick` and writing metrics every `metrics_interval`. The
    /// thread running it exits once `exit_evt` is written to.
    pub fn new(
        table: Arc<SocketTable>,
        transport: Arc<dyn Transport>,
        timing: TimingConfig,
        tick: Duration,
        metrics_interval: Duration,
        exit_evt: &EventFd,
    ) -> Result<Self, io::Error> {
        let timer_fd = periodic_timer(tick)?;
        let metrics_fd = periodic_timer(metrics_interval)?;

        let epoll = Epoll::new()?;
        epoll.ctl(
            ControlOperation::Add,
            timer_fd.as_raw_fd(),
            EpollEvent::new(EventSet::IN, TIMER_TOKEN),
        )?;
        epoll.ctl(
            ControlOperation::Add,
            metrics_fd.as_raw_fd(),
            EpollEvent::new(EventSet::IN, METRICS_TOKEN),
        )?;
        epoll.ctl(
            ControlOperation::Add,
            exit_evt.as_raw_fd(),
            EpollEvent::new(EventSet::IN, EXIT_TOKEN),
        )?;

        Ok(RetransmitTimer {
            table,
            transport,
            timing,
            timer_fd,
            metrics_fd,
            epoll,
        })
    }

    /// Ticks until asked to exit.
    pub fn run(self) {
        let mut events = [EpollEvent::default(); 3];
        loop {
            let count = match self.epoll.wait(-1, &mut events) {
                Ok(count) => count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("Retransmission timer failed to wait for events: {}", err);
                    return;
                }
            };

            let ready = &events[..count];
            if ready.iter().any(|event| event.data() == EXIT_TOKEN) {
                debug!("Retransmission timer exiting");
                return;
            }
            for event in ready {
                match event.data() {
                    TIMER_TOKEN => {
                        // Expirations we slept through only count once.
                        self.timer_fd.read();
                        self.tick(Instant::now());
                    }
                    METRICS_TOKEN => {
                        self.metrics_fd.read();
                        write_metrics();
                    }
                    other => warn!("Retransmission timer got an unknown event: {}", other),
                }
            }
        }
    }

    /// Visits every socket in use, one at a time.
    pub fn tick(&self, now: Instant) {
        for tcb in self.table.in_use() {
            if let Err(err) = process(
                &tcb,
                &self.table,
                self.transport.as_ref(),
                &self.timing,
                Event::RetransmitTimeout,
                now,
            ) {
                debug!("Socket {}: {}", tcb.index(), err);
            }
        }
    }
}
