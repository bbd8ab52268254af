// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The TCP half of the stack: connection state, the RFC 793 state machine, the socket table
//! and the two background workers which drive them.
//!
//! Lock order, from outermost to innermost: TCB send lock, TCB receive lock, socket table lock.
//! The table lock is never held while acquiring a TCB lock.

use std::fmt;
use std::num::Wrapping;
use std::time::Instant;

pub mod dispatcher;
pub mod engine;
pub mod table;
pub mod tcb;
pub mod timer;

use crate::pdu::tcp::Flags;
use crate::transport::Transport;
use engine::{
    on_event, Connection, ConnectionError, Event, EventStatus, Outbound, Output, TimingConfig,
};
use logger::{debug, IncMetric, METRICS};
use table::SocketTable;
use tcb::Tcb;

// Sequence numbers live in a 2^32 circle; `a` is after `b` when it lies in the half of the
// circle that starts right after `b`.
#[inline]
pub fn seq_at_or_after(a: Wrapping<u32>, b: Wrapping<u32>) -> bool {
    (a - b).0 as i32 >= 0
}

#[inline]
pub fn seq_after(a: Wrapping<u32>, b: Wrapping<u32>) -> bool {
    (a - b).0 as i32 > 0
}

/// Connection states, as named by RFC 793.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No connection.
    Closed,
    /// Waiting for a connection request from any remote endpoint.
    Listen,
    /// Waiting for a matching connection request after having sent one.
    SynSent,
    /// Waiting for the acknowledgment of our connection request.
    SynReceived,
    /// Data can flow both ways.
    Established,
    /// Waiting for the acknowledgment of our `FIN`, or for the remote `FIN`.
    FinWait1,
    /// Waiting for the remote `FIN`.
    FinWait2,
    /// The remote end is done sending; waiting for the local user to close.
    CloseWait,
    /// Both ends sent a `FIN`; waiting for the acknowledgment of ours.
    Closing,
    /// Waiting for the acknowledgment of our `FIN`, after the remote end closed first.
    LastAck,
    /// Holding the connection so the remote end receives the acknowledgment of its `FIN`.
    TimeWait,
}

impl State {
    /// Whether sequence numbers have been exchanged in both directions.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, State::Closed | State::Listen | State::SynSent)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Closed => "CLOSED",
            State::Listen => "LISTEN",
            State::SynSent => "SYN_SENT",
            State::SynReceived => "SYN_RECEIVED",
            State::Established => "ESTABLISHED",
            State::FinWait1 => "FIN_WAIT_1",
            State::FinWait2 => "FIN_WAIT_2",
            State::CloseWait => "CLOSE_WAIT",
            State::Closing => "CLOSING",
            State::LastAck => "LAST_ACK",
            State::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}

/// Writes `segments` to the wire. Failures are counted and logged; the retransmission timer
/// takes care of anything that got lost.
pub(crate) fn transmit(transport: &dyn Transport, segments: &[Outbound]) {
    let mut buf = [0u8; engine::MAX_SEGMENT_LEN];

    for segment in segments {
        let len = match segment.encode(&mut buf) {
            Ok(len) => len,
            Err(err) => {
                debug!("Failed to encode segment for {}: {}", segment.dst, err);
                METRICS.tx.errors.inc();
                continue;
            }
        };

        match transport.send_segment(*segment.src.ip(), *segment.dst.ip(), &buf[..len]) {
            Ok(()) => {
                METRICS.tx.segments.inc();
                METRICS.tx.bytes.add(len as u64);
                if segment.header.flags.contains(Flags::RST) {
                    METRICS.tx.resets.inc();
                }
            }
            Err(err) => {
                debug!("Failed to send segment to {}: {}", segment.dst, err);
                METRICS.tx.errors.inc();
            }
        }
    }
}

/// Runs `event` against `tcb`, then sends whatever it produced.
///
/// Table bindings change and readers are woken while the TCB is still locked; the segments go
/// out only after both TCB locks are released.
pub(crate) fn process(
    tcb: &Tcb,
    table: &SocketTable,
    transport: &dyn Transport,
    timing: &TimingConfig,
    event: Event<'_>,
    now: Instant,
) -> Result<Output, ConnectionError> {
    let output = {
        let (mut snd, mut rcv) = tcb.lock_both();
        let mut conn = Connection {
            snd: &mut snd,
            rcv: &mut rcv,
            timing,
        };
        let output = on_event(&mut conn, event, now)?;
        if let Some(binding) = output.binding {
            table.apply(tcb.index(), binding);
        }
        if output.wake_readers {
            tcb.notify_readers();
        }
        output
    };

    transmit(transport, &output.segments);
    record(tcb.index(), output.status);
    Ok(output)
}

// Updates the counters for what happened to connection `index`.
fn record(index: usize, status: EventStatus) {
    if status.contains(EventStatus::ESTABLISHED) {
        METRICS.connections.established.inc();
        debug!("Socket {} established", index);
    }
    if status.contains(EventStatus::CLOSED) {
        METRICS.connections.closed.inc();
        debug!("Socket {} closed", index);
    }
    if status.contains(EventStatus::TIMED_OUT) {
        METRICS.connections.timed_out.inc();
        debug!("Socket {} ran out of retransmissions", index);
    }
    if status.contains(EventStatus::ABORTED) {
        METRICS.connections.aborted.inc();
    }
    if status.contains(EventStatus::RESET_RECEIVED) {
        METRICS.rx.resets.inc();
    }
    if status.contains(EventStatus::RETRANSMITTED) {
        METRICS.tx.retransmissions.inc();
    }
    if status.contains(EventStatus::DUP_ACK) {
        METRICS.rx.dup_acks.inc();
    }
    if status.contains(EventStatus::OUT_OF_WINDOW) {
        METRICS.rx.out_of_window.inc();
    }
    if status.contains(EventStatus::INVALID_ACK) {
        debug!("Socket {} got an acknowledgment for unsent data", index);
    }
    if status.contains(EventStatus::RETURNED_TO_LISTEN) {
        debug!("Socket {} is listening again", index);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_seq_at_or_after() {
        let a = Wrapping(123);
        let b = a + Wrapping(100);
        let c = a + Wrapping(1 << 31);

        assert!(seq_at_or_after(a, a));
        assert!(!seq_after(a, a));
        assert!(seq_at_or_after(b, a));
        assert!(seq_after(b, a));
        assert!(!seq_at_or_after(a, b));
        assert!(!seq_after(a, b));
        // Exactly half the circle away counts as before.
        assert!(!seq_at_or_after(c, a));
        assert!(!seq_after(c, a));
    }

    #[test]
    fn test_seq_wraparound() {
        let before = Wrapping(0xffff_fff0u32);
        let after = Wrapping(0x0000_0005u32);

        assert!(seq_after(after, before));
        assert!(!seq_after(before, after));
        assert!(seq_at_or_after(after, before));
        assert_eq!((after - before).0, 0x15);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(State::FinWait1.to_string(), "FIN_WAIT_1");
        assert_eq!(State::TimeWait.to_string(), "TIME_WAIT");
        assert!(!State::SynSent.is_synchronized());
        assert!(State::SynReceived.is_synchronized());
    }

    proptest! {
        #[test]
        fn test_seq_order_is_antisymmetric(a in any::<u32>(), delta in 1u32..(1 << 31)) {
            let a = Wrapping(a);
            let b = a + Wrapping(delta);
            prop_assert!(seq_after(b, a));
            prop_assert!(!seq_after(a, b));
            prop_assert!(!seq_at_or_after(a, b));
        }
    }
}
