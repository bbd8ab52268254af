// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transmission control blocks.
//!
//! A [`Tcb`] is split in two halves guarded by separate locks, so readers blocked on the
//! receive half do not stall the sender. Whoever needs both takes the send lock first.

use std::cmp::min;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::num::Wrapping;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

use logger::extract_guard;
use utils::ring_buffer::RingBuffer;

use crate::pdu::tcp::Flags;
use crate::tcp::engine::ConnectionError;
use crate::tcp::State;
use crate::{RECVBUFLEN, RETRBUFLEN, SENDBUFLEN};

/// The segment currently in flight, kept around until the remote end acknowledges it.
#[derive(Debug, Clone)]
pub struct RetransmitSlot {
    /// Sequence number of the first octet (or of the `SYN`).
    pub seq: Wrapping<u32>,
    /// Which of `SYN` and `FIN` the segment carries.
    pub flags: Flags,
    payload: [u8; RETRBUFLEN],
    len: usize,
}

impl Default for RetransmitSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl RetransmitSlot {
    /// An empty slot.
    pub const fn new() -> Self {
        RetransmitSlot {
            seq: Wrapping(0),
            flags: Flags::empty(),
            payload: [0; RETRBUFLEN],
            len: 0,
        }
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len == 0 && self.flags.is_empty()
    }

    /// Data carried by the in-flight segment.
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len]
    }

    /// Sequence space covered by the in-flight segment.
    pub fn sequence_len(&self) -> u32 {
        let mut len = self.len as u32;
        if self.flags.contains(Flags::SYN) {
            len += 1;
        }
        if self.flags.contains(Flags::FIN) {
            len += 1;
        }
        len
    }

    /// Records a control segment without data.
    pub fn load_control(&mut self, seq: Wrapping<u32>, flags: Flags) {
        self.seq = seq;
        self.flags = flags & (Flags::SYN | Flags::FIN);
        self.len = 0;
    }

    /// Moves up to `max_len` bytes out of `queue` into the slot and returns how many moved.
    pub fn load<const N: usize>(
        &mut self,
        seq: Wrapping<u32>,
        flags: Flags,
        queue: &mut RingBuffer<N>,
        max_len: usize,
    ) -> usize {
        let len = min(max_len, RETRBUFLEN);
        let len = queue.peek(0, &mut self.payload[..len]);
        queue.consume(len);
        self.seq = seq;
        self.flags = flags & (Flags::SYN | Flags::FIN);
        self.len = len;
        len
    }

    /// Drops the first `count` data bytes, after the remote end acknowledged them.
    pub fn advance(&mut self, count: usize) {
        let count = min(count, self.len);
        self.payload.copy_within(count..self.len, 0);
        self.len -= count;
        self.seq += Wrapping(count as u32);
    }

    /// Forgets the in-flight segment.
    pub fn clear(&mut self) {
        self.flags = Flags::empty();
        self.len = 0;
    }
}

/// Retransmission bookkeeping for the in-flight segment.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    /// Whether the deadline is meaningful.
    pub armed: bool,
    /// When the in-flight segment is to be sent again.
    pub deadline: Instant,
    /// Retransmissions since the last acceptable acknowledgment.
    pub count: u32,
}

impl RetryState {
    fn new() -> Self {
        RetryState {
            armed: false,
            deadline: Instant::now(),
            count: 0,
        }
    }

    /// Stops the timer and resets the retry count.
    pub fn disarm(&mut self) {
        self.armed = false;
        self.count = 0;
    }
}

/// The half of a TCB which sending, closing and acknowledgment processing work with.
#[derive(Debug)]
pub struct SendSide {
    pub state: State,
    /// Set when the connection was initiated locally.
    pub active_open: bool,
    pub local: SocketAddrV4,
    pub remote: Option<SocketAddrV4>,
    /// SND.UNA: oldest unacknowledged sequence number.
    pub una: Wrapping<u32>,
    /// SND.NXT: next sequence number to be sent.
    pub nxt: Wrapping<u32>,
    /// SND.WND: window advertised by the remote end.
    pub wnd: u16,
    /// SND.UP: send urgent pointer.
    pub up: Wrapping<u32>,
    /// SND.WL1: sequence number of the segment used for the last window update.
    pub wl1: Wrapping<u32>,
    /// SND.WL2: acknowledgment number of the segment used for the last window update.
    pub wl2: Wrapping<u32>,
    /// ISS: initial send sequence number.
    pub iss: Wrapping<u32>,
    /// Data queued by the user and not transmitted yet.
    pub buf: RingBuffer<SENDBUFLEN>,
    pub retr: RetransmitSlot,
    pub retry: RetryState,
    /// Sequence number of our `FIN`, once it has been sent.
    pub fin_seq: Option<Wrapping<u32>>,
    /// The user asked for the connection to be closed; the `FIN` follows any queued data.
    pub close_requested: bool,
    pub time_wait_deadline: Option<Instant>,
}

impl SendSide {
    pub(crate) fn new(local: SocketAddrV4) -> Self {
        SendSide {
            state: State::Closed,
            active_open: false,
            local,
            remote: None,
            una: Wrapping(0),
            nxt: Wrapping(0),
            wnd: 0,
            up: Wrapping(0),
            wl1: Wrapping(0),
            wl2: Wrapping(0),
            iss: Wrapping(0),
            buf: RingBuffer::new(),
            retr: RetransmitSlot::new(),
            retry: RetryState::new(),
            fin_seq: None,
            close_requested: false,
            time_wait_deadline: None,
        }
    }

    /// Forgets everything about the previous connection, keeping the local address and state.
    pub fn clear_connection(&mut self) {
        let state = self.state;
        *self = SendSide::new(self.local);
        self.state = state;
    }
}

/// Why no more data will arrive on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvShutdown {
    /// Orderly end of stream: the remote end sent a `FIN`, or the connection was closed.
    Eof,
    /// The connection was reset or aborted.
    Reset,
}

/// The half of a TCB which received data and readers work with.
#[derive(Debug)]
pub struct RecvSide {
    /// RCV.NXT: next sequence number expected.
    pub nxt: Wrapping<u32>,
    /// RCV.WND: free space in the receive buffer.
    pub wnd: u16,
    /// RCV.UP: receive urgent pointer.
    pub up: Wrapping<u32>,
    /// IRS: initial receive sequence number.
    pub irs: Wrapping<u32>,
    pub buf: RingBuffer<RECVBUFLEN>,
    pub shutdown: Option<RecvShutdown>,
}

impl RecvSide {
    pub(crate) fn new() -> Self {
        RecvSide {
            nxt: Wrapping(0),
            wnd: RECVBUFLEN as u16,
            up: Wrapping(0),
            irs: Wrapping(0),
            buf: RingBuffer::new(),
            // Nothing will ever arrive on a socket which has not been opened.
            shutdown: Some(RecvShutdown::Eof),
        }
    }

    /// Prepares for a new connection.
    pub fn reopen(&mut self) {
        *self = RecvSide::new();
        self.shutdown = None;
    }

    /// Recomputes RCV.WND from the free receive buffer space.
    pub fn update_window(&mut self) {
        self.wnd = u16::try_from(self.buf.free()).unwrap_or(u16::MAX);
    }

    /// Discards buffered data and marks the connection as reset.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.update_window();
        self.shutdown = Some(RecvShutdown::Reset);
    }

    // Copies out whatever is buffered and reports whether the window went from zero to open.
    fn take(&mut self, buf: &mut [u8]) -> ReadOutcome {
        let was_closed = self.wnd == 0;
        let len = self.buf.read(buf);
        self.update_window();
        ReadOutcome {
            len,
            window_reopened: was_closed && self.wnd > 0,
        }
    }
}

/// What a successful read produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes copied to the caller; 0 means nothing was available (or end of stream for blocking
    /// reads).
    pub len: usize,
    /// The read reopened a zero receive window, so the remote end should be told.
    pub window_reopened: bool,
}

/// A transmission control block: the whole state of one connection.
#[derive(Debug)]
pub struct Tcb {
    index: usize,
    send: Mutex<SendSide>,
    recv: Mutex<RecvSide>,
    data_ready: Condvar,
}

impl Tcb {
    /// A closed TCB for the socket table slot `index`.
    pub fn new(index: usize) -> Self {
        Tcb {
            index,
            send: Mutex::new(SendSide::new(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))),
            recv: Mutex::new(RecvSide::new()),
            data_ready: Condvar::new(),
        }
    }

    /// The socket table slot this TCB lives in.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn lock_send(&self) -> MutexGuard<'_, SendSide> {
        extract_guard(self.send.lock())
    }

    pub fn lock_recv(&self) -> MutexGuard<'_, RecvSide> {
        extract_guard(self.recv.lock())
    }

    /// Takes both locks, in order.
    pub fn lock_both(&self) -> (MutexGuard<'_, SendSide>, MutexGuard<'_, RecvSide>) {
        let snd = self.lock_send();
        let rcv = self.lock_recv();
        (snd, rcv)
    }

    /// Reinitializes a freshly allocated TCB.
    pub fn reset(&self, local: SocketAddrV4) {
        let (mut snd, mut rcv) = self.lock_both();
        *snd = SendSide::new(local);
        *rcv = RecvSide::new();
    }

    pub fn state(&self) -> State {
        self.lock_send().state
    }

    /// Wakes every reader blocked in `read_blocking`.
    pub fn notify_readers(&self) {
        self.data_ready.notify_all();
    }

    /// Copies buffered data into `buf` without waiting.
    ///
    /// Returns a length of 0 when nothing is buffered, and fails only if the connection has
    /// been reset.
    pub fn read_nonblocking(&self, buf: &mut [u8]) -> Result<ReadOutcome, ConnectionError> {
        let mut rcv = self.lock_recv();
        if rcv.buf.is_empty() {
            return match rcv.shutdown {
                Some(RecvShutdown::Reset) => Err(ConnectionError::ConnectionReset),
                _ => Ok(ReadOutcome {
                    len: 0,
                    window_reopened: false,
                }),
            };
        }

        let outcome = rcv.take(buf);
        self.pass_on(&rcv);
        Ok(outcome)
    }

    /// Waits until at least one byte is available, or the connection terminates.
    ///
    /// Returns a length of 0 on orderly end of stream, and `ConnectionReset` if the connection
    /// was reset or aborted.
    pub fn read_blocking(&self, buf: &mut [u8]) -> Result<ReadOutcome, ConnectionError> {
        let mut rcv = self.lock_recv();
        loop {
            if buf.is_empty() || !rcv.buf.is_empty() {
                let outcome = rcv.take(buf);
                self.pass_on(&rcv);
                return Ok(outcome);
            }

            match rcv.shutdown {
                Some(RecvShutdown::Reset) => return Err(ConnectionError::ConnectionReset),
                Some(RecvShutdown::Eof) => {
                    return Ok(ReadOutcome {
                        len: 0,
                        window_reopened: false,
                    })
                }
                None => rcv = extract_guard(self.data_ready.wait(rcv)),
            }
        }
    }

    // A reader that left data behind hands the wakeup on to the next one.
    fn pass_on(&self, rcv: &RecvSide) {
        if !rcv.buf.is_empty() {
            self.data_ready.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_retransmit_slot() {
        let mut queue = RingBuffer::<SENDBUFLEN>::new();
        queue.write(b"abcdef");

        let mut slot = RetransmitSlot::new();
        assert!(slot.is_empty());

        assert_eq!(
            slot.load(Wrapping(u32::MAX - 1), Flags::FIN | Flags::ACK, &mut queue, 4),
            4
        );
        assert_eq!(slot.payload(), b"abcd");
        assert_eq!(slot.flags, Flags::FIN);
        assert_eq!(slot.sequence_len(), 5);
        assert_eq!(queue.len(), 2);

        slot.advance(3);
        assert_eq!(slot.payload(), b"d");
        assert_eq!(slot.seq, Wrapping(1));

        slot.clear();
        assert!(slot.is_empty());

        slot.load_control(Wrapping(7), Flags::SYN);
        assert!(!slot.is_empty());
        assert_eq!(slot.sequence_len(), 1);
    }

    #[test]
    fn test_fresh_tcb_reads_end_of_stream() {
        let tcb = Tcb::new(3);
        assert_eq!(tcb.index(), 3);
        assert_eq!(tcb.state(), State::Closed);

        let mut buf = [0u8; 8];
        assert_eq!(tcb.read_nonblocking(&mut buf).unwrap().len, 0);
        assert_eq!(tcb.read_blocking(&mut buf).unwrap().len, 0);
    }

    #[test]
    fn test_read_reports_reopened_window() {
        let tcb = Tcb::new(0);
        {
            let mut rcv = tcb.lock_recv();
            rcv.reopen();
            rcv.buf.write(&[1u8; RECVBUFLEN]);
            rcv.update_window();
            assert_eq!(rcv.wnd, 0);
        }

        let mut buf = [0u8; 16];
        let outcome = tcb.read_nonblocking(&mut buf).unwrap();
        assert_eq!(outcome.len, 16);
        assert!(outcome.window_reopened);
        assert_eq!(tcb.lock_recv().wnd, 16);

        let outcome = tcb.read_nonblocking(&mut buf).unwrap();
        assert!(!outcome.window_reopened);
    }

    #[test]
    fn test_read_after_reset() {
        let tcb = Tcb::new(0);
        {
            let mut rcv = tcb.lock_recv();
            rcv.reopen();
            rcv.buf.write(b"lost");
            rcv.reset();
        }

        let mut buf = [0u8; 8];
        assert_eq!(
            tcb.read_nonblocking(&mut buf).unwrap_err(),
            ConnectionError::ConnectionReset
        );
        assert_eq!(
            tcb.read_blocking(&mut buf).unwrap_err(),
            ConnectionError::ConnectionReset
        );
    }

    #[test]
    fn test_blocked_reader_wakes_up() {
        let tcb = Arc::new(Tcb::new(0));
        tcb.lock_recv().reopen();

        let reader = {
            let tcb = tcb.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                let len = tcb.read_blocking(&mut buf).unwrap().len;
                buf[..len].to_vec()
            })
        };

        {
            let mut rcv = tcb.lock_recv();
            rcv.buf.write(b"ping");
            rcv.update_window();
        }
        tcb.notify_readers();

        assert_eq!(reader.join().unwrap(), b"ping");
    }

    #[test]
    fn test_blocked_reader_sees_end_of_stream() {
        let tcb = Arc::new(Tcb::new(0));
        tcb.lock_recv().reopen();

        let reader = {
            let tcb = tcb.clone();
            thread::spawn(move || tcb.read_blocking(&mut [0u8; 8]).map(|outcome| outcome.len))
        };

        tcb.lock_recv().shutdown = Some(RecvShutdown::Eof);
        tcb.notify_readers();

        assert_eq!(reader.join().unwrap(), Ok(0));
    }
}
