// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The RFC 793 state machine.
//!
//! [`on_event`] applies one user call, arriving segment or timer expiration to a [`Connection`]
//! (a view over both halves of a locked TCB) and describes the consequences in an [`Output`]:
//! segments to send, readers to wake, socket table changes. It does no I/O, so the caller can
//! release the TCB locks before touching the transport.
//!
//! Only one segment is ever in flight. Data written while it is unacknowledged waits in the
//! send buffer, and goes out as soon as the acknowledgment arrives.

use std::cmp::min;
use std::net::SocketAddrV4;
use std::num::Wrapping;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use utils::rand::xor_pseudo_rng_u32;

use crate::pdu::tcp::{encode, Flags, TcpError, TcpHeader, TCP_HEADER_LEN};
use crate::tcp::tcb::{RecvShutdown, RecvSide, RetryState, SendSide};
use crate::tcp::{seq_after, seq_at_or_after, State};
use crate::{MAX_TRIES, RETRBUFLEN};

/// Largest segment the engine ever produces.
pub const MAX_SEGMENT_LEN: usize = TCP_HEADER_LEN + RETRBUFLEN;

bitflags! {
    /// Notable things that happened while handling an event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventStatus: u16 {
        /// The connection reached `ESTABLISHED`.
        const ESTABLISHED =         1;
        /// The connection completed an orderly close.
        const CLOSED =              1 << 1;
        /// The connection was torn down by a reset or a timeout.
        const ABORTED =             1 << 2;
        /// The retransmission limit was reached.
        const TIMED_OUT =           1 << 3;
        /// A valid `RST` arrived.
        const RESET_RECEIVED =      1 << 4;
        /// A `RST` is among the outbound segments.
        const RESET_SENT =          1 << 5;
        /// The in-flight segment was sent again.
        const RETRANSMITTED =       1 << 6;
        /// The acknowledgment repeats `SND.UNA` while something is in flight.
        const DUP_ACK =             1 << 7;
        /// The segment was outside the receive window, or not the next one expected.
        const OUT_OF_WINDOW =       1 << 8;
        /// The segment acknowledges data which was never sent.
        const INVALID_ACK =         1 << 9;
        /// A passive connection attempt failed and the socket is listening again.
        const RETURNED_TO_LISTEN =  1 << 10;
        /// The segment was for another connection; this TCB was reused since it was looked up.
        const STALE =               1 << 11;
    }
}

/// Describes errors a user call on a connection may run into.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum ConnectionError {
    /// Connection reset
    ConnectionReset,
    /// Operation not valid in state {0}
    InvalidState(State),
    /// Connection closing
    ConnectionClosing,
}

/// Retransmission and `TIME_WAIT` timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    /// Timeout before the first retransmission.
    pub rto_initial: Duration,
    /// Upper bound for the backed-off timeout.
    pub rto_max: Duration,
    /// Retransmissions allowed before the connection is aborted.
    pub max_tries: u32,
    /// How long `TIME_WAIT` holds.
    pub time_wait: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            rto_initial: Duration::from_secs(1),
            rto_max: Duration::from_secs(60),
            max_tries: MAX_TRIES,
            time_wait: Duration::from_secs(30),
        }
    }
}

impl TimingConfig {
    /// Timeout after `retries` retransmissions: the initial one doubled each time, capped.
    pub fn rto(&self, retries: u32) -> Duration {
        self.rto_initial
            .saturating_mul(1 << min(retries, 16))
            .min(self.rto_max)
    }
}

/// A segment ready to be written to the wire.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub header: TcpHeader,
    payload: [u8; RETRBUFLEN],
    payload_len: usize,
}

impl Outbound {
    /// Builds a segment; anything in `payload` past `RETRBUFLEN` bytes is left out.
    pub fn new(src: SocketAddrV4, dst: SocketAddrV4, header: TcpHeader, payload: &[u8]) -> Self {
        let payload_len = min(payload.len(), RETRBUFLEN);
        let mut segment = Outbound {
            src,
            dst,
            header,
            payload: [0; RETRBUFLEN],
            payload_len,
        };
        segment.payload[..payload_len].copy_from_slice(&payload[..payload_len]);
        segment
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len]
    }

    /// Encodes the segment, checksum included, into `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, TcpError> {
        encode(
            &self.header,
            self.payload(),
            *self.src.ip(),
            *self.dst.ip(),
            buf,
        )
    }
}

/// How the socket table entry of a connection has to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Accept connection requests from any remote endpoint.
    Listen,
    /// Only segments from this remote endpoint belong to the connection.
    Remote(SocketAddrV4),
    /// Nothing belongs to the connection anymore.
    Unbound,
}

/// Everything that follows from handling an event.
#[derive(Debug)]
pub struct Output {
    /// Segments to send, in order.
    pub segments: Vec<Outbound>,
    /// State after the event.
    pub state: State,
    /// Bytes taken from the user by a send.
    pub accepted: usize,
    /// Data arrived or the connection terminated, so blocked readers must wake up.
    pub wake_readers: bool,
    pub status: EventStatus,
    pub binding: Option<Binding>,
}

impl Output {
    fn new(state: State) -> Self {
        Output {
            segments: Vec::new(),
            state,
            accepted: 0,
            wake_readers: false,
            status: EventStatus::empty(),
            binding: None,
        }
    }
}

/// What the state machine reacts to.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// The user wants to accept a connection.
    OpenPassive,
    /// The user wants to connect to a remote endpoint.
    OpenActive(SocketAddrV4),
    /// The user hands over data to send.
    Send(&'a [u8]),
    /// The user is done sending.
    Close,
    /// A checksummed segment arrived from `remote` for `local`.
    SegmentArrives {
        local: SocketAddrV4,
        remote: SocketAddrV4,
        header: TcpHeader,
        payload: &'a [u8],
    },
    /// The periodic timer fired; acts only if a deadline has passed.
    RetransmitTimeout,
}

/// A view over a TCB whose two halves are locked by the caller.
#[derive(Debug)]
pub struct Connection<'a> {
    pub snd: &'a mut SendSide,
    pub rcv: &'a mut RecvSide,
    pub timing: &'a TimingConfig,
}

/// Applies `event` to `conn`. `now` must not decrease between calls.
pub fn on_event(
    conn: &mut Connection<'_>,
    event: Event<'_>,
    now: Instant,
) -> Result<Output, ConnectionError> {
    let mut out = Output::new(conn.snd.state);

    match event {
        Event::OpenPassive => conn.open_passive(&mut out)?,
        Event::OpenActive(remote) => conn.open_active(remote, now, &mut out)?,
        Event::Send(data) => conn.send(data, now, &mut out)?,
        Event::Close => conn.close(now, &mut out)?,
        Event::SegmentArrives {
            local,
            remote,
            header,
            payload,
        } => {
            if conn.owns(local, remote) {
                conn.segment_arrives(remote, &header, payload, now, &mut out);
            } else {
                out.status |= EventStatus::STALE;
            }
        }
        Event::RetransmitTimeout => conn.timeout(now, &mut out),
    }

    out.state = conn.snd.state;
    Ok(out)
}

/// Produces a window update after a read reopened a zero receive window.
pub fn window_update(conn: &mut Connection<'_>) -> Output {
    let mut out = Output::new(conn.snd.state);
    if matches!(
        conn.snd.state,
        State::Established | State::FinWait1 | State::FinWait2
    ) {
        conn.send_ack(&mut out);
    }
    out
}

/// Builds the `RST` answering a segment that came from `remote` for `local`, following
/// RFC 793: `<SEQ=SEG.ACK><CTL=RST>` when the segment carries an ACK, and
/// `<SEQ=0><ACK=SEG.SEQ+SEG.LEN><CTL=RST,ACK>` otherwise. A `RST` never answers a `RST`.
pub fn reset_for(
    local: SocketAddrV4,
    remote: SocketAddrV4,
    header: &TcpHeader,
    payload_len: usize,
) -> Option<Outbound> {
    if header.flags.contains(Flags::RST) {
        return None;
    }

    let mut rst = TcpHeader::new(local.port(), remote.port());
    if header.flags.contains(Flags::ACK) {
        rst.seq = header.ack;
        rst.flags = Flags::RST;
    } else {
        rst.ack = header
            .seq
            .wrapping_add(header.sequence_len(payload_len));
        rst.flags = Flags::RST | Flags::ACK;
    }
    Some(Outbound::new(local, remote, rst, &[]))
}

impl Connection<'_> {
    // Queues a segment for the remote end, acknowledging RCV.NXT when `flags` has ACK.
    fn emit(&self, out: &mut Output, flags: Flags, seq: Wrapping<u32>, payload: &[u8]) {
        let Some(remote) = self.snd.remote else {
            return;
        };

        let mut header = TcpHeader::new(self.snd.local.port(), remote.port());
        header.seq = seq.0;
        if flags.contains(Flags::ACK) {
            header.ack = self.rcv.nxt.0;
        }
        header.flags = flags;
        header.window = self.rcv.wnd;
        out.segments
            .push(Outbound::new(self.snd.local, remote, header, payload));
    }

    fn send_ack(&self, out: &mut Output) {
        self.emit(out, Flags::ACK, self.snd.nxt, &[]);
    }

    fn send_reset_for(&self, out: &mut Output, header: &TcpHeader, payload_len: usize) {
        if let Some(remote) = self.snd.remote {
            if let Some(rst) = reset_for(self.snd.local, remote, header, payload_len) {
                out.segments.push(rst);
                out.status |= EventStatus::RESET_SENT;
            }
        }
    }

    // Sends the in-flight segment (again).
    fn resend(&self, out: &mut Output) {
        let retr = &self.snd.retr;
        let mut flags = retr.flags;
        if self.snd.state != State::SynSent {
            flags |= Flags::ACK;
        }
        if !retr.payload().is_empty() {
            flags |= Flags::PSH;
        }
        self.emit(out, flags, retr.seq, retr.payload());
    }

    fn arm_retry(&mut self, now: Instant) {
        self.snd.retry = RetryState {
            armed: true,
            deadline: now + self.timing.rto(0),
            count: 0,
        };
    }

    fn new_iss(&mut self) {
        let iss = Wrapping(xor_pseudo_rng_u32());
        self.snd.iss = iss;
        self.snd.una = iss;
        self.snd.nxt = iss + Wrapping(1);
    }

    fn enter_closed(&mut self, reason: RecvShutdown, out: &mut Output) {
        let snd = &mut *self.snd;
        snd.state = State::Closed;
        snd.retr.clear();
        snd.retry.disarm();
        snd.buf.clear();
        snd.close_requested = false;
        snd.time_wait_deadline = None;

        match reason {
            RecvShutdown::Reset => self.rcv.reset(),
            RecvShutdown::Eof => {
                self.rcv.shutdown.get_or_insert(RecvShutdown::Eof);
            }
        }

        out.wake_readers = true;
        out.binding = Some(Binding::Unbound);
    }

    fn return_to_listen(&mut self, out: &mut Output) {
        self.snd.clear_connection();
        self.snd.state = State::Listen;
        self.rcv.reopen();
        out.binding = Some(Binding::Listen);
        out.status |= EventStatus::RETURNED_TO_LISTEN;
    }

    fn enter_time_wait(&mut self, now: Instant) {
        self.snd.state = State::TimeWait;
        self.snd.retr.clear();
        self.snd.retry.disarm();
        self.snd.time_wait_deadline = Some(now + self.timing.time_wait);
    }

    fn open_passive(&mut self, out: &mut Output) -> Result<(), ConnectionError> {
        if self.snd.state != State::Closed {
            return Err(ConnectionError::InvalidState(self.snd.state));
        }

        self.snd.clear_connection();
        self.snd.state = State::Listen;
        self.rcv.reopen();
        out.binding = Some(Binding::Listen);
        Ok(())
    }

    fn open_active(
        &mut self,
        remote: SocketAddrV4,
        now: Instant,
        out: &mut Output,
    ) -> Result<(), ConnectionError> {
        if self.snd.state != State::Closed {
            return Err(ConnectionError::InvalidState(self.snd.state));
        }

        self.snd.clear_connection();
        self.rcv.reopen();
        self.snd.active_open = true;
        self.snd.remote = Some(remote);
        self.new_iss();
        let iss = self.snd.iss;
        self.snd.retr.load_control(iss, Flags::SYN);
        self.arm_retry(now);
        self.snd.state = State::SynSent;
        out.binding = Some(Binding::Remote(remote));
        self.resend(out);
        Ok(())
    }

    fn send(&mut self, data: &[u8], now: Instant, out: &mut Output) -> Result<(), ConnectionError> {
        match self.snd.state {
            State::Closed | State::Listen => Err(ConnectionError::InvalidState(self.snd.state)),
            State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::LastAck
            | State::TimeWait => Err(ConnectionError::ConnectionClosing),
            State::SynSent | State::SynReceived | State::Established | State::CloseWait => {
                if self.snd.close_requested {
                    return Err(ConnectionError::ConnectionClosing);
                }
                out.accepted = self.snd.buf.write(data);
                self.try_transmit(now, out);
                Ok(())
            }
        }
    }

    fn close(&mut self, now: Instant, out: &mut Output) -> Result<(), ConnectionError> {
        match self.snd.state {
            State::Closed => return Err(ConnectionError::InvalidState(State::Closed)),
            State::Listen | State::SynSent => {
                self.enter_closed(RecvShutdown::Eof, out);
                out.status |= EventStatus::CLOSED;
            }
            // The FIN goes out once the handshake completes.
            State::SynReceived => self.snd.close_requested = true,
            State::Established => {
                self.snd.close_requested = true;
                self.snd.state = State::FinWait1;
                self.try_transmit(now, out);
            }
            State::CloseWait => {
                self.snd.close_requested = true;
                self.snd.state = State::LastAck;
                self.try_transmit(now, out);
            }
            State::FinWait1
            | State::FinWait2
            | State::Closing
            | State::LastAck
            | State::TimeWait => return Err(ConnectionError::ConnectionClosing),
        }
        Ok(())
    }

    // Puts the next segment in flight, if the slot is free and there is something to send.
    // Returns whether a segment was emitted.
    fn try_transmit(&mut self, now: Instant, out: &mut Output) -> bool {
        let can_send = matches!(
            self.snd.state,
            State::Established
                | State::CloseWait
                | State::FinWait1
                | State::Closing
                | State::LastAck
        );
        if !can_send || !self.snd.retr.is_empty() {
            return false;
        }

        let queued = self.snd.buf.len();
        let want_fin = self.snd.close_requested && self.snd.fin_seq.is_none();
        if queued == 0 && !want_fin {
            return false;
        }

        // A zero window still lets a single byte through, so we learn when it opens.
        let window = usize::from(self.snd.wnd);
        let len = if window == 0 {
            min(queued, 1)
        } else {
            min(min(queued, window), RETRBUFLEN)
        };
        let fin = want_fin && len == queued;

        let snd = &mut *self.snd;
        let seq = snd.nxt;
        let flags = if fin { Flags::FIN } else { Flags::empty() };
        let len = snd.retr.load(seq, flags, &mut snd.buf, len);
        let len = Wrapping(len as u32);
        if fin {
            snd.fin_seq = Some(seq + len);
        }
        snd.nxt = seq + len + Wrapping(u32::from(fin));

        self.arm_retry(now);
        self.resend(out);
        true
    }

    fn timeout(&mut self, now: Instant, out: &mut Output) {
        if self.snd.state == State::TimeWait {
            if self.snd.time_wait_deadline.is_some_and(|deadline| now >= deadline) {
                self.enter_closed(RecvShutdown::Eof, out);
                out.status |= EventStatus::CLOSED;
            }
            return;
        }

        let retry = self.snd.retry;
        if !retry.armed || now < retry.deadline {
            return;
        }

        if retry.count >= self.timing.max_tries {
            out.status |= EventStatus::TIMED_OUT;
            if self.snd.state == State::SynReceived && !self.snd.active_open {
                self.return_to_listen(out);
            } else {
                self.enter_closed(RecvShutdown::Reset, out);
                out.status |= EventStatus::ABORTED;
            }
            return;
        }

        let count = retry.count + 1;
        self.snd.retry.count = count;
        self.snd.retry.deadline = now + self.timing.rto(count);
        self.resend(out);
        out.status |= EventStatus::RETRANSMITTED;
    }

    // Whether the segment between `local` and `remote` still belongs here.
    fn owns(&self, local: SocketAddrV4, remote: SocketAddrV4) -> bool {
        self.snd.local == local
            && match self.snd.state {
                State::Closed | State::Listen => true,
                _ => self.snd.remote == Some(remote),
            }
    }

    fn segment_arrives(
        &mut self,
        remote: SocketAddrV4,
        header: &TcpHeader,
        payload: &[u8],
        now: Instant,
        out: &mut Output,
    ) {
        match self.snd.state {
            State::Closed => {
                if let Some(rst) = reset_for(self.snd.local, remote, header, payload.len()) {
                    out.segments.push(rst);
                    out.status |= EventStatus::RESET_SENT;
                }
            }
            State::Listen => self.listen_segment(remote, header, now, out),
            State::SynSent => self.syn_sent_segment(header, now, out),
            _ => self.synchronized_segment(header, payload, now, out),
        }
    }

    fn listen_segment(
        &mut self,
        remote: SocketAddrV4,
        header: &TcpHeader,
        now: Instant,
        out: &mut Output,
    ) {
        let flags = header.flags;
        if flags.contains(Flags::RST) {
            return;
        }
        if flags.contains(Flags::ACK) {
            if let Some(rst) = reset_for(self.snd.local, remote, header, 0) {
                out.segments.push(rst);
                out.status |= EventStatus::RESET_SENT;
            }
            return;
        }
        if !flags.contains(Flags::SYN) {
            return;
        }

        // Data on the SYN is dropped; the remote end sends it again once we acknowledge.
        let seq = Wrapping(header.seq);
        self.rcv.irs = seq;
        self.rcv.nxt = seq + Wrapping(1);
        self.snd.remote = Some(remote);
        self.snd.wnd = header.window;
        self.snd.wl1 = seq;
        self.new_iss();
        let iss = self.snd.iss;
        self.snd.retr.load_control(iss, Flags::SYN);
        self.arm_retry(now);
        self.snd.state = State::SynReceived;
        out.binding = Some(Binding::Remote(remote));
        self.resend(out);
    }

    fn syn_sent_segment(&mut self, header: &TcpHeader, now: Instant, out: &mut Output) {
        let flags = header.flags;
        let ack = Wrapping(header.ack);
        let has_ack = flags.contains(Flags::ACK);

        if has_ack && (!seq_after(ack, self.snd.iss) || seq_after(ack, self.snd.nxt)) {
            self.send_reset_for(out, header, 0);
            return;
        }

        if flags.contains(Flags::RST) {
            if has_ack {
                out.status |= EventStatus::RESET_RECEIVED | EventStatus::ABORTED;
                self.enter_closed(RecvShutdown::Reset, out);
            }
            return;
        }

        if !flags.contains(Flags::SYN) {
            return;
        }

        let seq = Wrapping(header.seq);
        self.rcv.irs = seq;
        self.rcv.nxt = seq + Wrapping(1);
        self.snd.wnd = header.window;
        self.snd.wl1 = seq;
        self.snd.wl2 = ack;

        if has_ack {
            self.snd.una = ack;
            self.snd.retr.clear();
            self.snd.retry.disarm();
            self.snd.state = State::Established;
            out.status |= EventStatus::ESTABLISHED;
            if !self.try_transmit(now, out) {
                self.send_ack(out);
            }
        } else {
            // Simultaneous open: our SYN is still in flight and now carries an ACK.
            self.snd.state = State::SynReceived;
            self.resend(out);
        }
    }

    // RFC 793 segment acceptability test.
    fn acceptable(&self, seq: Wrapping<u32>, seg_len: u32) -> bool {
        let nxt = self.rcv.nxt;
        let wnd = Wrapping(u32::from(self.rcv.wnd));
        let in_window = |s: Wrapping<u32>| seq_at_or_after(s, nxt) && seq_after(nxt + wnd, s);

        match (seg_len, wnd.0) {
            (0, 0) => seq == nxt,
            (0, _) => in_window(seq),
            (_, 0) => false,
            (len, _) => in_window(seq) || in_window(seq + Wrapping(len - 1)),
        }
    }

    fn synchronized_segment(
        &mut self,
        header: &TcpHeader,
        payload: &[u8],
        now: Instant,
        out: &mut Output,
    ) {
        let flags = header.flags;
        let seq = Wrapping(header.seq);
        let ack = Wrapping(header.ack);

        // The remote end did not get our SYN+ACK and sent its SYN again.
        if self.snd.state == State::SynReceived
            && flags & (Flags::SYN | Flags::ACK | Flags::RST) == Flags::SYN
            && seq == self.rcv.irs
        {
            self.resend(out);
            return;
        }

        if !self.acceptable(seq, header.sequence_len(payload.len())) {
            if flags.contains(Flags::RST) {
                return;
            }
            out.status |= EventStatus::OUT_OF_WINDOW;
            if self.snd.state == State::TimeWait && flags.contains(Flags::FIN) {
                self.snd.time_wait_deadline = Some(now + self.timing.time_wait);
            }
            // A closed receive window still takes acknowledgments.
            if seq == self.rcv.nxt
                && flags.contains(Flags::ACK)
                && self.snd.state != State::SynReceived
                && !self.process_ack(header, payload.len(), now, out)
            {
                return;
            }
            if self.snd.state != State::Closed {
                self.send_ack(out);
            }
            return;
        }

        if flags.contains(Flags::RST) {
            out.status |= EventStatus::RESET_RECEIVED;
            match self.snd.state {
                State::SynReceived if !self.snd.active_open => self.return_to_listen(out),
                State::SynReceived
                | State::Established
                | State::FinWait1
                | State::FinWait2
                | State::CloseWait => {
                    out.status |= EventStatus::ABORTED;
                    self.enter_closed(RecvShutdown::Reset, out);
                }
                _ => self.enter_closed(RecvShutdown::Eof, out),
            }
            return;
        }

        if flags.contains(Flags::SYN) {
            self.send_reset_for(out, header, payload.len());
            out.status |= EventStatus::ABORTED;
            self.enter_closed(RecvShutdown::Reset, out);
            return;
        }

        if !flags.contains(Flags::ACK) {
            return;
        }

        if self.snd.state == State::SynReceived {
            if seq_after(ack, self.snd.una) && seq_at_or_after(self.snd.nxt, ack) {
                self.snd.una = ack;
                self.snd.retr.clear();
                self.snd.retry.disarm();
                self.snd.wnd = header.window;
                self.snd.wl1 = seq;
                self.snd.wl2 = ack;
                self.snd.state = if self.snd.close_requested {
                    State::FinWait1
                } else {
                    State::Established
                };
                out.status |= EventStatus::ESTABLISHED;
            } else {
                self.send_reset_for(out, header, payload.len());
                return;
            }
        } else if !self.process_ack(header, payload.len(), now, out) {
            return;
        }

        if flags.contains(Flags::URG)
            && matches!(
                self.snd.state,
                State::Established | State::FinWait1 | State::FinWait2
            )
        {
            let up = seq + Wrapping(u32::from(header.urgent_pointer));
            if seq_after(up, self.rcv.up) {
                self.rcv.up = up;
            }
        }

        let mut need_ack = false;
        let receiving = matches!(
            self.snd.state,
            State::Established | State::FinWait1 | State::FinWait2
        );

        if !payload.is_empty() && receiving {
            if seq != self.rcv.nxt || payload.len() > usize::from(self.rcv.wnd) {
                out.status |= EventStatus::OUT_OF_WINDOW;
                self.send_ack(out);
                return;
            }
            let len = self.rcv.buf.write(payload);
            self.rcv.nxt += Wrapping(len as u32);
            self.rcv.update_window();
            out.wake_readers = true;
            need_ack = true;
        }

        if flags.contains(Flags::FIN) {
            let fin_seq = seq + Wrapping(payload.len() as u32);
            if fin_seq == self.rcv.nxt && receiving {
                self.rcv.nxt += Wrapping(1);
                self.rcv.shutdown.get_or_insert(RecvShutdown::Eof);
                out.wake_readers = true;
                need_ack = true;
                match self.snd.state {
                    State::Established => self.snd.state = State::CloseWait,
                    State::FinWait1 => self.snd.state = State::Closing,
                    _ => self.enter_time_wait(now),
                }
            } else if seq_after(self.rcv.nxt, fin_seq) {
                // Seen before; our acknowledgment got lost.
                need_ack = true;
                if self.snd.state == State::TimeWait {
                    self.snd.time_wait_deadline = Some(now + self.timing.time_wait);
                }
            }
        }

        let sent = self.try_transmit(now, out);
        if need_ack && !sent {
            self.send_ack(out);
        }
    }

    // Acknowledgment processing for synchronized states past SYN_RECEIVED. Returns whether the
    // rest of the segment should still be processed.
    fn process_ack(
        &mut self,
        header: &TcpHeader,
        payload_len: usize,
        now: Instant,
        out: &mut Output,
    ) -> bool {
        if self.snd.state == State::TimeWait {
            return true;
        }

        let seq = Wrapping(header.seq);
        let ack = Wrapping(header.ack);

        if seq_after(ack, self.snd.nxt) {
            out.status |= EventStatus::INVALID_ACK;
            self.send_ack(out);
            return false;
        }

        let old_wnd = self.snd.wnd;
        if seq_after(ack, self.snd.una) {
            self.acknowledge(ack, now);
        } else if ack == self.snd.una && payload_len == 0 && !self.snd.retr.is_empty() {
            out.status |= EventStatus::DUP_ACK;
        }

        let snd = &mut *self.snd;
        if seq_at_or_after(ack, snd.una)
            && (seq_after(seq, snd.wl1) || (seq == snd.wl1 && seq_at_or_after(ack, snd.wl2)))
        {
            snd.wnd = header.window;
            snd.wl1 = seq;
            snd.wl2 = ack;
        }

        if !snd.retr.is_empty() {
            if old_wnd == 0 && snd.wnd > 0 {
                // The probe was refused; the window is open now, so send it right away.
                self.arm_retry(now);
                self.resend(out);
            } else if snd.wnd == 0 && ack == snd.una {
                // The remote end answers our probes, so keep probing.
                snd.retry.count = 0;
            }
        }

        let fin_acked = self
            .snd
            .fin_seq
            .is_some_and(|fin| seq_after(self.snd.una, fin));
        match self.snd.state {
            State::FinWait1 if fin_acked => self.snd.state = State::FinWait2,
            // In both states the FIN may still wait behind queued data.
            State::Closing => {
                if !fin_acked {
                    self.try_transmit(now, out);
                    return false;
                }
                self.enter_time_wait(now);
            }
            State::LastAck => {
                if fin_acked {
                    self.enter_closed(RecvShutdown::Eof, out);
                    out.status |= EventStatus::CLOSED;
                } else {
                    self.try_transmit(now, out);
                }
                return false;
            }
            _ => {}
        }
        true
    }

    // SND.UNA moves up to `ack`, releasing whatever part of the in-flight segment it covers.
    fn acknowledge(&mut self, ack: Wrapping<u32>, now: Instant) {
        let snd = &mut *self.snd;
        snd.una = ack;
        if snd.retr.is_empty() {
            return;
        }

        let end = snd.retr.seq + Wrapping(snd.retr.sequence_len());
        if seq_at_or_after(ack, end) {
            snd.retr.clear();
            snd.retry.disarm();
        } else {
            let acked = (ack - snd.retr.seq).0 as usize;
            snd.retr.advance(acked);
            self.arm_retry(now);
        }
    }
}
