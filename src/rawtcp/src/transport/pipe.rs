// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex};

use logger::extract_guard;

use super::{Transport, TransportError};
use crate::pdu::ipv4::{IPv4Packet, IPV4_HEADER_LEN, PROTOCOL_TCP};

/// Decides, for each outgoing TCP segment, whether it gets lost on the way.
pub type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

#[derive(Debug, Default)]
struct Inbox {
    state: Mutex<InboxState>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct InboxState {
    packets: VecDeque<Vec<u8>>,
    closed: bool,
}

impl Inbox {
    fn push(&self, packet: Vec<u8>) {
        let mut state = extract_guard(self.state.lock());
        if !state.closed {
            state.packets.push_back(packet);
            self.ready.notify_one();
        }
    }

    fn close(&self) {
        extract_guard(self.state.lock()).closed = true;
        self.ready.notify_all();
    }
}

/// One end of an in-process IPv4 link.
///
/// Each end wraps outgoing segments in an IPv4 header and queues them for the other end.
pub struct PipeTransport {
    inbox: Arc<Inbox>,
    peer: Arc<Inbox>,
    drop_filter: Mutex<Option<DropFilter>>,
}

impl fmt::Debug for PipeTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeTransport")
            .field("inbox", &self.inbox)
            .finish_non_exhaustive()
    }
}

impl PipeTransport {
    /// Two connected ends.
    pub fn pair() -> (PipeTransport, PipeTransport) {
        let a = Arc::new(Inbox::default());
        let b = Arc::new(Inbox::default());
        (
            PipeTransport::new(a.clone(), b.clone()),
            PipeTransport::new(b, a),
        )
    }

    fn new(inbox: Arc<Inbox>, peer: Arc<Inbox>) -> Self {
        PipeTransport {
            inbox,
            peer,
            drop_filter: Mutex::new(None),
        }
    }

    /// Loses every outgoing segment for which `filter` returns true.
    pub fn set_drop_filter(&self, filter: DropFilter) {
        *extract_guard(self.drop_filter.lock()) = Some(filter);
    }

    /// Stops losing segments.
    pub fn clear_drop_filter(&self) {
        *extract_guard(self.drop_filter.lock()) = None;
    }
}

impl Transport for PipeTransport {
    fn recv_packet(&self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let mut state = extract_guard(self.inbox.state.lock());
        loop {
            if state.closed {
                return Ok(None);
            }
            if let Some(packet) = state.packets.pop_front() {
                // Like a datagram socket, truncate what does not fit.
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                return Ok(Some(len));
            }
            state = extract_guard(self.inbox.ready.wait(state));
        }
    }

    fn send_segment(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        segment: &[u8],
    ) -> Result<(), TransportError> {
        if extract_guard(self.inbox.state.lock()).closed {
            return Err(TransportError::Closed);
        }
        if let Some(filter) = extract_guard(self.drop_filter.lock()).as_mut() {
            if filter(segment) {
                return Ok(());
            }
        }

        let mut packet = vec![0u8; IPV4_HEADER_LEN + segment.len()];
        let mut incomplete = IPv4Packet::write_header(packet.as_mut_slice(), PROTOCOL_TCP, src, dst)?;
        incomplete.inner_mut().payload_mut()[..segment.len()].copy_from_slice(segment);
        incomplete.with_payload_len_unchecked(segment.len(), true);

        self.peer.push(packet);
        Ok(())
    }

    fn shutdown(&self) {
        self.inbox.close();
    }
}
