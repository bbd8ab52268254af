// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The receive thread: reads IPv4 packets off the transport and feeds the TCP segments they
//! carry to the connection they belong to.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::Instant;

use logger::{debug, error, info, IncMetric, METRICS};

use crate::pdu::ipv4::{IPv4Packet, PROTOCOL_TCP};
use crate::pdu::tcp::decode;
use crate::tcp::engine::{reset_for, Event, EventStatus, TimingConfig};
use crate::tcp::table::SocketTable;
use crate::tcp::{process, transmit};
use crate::transport::{Transport, TransportError};

/// Largest IPv4 packet.
pub const MAX_PACKET_LEN: usize = 65535;

// Attempts at finding the socket of a segment while sockets get reused under it.
const MAX_LOOKUPS: usize = 3;

/// Demultiplexes inbound segments between the sockets of a stack.
#[derive(Debug)]
pub struct Dispatcher {
    table: Arc<SocketTable>,
    transport: Arc<dyn Transport>,
    timing: TimingConfig,
    local_addr: Ipv4Addr,
}

impl Dispatcher {
    pub fn new(
        table: Arc<SocketTable>,
        transport: Arc<dyn Transport>,
        timing: TimingConfig,
        local_addr: Ipv4Addr,
    ) -> Self {
        Dispatcher {
            table,
            transport,
            timing,
            local_addr,
        }
    }

    /// Receives until the transport is shut down.
    pub fn run(self) {
        let mut buf = vec![0u8; MAX_PACKET_LEN];
        loop {
            match self.transport.recv_packet(&mut buf) {
                Ok(Some(len)) => self.handle_packet(&buf[..len], Instant::now()),
                Ok(None) => {
                    info!("Receive dispatcher exiting");
                    return;
                }
                Err(TransportError::Recv(err)) => {
                    METRICS.rx.errors.inc();
                    debug!("Failed to receive a packet: {}", err);
                }
                Err(err) => {
                    METRICS.rx.errors.inc();
                    error!("Receive dispatcher stopped: {}", err);
                    return;
                }
            }
        }
    }

    /// Handles one IPv4 packet, header included.
    pub fn handle_packet(&self, packet: &[u8], now: Instant) {
        METRICS.rx.packets.inc();
        METRICS.rx.bytes.add(packet.len() as u64);

        let packet = match IPv4Packet::from_bytes(packet, true) {
            Ok(packet) => packet,
            Err(err) => {
                METRICS.rx.bad_ip.inc();
                debug!("Dropping packet with an invalid IPv4 header: {}", err);
                return;
            }
        };
        if packet.protocol() != PROTOCOL_TCP || packet.destination_address() != self.local_addr {
            METRICS.rx.not_for_us.inc();
            return;
        }

        let src = packet.source_address();
        let dst = packet.destination_address();
        let (header, payload) = match decode(packet.payload(), src, dst) {
            Ok(decoded) => decoded,
            Err(err) => {
                METRICS.rx.bad_segment.inc();
                debug!("Dropping segment from {}: {}", src, err);
                return;
            }
        };

        let local = SocketAddrV4::new(dst, header.dst_port);
        let remote = SocketAddrV4::new(src, header.src_port);

        // The lookup releases the table before the TCB gets locked, so the socket may be freed
        // and reused in between. The engine refuses the segment then, and the lookup runs again.
        for _ in 0..MAX_LOOKUPS {
            let Some(tcb) = self.table.lookup(local, remote) else {
                METRICS.rx.no_socket.inc();
                debug!("No socket for segment from {} to {}", remote, local);
                if let Some(rst) = reset_for(local, remote, &header, payload.len()) {
                    transmit(self.transport.as_ref(), &[rst]);
                }
                return;
            };

            let event = Event::SegmentArrives {
                local,
                remote,
                header,
                payload,
            };
            match process(
                &tcb,
                &self.table,
                self.transport.as_ref(),
                &self.timing,
                event,
                now,
            ) {
                Ok(output) if output.status.contains(EventStatus::STALE) => {
                    debug!("Socket {} changed hands, looking up again", tcb.index());
                }
                Ok(_) => return,
                Err(err) => {
                    debug!("Socket {}: {}", tcb.index(), err);
                    return;
                }
            }
        }
        METRICS.rx.no_socket.inc();
        debug!("Dropping segment from {} to {}: its socket kept changing", remote, local);
    }
}
