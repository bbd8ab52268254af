// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The IP layer underneath the stack.
//!
//! The stack only needs to receive whole IPv4 packets, and to send TCP segments to an IPv4
//! address. [`RawSocket`] does this through the host kernel; [`PipeTransport`] connects two
//! stacks living in the same process.

use std::fmt::Debug;
use std::io;
use std::net::Ipv4Addr;

use crate::pdu::ipv4::Ipv4Error;

mod pipe;
mod raw;

pub use pipe::{DropFilter, PipeTransport};
pub use raw::RawSocket;

/// Describes errors which may occur while moving packets in and out of the stack.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum TransportError {
    /// Failed to open the raw socket: {0}
    Socket(io::Error),
    /// Failed to create the exit event: {0}
    EventFd(io::Error),
    /// Epoll operation failed: {0}
    Epoll(io::Error),
    /// Failed to receive a packet: {0}
    Recv(io::Error),
    /// Failed to send a segment: {0}
    Send(io::Error),
    /// Failed to build the IPv4 packet: {0}
    Ipv4(#[from] Ipv4Error),
    /// The transport has been shut down
    Closed,
}

/// A source and sink of IPv4 packets carrying TCP.
pub trait Transport: Debug + Send + Sync {
    /// Blocks until a packet arrives and copies it, IPv4 header included, into `buf`.
    ///
    /// Returns `None` once `shutdown` has been called.
    fn recv_packet(&self, buf: &mut [u8]) -> Result<Option<usize>, TransportError>;

    /// Sends `segment` from `src` to `dst`.
    fn send_segment(
        &self,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        segment: &[u8],
    ) -> Result<(), TransportError>;

    /// Wakes up `recv_packet` for good.
    fn shutdown(&self);
}
