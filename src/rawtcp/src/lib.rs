// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A user-space implementation of TCP (RFC 793) over IPv4.
//!
//! The stack keeps a fixed table of [`MAXSOCKETS`] connections. A receive dispatcher thread
//! feeds inbound segments to the state machine, and a retransmission timer thread resends
//! whatever stays unacknowledged for too long. Each connection has a single segment in flight
//! at any time.
//!
//! [`tcp_init`] sets up a process-wide stack on a raw socket. [`Stack::new`] builds one on any
//! [`Transport`](transport::Transport), such as the in-process
//! [`PipeTransport`](transport::PipeTransport).

use std::fs::OpenOptions;
use std::io::LineWriter;
use std::sync::{Arc, OnceLock};

use logger::{info, LOGGER, METRICS};

pub mod pdu;
mod stack;
pub mod tcp;
pub mod transport;

pub use stack::{Stack, StackConfig, StackError, TcpSocket};
pub use tcp::engine::ConnectionError;
pub use tcp::State;

/// Number of sockets a stack can hold at the same time.
pub const MAXSOCKETS: usize = 16;
/// Capacity of the send buffer of each connection.
pub const SENDBUFLEN: usize = 256;
/// Capacity of the receive buffer of each connection.
pub const RECVBUFLEN: usize = 256;
/// Largest payload of a single segment.
pub const RETRBUFLEN: usize = 256;
/// Retransmissions of a segment before its connection is aborted.
pub const MAX_TRIES: u32 = 5;
/// 127.0.0.1 in network byte order, read as a little-endian `u32` (the `s_addr` of a
/// little-endian host).
pub const LOCALHOST: u32 = 0x0100_007f;

const _: () = assert!(MAXSOCKETS.is_power_of_two());

static STACK: OnceLock<Stack> = OnceLock::new();

/// Starts the process-wide stack on a raw IPv4 socket.
///
/// Applies the logger and metrics settings of `config` first. Can only succeed once per
/// process. Opening the raw socket needs `CAP_NET_RAW`.
pub fn tcp_init(config: StackConfig) -> Result<&'static Stack, StackError> {
    if STACK.get().is_some() {
        return Err(StackError::AlreadyInitialized);
    }
    config.validate()?;

    if let Some(logger_config) = config.logger.clone() {
        // Another logger may already be installed; the settings still apply to ours.
        if let Err(err) = LOGGER.init() {
            info!("Using the logger already in place: {}", err);
        }
        LOGGER.update(logger_config)?;
    }
    if let Some(path) = &config.metrics_path {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(StackError::MetricsFile)?;
        METRICS.init(LineWriter::new(file))?;
    }

    let transport = transport::RawSocket::new()?;
    let stack = Stack::new(&config, Arc::new(transport))?;
    // A racing call could have won; its stack stays and ours is dropped, which stops it.
    STACK
        .set(stack)
        .map_err(|_| StackError::AlreadyInitialized)?;
    STACK.get().ok_or(StackError::AlreadyInitialized)
}
