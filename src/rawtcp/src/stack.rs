// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use logger::{error, extract_guard, info, LoggerConfig, LoggerUpdateError, MetricsError};
use serde::{Deserialize, Serialize};
use utils::eventfd::{EventFd, EFD_NONBLOCK};

use crate::tcp::dispatcher::Dispatcher;
use crate::tcp::engine::{
    window_update, Connection, ConnectionError, Event, Output, TimingConfig,
};
use crate::tcp::table::{SocketTable, TableError};
use crate::tcp::tcb::{ReadOutcome, Tcb};
use crate::tcp::timer::{write_metrics, RetransmitTimer};
use crate::tcp::{process, transmit, State};
use crate::transport::{Transport, TransportError};
use crate::{LOCALHOST, MAX_TRIES};

/// Stack settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct StackConfig {
    /// Address the stack answers on. Packets for any other address are ignored.
    pub local_addr: Ipv4Addr,
    /// Period of the retransmission timer.
    pub tick_interval_ms: u64,
    /// Retransmission timeout before any backoff.
    pub rto_initial_ms: u64,
    /// Upper bound for the backed-off retransmission timeout.
    pub rto_max_ms: u64,
    /// Retransmissions of a segment before its connection is aborted.
    pub max_tries: u32,
    /// How long a connection lingers in `TIME_WAIT`.
    pub time_wait_ms: u64,
    /// Logger settings, applied by [`tcp_init`](crate::tcp_init).
    pub logger: Option<LoggerConfig>,
    /// File receiving the JSON metrics, set up by [`tcp_init`](crate::tcp_init).
    pub metrics_path: Option<PathBuf>,
    /// Period of the metrics flush. A last flush happens on shutdown.
    pub metrics_interval_ms: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            local_addr: Ipv4Addr::from(LOCALHOST.to_le_bytes()),
            tick_interval_ms: 100,
            rto_initial_ms: 1000,
            rto_max_ms: 60_000,
            max_tries: MAX_TRIES,
            time_wait_ms: 30_000,
            logger: None,
            metrics_path: None,
            metrics_interval_ms: 60_000,
        }
    }
}

impl StackConfig {
    /// Checks the settings make sense together.
    pub fn validate(&self) -> Result<(), StackError> {
        let invalid = |msg: &str| StackError::InvalidConfig(msg.to_string());

        if self.local_addr.is_unspecified() || self.local_addr.is_broadcast() {
            return Err(invalid("local_addr must be a unicast address"));
        }
        if self.tick_interval_ms == 0 {
            return Err(invalid("tick_interval_ms must be positive"));
        }
        if self.rto_initial_ms == 0 {
            return Err(invalid("rto_initial_ms must be positive"));
        }
        if self.rto_max_ms < self.rto_initial_ms {
            return Err(invalid("rto_max_ms must not be smaller than rto_initial_ms"));
        }
        if self.max_tries == 0 {
            return Err(invalid("max_tries must be positive"));
        }
        if self.metrics_interval_ms == 0 {
            return Err(invalid("metrics_interval_ms must be positive"));
        }
        Ok(())
    }
}

impl From<&StackConfig> for TimingConfig {
    fn from(config: &StackConfig) -> Self {
        TimingConfig {
            rto_initial: Duration::from_millis(config.rto_initial_ms),
            rto_max: Duration::from_millis(config.rto_max_ms),
            max_tries: config.max_tries,
            time_wait: Duration::from_millis(config.time_wait_ms),
        }
    }
}

/// Describes errors which may occur while setting up the stack or its sockets.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum StackError {
    /// The TCP stack is already initialized
    AlreadyInitialized,
    /// Invalid stack configuration: {0}
    InvalidConfig(String),
    /// The stack does not own address {0}
    InvalidAddress(Ipv4Addr),
    /// Transport error: {0}
    Transport(#[from] TransportError),
    /// Socket table error: {0}
    Table(#[from] TableError),
    /// Failed to set up the retransmission timer: {0}
    Timer(io::Error),
    /// Failed to spawn the {0} thread: {1}
    Thread(&'static str, io::Error),
    /// Failed to configure the logger: {0}
    Logger(#[from] LoggerUpdateError),
    /// Failed to open the metrics file: {0}
    MetricsFile(io::Error),
    /// Failed to set up metrics: {0}
    Metrics(#[from] MetricsError),
}

// State shared by the worker threads and the sockets.
#[derive(Debug)]
struct Shared {
    table: Arc<SocketTable>,
    transport: Arc<dyn Transport>,
    timing: TimingConfig,
    local_addr: Ipv4Addr,
}

impl Shared {
    fn process(&self, tcb: &Tcb, event: Event<'_>) -> Result<Output, ConnectionError> {
        process(
            tcb,
            &self.table,
            self.transport.as_ref(),
            &self.timing,
            event,
            Instant::now(),
        )
    }
}

/// A running TCP stack: a socket table, a receive dispatcher thread and a retransmission timer
/// thread, on top of a [`Transport`].
#[derive(Debug)]
pub struct Stack {
    shared: Arc<Shared>,
    timer_exit: EventFd,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Stack {
    /// Starts a stack on `transport`.
    pub fn new(config: &StackConfig, transport: Arc<dyn Transport>) -> Result<Self, StackError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            table: Arc::new(SocketTable::new()),
            transport,
            timing: TimingConfig::from(config),
            local_addr: config.local_addr,
        });
        let timer_exit = EventFd::new(EFD_NONBLOCK).map_err(StackError::Timer)?;
        let timer = RetransmitTimer::new(
            shared.table.clone(),
            shared.transport.clone(),
            shared.timing,
            Duration::from_millis(config.tick_interval_ms),
            Duration::from_millis(config.metrics_interval_ms),
            &timer_exit,
        )
        .map_err(StackError::Timer)?;
        let dispatcher = Dispatcher::new(
            shared.table.clone(),
            shared.transport.clone(),
            shared.timing,
            shared.local_addr,
        );

        // From here on, dropping the stack stops whatever was already started.
        let stack = Stack {
            shared,
            timer_exit,
            workers: Mutex::new(Vec::with_capacity(2)),
        };
        stack.spawn("tcp_rx", move || dispatcher.run())?;
        stack.spawn("tcp_timer", move || timer.run())?;

        info!("TCP stack running on {}", config.local_addr);
        Ok(stack)
    }

    fn spawn<F>(&self, name: &'static str, f: F) -> Result<(), StackError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(f)
            .map_err(|err| StackError::Thread(name, err))?;
        extract_guard(self.workers.lock()).push(handle);
        Ok(())
    }

    /// The address the stack answers on.
    pub fn local_addr(&self) -> Ipv4Addr {
        self.shared.local_addr
    }

    /// Allocates a `CLOSED` socket bound to `local`. An unspecified IP stands for the stack's
    /// own address.
    pub fn create_socket(&self, local: SocketAddrV4) -> Result<TcpSocket, StackError> {
        let local = if local.ip().is_unspecified() {
            SocketAddrV4::new(self.shared.local_addr, local.port())
        } else if *local.ip() == self.shared.local_addr {
            local
        } else {
            return Err(StackError::InvalidAddress(*local.ip()));
        };

        let index = self.shared.table.allocate(local)?;
        let tcb = self
            .shared
            .table
            .get(index)
            .ok_or(StackError::Table(TableError::InvalidIndex))?;
        Ok(TcpSocket {
            shared: self.shared.clone(),
            tcb,
        })
    }

    /// Stops both worker threads and waits for them, then flushes the metrics one last time.
    /// Sockets stay usable, but nothing arrives or gets retransmitted anymore.
    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *extract_guard(self.workers.lock()));
        if workers.is_empty() {
            return;
        }

        self.shared.transport.shutdown();
        if let Err(err) = self.timer_exit.write(1) {
            error!("Failed to stop the retransmission timer: {}", err);
        }
        for worker in workers {
            let name = worker.thread().name().unwrap_or_default().to_owned();
            if worker.join().is_err() {
                error!("The {} thread panicked", name);
            }
        }
        write_metrics();
        info!("TCP stack stopped");
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A handle to one connection of a [`Stack`].
///
/// Every method may be called from any thread. Several threads may read at the same time, in
/// which case each byte goes to exactly one of them.
#[derive(Debug)]
pub struct TcpSocket {
    shared: Arc<Shared>,
    tcb: Arc<Tcb>,
}

impl TcpSocket {
    /// Waits for a connection request from any remote endpoint.
    pub fn passive_open(&self) -> Result<(), ConnectionError> {
        self.shared.process(&self.tcb, Event::OpenPassive)?;
        Ok(())
    }

    /// Sends a connection request to `remote`. Returns right away; the connection is usable
    /// once [`state`](Self::state) reports `ESTABLISHED`.
    pub fn active_open(&self, remote: SocketAddrV4) -> Result<(), ConnectionError> {
        self.shared.process(&self.tcb, Event::OpenActive(remote))?;
        Ok(())
    }

    /// Queues as much of `buf` as the send buffer has room for, and returns how much that was.
    pub fn send_data(&self, buf: &[u8]) -> Result<usize, ConnectionError> {
        Ok(self.shared.process(&self.tcb, Event::Send(buf))?.accepted)
    }

    /// Copies received data into `buf` without waiting. Returns 0 when there is none.
    pub fn read_nonblocking(&self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        let outcome = self.tcb.read_nonblocking(buf)?;
        Ok(self.after_read(outcome))
    }

    /// Waits for data and copies it into `buf`.
    ///
    /// Returns 0 once the remote end closed its side and everything was read, and
    /// `ConnectionReset` if the connection was reset or timed out.
    pub fn read_blocking(&self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        let outcome = self.tcb.read_blocking(buf)?;
        Ok(self.after_read(outcome))
    }

    // Tells the remote end about a receive window the read just reopened.
    fn after_read(&self, outcome: ReadOutcome) -> usize {
        if outcome.window_reopened {
            let output = {
                let (mut snd, mut rcv) = self.tcb.lock_both();
                let mut conn = Connection {
                    snd: &mut snd,
                    rcv: &mut rcv,
                    timing: &self.shared.timing,
                };
                window_update(&mut conn)
            };
            transmit(self.shared.transport.as_ref(), &output.segments);
        }
        outcome.len
    }

    /// Closes our side of the connection, once queued data is sent.
    pub fn close_connection(&self) -> Result<(), ConnectionError> {
        self.shared.process(&self.tcb, Event::Close)?;
        Ok(())
    }

    /// Gives the socket back to the stack. Only a `CLOSED` socket can go; any other one is
    /// handed back.
    pub fn destroy_socket(self) -> Result<(), TcpSocket> {
        match self.shared.table.free(self.tcb.index()) {
            Ok(()) => Ok(()),
            Err(_) => Err(self),
        }
    }

    pub fn state(&self) -> State {
        self.tcb.state()
    }

    /// Local address and port.
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.tcb.lock_send().local
    }

    /// Remote address and port, once there is one.
    pub fn peer_addr(&self) -> Option<SocketAddrV4> {
        self.tcb.lock_send().remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::PipeTransport;
    use crate::MAXSOCKETS;

    fn config(local_addr: Ipv4Addr) -> StackConfig {
        StackConfig {
            local_addr,
            tick_interval_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = StackConfig::default();
        assert_eq!(config.local_addr, Ipv4Addr::LOCALHOST);
        assert_eq!(config.max_tries, MAX_TRIES);
        config.validate().unwrap();

        let timing = TimingConfig::from(&config);
        assert_eq!(timing, TimingConfig::default());
    }

    #[test]
    fn test_config_deserialize() {
        let config: StackConfig = serde_json::from_str(
            r#"{
                "local_addr": "10.0.0.1",
                "rto_initial_ms": 200,
                "logger": { "level": "Debug" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.local_addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.rto_initial_ms, 200);
        assert_eq!(config.tick_interval_ms, 100);
        assert_eq!(config.metrics_interval_ms, 60_000);
        assert_eq!(
            config.logger.unwrap().level,
            Some(logger::LevelFilter::Debug)
        );

        serde_json::from_str::<StackConfig>(r#"{ "mss": 536 }"#).unwrap_err();
    }

    #[test]
    fn test_config_validate() {
        let cases = [
            StackConfig {
                local_addr: Ipv4Addr::UNSPECIFIED,
                ..Default::default()
            },
            StackConfig {
                tick_interval_ms: 0,
                ..Default::default()
            },
            StackConfig {
                rto_initial_ms: 500,
                rto_max_ms: 100,
                ..Default::default()
            },
            StackConfig {
                max_tries: 0,
                ..Default::default()
            },
            StackConfig {
                metrics_interval_ms: 0,
                ..Default::default()
            },
        ];
        for config in &cases {
            assert!(matches!(
                config.validate(),
                Err(StackError::InvalidConfig(_))
            ));
        }

        let (transport, _) = PipeTransport::pair();
        assert!(matches!(
            Stack::new(&cases[1], Arc::new(transport)),
            Err(StackError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_create_socket() {
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        let (transport, _peer) = PipeTransport::pair();
        let stack = Stack::new(&config(addr), Arc::new(transport)).unwrap();

        let socket = stack
            .create_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 80))
            .unwrap();
        assert_eq!(socket.local_addr(), SocketAddrV4::new(addr, 80));
        assert_eq!(socket.state(), State::Closed);
        assert_eq!(socket.peer_addr(), None);

        assert!(matches!(
            stack.create_socket(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 80)),
            Err(StackError::InvalidAddress(_))
        ));

        let mut sockets = vec![socket];
        for port in 1..u16::try_from(MAXSOCKETS).unwrap() {
            sockets.push(stack.create_socket(SocketAddrV4::new(addr, port)).unwrap());
        }
        assert!(matches!(
            stack.create_socket(SocketAddrV4::new(addr, 9999)),
            Err(StackError::Table(TableError::Full))
        ));

        // A listening socket cannot go back to the pool, a closed one can.
        let socket = sockets.pop().unwrap();
        socket.passive_open().unwrap();
        let socket = socket.destroy_socket().unwrap_err();
        socket.close_connection().unwrap();
        socket.destroy_socket().unwrap();
        stack.create_socket(SocketAddrV4::new(addr, 9999)).unwrap();

        stack.shutdown();
        // Twice is fine.
        stack.shutdown();
    }

    #[test]
    fn test_user_calls_on_closed_socket() {
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        let (transport, _peer) = PipeTransport::pair();
        let stack = Stack::new(&config(addr), Arc::new(transport)).unwrap();
        let socket = stack.create_socket(SocketAddrV4::new(addr, 80)).unwrap();

        assert_eq!(
            socket.send_data(b"data").unwrap_err(),
            ConnectionError::InvalidState(State::Closed)
        );
        assert_eq!(socket.read_nonblocking(&mut [0u8; 8]).unwrap(), 0);
        // A socket that never connected reads as end of stream.
        assert_eq!(socket.read_blocking(&mut [0u8; 8]).unwrap(), 0);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            StackError::AlreadyInitialized.to_string(),
            "The TCP stack is already initialized"
        );
        assert_eq!(
            StackError::InvalidAddress(Ipv4Addr::new(10, 0, 0, 9)).to_string(),
            "The stack does not own address 10.0.0.9"
        );
        assert_eq!(
            StackError::Table(TableError::Full).to_string(),
            "Socket table error: All sockets are in use"
        );
    }
}
