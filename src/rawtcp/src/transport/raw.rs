// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::mem::size_of;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use utils::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use utils::eventfd::{EventFd, EFD_NONBLOCK};

use super::{Transport, TransportError};

const SOCKET_TOKEN: u64 = 0;
const EXIT_TOKEN: u64 = 1;

/// A `SOCK_RAW` socket receiving every TCP packet addressed to the host.
///
/// The kernel builds the IPv4 header of outgoing segments. Opening the socket needs
/// `CAP_NET_RAW`.
#[derive(Debug)]
pub struct RawSocket {
    socket: OwnedFd,
    epoll: Epoll,
    exit_evt: EventFd,
}

impl RawSocket {
    pub fn new() -> Result<Self, TransportError> {
        // SAFETY: socket() has no memory safety preconditions, and we check the return value.
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::IPPROTO_TCP,
            )
        };
        if fd < 0 {
            return Err(TransportError::Socket(io::Error::last_os_error()));
        }
        // SAFETY: The descriptor was just returned by socket() and has no other owner.
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };

        let exit_evt = EventFd::new(EFD_NONBLOCK).map_err(TransportError::EventFd)?;
        let epoll = Epoll::new().map_err(TransportError::Epoll)?;
        epoll
            .ctl(
                ControlOperation::Add,
                socket.as_raw_fd(),
                EpollEvent::new(EventSet::IN, SOCKET_TOKEN),
            )
            .map_err(TransportError::Epoll)?;
        epoll
            .ctl(
                ControlOperation::Add,
                exit_evt.as_raw_fd(),
                EpollEvent::new(EventSet::IN, EXIT_TOKEN),
            )
            .map_err(TransportError::Epoll)?;

        Ok(RawSocket {
            socket,
            epoll,
            exit_evt,
        })
    }
}

impl Transport for RawSocket {
    fn recv_packet(&self, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
        let mut events = [EpollEvent::default(); 2];
        loop {
            let count = match self.epoll.wait(-1, &mut events) {
                Ok(count) => count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Epoll(err)),
            };
            if events[..count]
                .iter()
                .any(|event| event.data() == EXIT_TOKEN)
            {
                return Ok(None);
            }
            if count == 0 {
                continue;
            }

            // SAFETY: `buf` is valid for writes of `buf.len()` bytes, and we check the return
            // value.
            let len = unsafe {
                libc::recv(
                    self.socket.as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                    libc::MSG_DONTWAIT,
                )
            };
            if len < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => continue,
                    _ => return Err(TransportError::Recv(err)),
                }
            }
            return Ok(Some(len.unsigned_abs()));
        }
    }

    fn send_segment(
        &self,
        _src: Ipv4Addr,
        dst: Ipv4Addr,
        segment: &[u8],
    ) -> Result<(), TransportError> {
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from(dst).to_be(),
            },
            sin_zero: [0; 8],
        };

        // SAFETY: `segment` is valid for reads of `segment.len()` bytes, `addr` is a properly
        // initialized sockaddr_in whose size we pass along, and we check the return value.
        let ret = unsafe {
            libc::sendto(
                self.socket.as_raw_fd(),
                segment.as_ptr().cast(),
                segment.len(),
                0,
                std::ptr::addr_of!(addr).cast(),
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(TransportError::Send(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn shutdown(&self) {
        // The only possible failure is an overflowing counter, which still leaves it readable.
        let _ = self.exit_evt.write(1);
    }
}
