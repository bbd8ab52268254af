// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use logger::extract_guard;

use crate::tcp::engine::Binding;
use crate::tcp::tcb::Tcb;
use crate::tcp::State;
use crate::MAXSOCKETS;

/// Describes errors which may occur when managing socket table slots.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum TableError {
    /// All sockets are in use
    Full,
    /// The socket is not closed
    NotClosed,
    /// No socket at this index
    InvalidIndex,
}

// Addressing information for a slot. It lives here rather than in the TCB, so segment
// demultiplexing only ever needs the table lock.
#[derive(Debug, Clone, Copy)]
struct Slot {
    in_use: bool,
    local: SocketAddrV4,
    remote: Option<SocketAddrV4>,
    listening: bool,
}

const FREE_SLOT: Slot = Slot {
    in_use: false,
    local: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
    remote: None,
    listening: false,
};

/// Fixed pool of TCBs, and the addressing used to find the one a segment belongs to.
#[derive(Debug)]
pub struct SocketTable {
    slots: Mutex<[Slot; MAXSOCKETS]>,
    tcbs: [Arc<Tcb>; MAXSOCKETS],
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketTable {
    pub fn new() -> Self {
        SocketTable {
            slots: Mutex::new([FREE_SLOT; MAXSOCKETS]),
            tcbs: std::array::from_fn(|index| Arc::new(Tcb::new(index))),
        }
    }

    /// Claims a free slot for a socket bound to `local`, and returns its index. The TCB starts
    /// out `CLOSED`.
    pub fn allocate(&self, local: SocketAddrV4) -> Result<usize, TableError> {
        let index = {
            let mut slots = extract_guard(self.slots.lock());
            let index = slots
                .iter()
                .position(|slot| !slot.in_use)
                .ok_or(TableError::Full)?;
            slots[index] = Slot {
                in_use: true,
                local,
                ..FREE_SLOT
            };
            index
        };

        // Nothing can reach the TCB through a lookup until it is bound, so it is safe to reset it
        // outside the table lock.
        self.tcbs[index].reset(local);
        Ok(index)
    }

    /// The TCB in slot `index`, if the slot is in use.
    pub fn get(&self, index: usize) -> Option<Arc<Tcb>> {
        let slots = extract_guard(self.slots.lock());
        match slots.get(index) {
            Some(slot) if slot.in_use => Some(self.tcbs[index].clone()),
            _ => None,
        }
    }

    /// Finds the connection a segment from `remote` to `local` belongs to: an exact match first,
    /// then a listening socket bound to `local`.
    pub fn lookup(&self, local: SocketAddrV4, remote: SocketAddrV4) -> Option<Arc<Tcb>> {
        let slots = extract_guard(self.slots.lock());

        let exact = slots
            .iter()
            .position(|slot| slot.in_use && slot.local == local && slot.remote == Some(remote));
        let index = exact.or_else(|| {
            slots.iter().position(|slot| {
                slot.in_use && slot.listening && slot.remote.is_none() && slot.local == local
            })
        })?;

        Some(self.tcbs[index].clone())
    }

    /// Releases slot `index`. The TCB has to be `CLOSED`.
    pub fn free(&self, index: usize) -> Result<(), TableError> {
        let tcb = self.tcbs.get(index).ok_or(TableError::InvalidIndex)?;
        let snd = tcb.lock_send();
        if snd.state != State::Closed {
            return Err(TableError::NotClosed);
        }

        let mut slots = extract_guard(self.slots.lock());
        if !slots[index].in_use {
            return Err(TableError::InvalidIndex);
        }
        slots[index] = FREE_SLOT;
        Ok(())
    }

    /// Ties slot `index` to a single remote endpoint.
    pub fn bind_remote(&self, index: usize, remote: SocketAddrV4) {
        self.update(index, |slot| {
            slot.remote = Some(remote);
            slot.listening = false;
        });
    }

    /// Unties slot `index` from its remote endpoint.
    pub fn unbind_remote(&self, index: usize) {
        self.update(index, |slot| {
            slot.remote = None;
            slot.listening = false;
        });
    }

    /// Makes slot `index` match segments from any remote endpoint.
    pub fn listen(&self, index: usize) {
        self.update(index, |slot| {
            slot.remote = None;
            slot.listening = true;
        });
    }

    /// Applies a binding change the state machine asked for.
    pub fn apply(&self, index: usize, binding: Binding) {
        match binding {
            Binding::Listen => self.listen(index),
            Binding::Remote(remote) => self.bind_remote(index, remote),
            Binding::Unbound => self.unbind_remote(index),
        }
    }

    /// Snapshot of every TCB in use.
    pub fn in_use(&self) -> Vec<Arc<Tcb>> {
        let slots = extract_guard(self.slots.lock());
        slots
            .iter()
            .zip(self.tcbs.iter())
            .filter(|(slot, _)| slot.in_use)
            .map(|(_, tcb)| tcb.clone())
            .collect()
    }

    fn update<F: FnOnce(&mut Slot)>(&self, index: usize, f: F) {
        let mut slots = extract_guard(self.slots.lock());
        if let Some(slot) = slots.get_mut(index).filter(|slot| slot.in_use) {
            f(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn test_allocate_until_full() {
        let table = SocketTable::new();
        for expected in 0..MAXSOCKETS {
            let port = u16::try_from(1000 + expected).unwrap();
            assert_eq!(table.allocate(addr(port)).unwrap(), expected);
        }
        assert_eq!(table.allocate(addr(80)).unwrap_err(), TableError::Full);
        assert_eq!(table.in_use().len(), MAXSOCKETS);

        table.free(5).unwrap();
        assert_eq!(table.allocate(addr(80)).unwrap(), 5);
        assert_eq!(table.get(5).unwrap().lock_send().local, addr(80));
    }

    #[test]
    fn test_lookup_prefers_exact_match() {
        let table = SocketTable::new();
        let listener = table.allocate(addr(80)).unwrap();
        let connected = table.allocate(addr(80)).unwrap();
        let other = table.allocate(addr(81)).unwrap();

        // Nothing is bound yet.
        assert!(table.lookup(addr(80), addr(5000)).is_none());

        table.listen(listener);
        table.bind_remote(connected, addr(5000));
        table.bind_remote(other, addr(5000));

        assert_eq!(
            table.lookup(addr(80), addr(5000)).unwrap().index(),
            connected
        );
        assert_eq!(table.lookup(addr(80), addr(6000)).unwrap().index(), listener);
        assert_eq!(table.lookup(addr(81), addr(5000)).unwrap().index(), other);
        assert!(table.lookup(addr(81), addr(6000)).is_none());

        // A listener that took a connection stops matching other peers.
        table.apply(listener, Binding::Remote(addr(7000)));
        assert!(table.lookup(addr(80), addr(6000)).is_none());
        table.apply(listener, Binding::Listen);
        assert_eq!(table.lookup(addr(80), addr(6000)).unwrap().index(), listener);

        table.apply(connected, Binding::Unbound);
        assert_eq!(table.lookup(addr(80), addr(5000)).unwrap().index(), listener);
    }

    #[test]
    fn test_free() {
        let table = SocketTable::new();
        assert_eq!(table.free(0).unwrap_err(), TableError::InvalidIndex);
        assert_eq!(
            table.free(MAXSOCKETS).unwrap_err(),
            TableError::InvalidIndex
        );

        let index = table.allocate(addr(80)).unwrap();
        table.get(index).unwrap().lock_send().state = State::Listen;
        assert_eq!(table.free(index).unwrap_err(), TableError::NotClosed);

        table.get(index).unwrap().lock_send().state = State::Closed;
        table.free(index).unwrap();
        assert!(table.get(index).is_none());
        assert_eq!(table.free(index).unwrap_err(), TableError::InvalidIndex);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(TableError::Full.to_string(), "All sockets are in use");
    }
}
