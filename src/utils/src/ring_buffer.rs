// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::cmp::min;

/// Fixed-capacity byte queue backed by an inline array.
///
/// Bytes are appended at the write cursor (`start + len`) and removed from the read cursor
/// (`start`). Both cursors wrap around the end of the array, so no data is ever moved.
/// `N` must not be 0.
#[derive(Debug, Clone)]
pub struct RingBuffer<const N: usize> {
    items: [u8; N],
    start: usize,
    len: usize,
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> RingBuffer<N> {
    /// New empty buffer.
    pub const fn new() -> Self {
        Self {
            items: [0; N],
            start: 0,
            len: 0,
        }
    }

    /// Total number of bytes the buffer can hold.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of bytes currently queued.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if ring is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if ring is full
    pub fn is_full(&self) -> bool {
        self.len == N
    }

    /// Number of bytes that can still be written.
    pub fn free(&self) -> usize {
        N - self.len
    }

    /// Appends as much of `data` as fits and returns the number of bytes written.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let count = min(data.len(), self.free());
        if count == 0 {
            return 0;
        }

        let tail = (self.start + self.len) % N;
        let first = min(count, N - tail);
        self.items[tail..tail + first].copy_from_slice(&data[..first]);
        self.items[..count - first].copy_from_slice(&data[first..count]);
        self.len += count;
        count
    }

    /// Copies queued bytes into `buf` without removing them, starting `offset` bytes past the
    /// read cursor. Returns the number of bytes copied.
    pub fn peek(&self, offset: usize, buf: &mut [u8]) -> usize {
        if offset >= self.len {
            return 0;
        }

        let count = min(buf.len(), self.len - offset);
        let pos = (self.start + offset) % N;
        let first = min(count, N - pos);
        buf[..first].copy_from_slice(&self.items[pos..pos + first]);
        buf[first..count].copy_from_slice(&self.items[..count - first]);
        count
    }

    /// Drops up to `count` bytes from the front of the queue and returns how many were dropped.
    pub fn consume(&mut self, count: usize) -> usize {
        let count = min(count, self.len);
        if count == 0 {
            return 0;
        }

        self.start = (self.start + count) % N;
        self.len -= count;
        count
    }

    /// Moves up to `buf.len()` bytes from the front of the queue into `buf`.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let count = self.peek(0, buf);
        self.consume(count)
    }

    /// Drops every queued byte and rewinds both cursors.
    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }
}
