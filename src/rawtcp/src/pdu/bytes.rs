// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Big-endian field access over byte slices.
//!
//! Header views read and write their fields at fixed offsets instead of casting the bytes to a
//! packed struct. Any `Deref<Target = [u8]>` works as storage, so one view type gives read
//! access over `&[u8]` and gains setters over `&mut [u8]`.
//!
//! The `_unchecked` accessors panic on an offset past the end of the slice; the views validate
//! lengths once, when they are built.

use std::marker::PhantomData;
use std::mem::take;
use std::ops::{Deref, DerefMut};

use byteorder::{ByteOrder, NetworkEndian};

/// Read access to network-ordered values in a byte sequence.
pub trait NetworkBytes: Deref<Target = [u8]> {
    /// Reads the `u16` at `offset`.
    #[inline]
    fn ntohs_unchecked(&self, offset: usize) -> u16 {
        NetworkEndian::read_u16(&self[offset..])
    }

    /// Reads the `u32` at `offset`.
    #[inline]
    fn ntohl_unchecked(&self, offset: usize) -> u32 {
        NetworkEndian::read_u32(&self[offset..])
    }

    /// Cuts the sequence down to its first `len` bytes.
    fn shrink_unchecked(&mut self, len: usize);
}

/// Write access on top of [`NetworkBytes`].
pub trait NetworkBytesMut: NetworkBytes + DerefMut<Target = [u8]> {
    /// Stores `value` at `offset`.
    #[inline]
    fn htons_unchecked(&mut self, offset: usize, value: u16) {
        NetworkEndian::write_u16(&mut self[offset..], value)
    }

    /// Stores `value` at `offset`.
    #[inline]
    fn htonl_unchecked(&mut self, offset: usize, value: u32) {
        NetworkEndian::write_u32(&mut self[offset..], value)
    }
}

impl NetworkBytes for &[u8] {
    #[inline]
    fn shrink_unchecked(&mut self, len: usize) {
        *self = &self[..len];
    }
}

impl NetworkBytes for &mut [u8] {
    #[inline]
    fn shrink_unchecked(&mut self, len: usize) {
        // The slice has to be moved out before it can be reborrowed for the outer lifetime.
        *self = &mut take(self)[..len];
    }
}

impl NetworkBytesMut for &mut [u8] {}

// The storage of a header view, tagged with the lifetime of the bytes it borrows.
#[derive(Debug)]
pub(super) struct InnerBytes<'a, T: 'a> {
    bytes: T,
    phantom: PhantomData<&'a T>,
}

impl<T> InnerBytes<'_, T> {
    #[inline]
    pub fn new(bytes: T) -> Self {
        InnerBytes {
            bytes,
            phantom: PhantomData,
        }
    }
}

impl<T: Deref<Target = [u8]>> Deref for InnerBytes<'_, T> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T: DerefMut<Target = [u8]>> DerefMut for InnerBytes<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl<T: NetworkBytes> NetworkBytes for InnerBytes<'_, T> {
    #[inline]
    fn shrink_unchecked(&mut self, len: usize) {
        self.bytes.shrink_unchecked(len);
    }
}

impl<T: NetworkBytesMut> NetworkBytesMut for InnerBytes<'_, T> {}
