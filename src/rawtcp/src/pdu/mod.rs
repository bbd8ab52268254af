// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A module for interpreting byte slices as `PDU`s.
//!
//! PDU stands for protocol data unit, and represents data transmitted as a single unit during
//! communication using a specific protocol. IPv4 packets and TCP segments are both examples of
//! protocol data units.

use byteorder::{BigEndian, ByteOrder};

pub mod bytes;
pub mod ipv4;
pub mod tcp;

/// Folds `bytes`, read as big-endian 16-bit words, into the ones' complement sum started by
/// `sum`, and returns the complement. An odd trailing byte is padded with zero.
///
/// Verifying a checksum amounts to running this over data that already contains one, which
/// yields 0 when it is correct.
pub(crate) fn internet_checksum(mut sum: u32, bytes: &[u8]) -> u16 {
    let mut words = bytes.chunks_exact(2);
    for word in words.by_ref() {
        sum += u32::from(BigEndian::read_u16(word));
    }
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Wraps a PDU that does not have everything filled in yet.
///
/// Fields like the checksum can only be calculated after the payload becomes known, and the
/// length of the underlying slice has to shrink to the exact size of the PDU once a
/// variable-length payload is written. Each PDU implements its own ways of completing an
/// `Incomplete<T>`.
#[derive(Debug)]
pub struct Incomplete<T> {
    inner: T,
}

impl<T> Incomplete<T> {
    #[inline]
    fn new(inner: T) -> Self {
        Incomplete { inner }
    }

    /// Returns a reference to the wrapped PDU.
    #[inline]
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Returns a mutable reference to the wrapped PDU.
    #[inline]
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internet_checksum() {
        // The worked example of RFC 1071, section 3.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(0, &data), !0xddf2);

        // Appending the checksum makes the whole sum verify.
        let mut with_checksum = data.to_vec();
        with_checksum.extend_from_slice(&internet_checksum(0, &data).to_be_bytes());
        assert_eq!(internet_checksum(0, &with_checksum), 0);

        // An odd length pads the last byte on the right.
        assert_eq!(internet_checksum(0, &[0x12]), !0x1200);
        assert_eq!(internet_checksum(0x1200, &[]), internet_checksum(0, &[0x12]));
    }
}
