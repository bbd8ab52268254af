// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The IPv4 layer around TCP segments.
//!
//! A raw socket hands the receive dispatcher whole packets, so they have to be checked and
//! stripped of their header; the in-process transport goes the other way and wraps outgoing
//! segments. Only the fields a TCP endpoint cares about are exposed. Options are skipped on
//! input and never written.

use std::net::Ipv4Addr;

use super::bytes::{InnerBytes, NetworkBytes, NetworkBytesMut};
use super::{internet_checksum, Incomplete};

const VERSION_AND_IHL_OFFSET: usize = 0;
const TOTAL_LEN_OFFSET: usize = 2;
const FLAGS_AND_FRAGMENTOFF_OFFSET: usize = 6;
const TTL_OFFSET: usize = 8;
const PROTOCOL_OFFSET: usize = 9;
const HEADER_CHECKSUM_OFFSET: usize = 10;
const SOURCE_ADDRESS_OFFSET: usize = 12;
const DESTINATION_ADDRESS_OFFSET: usize = 16;

const IPV4_VERSION: u8 = 4;
const DEFAULT_TTL: u8 = 64;
// Don't Fragment, at bit 14 of the flags and fragment offset word.
const FLAG_DF: u16 = 0x4000;

/// The IP protocol number associated with TCP.
pub const PROTOCOL_TCP: u8 = 6;

/// Length of an IPv4 header without options.
pub const IPV4_HEADER_LEN: usize = 20;

/// Describes the errors which may occur while handling IPv4 packets.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum Ipv4Error {
    /// Invalid IPv4 header checksum.
    Checksum,
    /// Invalid IPv4 header length.
    HeaderLen,
    /// The total length field is smaller than the header.
    InvalidTotalLen,
    /// The total length field does not match the size of the packet.
    SliceExactLength,
    /// Slice too short to hold an IPv4 header.
    SliceTooShort,
    /// Not an IPv4 packet.
    Version,
}

/// A view of an IPv4 packet over some bytes.
#[derive(Debug)]
pub struct IPv4Packet<'a, T: 'a> {
    bytes: InnerBytes<'a, T>,
}

impl<T: NetworkBytes> IPv4Packet<'_, T> {
    /// Checks the header of the packet held by `bytes`, which must have the exact length the
    /// header announces.
    pub fn from_bytes(bytes: T, verify_checksum: bool) -> Result<Self, Ipv4Error> {
        if bytes.len() < IPV4_HEADER_LEN {
            return Err(Ipv4Error::SliceTooShort);
        }
        let packet = IPv4Packet {
            bytes: InnerBytes::new(bytes),
        };

        if packet.bytes[VERSION_AND_IHL_OFFSET] >> 4 != IPV4_VERSION {
            return Err(Ipv4Error::Version);
        }
        let header_len = packet.header_len();
        if header_len < IPV4_HEADER_LEN {
            return Err(Ipv4Error::HeaderLen);
        }
        let total_len = usize::from(packet.bytes.ntohs_unchecked(TOTAL_LEN_OFFSET));
        if total_len < header_len {
            return Err(Ipv4Error::InvalidTotalLen);
        }
        if total_len != packet.bytes.len() {
            return Err(Ipv4Error::SliceExactLength);
        }
        if verify_checksum && internet_checksum(0, &packet.bytes[..header_len]) != 0 {
            return Err(Ipv4Error::Checksum);
        }

        Ok(packet)
    }

    /// Returns the header length in bytes, options included.
    #[inline]
    pub fn header_len(&self) -> usize {
        usize::from(self.bytes[VERSION_AND_IHL_OFFSET] & 0x0f) * 4
    }

    #[inline]
    pub fn protocol(&self) -> u8 {
        self.bytes[PROTOCOL_OFFSET]
    }

    #[inline]
    pub fn source_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.bytes.ntohl_unchecked(SOURCE_ADDRESS_OFFSET))
    }

    #[inline]
    pub fn destination_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.bytes.ntohl_unchecked(DESTINATION_ADDRESS_OFFSET))
    }

    /// Returns whatever follows the header.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.header_len()..]
    }
}

impl<'a, T: NetworkBytesMut> IPv4Packet<'a, T> {
    /// Writes an option-less header for a packet from `src_addr` to `dst_addr` at the start of
    /// `buf`, leaving the length and the checksum to
    /// [`with_payload_len_unchecked`](Incomplete::with_payload_len_unchecked).
    pub fn write_header(
        buf: T,
        protocol: u8,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
    ) -> Result<Incomplete<Self>, Ipv4Error> {
        if buf.len() < IPV4_HEADER_LEN {
            return Err(Ipv4Error::SliceTooShort);
        }
        let mut bytes = InnerBytes::new(buf);
        // No DSCP/ECN and identification 0; DF makes the identification irrelevant.
        bytes[..IPV4_HEADER_LEN].fill(0);
        bytes[VERSION_AND_IHL_OFFSET] = (IPV4_VERSION << 4) | (IPV4_HEADER_LEN / 4) as u8;
        bytes.htons_unchecked(FLAGS_AND_FRAGMENTOFF_OFFSET, FLAG_DF);
        bytes[TTL_OFFSET] = DEFAULT_TTL;
        bytes[PROTOCOL_OFFSET] = protocol;
        bytes.htonl_unchecked(SOURCE_ADDRESS_OFFSET, u32::from(src_addr));
        bytes.htonl_unchecked(DESTINATION_ADDRESS_OFFSET, u32::from(dst_addr));

        Ok(Incomplete::new(IPv4Packet { bytes }))
    }

    /// Returns everything after the header as a mutable slice.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        &mut self.bytes[header_len..]
    }
}

impl<'a, T: NetworkBytesMut> Incomplete<IPv4Packet<'a, T>> {
    /// Completes the packet once `payload_len` bytes of payload have been written: the slice
    /// is cut to the packet size, the total length gets filled in and, if asked for, the
    /// header checksum as well.
    ///
    /// # Panics
    ///
    /// Panics if the payload does not fit in the slice given to `write_header`.
    pub fn with_payload_len_unchecked(
        mut self,
        payload_len: usize,
        compute_checksum: bool,
    ) -> IPv4Packet<'a, T> {
        let packet = &mut self.inner;
        let header_len = packet.header_len();
        let total_len = header_len + payload_len;

        packet.bytes.shrink_unchecked(total_len);
        packet.bytes.htons_unchecked(TOTAL_LEN_OFFSET, total_len as u16);
        packet.bytes.htons_unchecked(HEADER_CHECKSUM_OFFSET, 0);
        if compute_checksum {
            let checksum = internet_checksum(0, &packet.bytes[..header_len]);
            packet.bytes.htons_unchecked(HEADER_CHECKSUM_OFFSET, checksum);
        }
        self.inner
    }
}
