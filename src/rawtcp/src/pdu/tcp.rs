// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contains support for parsing and writing TCP segments.
//!
//! [`TcpSegment`] is a zero-copy view with typed accessors at fixed offsets; [`TcpHeader`] is a
//! plain copy of the fixed header fields, which is what the state machine works with.
//! [`encode`] and [`decode`] move between the two, computing and verifying the checksum over
//! the IPv4 pseudo-header.

use std::cmp::min;
use std::net::Ipv4Addr;

use bitflags::bitflags;

use super::bytes::{InnerBytes, NetworkBytes, NetworkBytesMut};
use super::ipv4::PROTOCOL_TCP;
use super::{internet_checksum, Incomplete};

const SOURCE_PORT_OFFSET: usize = 0;
const DESTINATION_PORT_OFFSET: usize = 2;
const SEQ_NUMBER_OFFSET: usize = 4;
const ACK_NUMBER_OFFSET: usize = 8;
const DATAOFF_RSVD_NS_OFFSET: usize = 12;
const FLAGS_AFTER_NS_OFFSET: usize = 13;
const WINDOW_SIZE_OFFSET: usize = 14;
const CHECKSUM_OFFSET: usize = 16;
const URG_POINTER_OFFSET: usize = 18;
const OPTIONS_OFFSET: usize = 20;

const MAX_HEADER_LEN: usize = 60;

/// Length of a TCP header without options.
pub const TCP_HEADER_LEN: usize = OPTIONS_OFFSET;

/// Value of the data offset field for a header without options (in 32-bit words).
pub const DATA_OFFSET_NO_OPTIONS: u8 = 5;

bitflags! {
    /// Control bits. These values are only valid in conjunction with the `flags_after_ns()`
    /// function, which returns the byte containing every flag except NS.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        /// Congestion window reduced.
        const CWR = 1 << 7;
        /// ECN echo.
        const ECE = 1 << 6;
        /// Urgent pointer is significant.
        const URG = 1 << 5;
        /// Acknowledgment number is significant.
        const ACK = 1 << 4;
        /// Push function.
        const PSH = 1 << 3;
        /// Reset the connection.
        const RST = 1 << 2;
        /// Synchronize sequence numbers.
        const SYN = 1 << 1;
        /// No more data from sender.
        const FIN = 1 << 0;
    }
}

/// Describes the errors which may occur while handling TCP segments.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum TcpError {
    /// Invalid checksum.
    Checksum,
    /// A payload has been specified for the segment, but it is empty.
    EmptyPayload,
    /// Invalid header length.
    HeaderLen,
    /// The specified slice is shorter than the header length.
    SliceTooShort,
}

/// Owned copy of the fixed TCP header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
    /// Sequence number of the first octet (or of the SYN).
    pub seq: u32,
    /// Next sequence number the sender expects, when `ACK` is set.
    pub ack: u32,
    /// Header length in 32-bit words.
    pub data_offset: u8,
    /// Control bits.
    pub flags: Flags,
    /// Receive window advertised by the sender.
    pub window: u16,
    /// Internet checksum over the pseudo-header, header and payload.
    pub checksum: u16,
    /// Offset from `seq` of the octet following urgent data, when `URG` is set.
    pub urgent_pointer: u16,
}

impl TcpHeader {
    /// A header without options, every field except the ports zeroed.
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        TcpHeader {
            src_port,
            dst_port,
            seq: 0,
            ack: 0,
            data_offset: DATA_OFFSET_NO_OPTIONS,
            flags: Flags::empty(),
            window: 0,
            checksum: 0,
            urgent_pointer: 0,
        }
    }

    /// Amount of sequence space a segment with this header and `payload_len` bytes of data
    /// occupies (SYN and FIN count for one each).
    pub fn sequence_len(&self, payload_len: usize) -> u32 {
        let mut len = u32::try_from(payload_len).unwrap_or(u32::MAX);
        if self.flags.contains(Flags::SYN) {
            len = len.wrapping_add(1);
        }
        if self.flags.contains(Flags::FIN) {
            len = len.wrapping_add(1);
        }
        len
    }
}

/// Interprets the inner bytes as a TCP segment.
// The checksum computation is IPv4 specific.
#[derive(Debug)]
pub struct TcpSegment<'a, T: 'a> {
    bytes: InnerBytes<'a, T>,
}

#[allow(clippy::len_without_is_empty)]
impl<T: NetworkBytes> TcpSegment<'_, T> {
    // Here's a useful depiction of the TCP header layout:
    // https://en.wikipedia.org/wiki/Transmission_Control_Protocol#TCP_segment_structure
    // (watch out for the MSB 0 bit numbering, which isn't even stated this time)

    /// Returns the value of the `source port` header field.
    #[inline]
    pub fn source_port(&self) -> u16 {
        self.bytes.ntohs_unchecked(SOURCE_PORT_OFFSET)
    }

    /// Returns the value of the `destination port` header field.
    #[inline]
    pub fn destination_port(&self) -> u16 {
        self.bytes.ntohs_unchecked(DESTINATION_PORT_OFFSET)
    }

    /// Returns the value of the `sequence number` header field.
    #[inline]
    pub fn sequence_number(&self) -> u32 {
        self.bytes.ntohl_unchecked(SEQ_NUMBER_OFFSET)
    }

    /// Returns the value of the `acknowledgement number` header field.
    #[inline]
    pub fn ack_number(&self) -> u32 {
        self.bytes.ntohl_unchecked(ACK_NUMBER_OFFSET)
    }

    /// Returns the header length, the value of the reserved bits, and whether the `NS` flag
    /// is set or not.
    #[inline]
    pub fn header_len_rsvd_ns(&self) -> (usize, u8, bool) {
        let value = self.bytes[DATAOFF_RSVD_NS_OFFSET];
        let data_offset = value >> 4;
        let header_len = data_offset as usize * 4;
        let rsvd = value & 0x0e;
        let ns = (value & 1) != 0;
        (header_len, rsvd, ns)
    }

    /// Returns the length of the header.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.header_len_rsvd_ns().0
    }

    /// Returns the TCP header flags, with the exception of `NS`.
    #[inline]
    pub fn flags_after_ns(&self) -> Flags {
        Flags::from_bits_truncate(self.bytes[FLAGS_AFTER_NS_OFFSET])
    }

    /// Returns the value of the `window size` header field.
    #[inline]
    pub fn window_size(&self) -> u16 {
        self.bytes.ntohs_unchecked(WINDOW_SIZE_OFFSET)
    }

    /// Returns the value of the `checksum` header field.
    #[inline]
    pub fn checksum(&self) -> u16 {
        self.bytes.ntohs_unchecked(CHECKSUM_OFFSET)
    }

    /// Returns the value of the `urgent pointer` header field.
    #[inline]
    pub fn urgent_pointer(&self) -> u16 {
        self.bytes.ntohs_unchecked(URG_POINTER_OFFSET)
    }

    /// Returns the TCP payload as an unchecked slice.
    ///
    /// # Panics
    ///
    /// This method may panic if the value of `header_len` is invalid.
    #[inline]
    pub fn payload_unchecked(&self, header_len: usize) -> &[u8] {
        self.bytes.split_at(header_len).1
    }

    /// Returns the length of the segment.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns the TCP payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.payload_unchecked(self.header_len())
    }

    /// Returns the length of the TCP payload.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.len() - self.header_len()
    }

    /// Copies the fixed header fields out of the segment.
    pub fn header(&self) -> TcpHeader {
        TcpHeader {
            src_port: self.source_port(),
            dst_port: self.destination_port(),
            seq: self.sequence_number(),
            ack: self.ack_number(),
            data_offset: self.bytes[DATAOFF_RSVD_NS_OFFSET] >> 4,
            flags: self.flags_after_ns(),
            window: self.window_size(),
            checksum: self.checksum(),
            urgent_pointer: self.urgent_pointer(),
        }
    }

    /// Computes the TCP checksum of the segment. More details about TCP checksum computation
    /// can be found [here].
    ///
    /// [here]: https://en.wikipedia.org/wiki/Transmission_Control_Protocol#Checksum_computation
    pub fn compute_checksum(&self, src_addr: Ipv4Addr, dst_addr: Ipv4Addr) -> u16 {
        // A segment is at most 64 KiB, so 32 bits hold the whole sum before folding.
        let pseudo_header = [u32::from(src_addr), u32::from(dst_addr)]
            .iter()
            .map(|addr| (addr >> 16) + (addr & 0xffff))
            .sum::<u32>()
            + u32::from(PROTOCOL_TCP)
            + u32::try_from(self.len()).unwrap_or(u32::MAX);
        internet_checksum(pseudo_header, &self.bytes)
    }

    #[inline]
    fn from_bytes_unchecked(bytes: T) -> Self {
        TcpSegment {
            bytes: InnerBytes::new(bytes),
        }
    }

    /// Attempts to interpret `bytes` as a TCP segment. If `verify_checksum` carries the source
    /// and destination IPv4 addresses, the checksum is verified as well.
    #[inline]
    pub fn from_bytes(
        bytes: T,
        verify_checksum: Option<(Ipv4Addr, Ipv4Addr)>,
    ) -> Result<Self, TcpError> {
        if bytes.len() < OPTIONS_OFFSET {
            return Err(TcpError::SliceTooShort);
        }

        let segment = Self::from_bytes_unchecked(bytes);

        // We skip checking if the reserved bits are 0b000 (and a couple of other things).

        let header_len = segment.header_len();

        if header_len < OPTIONS_OFFSET || header_len > min(MAX_HEADER_LEN, segment.len()) {
            return Err(TcpError::HeaderLen);
        }

        if let Some((src_addr, dst_addr)) = verify_checksum {
            if segment.compute_checksum(src_addr, dst_addr) != 0 {
                return Err(TcpError::Checksum);
            }
        }

        Ok(segment)
    }
}

impl<'a, T: NetworkBytesMut> TcpSegment<'a, T> {
    /// Sets the value of the `source port` header field.
    #[inline]
    pub fn set_source_port(&mut self, value: u16) -> &mut Self {
        self.bytes.htons_unchecked(SOURCE_PORT_OFFSET, value);
        self
    }

    /// Sets the value of the `destination port` header field.
    #[inline]
    pub fn set_destination_port(&mut self, value: u16) -> &mut Self {
        self.bytes.htons_unchecked(DESTINATION_PORT_OFFSET, value);
        self
    }

    /// Sets the value of the `sequence number` header field.
    #[inline]
    pub fn set_sequence_number(&mut self, value: u32) -> &mut Self {
        self.bytes.htonl_unchecked(SEQ_NUMBER_OFFSET, value);
        self
    }

    /// Sets the value of the `acknowledgement number` header field.
    #[inline]
    pub fn set_ack_number(&mut self, value: u32) -> &mut Self {
        self.bytes.htonl_unchecked(ACK_NUMBER_OFFSET, value);
        self
    }

    /// Sets the value of the `data offset` field from `header_len`, which should be a multiple
    /// of 4. Reserved is implicitly set to 0b000.
    #[inline]
    pub fn set_header_len_rsvd_ns(&mut self, header_len: usize, ns: bool) -> &mut Self {
        let mut value = ((header_len / 4) as u8) << 4;
        if ns {
            value |= 1;
        }
        self.bytes[DATAOFF_RSVD_NS_OFFSET] = value;
        self
    }

    /// Sets the value of the `flags` header field, leaving `NS` untouched.
    #[inline]
    pub fn set_flags_after_ns(&mut self, flags: Flags) -> &mut Self {
        self.bytes[FLAGS_AFTER_NS_OFFSET] = flags.bits();
        self
    }

    /// Sets the value of the `window size` header field.
    #[inline]
    pub fn set_window_size(&mut self, value: u16) -> &mut Self {
        self.bytes.htons_unchecked(WINDOW_SIZE_OFFSET, value);
        self
    }

    /// Sets the value of the `checksum` header field.
    #[inline]
    pub fn set_checksum(&mut self, value: u16) -> &mut Self {
        self.bytes.htons_unchecked(CHECKSUM_OFFSET, value);
        self
    }

    /// Sets the value of the `urgent pointer` header field.
    #[inline]
    pub fn set_urgent_pointer(&mut self, value: u16) -> &mut Self {
        self.bytes.htons_unchecked(URG_POINTER_OFFSET, value);
        self
    }

    /// Returns a mutable slice over the payload.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len();
        self.bytes.split_at_mut(header_len).1
    }

    /// Writes an entire segment, checksum included when `compute_checksum` carries the IPv4
    /// source and destination addresses.
    #[allow(clippy::too_many_arguments)]
    #[inline]
    pub fn write_segment(
        buf: T,
        src_port: u16,
        dst_port: u16,
        seq_number: u32,
        ack_number: u32,
        flags_after_ns: Flags,
        window_size: u16,
        urgent_pointer: u16,
        payload: Option<(&[u8], usize)>,
        compute_checksum: Option<(Ipv4Addr, Ipv4Addr)>,
    ) -> Result<Self, TcpError> {
        Ok(Self::write_incomplete_segment(
            buf,
            seq_number,
            ack_number,
            flags_after_ns,
            window_size,
            urgent_pointer,
            payload,
        )?
        .finalize(src_port, dst_port, compute_checksum))
    }

    /// Writes a segment without the source port, destination port and checksum fields.
    ///
    /// Options are never written, so the header is always `TCP_HEADER_LEN` bytes long. When
    /// `payload` is present, it holds a buffer to read data from and the maximum number of
    /// bytes allowed in this segment (restricted by things like flow control); as much data as
    /// fits in `buf` is copied.
    #[inline]
    pub fn write_incomplete_segment(
        buf: T,
        seq_number: u32,
        ack_number: u32,
        flags_after_ns: Flags,
        window_size: u16,
        urgent_pointer: u16,
        payload: Option<(&[u8], usize)>,
    ) -> Result<Incomplete<Self>, TcpError> {
        let mut segment_len = OPTIONS_OFFSET;

        if buf.len() < segment_len {
            return Err(TcpError::SliceTooShort);
        }

        // The unchecked call is fine because buf.len() >= segment_len.
        let mut segment = Self::from_bytes_unchecked(buf);

        segment
            .set_sequence_number(seq_number)
            .set_ack_number(ack_number)
            .set_header_len_rsvd_ns(OPTIONS_OFFSET, false)
            .set_flags_after_ns(flags_after_ns)
            .set_window_size(window_size)
            .set_urgent_pointer(urgent_pointer);

        if let Some((payload_buf, max_payload_bytes)) = payload {
            let left_to_read = min(payload_buf.len(), max_payload_bytes);
            let room_for_payload = min(segment.len() - segment_len, left_to_read);

            if room_for_payload == 0 {
                return Err(TcpError::EmptyPayload);
            }

            segment.bytes[segment_len..segment_len + room_for_payload]
                .copy_from_slice(&payload_buf[..room_for_payload]);
            segment_len += room_for_payload;
        }

        // Shrink the resulting segment to a slice of exact size, so using self.len() makes sense.
        segment.bytes.shrink_unchecked(segment_len);

        Ok(Incomplete::new(segment))
    }
}

impl<'a, T: NetworkBytesMut> Incomplete<TcpSegment<'a, T>> {
    /// Fills in the ports and, unless `compute_checksum` is `None`, the checksum.
    pub fn finalize(
        mut self,
        src_port: u16,
        dst_port: u16,
        compute_checksum: Option<(Ipv4Addr, Ipv4Addr)>,
    ) -> TcpSegment<'a, T> {
        self.inner.set_source_port(src_port);
        self.inner.set_destination_port(dst_port);
        if let Some((src_addr, dst_addr)) = compute_checksum {
            // Set this to 0 first.
            self.inner.set_checksum(0);
            let checksum = self.inner.compute_checksum(src_addr, dst_addr);
            self.inner.set_checksum(checksum);
        }
        self.inner
    }
}

/// Writes `header` followed by `payload` into `buf` and returns the segment length.
///
/// The data offset is always written as 5 (no options) and the checksum field of `header` is
/// ignored; the checksum is computed over the pseudo-header built from `src_addr` and `dst_addr`.
pub fn encode(
    header: &TcpHeader,
    payload: &[u8],
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
    buf: &mut [u8],
) -> Result<usize, TcpError> {
    if buf.len() < TCP_HEADER_LEN + payload.len() {
        return Err(TcpError::SliceTooShort);
    }

    let payload = if payload.is_empty() {
        None
    } else {
        Some((payload, payload.len()))
    };

    let segment = TcpSegment::write_segment(
        buf,
        header.src_port,
        header.dst_port,
        header.seq,
        header.ack,
        header.flags,
        header.window,
        header.urgent_pointer,
        payload,
        Some((src_addr, dst_addr)),
    )?;
    Ok(segment.len())
}

/// Parses a segment received from `src_addr` for `dst_addr`, verifying its checksum, and
/// returns the header fields along with the payload. Options are skipped.
pub fn decode(
    bytes: &[u8],
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
) -> Result<(TcpHeader, &[u8]), TcpError> {
    let segment = TcpSegment::from_bytes(bytes, Some((src_addr, dst_addr)))?;
    let header = segment.header();
    Ok((header, &bytes[segment.header_len()..]))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 1, 2, 3);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 168, 44, 77);

    #[test]
    fn test_set_get() {
        let mut a = [0u8; 100];
        let mut p = TcpSegment::from_bytes_unchecked(a.as_mut());

        assert_eq!(p.source_port(), 0);
        p.set_source_port(123);
        assert_eq!(p.source_port(), 123);

        assert_eq!(p.destination_port(), 0);
        p.set_destination_port(322);
        assert_eq!(p.destination_port(), 322);

        assert_eq!(p.sequence_number(), 0);
        p.set_sequence_number(1234567);
        assert_eq!(p.sequence_number(), 1234567);

        assert_eq!(p.ack_number(), 0);
        p.set_ack_number(345234);
        assert_eq!(p.ack_number(), 345234);

        assert_eq!(p.header_len_rsvd_ns(), (0, 0, false));
        assert_eq!(p.header_len(), 0);
        // Header_len must be a multiple of 4 here to be valid.
        let header_len = 60;
        p.set_header_len_rsvd_ns(header_len, true);
        assert_eq!(p.header_len_rsvd_ns(), (header_len, 0, true));
        assert_eq!(p.header_len(), header_len);

        assert_eq!(p.flags_after_ns().bits(), 0);
        p.set_flags_after_ns(Flags::SYN | Flags::URG);
        assert_eq!(p.flags_after_ns(), Flags::SYN | Flags::URG);

        assert_eq!(p.window_size(), 0);
        p.set_window_size(60000);
        assert_eq!(p.window_size(), 60000);

        assert_eq!(p.checksum(), 0);
        p.set_checksum(4321);
        assert_eq!(p.checksum(), 4321);

        assert_eq!(p.urgent_pointer(), 0);
        p.set_urgent_pointer(5554);
        assert_eq!(p.urgent_pointer(), 5554);
    }

    #[test]
    fn test_flag_values() {
        assert_eq!(Flags::CWR.bits(), 0x80);
        assert_eq!(Flags::ECE.bits(), 0x40);
        assert_eq!(Flags::URG.bits(), 0x20);
        assert_eq!(Flags::ACK.bits(), 0x10);
        assert_eq!(Flags::PSH.bits(), 0x08);
        assert_eq!(Flags::RST.bits(), 0x04);
        assert_eq!(Flags::SYN.bits(), 0x02);
        assert_eq!(Flags::FIN.bits(), 0x01);
    }

    #[test]
    fn test_constructors() {
        let mut a = [1u8; 300];
        let b = [2u8; 200];
        let c = [3u8; 2000];

        let src_port = 1234;
        let dst_port = 5678;
        let seq_number = 11111222;
        let ack_number = 34566543;
        let flags_after_ns = Flags::ACK | Flags::PSH;
        let window_size = 19999;

        let segment_len = {
            let mut p = TcpSegment::write_segment(
                a.as_mut(),
                src_port,
                dst_port,
                seq_number,
                ack_number,
                flags_after_ns,
                window_size,
                0,
                Some((b.as_ref(), b.len())),
                Some((SRC, DST)),
            )
            .unwrap();

            assert_eq!(p.source_port(), src_port);
            assert_eq!(p.destination_port(), dst_port);
            assert_eq!(p.sequence_number(), seq_number);
            assert_eq!(p.ack_number(), ack_number);
            assert_eq!(p.header_len_rsvd_ns(), (TCP_HEADER_LEN, 0, false));
            assert_eq!(p.flags_after_ns(), flags_after_ns);
            assert_eq!(p.window_size(), window_size);
            assert_eq!(p.urgent_pointer(), 0);

            let checksum = p.checksum();
            p.set_checksum(0);
            let computed_checksum = p.compute_checksum(SRC, DST);
            assert_eq!(checksum, computed_checksum);

            p.set_checksum(checksum);
            assert_eq!(p.compute_checksum(SRC, DST), 0);

            assert_eq!(p.len(), TCP_HEADER_LEN + b.len());
            assert_eq!(p.payload(), b.as_ref());
            p.len()
        };

        let parsed = TcpSegment::from_bytes(&a[..segment_len], Some((SRC, DST))).unwrap();
        assert_eq!(parsed.payload_len(), b.len());

        // A payload larger than the destination slice gets truncated.
        let len = TcpSegment::write_segment(
            a.as_mut(),
            src_port,
            dst_port,
            seq_number,
            ack_number,
            flags_after_ns,
            window_size,
            0,
            Some((c.as_ref(), c.len())),
            Some((SRC, DST)),
        )
        .unwrap()
        .len();
        assert_eq!(len, a.len());

        // So does one larger than the allowed maximum.
        let len = TcpSegment::write_segment(
            a.as_mut(),
            src_port,
            dst_port,
            seq_number,
            ack_number,
            flags_after_ns,
            window_size,
            0,
            Some((c.as_ref(), 10)),
            None,
        )
        .unwrap()
        .len();
        assert_eq!(len, TCP_HEADER_LEN + 10);

        assert_eq!(
            TcpSegment::write_segment(
                a.as_mut(),
                src_port,
                dst_port,
                seq_number,
                ack_number,
                flags_after_ns,
                window_size,
                0,
                Some((c.as_ref(), 0)),
                None,
            )
            .unwrap_err(),
            TcpError::EmptyPayload
        );

        fn p(buf: &mut [u8]) -> TcpSegment<'_, &mut [u8]> {
            TcpSegment::from_bytes_unchecked(buf)
        }

        let look_for_error = |buf: &[u8], err: TcpError| {
            assert_eq!(
                TcpSegment::from_bytes(buf, Some((SRC, DST))).unwrap_err(),
                err
            );
        };

        // Header length too short.
        p(a.as_mut()).set_header_len_rsvd_ns(OPTIONS_OFFSET - 4, false);
        look_for_error(a.as_ref(), TcpError::HeaderLen);

        // Header length too large.
        p(a.as_mut()).set_header_len_rsvd_ns(MAX_HEADER_LEN + 4, false);
        look_for_error(a.as_ref(), TcpError::HeaderLen);

        let mut small_buf = [0u8; 1];
        look_for_error(small_buf.as_ref(), TcpError::SliceTooShort);

        assert_eq!(
            TcpSegment::write_segment(
                small_buf.as_mut(),
                src_port,
                dst_port,
                seq_number,
                ack_number,
                flags_after_ns,
                window_size,
                0,
                Some((b.as_ref(), b.len())),
                Some((SRC, DST)),
            )
            .unwrap_err(),
            TcpError::SliceTooShort
        );
    }

    #[test]
    fn test_encode_decode() {
        let mut header = TcpHeader::new(40000, 80);
        assert_eq!(header.data_offset, DATA_OFFSET_NO_OPTIONS);
        header.seq = 0xffff_fff0;
        header.ack = 7;
        header.flags = Flags::ACK | Flags::PSH | Flags::URG;
        header.window = 256;
        header.urgent_pointer = 3;

        // Odd payload lengths exercise the padding byte of the checksum.
        let payload = b"hello";
        let mut buf = [0u8; 64];
        let len = encode(&header, payload, SRC, DST, &mut buf).unwrap();
        assert_eq!(len, TCP_HEADER_LEN + payload.len());

        let (decoded, data) = decode(&buf[..len], SRC, DST).unwrap();
        assert_eq!(data, payload);
        assert_ne!(decoded.checksum, 0);
        header.checksum = decoded.checksum;
        assert_eq!(decoded, header);

        // The pseudo-header binds the segment to its addresses.
        assert_eq!(
            decode(&buf[..len], SRC, Ipv4Addr::new(192, 168, 44, 78)).unwrap_err(),
            TcpError::Checksum
        );

        // No room for the payload.
        assert_eq!(
            encode(&header, payload, SRC, DST, &mut buf[..TCP_HEADER_LEN + 2]).unwrap_err(),
            TcpError::SliceTooShort
        );

        // Empty payloads are fine.
        let len = encode(&header, &[], SRC, DST, &mut buf).unwrap();
        let (_, data) = decode(&buf[..len], SRC, DST).unwrap();
        assert!(data.is_empty());
    }

    #[test]
    fn test_decode_skips_options() {
        let mut buf = [0u8; 40];
        {
            let mut p = TcpSegment::from_bytes_unchecked(buf.as_mut());
            p.set_source_port(1)
                .set_destination_port(2)
                .set_header_len_rsvd_ns(TCP_HEADER_LEN + 4, false)
                .set_flags_after_ns(Flags::SYN);
        }
        // A NOP-padded option block, then two payload bytes.
        buf[20..24].copy_from_slice(&[1, 1, 1, 0]);
        buf[24] = 0xaa;
        buf[25] = 0xbb;
        let len = 26;
        let checksum = TcpSegment::from_bytes_unchecked(&buf[..len]).compute_checksum(SRC, DST);
        TcpSegment::from_bytes_unchecked(buf.as_mut()).set_checksum(checksum);

        let (header, payload) = decode(&buf[..len], SRC, DST).unwrap();
        assert_eq!(header.data_offset, 6);
        assert_eq!(header.flags, Flags::SYN);
        assert_eq!(payload, &[0xaa, 0xbb]);
    }

    #[test]
    fn test_sequence_len() {
        let mut header = TcpHeader::new(1, 2);
        assert_eq!(header.sequence_len(10), 10);
        header.flags = Flags::SYN | Flags::ACK;
        assert_eq!(header.sequence_len(0), 1);
        header.flags = Flags::FIN | Flags::ACK;
        assert_eq!(header.sequence_len(3), 4);
    }

    proptest! {
        #[test]
        fn test_single_bit_flip_fails_decode(
            seq in any::<u32>(),
            ack in any::<u32>(),
            window in any::<u16>(),
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            bit in any::<usize>(),
        ) {
            let mut header = TcpHeader::new(5000, 6000);
            header.seq = seq;
            header.ack = ack;
            header.window = window;
            header.flags = Flags::ACK;

            let mut buf = [0u8; TCP_HEADER_LEN + 256];
            let len = encode(&header, &payload, SRC, DST, &mut buf).unwrap();

            let (decoded, data) = decode(&buf[..len], SRC, DST).unwrap();
            prop_assert_eq!(decoded.seq, seq);
            prop_assert_eq!(decoded.ack, ack);
            prop_assert_eq!(decoded.window, window);
            prop_assert_eq!(data, payload.as_slice());

            let bit = bit % (len * 8);
            buf[bit / 8] ^= 1 << (bit % 8);
            prop_assert!(decode(&buf[..len], SRC, DST).is_err());
        }
    }
}
