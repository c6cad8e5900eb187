use crate::seq::SequenceNumber;
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// All numbers on the wire are little-endian. Sequence numbers are 24 bits wide.
pub trait BufU24: Buf {
    fn try_get_u24_le(&mut self) -> anyhow::Result<u32> {
        if self.remaining() < 3 {
            bail!("buffer underflow");
        }
        let a = self.get_u8() as u32;
        let b = self.get_u8() as u32;
        let c = self.get_u8() as u32;
        Ok(a | (b << 8) | (c << 16))
    }

    fn try_get_sequence_number(&mut self) -> anyhow::Result<SequenceNumber> {
        Ok(SequenceNumber::from_raw(self.try_get_u24_le()?))
    }
}
impl<T: Buf> BufU24 for T {}

pub trait BufMutU24: BufMut {
    fn put_u24_le(&mut self, value: u32) {
        debug_assert!(value <= 0x00ff_ffff);
        self.put_u8(value as u8);
        self.put_u8((value >> 8) as u8);
        self.put_u8((value >> 16) as u8);
    }

    fn put_sequence_number(&mut self, value: SequenceNumber) {
        self.put_u24_le(value.to_raw());
    }
}
impl<T: BufMut> BufMutU24 for T {}


bitflags! {
    /// first byte of every datagram
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct DatagramFlags: u8 {
        const VALID  = 0x80;
        const ACK    = 0x40;
        const NACK   = 0x20;
        const RESEND = 0x08;
    }
}

/// the delivery guarantee requested for a single encapsulated message
#[derive(Copy, Clone, Eq, PartialEq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Reliability {
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
}
impl Reliability {
    pub fn is_reliable(self) -> bool {
        matches!(self, Reliability::Reliable | Reliability::ReliableOrdered | Reliability::ReliableSequenced)
    }

    pub fn is_sequenced(self) -> bool {
        matches!(self, Reliability::UnreliableSequenced | Reliability::ReliableSequenced)
    }

    pub fn is_ordered(self) -> bool {
        matches!(self, Reliability::ReliableOrdered)
    }

    pub fn is_ordered_or_sequenced(self) -> bool {
        self.is_sequenced() || self.is_ordered()
    }
}

/// ordering/sequencing indices of a frame, present only for ordered/sequenced reliability modes
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct FrameOrdering {
    pub sequenced_index: SequenceNumber,
    pub ordered_index: SequenceNumber,
    pub channel: u8,
}

/// split-packet metadata, present only for fragments of an oversized message
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct SplitMeta {
    pub fragment_count: u16,
    pub split_id: u16,
    pub fragment_index: u16,
}

/// One encapsulated message inside a datagram.
///
/// Wire layout:
/// ```ascii
/// 0: reliability mode (bits 5-7) and flags (0x08: ack receipt requested)
/// 1: payload length in *bits* (u16 LE)
/// 3: reliable message index (u24 LE) - reliable modes only
/// *: sequenced index (u24 LE) + ordered index (u24 LE) + ordering channel (u8)
///     - ordered/sequenced modes only
/// *: split flag (u8); if != 0:
///     fragment count (u16 LE), split id (u16 LE), fragment index (u16 LE)
/// *: payload bytes
/// ```
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Frame {
    pub reliability: Reliability,
    pub ack_receipt: bool,
    pub reliable_index: Option<SequenceNumber>,
    pub ordering: Option<FrameOrdering>,
    pub split: Option<SplitMeta>,
    pub payload: Bytes,
}
impl Frame {
    const FLAG_ACK_RECEIPT: u8 = 0x08;

    /// upper bound for the frame header, used for send capacity budgeting
    pub const MAX_HEADER_LEN: usize = 1 + 2 + 3 + 3 + 3 + 1 + 1 + 6;

    pub fn header_len(&self) -> usize {
        let mut result = 1 + 2;
        if self.reliability.is_reliable() {
            result += 3;
        }
        if self.reliability.is_ordered_or_sequenced() {
            result += 3 + 3 + 1;
        }
        result += 1;
        if self.split.is_some() {
            result += 6;
        }
        result
    }

    pub fn serialized_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert_eq!(self.reliability.is_reliable(), self.reliable_index.is_some());
        debug_assert_eq!(self.reliability.is_ordered_or_sequenced(), self.ordering.is_some());
        debug_assert!(self.payload.len() * 8 <= u16::MAX as usize);

        let mut flags = u8::from(self.reliability) << 5;
        if self.ack_receipt {
            flags |= Self::FLAG_ACK_RECEIPT;
        }
        buf.put_u8(flags);
        buf.put_u16_le((self.payload.len() * 8) as u16);

        if let Some(reliable_index) = self.reliable_index {
            buf.put_sequence_number(reliable_index);
        }
        if let Some(ordering) = self.ordering {
            buf.put_sequence_number(ordering.sequenced_index);
            buf.put_sequence_number(ordering.ordered_index);
            buf.put_u8(ordering.channel);
        }
        match self.split {
            None => buf.put_u8(0),
            Some(split) => {
                buf.put_u8(1);
                buf.put_u16_le(split.fragment_count);
                buf.put_u16_le(split.split_id);
                buf.put_u16_le(split.fragment_index);
            }
        }
        buf.put_slice(&self.payload);
    }

    pub fn deser(buf: &mut Bytes) -> anyhow::Result<Frame> {
        let flags = buf.try_get_u8()?;
        let reliability = Reliability::try_from(flags >> 5)?;
        let ack_receipt = flags & Self::FLAG_ACK_RECEIPT != 0;

        let payload_bits = buf.try_get_u16_le()? as usize;
        let payload_len = payload_bits.div_ceil(8);

        let reliable_index = if reliability.is_reliable() {
            Some(buf.try_get_sequence_number()?)
        }
        else {
            None
        };

        let ordering = if reliability.is_ordered_or_sequenced() {
            Some(FrameOrdering {
                sequenced_index: buf.try_get_sequence_number()?,
                ordered_index: buf.try_get_sequence_number()?,
                channel: buf.try_get_u8()?,
            })
        }
        else {
            None
        };

        let split = if buf.try_get_u8()? != 0 {
            Some(SplitMeta {
                fragment_count: buf.try_get_u16_le()?,
                split_id: buf.try_get_u16_le()?,
                fragment_index: buf.try_get_u16_le()?,
            })
        }
        else {
            None
        };

        if buf.remaining() < payload_len {
            bail!("frame payload truncated: declared {} bytes, {} remaining", payload_len, buf.remaining());
        }
        let payload = buf.copy_to_bytes(payload_len);

        Ok(Frame {
            reliability,
            ack_receipt,
            reliable_index,
            ordering,
            split,
            payload,
        })
    }
}

/// A set of acknowledged (or negatively acknowledged) datagram sequence number ranges,
///  both bounds inclusive.
///
/// Wire layout: range count (u16 LE), then per range a form byte - 0x01 for a single
///  sequence number (u24 LE), 0x00 for an inclusive (start, end) pair of u24 LE.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct AckRanges(pub Vec<(SequenceNumber, SequenceNumber)>);

impl AckRanges {
    /// Upper bound for a single range's width. ACK/NACK processing iterates over covered
    ///  sequence numbers, so accepting arbitrary ranges from the wire would allow a peer
    ///  to make us do 2^24 lookups per record.
    const MAX_RANGE_SPAN: u32 = 65536;

    /// builds minimal ranges from an iterator of sequence numbers in ascending (wrap-aware) order
    pub fn from_sorted(seqs: impl Iterator<Item = SequenceNumber>) -> AckRanges {
        let mut ranges: Vec<(SequenceNumber, SequenceNumber)> = Vec::new();
        for seq in seqs {
            match ranges.last_mut() {
                Some((_, end)) if seq == end.next() => *end = seq,
                _ => ranges.push((seq, seq)),
            }
        }
        AckRanges(ranges)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter_covered(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        self.0.iter()
            .flat_map(|&(start, end)| start.until(end.next()))
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        debug_assert!(self.0.len() <= u16::MAX as usize);
        buf.put_u16_le(self.0.len() as u16);
        for &(start, end) in &self.0 {
            if start == end {
                buf.put_u8(1);
                buf.put_sequence_number(start);
            }
            else {
                buf.put_u8(0);
                buf.put_sequence_number(start);
                buf.put_sequence_number(end);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AckRanges> {
        let num_ranges = buf.try_get_u16_le()? as usize;
        let mut ranges = Vec::with_capacity(num_ranges.min(1024));
        for _ in 0..num_ranges {
            let range = match buf.try_get_u8()? {
                1 => {
                    let seq = buf.try_get_sequence_number()?;
                    (seq, seq)
                }
                0 => {
                    let start = buf.try_get_sequence_number()?;
                    let end = buf.try_get_sequence_number()?;
                    if end.distance_after(start) > Self::MAX_RANGE_SPAN {
                        bail!("ack range {}..{} wider than the maximum span of {}", start, end, Self::MAX_RANGE_SPAN);
                    }
                    (start, end)
                }
                form => bail!("invalid ack range form byte {}", form),
            };
            ranges.push(range);
        }
        Ok(AckRanges(ranges))
    }
}

/// The unit exchanged over the socket: an ACK block, a NACK block, or a sequenced
///  collection of frames.
///
/// Wire layout: flags (u8), then for ACK/NACK the range block, for data the
///  datagram sequence number (u24 LE) followed by frames until the end of the datagram.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Datagram {
    Data {
        is_resend: bool,
        sequence_number: SequenceNumber,
        frames: Vec<Frame>,
    },
    Ack(AckRanges),
    Nack(AckRanges),
}
impl Datagram {
    pub const HEADER_LEN: usize = 1 + 3;

    pub fn serialized_len(&self) -> usize {
        match self {
            Datagram::Data { frames, .. } =>
                Self::HEADER_LEN + frames.iter().map(|f| f.serialized_len()).sum::<usize>(),
            Datagram::Ack(ranges) | Datagram::Nack(ranges) =>
                1 + 2 + ranges.0.iter()
                    .map(|(start, end)| if start == end { 4 } else { 7 })
                    .sum::<usize>(),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            Datagram::Data { is_resend, sequence_number, frames } => {
                let mut flags = DatagramFlags::VALID;
                if *is_resend {
                    flags |= DatagramFlags::RESEND;
                }
                buf.put_u8(flags.bits());
                buf.put_sequence_number(*sequence_number);
                for frame in frames {
                    frame.ser(buf);
                }
            }
            Datagram::Ack(ranges) => {
                buf.put_u8((DatagramFlags::VALID | DatagramFlags::ACK).bits());
                ranges.ser(buf);
            }
            Datagram::Nack(ranges) => {
                buf.put_u8((DatagramFlags::VALID | DatagramFlags::NACK).bits());
                ranges.ser(buf);
            }
        }
    }

    /// Writes the header of a retransmitted data datagram. Retransmission reuses the
    ///  retained serialized frame block, so only the header is built fresh.
    pub fn ser_resend_header(buf: &mut BytesMut, sequence_number: SequenceNumber) {
        buf.put_u8((DatagramFlags::VALID | DatagramFlags::RESEND).bits());
        buf.put_sequence_number(sequence_number);
    }

    pub fn deser(mut buf: Bytes) -> anyhow::Result<Datagram> {
        let flags = DatagramFlags::from_bits_truncate(buf.try_get_u8()?);
        if !flags.contains(DatagramFlags::VALID) {
            bail!("datagram without VALID flag");
        }

        if flags.contains(DatagramFlags::ACK) {
            return Ok(Datagram::Ack(AckRanges::deser(&mut buf)?));
        }
        if flags.contains(DatagramFlags::NACK) {
            return Ok(Datagram::Nack(AckRanges::deser(&mut buf)?));
        }

        let sequence_number = buf.try_get_sequence_number()?;
        let mut frames = Vec::new();
        while buf.has_remaining() {
            frames.push(Frame::deser(&mut buf)?);
        }
        if frames.is_empty() {
            bail!("data datagram without frames");
        }

        Ok(Datagram::Data {
            is_resend: flags.contains(DatagramFlags::RESEND),
            sequence_number,
            frames,
        })
    }
}
