use std::fmt::{Debug, Formatter};

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

use crate::estate::Uid;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct PacketFlags: u8 {
        /// the packet was sent by the transaction's correspondent (as opposed to its initiator)
        const CORRESPONDENT = 0b0000_0001;
        /// the sender waits for a reply before sending more segments
        const WAIT          = 0b0000_0010;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TxKind {
    Join = 1,
    Allow = 2,
    Alive = 3,
    Message = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketKind {
    Request = 1,
    Response = 2,
    Ack = 3,
    Refuse = 4,
    Reject = 5,
    Hello = 6,
    Cookie = 7,
    Initiate = 8,
    Segment = 9,
    Resend = 10,
    Done = 11,
    Nack = 12,
    Unjoined = 13,
    Unallowed = 14,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram truncated: {0} bytes is shorter than the packet header")]
    Truncated(usize),
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("unsupported flags {0:#04x}")]
    UnknownFlags(u8),
    #[error("unknown transaction kind {0}")]
    UnknownTxKind(u8),
    #[error("unknown packet kind {0}")]
    UnknownPacketKind(u8),
    #[error("declared body length {declared} does not match the {actual} bytes remaining")]
    BodyLength { declared: usize, actual: usize },
    #[error("segment {segment} is out of range for segment count {count}")]
    InvalidSegment { segment: u32, count: u32 },
}

/// CRC-64 over the network secret and the packet's bytes after the checksum field
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub u64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    pub fn new(network_secret: &[u8], covered: &[u8]) -> Checksum {
        let hasher = Crc::<u64>::new(&crc::CRC_64_REDIS);
        let mut digest = hasher.digest();
        digest.update(network_secret);
        digest.update(covered);
        Checksum(digest.finalize())
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub tx_kind: TxKind,
    pub packet_kind: PacketKind,
    /// the sender's id for the receiver
    pub se: Uid,
    /// the receiver's id for the sender, [Uid::VACUOUS] if the sender does not know it yet
    pub de: Uid,
    pub tx_index: u32,
    pub segment: u32,
    pub segment_count: u32,
}
impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let role = if self.flags.contains(PacketFlags::CORRESPONDENT) { "C" } else { "I" };
        let wait = if self.flags.contains(PacketFlags::WAIT) { "W" } else { "" };
        write!(f, "PCKT{{{:?}/{:?}{}{}:{}->{}#{}", self.tx_kind, self.packet_kind, role, wait, self.se.0, self.de.0, self.tx_index)?;
        if self.segment_count > 1 {
            write!(f, "[{}/{}]", self.segment, self.segment_count)?;
        }
        write!(f, "}}")
    }
}

impl PacketHeader {
    pub const MAGIC: [u8; 2] = *b"RD";
    pub const PROTOCOL_VERSION_1: u8 = 1;

    const OFFSET_CHECKSUM: usize = 3;
    const OFFSET_COVERED: usize = 11;

    /// magic, version, checksum, flags, kinds, se, de, tx index, segment, segment count, body length
    pub const SERIALIZED_LEN: usize = 2 + 1 + 8 + 1 + 1 + 1 + 4 + 4 + 4 + 4 + 4 + 2;

    pub fn new(tx_kind: TxKind, packet_kind: PacketKind, se: Uid, de: Uid, tx_index: u32) -> PacketHeader {
        PacketHeader {
            flags: PacketFlags::empty(),
            tx_kind,
            packet_kind,
            se,
            de,
            tx_index,
            segment: 0,
            segment_count: 1,
        }
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> PacketHeader {
        self.flags |= flags;
        self
    }

    pub fn with_segment(mut self, segment: u32, segment_count: u32) -> PacketHeader {
        self.segment = segment;
        self.segment_count = segment_count;
        self
    }

    pub fn is_from_correspondent(&self) -> bool {
        self.flags.contains(PacketFlags::CORRESPONDENT)
    }

    pub fn is_wait(&self) -> bool {
        self.flags.contains(PacketFlags::WAIT)
    }

    /// the covered fields, i.e. everything between the checksum and the body length
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.flags.bits());
        buf.put_u8(self.tx_kind.into());
        buf.put_u8(self.packet_kind.into());
        buf.put_u32(self.se.0);
        buf.put_u32(self.de.0);
        buf.put_u32(self.tx_index);
        buf.put_u32(self.segment);
        buf.put_u32(self.segment_count);
    }

    fn deser(buf: &mut impl Buf) -> Result<PacketHeader, PacketError> {
        let raw_flags = buf.get_u8();
        let flags = PacketFlags::from_bits(raw_flags)
            .ok_or(PacketError::UnknownFlags(raw_flags))?;
        let tx_kind = TxKind::try_from(buf.get_u8())
            .map_err(|e| PacketError::UnknownTxKind(e.number))?;
        let packet_kind = PacketKind::try_from(buf.get_u8())
            .map_err(|e| PacketError::UnknownPacketKind(e.number))?;
        let se = Uid(buf.get_u32());
        let de = Uid(buf.get_u32());
        let tx_index = buf.get_u32();
        let segment = buf.get_u32();
        let segment_count = buf.get_u32();

        if segment >= segment_count {
            return Err(PacketError::InvalidSegment { segment, count: segment_count });
        }

        Ok(PacketHeader {
            flags,
            tx_kind,
            packet_kind,
            se,
            de,
            tx_index,
            segment,
            segment_count,
        })
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Bytes,
}
impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}+{}", self.header, self.body.len())
    }
}

impl Packet {
    pub fn new(header: PacketHeader, body: impl Into<Bytes>) -> Packet {
        Packet {
            header,
            body: body.into(),
        }
    }

    /// NB: callers are responsible for keeping the body below the configured maximum packet size
    pub fn encode(&self, network_secret: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN + self.body.len());
        buf.put_slice(&PacketHeader::MAGIC);
        buf.put_u8(PacketHeader::PROTOCOL_VERSION_1);
        buf.put_u64(0); // placeholder for the checksum
        self.header.ser(&mut buf);
        buf.put_u16(self.body.len().prechecked_cast());
        buf.put_slice(&self.body);

        let checksum = Checksum::new(network_secret, &buf[PacketHeader::OFFSET_COVERED..]);
        buf[PacketHeader::OFFSET_CHECKSUM..PacketHeader::OFFSET_COVERED].copy_from_slice(&checksum.0.to_be_bytes());
        buf.freeze()
    }

    pub fn decode(datagram: &[u8], network_secret: &[u8]) -> Result<Packet, PacketError> {
        if datagram.len() < PacketHeader::SERIALIZED_LEN {
            return Err(PacketError::Truncated(datagram.len()));
        }

        let mut buf = datagram;
        if buf[..2] != PacketHeader::MAGIC {
            return Err(PacketError::BadMagic);
        }
        buf.advance(2);

        let version = buf.get_u8();
        if version != PacketHeader::PROTOCOL_VERSION_1 {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let checksum = Checksum(buf.get_u64());
        if checksum != Checksum::new(network_secret, &datagram[PacketHeader::OFFSET_COVERED..]) {
            return Err(PacketError::ChecksumMismatch);
        }

        let header = PacketHeader::deser(&mut buf)?;

        let declared: usize = buf.get_u16().safe_cast();
        if declared != buf.remaining() {
            return Err(PacketError::BodyLength { declared, actual: buf.remaining() });
        }

        Ok(Packet {
            header,
            body: Bytes::copy_from_slice(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SECRET: &[u8] = b"test network";

    fn segment_header() -> PacketHeader {
        PacketHeader::new(TxKind::Message, PacketKind::Segment, Uid(2), Uid(5), 17)
            .with_flags(PacketFlags::WAIT)
            .with_segment(3, 30)
    }

    #[rstest]
    #[case::join_request(PacketHeader::new(TxKind::Join, PacketKind::Request, Uid(2), Uid::VACUOUS, 1), b"identity".to_vec())]
    #[case::segment(segment_header(), vec![7u8; 900])]
    #[case::empty_body(PacketHeader::new(TxKind::Alive, PacketKind::Ack, Uid(3), Uid(4), 9).with_flags(PacketFlags::CORRESPONDENT), vec![])]
    fn test_encode_decode(#[case] header: PacketHeader, #[case] body: Vec<u8>) {
        let packet = Packet::new(header, body);
        let datagram = packet.encode(SECRET);
        assert_eq!(datagram.len(), PacketHeader::SERIALIZED_LEN + packet.body.len());
        assert_eq!(Packet::decode(&datagram, SECRET), Ok(packet));
    }

    #[test]
    fn test_layout() {
        let datagram = Packet::new(segment_header(), vec![1u8, 2, 3]).encode(SECRET);
        assert_eq!(&datagram[..3], b"RD\x01");
        assert_eq!(datagram[11], PacketFlags::WAIT.bits());
        assert_eq!(datagram[12], 4);
        assert_eq!(datagram[13], 9);
        assert_eq!(&datagram[14..18], &2u32.to_be_bytes());
        assert_eq!(&datagram[18..22], &5u32.to_be_bytes());
        assert_eq!(&datagram[22..26], &17u32.to_be_bytes());
        assert_eq!(&datagram[26..30], &3u32.to_be_bytes());
        assert_eq!(&datagram[30..34], &30u32.to_be_bytes());
        assert_eq!(&datagram[34..36], &3u16.to_be_bytes());
        assert_eq!(&datagram[36..], &[1, 2, 3]);
    }

    fn corrupt(offset: usize, value: u8) -> impl Fn(&mut Vec<u8>) {
        move |d: &mut Vec<u8>| d[offset] = value
    }

    /// rewrites the checksum after corrupting a covered field, simulating a peer that
    ///  sends garbage consistently rather than bit errors on the wire
    fn corrupt_covered(offset: usize, value: u8) -> impl Fn(&mut Vec<u8>) {
        move |d: &mut Vec<u8>| {
            d[offset] = value;
            let checksum = Checksum::new(SECRET, &d[11..]);
            d[3..11].copy_from_slice(&checksum.0.to_be_bytes());
        }
    }

    #[rstest]
    #[case::truncated(Box::new(|d: &mut Vec<u8>| d.truncate(20)), PacketError::Truncated(20))]
    #[case::magic(Box::new(corrupt(0, b'X')), PacketError::BadMagic)]
    #[case::version(Box::new(corrupt(2, 7)), PacketError::UnsupportedVersion(7))]
    #[case::bit_flip(Box::new(corrupt(40, 99)), PacketError::ChecksumMismatch)]
    #[case::flags(Box::new(corrupt_covered(11, 0x80)), PacketError::UnknownFlags(0x80))]
    #[case::tx_kind(Box::new(corrupt_covered(12, 0)), PacketError::UnknownTxKind(0))]
    #[case::packet_kind(Box::new(corrupt_covered(13, 99)), PacketError::UnknownPacketKind(99))]
    #[case::segment(Box::new(corrupt_covered(29, 40)), PacketError::InvalidSegment { segment: 40, count: 30 })]
    #[case::body_length(Box::new(corrupt_covered(35, 9)), PacketError::BodyLength { declared: 9, actual: 10 })]
    fn test_decode_rejects(#[case] modify: Box<dyn Fn(&mut Vec<u8>)>, #[case] expected: PacketError) {
        let mut datagram = Packet::new(segment_header(), vec![0u8; 10]).encode(SECRET).to_vec();
        modify(&mut datagram);
        assert_eq!(Packet::decode(&datagram, SECRET), Err(expected));
    }

    #[test]
    fn test_decode_other_network() {
        let datagram = Packet::new(segment_header(), vec![0u8; 10]).encode(SECRET);
        assert_eq!(Packet::decode(&datagram, b"other network"), Err(PacketError::ChecksumMismatch));
    }

    #[test]
    fn test_debug() {
        assert_eq!(format!("{:?}", segment_header()), "PCKT{Message/SegmentIW:2->5#17[3/30]}");
    }
}
