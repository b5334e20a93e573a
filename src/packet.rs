use std::fmt::{Debug, Formatter};
use std::hash::Hasher;
use std::ops::BitOr;

use bytes::{Buf, BufMut, BytesMut};
use twox_hash::XxHash64;

/// fixed prefix: protocol id (1) + hash (8) + descriptor (1)
pub(crate) const MIN_HEADER_SIZE: usize = 10;

/// byte offset of the descriptor within a serialized packet
pub(crate) const DESCRIPTOR_OFFSET: usize = 9;

/// The flag-bit byte selecting which conditional header sections a packet carries and
/// how the receiver treats it.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Descriptor(u8);

impl Descriptor {
    pub const RELIABLE: Descriptor = Descriptor(1);
    pub const ACK: Descriptor = Descriptor(1 << 1);
    pub const ORDERED: Descriptor = Descriptor(1 << 2);
    pub const CONNECT: Descriptor = Descriptor(1 << 3);
    pub const DISCONNECT: Descriptor = Descriptor(1 << 4);

    pub fn from_bits(bits: u8) -> Descriptor {
        Descriptor(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, flag: Descriptor) -> bool {
        self.0 & flag.0 != 0
    }
}

impl BitOr for Descriptor {
    type Output = Descriptor;

    fn bitor(self, rhs: Descriptor) -> Descriptor {
        Descriptor(self.0 | rhs.0)
    }
}

impl Debug for Descriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Descriptor({:#07b})", self.0)
    }
}

/// The wire entity. Which optional fields are meaningful is determined entirely by the
/// descriptor; serialization writes exactly the sections the descriptor implies, in
/// little-endian byte order.
#[derive(Clone, Default, PartialEq, Eq)]
pub(crate) struct Packet {
    pub protocol_id: u8,
    pub hash: u64,
    pub descriptor: Descriptor,

    /// present iff reliable or ordered
    pub sequence: u16,

    /// present iff reliable and ordered
    pub order: u8,

    /// present iff ack
    pub ack: u16,
    pub ack_bits: u32,

    pub payload: Vec<u8>,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("descriptor", &self.descriptor)
            .field("sequence", &self.sequence)
            .field("order", &self.order)
            .field("ack", &self.ack)
            .field("ack_bits", &self.ack_bits)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl Packet {
    pub fn new(descriptor: Descriptor, payload: Vec<u8>) -> Packet {
        Packet {
            descriptor,
            payload,
            ..Packet::default()
        }
    }

    fn flag(&self, flag: Descriptor) -> bool {
        self.descriptor.contains(flag)
    }

    pub fn serialized_len(&self) -> usize {
        let mut len = MIN_HEADER_SIZE;
        if self.flag(Descriptor::RELIABLE) || self.flag(Descriptor::ORDERED) {
            len += 2;
        }
        if self.flag(Descriptor::RELIABLE) && self.flag(Descriptor::ORDERED) {
            len += 1;
        }
        if self.flag(Descriptor::ACK) {
            len += 6;
        }
        len + self.payload.len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.protocol_id);
        buf.put_u64_le(self.hash);
        buf.put_u8(self.descriptor.bits());

        if self.flag(Descriptor::RELIABLE) || self.flag(Descriptor::ORDERED) {
            buf.put_u16_le(self.sequence);
        }

        if self.flag(Descriptor::RELIABLE) && self.flag(Descriptor::ORDERED) {
            buf.put_u8(self.order);
        }

        if self.flag(Descriptor::ACK) {
            buf.put_u16_le(self.ack);
            buf.put_u32_le(self.ack_bits);
        }

        if !self.payload.is_empty() {
            buf.put_slice(&self.payload);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let mut packet = Packet {
            protocol_id: buf.try_get_u8()?,
            hash: buf.try_get_u64_le()?,
            descriptor: Descriptor::from_bits(buf.try_get_u8()?),
            ..Packet::default()
        };

        if packet.flag(Descriptor::RELIABLE) || packet.flag(Descriptor::ORDERED) {
            packet.sequence = buf.try_get_u16_le()?;
        }

        if packet.flag(Descriptor::RELIABLE) && packet.flag(Descriptor::ORDERED) {
            packet.order = buf.try_get_u8()?;
        }

        if packet.flag(Descriptor::ACK) {
            packet.ack = buf.try_get_u16_le()?;
            packet.ack_bits = buf.try_get_u32_le()?;
        }

        if buf.has_remaining() {
            packet.payload = vec![0; buf.remaining()];
            buf.copy_to_slice(&mut packet.payload);
        }

        Ok(packet)
    }

    /// Computes and stores the packet checksum: xxhash64 over the serialized packet with
    /// its own hash bytes zeroed.
    pub fn calculate_hash(&mut self) {
        self.hash = 0;
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);

        let mut hasher = XxHash64::default();
        hasher.write(&buf);
        self.hash = hasher.finish();
    }
}

/// Size of the serialized header as implied by the descriptor byte. The buffer must hold
/// at least [`MIN_HEADER_SIZE`] bytes.
pub(crate) fn header_size(packet: &[u8]) -> usize {
    let desc = Descriptor::from_bits(packet[DESCRIPTOR_OFFSET]);
    let mut size = MIN_HEADER_SIZE;

    if desc.contains(Descriptor::RELIABLE) || desc.contains(Descriptor::ORDERED) {
        size += 2;
    }

    if desc.contains(Descriptor::RELIABLE) && desc.contains(Descriptor::ORDERED) {
        size += 1;
    }

    if desc.contains(Descriptor::ACK) {
        size += 6;
    }

    size
}

/// Cheap validity check run before any per-connection processing: minimum length,
/// protocol id, descriptor-implied size, and the checksum over the full packet with the
/// hash bytes zeroed. Payload tampering fails the checksum as well.
pub(crate) fn validate_header(packet: &[u8], protocol_id: u8) -> bool {
    if packet.len() < MIN_HEADER_SIZE {
        return false;
    }

    if packet[0] != protocol_id {
        return false;
    }

    if packet.len() < header_size(packet) {
        return false;
    }

    let transmitted = u64::from_le_bytes(packet[1..9].try_into().expect("8 hash bytes"));

    let mut hasher = XxHash64::default();
    hasher.write(&packet[..1]);
    hasher.write(&[0u8; 8]);
    hasher.write(&packet[9..]);

    transmitted == hasher.finish()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const TEST_PROTOCOL_ID: u8 = 231;

    fn test_packet(descriptor: Descriptor) -> Packet {
        Packet {
            protocol_id: TEST_PROTOCOL_ID,
            hash: 244,
            descriptor,
            sequence: 10,
            order: 5,
            ack: 18,
            ack_bits: 24,
            payload: Vec::new(),
        }
    }

    fn all_flags() -> Descriptor {
        Descriptor::RELIABLE | Descriptor::ACK | Descriptor::ORDERED
    }

    #[rstest]
    #[case::bare(Descriptor::default(), 10)]
    #[case::reliable(Descriptor::RELIABLE, 12)]
    #[case::ordered(Descriptor::ORDERED, 12)]
    #[case::reliable_ordered(Descriptor::RELIABLE | Descriptor::ORDERED, 13)]
    #[case::ack(Descriptor::ACK, 16)]
    #[case::all(Descriptor::RELIABLE | Descriptor::ORDERED | Descriptor::ACK, 19)]
    fn test_header_size(#[case] descriptor: Descriptor, #[case] expected: usize) {
        let packet = test_packet(descriptor);

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);

        assert_eq!(header_size(&buf), expected);
        assert_eq!(buf.len(), expected);
        assert_eq!(packet.serialized_len(), expected);
    }

    #[rstest]
    #[case::bare(Descriptor::default())]
    #[case::reliable(Descriptor::RELIABLE)]
    #[case::ack(Descriptor::ACK)]
    #[case::ordered(Descriptor::ORDERED)]
    #[case::reliable_ordered(Descriptor::RELIABLE | Descriptor::ORDERED)]
    #[case::reliable_ordered_ack(Descriptor::RELIABLE | Descriptor::ORDERED | Descriptor::ACK)]
    #[case::reliable_connect(Descriptor::RELIABLE | Descriptor::CONNECT)]
    #[case::disconnect(Descriptor::DISCONNECT)]
    fn test_ser_deser_identity(#[case] descriptor: Descriptor) {
        let mut original = test_packet(descriptor);
        original.payload = vec![0, 1, 2, 3, 4, 5, 6, 7];

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        let mut b: &[u8] = &buf;
        let deserialized = Packet::deser(&mut b).unwrap();
        assert!(b.is_empty());

        assert_eq!(deserialized.protocol_id, original.protocol_id);
        assert_eq!(deserialized.hash, original.hash);
        assert_eq!(deserialized.descriptor, original.descriptor);
        assert_eq!(deserialized.payload, original.payload);

        if descriptor.contains(Descriptor::RELIABLE) || descriptor.contains(Descriptor::ORDERED) {
            assert_eq!(deserialized.sequence, original.sequence);
        }
        if descriptor.contains(Descriptor::RELIABLE) && descriptor.contains(Descriptor::ORDERED) {
            assert_eq!(deserialized.order, original.order);
        }
        if descriptor.contains(Descriptor::ACK) {
            assert_eq!(deserialized.ack, original.ack);
            assert_eq!(deserialized.ack_bits, original.ack_bits);
        }
    }

    #[rstest]
    #[case::empty(&[][..])]
    #[case::truncated_fixed_header(&[231, 1, 2, 3][..])]
    #[case::missing_sequence(&[231, 0, 0, 0, 0, 0, 0, 0, 0, 1][..])]
    #[case::missing_ack_bits(&[231, 0, 0, 0, 0, 0, 0, 0, 0, 2, 7][..])]
    fn test_deser_short_input(#[case] bytes: &[u8]) {
        let mut b = bytes;
        assert!(Packet::deser(&mut b).is_err());
    }

    #[test]
    fn test_hash_deterministic() {
        let mut p1 = test_packet(all_flags());
        let mut p2 = test_packet(all_flags());

        p1.calculate_hash();
        p2.calculate_hash();

        assert_eq!(p1.hash, p2.hash);
        assert_ne!(p1.hash, 0);
    }

    #[test]
    fn test_hash_covers_payload() {
        let mut p1 = test_packet(all_flags());
        let mut p2 = test_packet(all_flags());
        p2.payload = vec![42];

        p1.calculate_hash();
        p2.calculate_hash();

        assert_ne!(p1.hash, p2.hash);
    }

    #[test]
    fn test_validate_header_accepts_serialized() {
        let mut packet = test_packet(all_flags());
        packet.payload = vec![1, 2, 3];
        packet.calculate_hash();

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);

        assert!(validate_header(&buf, TEST_PROTOCOL_ID));
    }

    #[test]
    fn test_validate_header_rejects_short_buffer() {
        let mut packet = test_packet(all_flags());
        packet.calculate_hash();

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);

        assert!(!validate_header(&buf[..5], TEST_PROTOCOL_ID));
        assert!(!validate_header(&buf[..12], TEST_PROTOCOL_ID));
    }

    #[test]
    fn test_validate_header_rejects_wrong_protocol_id() {
        let mut packet = test_packet(all_flags());
        packet.calculate_hash();

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);

        assert!(!validate_header(&buf, TEST_PROTOCOL_ID + 1));
    }

    #[test]
    fn test_validate_header_detects_any_byte_flip() {
        let mut packet = test_packet(all_flags());
        packet.payload = vec![9, 8, 7, 6];
        packet.calculate_hash();

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);

        for i in 1..buf.len() {
            let mut tampered = buf.to_vec();
            tampered[i] ^= 0x20;
            assert!(
                !validate_header(&tampered, TEST_PROTOCOL_ID),
                "flip at offset {} went undetected",
                i
            );
        }
    }
}
