//! Wire packet envelope.

use bitflags::bitflags;
use bytes::Bytes;

use crate::error::{DecodeError, Status};

/// The id triple carried in every packet: channel, service, method.
pub type IdSet = [u32; 3];

/// Packet kinds.
///
/// Directionality is structural: even values travel toward the server,
/// odd values toward the client, so either side classifies a packet from
/// its type alone without a side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 1,
    ClientStream = 2,
    ServerStream = 3,
    ClientError = 4,
    ServerError = 5,
    ClientStreamEnd = 6,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::Response),
            2 => Some(Self::ClientStream),
            3 => Some(Self::ServerStream),
            4 => Some(Self::ClientError),
            5 => Some(Self::ServerError),
            6 => Some(Self::ClientStreamEnd),
            _ => None,
        }
    }

    /// True if this packet travels toward the server.
    pub fn for_server(self) -> bool {
        self as u8 % 2 == 0
    }
}

bitflags! {
    /// Presence bits in the envelope header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct EnvelopeFlags: u8 {
        const HAS_STATUS = 0b01;
        const HAS_PAYLOAD = 0b10;
    }
}

/// A wire packet: type, addressing ids, optional status, opaque payload.
///
/// The envelope is little-endian: type and flag bytes, the three ids,
/// then a status word and a length-prefixed payload when the flag bits
/// say so. Any outer framing is the transport's concern.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub channel_id: u32,
    pub service_id: u32,
    pub method_id: u32,
    pub status: Option<Status>,
    pub payload: Bytes,
}

impl Packet {
    fn new(packet_type: PacketType, ids: IdSet) -> Self {
        Self {
            packet_type,
            channel_id: ids[0],
            service_id: ids[1],
            method_id: ids[2],
            status: None,
            payload: Bytes::new(),
        }
    }

    /// The initial packet of an invocation.
    pub fn request(ids: IdSet, payload: &[u8]) -> Self {
        let mut packet = Self::new(PacketType::Request, ids);
        packet.payload = Bytes::copy_from_slice(payload);
        packet
    }

    /// The terminal server packet: always a status, plus the response
    /// payload for methods whose responses are not streamed.
    pub fn response(ids: IdSet, status: Status, payload: Option<&[u8]>) -> Self {
        let mut packet = Self::new(PacketType::Response, ids);
        packet.status = Some(status);
        if let Some(payload) = payload {
            packet.payload = Bytes::copy_from_slice(payload);
        }
        packet
    }

    /// One chunk of a server stream. Never terminal, never a status.
    pub fn server_stream(ids: IdSet, payload: &[u8]) -> Self {
        let mut packet = Self::new(PacketType::ServerStream, ids);
        packet.payload = Bytes::copy_from_slice(payload);
        packet
    }

    /// One client-streamed request message.
    pub fn client_stream(ids: IdSet, payload: &[u8]) -> Self {
        let mut packet = Self::new(PacketType::ClientStream, ids);
        packet.payload = Bytes::copy_from_slice(payload);
        packet
    }

    /// Marks the end of the client's request stream.
    pub fn client_stream_end(ids: IdSet) -> Self {
        Self::new(PacketType::ClientStreamEnd, ids)
    }

    /// Client-side terminal error report. Never carries a payload.
    pub fn client_error(ids: IdSet, status: Status) -> Self {
        let mut packet = Self::new(PacketType::ClientError, ids);
        packet.status = Some(status);
        packet
    }

    /// Client-side cancellation, reported as a CANCELLED client error.
    pub fn cancel(ids: IdSet) -> Self {
        Self::client_error(ids, Status::Cancelled)
    }

    pub fn ids(&self) -> IdSet {
        [self.channel_id, self.service_id, self.method_id]
    }

    /// True if this packet travels toward the server.
    pub fn for_server(&self) -> bool {
        self.packet_type.for_server()
    }

    /// Encode into the wire envelope.
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = EnvelopeFlags::empty();
        if self.status.is_some() {
            flags |= EnvelopeFlags::HAS_STATUS;
        }
        if !self.payload.is_empty() {
            flags |= EnvelopeFlags::HAS_PAYLOAD;
        }

        let mut out = Vec::with_capacity(22 + self.payload.len());
        out.push(self.packet_type as u8);
        out.push(flags.bits());
        out.extend_from_slice(&self.channel_id.to_le_bytes());
        out.extend_from_slice(&self.service_id.to_le_bytes());
        out.extend_from_slice(&self.method_id.to_le_bytes());
        if let Some(status) = self.status {
            out.extend_from_slice(&(status as u32).to_le_bytes());
        }
        if !self.payload.is_empty() {
            out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&self.payload);
        }
        out
    }

    /// Decode a wire envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor { bytes, at: 0 };

        let raw_type = cursor.u8()?;
        let packet_type =
            PacketType::from_u8(raw_type).ok_or(DecodeError::UnknownPacketType(raw_type))?;
        let raw_flags = cursor.u8()?;
        let flags =
            EnvelopeFlags::from_bits(raw_flags).ok_or(DecodeError::UnknownFlags(raw_flags))?;

        let channel_id = cursor.u32()?;
        let service_id = cursor.u32()?;
        let method_id = cursor.u32()?;

        let status = if flags.contains(EnvelopeFlags::HAS_STATUS) {
            let raw = cursor.u32()?;
            Some(Status::from_u32(raw).ok_or(DecodeError::UnknownStatus(raw))?)
        } else {
            None
        };

        let payload = if flags.contains(EnvelopeFlags::HAS_PAYLOAD) {
            let len = cursor.u32()? as usize;
            Bytes::copy_from_slice(cursor.take(len)?)
        } else {
            Bytes::new()
        };

        cursor.finish()?;
        Ok(Self {
            packet_type,
            channel_id,
            service_id,
            method_id,
            status,
            payload,
        })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.bytes.get(self.at).ok_or(DecodeError::UnexpectedEof)?;
        self.at += 1;
        Ok(byte)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let slice = self.take(4)?;
        Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.at.checked_add(len).ok_or(DecodeError::UnexpectedEof)?;
        let slice = self
            .bytes
            .get(self.at..end)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.at = end;
        Ok(slice)
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.at == self.bytes.len() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.bytes.len() - self.at))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDS: IdSet = [1, 2, 3];

    fn assert_round_trip(packet: &Packet) {
        let decoded = Packet::decode(&packet.encode()).unwrap();
        assert_eq!(decoded.packet_type, packet.packet_type);
        assert_eq!(decoded.ids(), packet.ids());
        assert_eq!(decoded.status, packet.status);
        assert_eq!(decoded.payload, packet.payload);
    }

    #[test]
    fn round_trips_every_packet_kind() {
        assert_round_trip(&Packet::request(IDS, b"req"));
        assert_round_trip(&Packet::request(IDS, b""));
        assert_round_trip(&Packet::response(IDS, Status::Aborted, Some(b"resp")));
        assert_round_trip(&Packet::response(IDS, Status::Ok, None));
        assert_round_trip(&Packet::server_stream(IDS, b"chunk"));
        assert_round_trip(&Packet::client_stream(IDS, b"part"));
        assert_round_trip(&Packet::client_stream_end(IDS));
        assert_round_trip(&Packet::client_error(IDS, Status::NotFound));
        assert_round_trip(&Packet::cancel(IDS));
    }

    #[test]
    fn cancel_is_a_cancelled_client_error_without_payload() {
        let packet = Packet::cancel(IDS);
        assert_eq!(packet.packet_type, PacketType::ClientError);
        assert_eq!(packet.status, Some(Status::Cancelled));
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn even_types_are_server_directed() {
        assert!(PacketType::Request.for_server());
        assert!(PacketType::ClientStream.for_server());
        assert!(PacketType::ClientError.for_server());
        assert!(PacketType::ClientStreamEnd.for_server());
        assert!(!PacketType::Response.for_server());
        assert!(!PacketType::ServerStream.for_server());
        assert!(!PacketType::ServerError.for_server());
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let encoded = Packet::response(IDS, Status::Ok, Some(b"abc")).encode();
        assert_eq!(Packet::decode(&[]), Err(DecodeError::UnexpectedEof));
        for len in 1..encoded.len() {
            assert_eq!(
                Packet::decode(&encoded[..len]),
                Err(DecodeError::UnexpectedEof),
                "prefix of {len} bytes should not decode"
            );
        }
    }

    #[test]
    fn decode_rejects_unknown_type_flags_and_status() {
        let mut encoded = Packet::request(IDS, b"x").encode();
        encoded[0] = 9;
        assert_eq!(Packet::decode(&encoded), Err(DecodeError::UnknownPacketType(9)));

        let mut encoded = Packet::request(IDS, b"x").encode();
        encoded[1] |= 0b1000_0000;
        assert!(matches!(
            Packet::decode(&encoded),
            Err(DecodeError::UnknownFlags(_))
        ));

        let mut encoded = Packet::client_error(IDS, Status::NotFound).encode();
        encoded[14..18].copy_from_slice(&999u32.to_le_bytes());
        assert_eq!(Packet::decode(&encoded), Err(DecodeError::UnknownStatus(999)));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut encoded = Packet::client_stream_end(IDS).encode();
        encoded.push(0);
        assert_eq!(Packet::decode(&encoded), Err(DecodeError::TrailingBytes(1)));
    }
}
