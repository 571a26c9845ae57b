//! Component E: RDPSND wire framing.
//!
//! Every packet is a one-byte message type followed by a little-endian
//! u16 length, then a type-specific body. All multi-byte integers on the
//! wire are little-endian.

use crate::error::ProtocolError;
use crate::types::AudioFormat;

pub const MSG_CLOSE: u8 = 0x01;
pub const MSG_WRITE: u8 = 0x02;
pub const MSG_SET_VOLUME: u8 = 0x03;
pub const MSG_SET_PITCH: u8 = 0x04;
pub const MSG_COMPLETION: u8 = 0x05;
pub const MSG_TRAINING: u8 = 0x06;
pub const MSG_NEGOTIATE: u8 = 0x07;

/// Version advertised in the NEGOTIATE request.
pub const PROTOCOL_VERSION: u16 = 5;

const HEADER_LEN: usize = 1 + 2;

fn write_header(out: &mut Vec<u8>, msg_type: u8, body_len: u16) {
    out.push(msg_type);
    out.extend_from_slice(&body_len.to_le_bytes());
}

/// Server -> client format negotiation request.
pub struct NegotiateRequest {
    pub last_block_confirmed: u8,
    pub format: AudioFormat,
}

impl NegotiateRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        body.push(self.last_block_confirmed);
        body.push(0); // padding
        body.extend_from_slice(&1u16.to_le_bytes()); // number of formats
        // WaveFormat PCM = 1
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&self.format.channels.to_le_bytes());
        body.extend_from_slice(&self.format.sample_rate_hz.to_le_bytes());
        body.extend_from_slice(&self.format.avg_bytes_per_sec().to_le_bytes());
        body.extend_from_slice(&self.format.block_align().to_le_bytes());
        body.extend_from_slice(&self.format.bits_per_sample.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes()); // cbSize

        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        write_header(&mut out, MSG_NEGOTIATE, body.len() as u16);
        out.extend_from_slice(&body);
        out
    }
}

/// Client -> server format negotiation reply.
pub struct NegotiateResponse {
    pub num_formats: u16,
    pub accepted_format_index: u16,
}

impl NegotiateResponse {
    /// Minimal body: numberOfFormats (u16), formatIndex (u16).
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 4 {
            return Err(ProtocolError::Truncated { need: 4, got: body.len() });
        }
        let num_formats = u16::from_le_bytes([body[0], body[1]]);
        let accepted_format_index = u16::from_le_bytes([body[2], body[3]]);
        if num_formats != 1 {
            return Err(ProtocolError::UnsupportedFormatCount { offered: num_formats });
        }
        Ok(Self { num_formats, accepted_format_index })
    }
}

/// Server -> client audio data packet.
pub struct WritePacket<'a> {
    pub block_id: u8,
    pub timestamp_ms: u16,
    pub data: &'a [u8],
}

impl<'a> WritePacket<'a> {
    /// Encodes the full packet, header and payload inline, matching the
    /// wire contract that the body length equals `data.len() + 8` (the
    /// original leaves the first four data bytes inline in the header
    /// struct; we don't need that split since we're not reusing a fixed C
    /// struct layout, the wire bytes are identical either way).
    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.data.len() + 8;
        let mut out = Vec::with_capacity(HEADER_LEN + body_len);
        write_header(&mut out, MSG_WRITE, body_len as u16);
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // wFormatNo: always format 0
        out.push(self.block_id);
        out.push(0); // padding
        out.extend_from_slice(self.data);
        out
    }
}

/// Client -> server block acknowledgement.
pub struct CompletionPacket {
    pub timestamp_ms: u16,
    pub confirmed_block_id: u8,
}

impl CompletionPacket {
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        if body.len() < 4 {
            return Err(ProtocolError::Truncated { need: 4, got: body.len() });
        }
        Ok(Self {
            timestamp_ms: u16::from_le_bytes([body[0], body[1]]),
            confirmed_block_id: body[2],
        })
    }
}

/// Server -> client stream teardown.
pub struct ClosePacket;

impl ClosePacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        write_header(&mut out, MSG_CLOSE, 0);
        out
    }
}

/// Server -> client volume change (both channels identical).
pub struct SetVolumePacket {
    pub volume: u32,
}

impl SetVolumePacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + 4);
        write_header(&mut out, MSG_SET_VOLUME, 4);
        out.extend_from_slice(&self.volume.to_le_bytes());
        out
    }
}

/// Raw incoming packet, before type-specific decode.
pub struct RawPacket<'a> {
    pub msg_type: u8,
    pub body: &'a [u8],
}

impl<'a> RawPacket<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated { need: HEADER_LEN, got: bytes.len() });
        }
        let msg_type = bytes[0];
        let len = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
        if bytes.len() < HEADER_LEN + len {
            return Err(ProtocolError::Truncated { need: HEADER_LEN + len, got: bytes.len() });
        }
        Ok(Self { msg_type, body: &bytes[HEADER_LEN..HEADER_LEN + len] })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_request_roundtrip_header() {
        let req = NegotiateRequest {
            last_block_confirmed: 7,
            format: AudioFormat::internal(),
        };
        let bytes = req.encode();
        assert_eq!(bytes[0], MSG_NEGOTIATE);
        let raw = RawPacket::parse(&bytes).unwrap();
        assert_eq!(raw.msg_type, MSG_NEGOTIATE);
    }

    #[test]
    fn write_packet_length_field_is_data_plus_eight() {
        let data = vec![0u8; 100];
        let pkt = WritePacket { block_id: 1, timestamp_ms: 0, data: &data };
        let bytes = pkt.encode();
        let len = u16::from_le_bytes([bytes[1], bytes[2]]) as usize;
        assert_eq!(len, data.len() + 8);
    }

    #[test]
    fn negotiate_response_rejects_multi_format() {
        let body = [2u16.to_le_bytes(), 0u16.to_le_bytes()].concat();
        let err = NegotiateResponse::decode(&body).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedFormatCount { offered: 2 }));
    }

    #[test]
    fn completion_decode_extracts_block_id() {
        let body = [0u8, 0, 42, 0];
        let c = CompletionPacket::decode(&body).unwrap();
        assert_eq!(c.confirmed_block_id, 42);
    }

    #[test]
    fn raw_packet_rejects_truncated_body() {
        let bytes = [MSG_WRITE, 10, 0, 1, 2];
        assert!(RawPacket::parse(&bytes).is_err());
    }
}
