//! Frame layer: the fixed header, opcode table, and a streaming decoder.
//!
//! A frame is an 8-byte (v2) or 9-byte (v3+) header followed by a body whose
//! length the header carries as a big-endian u32. The high bit of the version
//! byte distinguishes responses from requests.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use failure::Fail;

use crate::coding::{BufExt, BufMutExt, CodingError};
use crate::{ProtocolVersion, StreamId};

/// Frame-level flag bits.
pub mod flags {
    pub const COMPRESSED: u8 = 0x01;
    pub const TRACING: u8 = 0x02;
    /// v4: a bytes map precedes the body.
    pub const CUSTOM_PAYLOAD: u8 = 0x04;
    /// v4: a string list of warnings precedes the body.
    pub const WARNING: u8 = 0x08;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Opcode {
    Error,
    Startup,
    Ready,
    Authenticate,
    Options,
    Supported,
    Query,
    Result,
    Prepare,
    Execute,
    Register,
    Event,
    Batch,
    AuthChallenge,
    AuthResponse,
    AuthSuccess,
}

impl Opcode {
    pub fn to_wire(self) -> u8 {
        use self::Opcode::*;
        match self {
            Error => 0x00,
            Startup => 0x01,
            Ready => 0x02,
            Authenticate => 0x03,
            Options => 0x05,
            Supported => 0x06,
            Query => 0x07,
            Result => 0x08,
            Prepare => 0x09,
            Execute => 0x0a,
            Register => 0x0b,
            Event => 0x0c,
            Batch => 0x0d,
            AuthChallenge => 0x0e,
            AuthResponse => 0x0f,
            AuthSuccess => 0x10,
        }
    }

    pub fn from_wire(x: u8) -> Result<Opcode, ProtocolError> {
        use self::Opcode::*;
        Ok(match x {
            0x00 => Error,
            0x01 => Startup,
            0x02 => Ready,
            0x03 => Authenticate,
            0x05 => Options,
            0x06 => Supported,
            0x07 => Query,
            0x08 => Result,
            0x09 => Prepare,
            0x0a => Execute,
            0x0b => Register,
            0x0c => Event,
            0x0d => Batch,
            0x0e => AuthChallenge,
            0x0f => AuthResponse,
            0x10 => AuthSuccess,
            _ => return Err(ProtocolError::UnknownOpcode { opcode: x }),
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Violations of the framing layer. Any of these poisons the connection the
/// frame arrived on.
#[derive(Debug, Clone, Eq, PartialEq, Fail)]
pub enum ProtocolError {
    #[fail(display = "truncated frame")]
    UnexpectedEnd,
    #[fail(display = "unknown opcode 0x{:02x}", opcode)]
    UnknownOpcode { opcode: u8 },
    #[fail(display = "unknown protocol version byte 0x{:02x}", byte)]
    UnknownVersion { byte: u8 },
    #[fail(display = "frame body of {} bytes exceeds limit of {}", len, max)]
    FrameTooLarge { len: usize, max: usize },
    #[fail(display = "compressed frame received but no compression negotiated")]
    UnexpectedCompression,
    #[fail(display = "request frame received where a response was expected")]
    UnexpectedDirection,
    #[fail(display = "malformed {}", _0)]
    Malformed(&'static str),
}

impl From<CodingError> for ProtocolError {
    fn from(x: CodingError) -> Self {
        match x {
            CodingError::UnexpectedEnd => ProtocolError::UnexpectedEnd,
            CodingError::Malformed(what) => ProtocolError::Malformed(what),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    pub response: bool,
    pub flags: u8,
    pub stream: StreamId,
    pub opcode: Opcode,
    pub length: u32,
}

impl FrameHeader {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<FrameHeader, ProtocolError> {
        let version_byte = buf.get::<u8>()?;
        let version = ProtocolVersion::from_wire(version_byte)
            .ok_or(ProtocolError::UnknownVersion { byte: version_byte })?;
        let response = version_byte & 0x80 != 0;
        let flags = buf.get::<u8>()?;
        let stream = match version {
            ProtocolVersion::V2 => StreamId(i16::from(buf.get::<i8>()?)),
            _ => StreamId(buf.get::<i16>()?),
        };
        let opcode = Opcode::from_wire(buf.get::<u8>()?)?;
        let length = buf.get::<u32>()?;
        Ok(FrameHeader {
            version,
            response,
            flags,
            stream,
            opcode,
            length,
        })
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let direction = if self.response { 0x80 } else { 0x00 };
        buf.write::<u8>(self.version.request_byte() | direction);
        buf.write::<u8>(self.flags);
        match self.version {
            ProtocolVersion::V2 => buf.write::<i8>(self.stream.0 as i8),
            _ => buf.write::<i16>(self.stream.0),
        }
        buf.write::<u8>(self.opcode.to_wire());
        buf.write::<u32>(self.length);
    }
}

/// Encode a complete request frame into `out`.
pub fn encode_request(
    version: ProtocolVersion,
    stream: StreamId,
    opcode: Opcode,
    body: &[u8],
    out: &mut BytesMut,
) {
    out.reserve(version.header_len() + body.len());
    FrameHeader {
        version,
        response: false,
        flags: 0,
        stream,
        opcode,
        length: body.len() as u32,
    }
    .encode(out);
    out.put_slice(body);
}

/// Encode a complete response frame into `out`. Used by the control plane of
/// tests and by nothing on the request path.
pub fn encode_response(
    version: ProtocolVersion,
    flags: u8,
    stream: StreamId,
    opcode: Opcode,
    body: &[u8],
    out: &mut BytesMut,
) {
    out.reserve(version.header_len() + body.len());
    FrameHeader {
        version,
        response: true,
        flags,
        stream,
        opcode,
        length: body.len() as u32,
    }
    .encode(out);
    out.put_slice(body);
}

enum DecodeState {
    Header,
    Body(FrameHeader),
}

/// Reentrant decoder producing `(header, body)` pairs from a byte stream.
///
/// Feed it the connection's read buffer; it consumes exactly the bytes of the
/// frames it returns and leaves partial input untouched until more arrives.
pub struct FrameDecoder {
    version: ProtocolVersion,
    max_frame_len: usize,
    state: DecodeState,
}

impl FrameDecoder {
    pub fn new(version: ProtocolVersion, max_frame_len: usize) -> Self {
        Self {
            version,
            max_frame_len,
            state: DecodeState::Header,
        }
    }

    pub fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<(FrameHeader, Bytes)>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < self.version.header_len() {
                        return Ok(None);
                    }
                    let mut header_bytes = src.split_to(self.version.header_len()).freeze();
                    let header = FrameHeader::decode(&mut header_bytes)?;
                    if !header.response {
                        return Err(ProtocolError::UnexpectedDirection);
                    }
                    if header.length as usize > self.max_frame_len {
                        return Err(ProtocolError::FrameTooLarge {
                            len: header.length as usize,
                            max: self.max_frame_len,
                        });
                    }
                    if header.flags & flags::COMPRESSED != 0 {
                        return Err(ProtocolError::UnexpectedCompression);
                    }
                    self.state = DecodeState::Body(header);
                }
                DecodeState::Body(ref header) => {
                    let len = header.length as usize;
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(len).freeze();
                    let header = match ::std::mem::replace(&mut self.state, DecodeState::Header) {
                        DecodeState::Body(h) => h,
                        DecodeState::Header => unreachable!(),
                    };
                    return Ok(Some((header, body)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn response_frame(version: ProtocolVersion, stream: i16, body: &[u8]) -> BytesMut {
        let mut out = BytesMut::new();
        encode_response(version, 0, StreamId(stream), Opcode::Ready, body, &mut out);
        out
    }

    #[test]
    fn header_round_trip() {
        for &version in &[ProtocolVersion::V2, ProtocolVersion::V3, ProtocolVersion::V4] {
            let header = FrameHeader {
                version,
                response: true,
                flags: flags::TRACING,
                stream: StreamId(if version == ProtocolVersion::V2 { 117 } else { 3117 }),
                opcode: Opcode::Result,
                length: 42,
            };
            let mut buf = BytesMut::new();
            header.encode(&mut buf);
            assert_eq!(buf.len(), version.header_len());
            let decoded = FrameHeader::decode(&mut buf.freeze()).unwrap();
            assert_eq!(decoded.version, version);
            assert!(decoded.response);
            assert_eq!(decoded.flags, flags::TRACING);
            assert_eq!(decoded.stream, header.stream);
            assert_eq!(decoded.opcode, Opcode::Result);
            assert_eq!(decoded.length, 42);
        }
    }

    #[test]
    fn event_stream_id_survives_both_widths() {
        for &version in &[ProtocolVersion::V2, ProtocolVersion::V3] {
            let mut buf = BytesMut::new();
            FrameHeader {
                version,
                response: true,
                flags: 0,
                stream: crate::EVENT_STREAM_ID,
                opcode: Opcode::Event,
                length: 0,
            }
            .encode(&mut buf);
            let decoded = FrameHeader::decode(&mut buf.freeze()).unwrap();
            assert_eq!(decoded.stream, crate::EVENT_STREAM_ID);
        }
    }

    #[test]
    fn decoder_handles_split_input() {
        let frame = response_frame(ProtocolVersion::V4, 7, b"hello");
        // Drip-feed one byte at a time; the decoder must produce exactly one
        // frame, at the final byte.
        let mut decoder = FrameDecoder::new(ProtocolVersion::V4, crate::MAX_FRAME_LEN);
        let mut src = BytesMut::new();
        let mut produced = Vec::new();
        for (i, b) in frame.iter().enumerate() {
            src.extend_from_slice(&[*b]);
            if let Some(x) = decoder.decode(&mut src).unwrap() {
                produced.push((i, x));
            }
        }
        assert_eq!(produced.len(), 1);
        let (at, (header, body)) = produced.pop().unwrap();
        assert_eq!(at, frame.len() - 1);
        assert_eq!(header.stream, StreamId(7));
        assert_eq!(body.as_ref(), b"hello");
    }

    #[test]
    fn decoder_produces_back_to_back_frames() {
        let mut src = response_frame(ProtocolVersion::V3, 1, b"a");
        src.extend_from_slice(&response_frame(ProtocolVersion::V3, 2, b"bc"));
        let mut decoder = FrameDecoder::new(ProtocolVersion::V3, crate::MAX_FRAME_LEN);
        let (h1, b1) = decoder.decode(&mut src).unwrap().unwrap();
        let (h2, b2) = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!((h1.stream, b1.as_ref()), (StreamId(1), &b"a"[..]));
        assert_eq!((h2.stream, b2.as_ref()), (StreamId(2), &b"bc"[..]));
        assert_matches!(decoder.decode(&mut src), Ok(None));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut src = BytesMut::new();
        encode_response(
            ProtocolVersion::V4,
            0,
            StreamId(0),
            Opcode::Result,
            &[0; 64],
            &mut src,
        );
        // Decoder configured with a 16-byte cap.
        let mut decoder = FrameDecoder::new(ProtocolVersion::V4, 16);
        assert_matches!(
            decoder.decode(&mut src),
            Err(ProtocolError::FrameTooLarge { len: 64, max: 16 })
        );
    }

    #[test]
    fn compressed_frames_are_rejected() {
        let mut src = BytesMut::new();
        encode_response(
            ProtocolVersion::V4,
            flags::COMPRESSED,
            StreamId(0),
            Opcode::Result,
            b"",
            &mut src,
        );
        let mut decoder = FrameDecoder::new(ProtocolVersion::V4, crate::MAX_FRAME_LEN);
        assert_matches!(
            decoder.decode(&mut src),
            Err(ProtocolError::UnexpectedCompression)
        );
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut src = BytesMut::new();
        src.put_slice(&[0x84, 0x00, 0x00, 0x00, 0x42, 0x00, 0x00, 0x00, 0x00]);
        let mut decoder = FrameDecoder::new(ProtocolVersion::V4, crate::MAX_FRAME_LEN);
        assert_matches!(
            decoder.decode(&mut src),
            Err(ProtocolError::UnknownOpcode { opcode: 0x42 })
        );
    }
}
