//! Framing of the CQL native protocol, version 4.
//!
//! Every frame starts with a 9-byte header:
//! `version: u8, flags: u8, stream: i16, opcode: u8, length: u32`.
//! Requests are serialized with a zeroed stream id, which the connection
//! fills in with [`SerializedRequest::set_stream`] once it has allocated one.

pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;

use std::fmt;

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use frame_errors::{FrameBodyExtensionsParseError, FrameHeaderParseError};
use request::{CqlRequestSerializationError, RequestOpcode, SerializableRequest};
use response::ResponseOpcode;

/// Size of the frame header, in bytes.
pub const HEADER_SIZE: usize = 9;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 0x04;

/// Stream id on which the server pushes events.
pub const EVENT_STREAM_ID: i16 = -1;

/// Bodies above 256 MiB, the server's own limit, are refused.
pub const MAX_FRAME_BODY_SIZE: usize = 256 * 1024 * 1024;

/// Set in the version byte of frames sent by the server.
const RESPONSE_BIT: u8 = 0x80;

mod flag {
    pub(super) const COMPRESSION: u8 = 0x01;
    pub(super) const TRACING: u8 = 0x02;
    pub(super) const CUSTOM_PAYLOAD: u8 = 0x04;
    pub(super) const WARNING: u8 = 0x08;
}

/// Body compression, negotiated in `STARTUP`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 block format, prefixed by the uncompressed length.
    Lz4,
    /// Raw Snappy.
    Snappy,
}

impl Compression {
    /// Name of the algorithm in `SUPPORTED` and `STARTUP`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }

    fn compress_into(self, body: &[u8], out: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        match self {
            Compression::Lz4 => {
                let length = u32::try_from(body.len())?;
                out.put_u32(length);
                out.extend_from_slice(&lz4_flex::compress(body));
            }
            Compression::Snappy => {
                let start = out.len();
                out.resize(start + snap::raw::max_compress_len(body.len()), 0);
                let written = snap::raw::Encoder::new()
                    .compress(body, &mut out[start..])
                    .map_err(|_| CqlRequestSerializationError::SnapCompressError)?;
                out.truncate(start + written);
            }
        }
        Ok(())
    }

    fn decompress(self, mut body: &[u8]) -> Result<Vec<u8>, FrameBodyExtensionsParseError> {
        match self {
            Compression::Lz4 => {
                if body.remaining() < 4 {
                    return Err(FrameBodyExtensionsParseError::Lz4Decompress(
                        "body shorter than the uncompressed length prefix".to_owned(),
                    ));
                }
                let length = body.get_u32() as usize;
                lz4_flex::decompress(body, length)
                    .map_err(|err| FrameBodyExtensionsParseError::Lz4Decompress(err.to_string()))
            }
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(body)
                .map_err(|_| FrameBodyExtensionsParseError::SnapDecompress),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete request frame whose stream id is still to be chosen.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    /// Frames `req`, compressing its body when `compression` is set.
    pub fn make<R: SerializableRequest>(
        req: &R,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let mut flags = if tracing { flag::TRACING } else { 0 };
        let mut data = Vec::with_capacity(HEADER_SIZE);
        data.put_u8(PROTOCOL_VERSION);
        data.put_u8(0);
        data.put_i16(0);
        data.put_u8(R::OPCODE as u8);
        data.put_u32(0);

        match compression {
            Some(compression) => {
                flags |= flag::COMPRESSION;
                compression.compress_into(&req.to_bytes()?, &mut data)?;
            }
            None => req.serialize(&mut data)?,
        }

        data[1] = flags;
        let length = u32::try_from(data.len() - HEADER_SIZE)?;
        data[5..HEADER_SIZE].copy_from_slice(&length.to_be_bytes());
        Ok(SerializedRequest { data })
    }

    /// Writes the stream id into the header.
    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    /// The stream id currently in the header.
    pub fn stream(&self) -> i16 {
        i16::from_be_bytes([self.data[2], self.data[3]])
    }

    /// The whole frame, header included.
    pub fn get_data(&self) -> &[u8] {
        &self.data
    }
}

/// The opcode-independent part of a frame header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    /// Version byte, direction bit included.
    pub version: u8,
    /// Frame flags.
    pub flags: u8,
    /// Stream the frame belongs to.
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        FrameParams {
            version: PROTOCOL_VERSION,
            flags: 0,
            stream: 0,
        }
    }
}

/// Reads a header and its body, checking the direction bit against
/// `from_server`.
async fn read_frame(
    reader: &mut (impl AsyncRead + Unpin),
    from_server: bool,
) -> Result<(FrameParams, u8, Bytes), FrameHeaderParseError> {
    let mut header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .await
        .map_err(FrameHeaderParseError::HeaderIoError)?;
    let mut header = &header[..];

    let version = header.get_u8();
    match (version & RESPONSE_BIT != 0, from_server) {
        (false, true) => return Err(FrameHeaderParseError::FrameFromClient),
        (true, false) => return Err(FrameHeaderParseError::FrameFromServer),
        _ => {}
    }
    if version & !RESPONSE_BIT != PROTOCOL_VERSION {
        return Err(FrameHeaderParseError::VersionNotSupported(version & !RESPONSE_BIT));
    }

    let params = FrameParams {
        version,
        flags: header.get_u8(),
        stream: header.get_i16(),
    };
    let opcode = header.get_u8();
    let length = header.get_u32() as usize;
    if length > MAX_FRAME_BODY_SIZE {
        return Err(FrameHeaderParseError::FrameTooLarge(length));
    }

    let mut body = Vec::with_capacity(length).limit(length);
    while body.has_remaining_mut() {
        let read = reader
            .read_buf(&mut body)
            .await
            .map_err(FrameHeaderParseError::BodyChunkIoError)?;
        if read == 0 {
            return Err(FrameHeaderParseError::ConnectionClosed(body.remaining_mut(), length));
        }
    }

    Ok((params, opcode, Bytes::from(body.into_inner())))
}

/// Reads one response frame. The body is returned as received, possibly
/// compressed.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameHeaderParseError> {
    let (params, opcode, body) = read_frame(reader, true).await?;
    Ok((params, ResponseOpcode::try_from(opcode)?, body))
}

/// Reads one request frame, as a server would.
pub async fn read_request_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, RequestOpcode, Bytes), FrameHeaderParseError> {
    let (params, opcode, body) = read_frame(reader, false).await?;
    Ok((params, RequestOpcode::try_from(opcode)?, body))
}

/// Frames an uncompressed response body, as a server would.
pub fn make_response_frame(stream: i16, opcode: ResponseOpcode, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.put_u8(PROTOCOL_VERSION | RESPONSE_BIT);
    frame.put_u8(0);
    frame.put_i16(stream);
    frame.put_u8(opcode as u8);
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(body);
    frame
}

/// A response body with the optional leading extensions taken off.
#[derive(Debug)]
pub struct ResponseBodyWithExtensions {
    /// Tracing session id, when tracing was requested.
    pub trace_id: Option<Uuid>,
    /// Warnings the server attached.
    pub warnings: Vec<String>,
    /// What follows the extensions, decompressed.
    pub body: Bytes,
}

/// Decompresses the body if the frame says so, then takes off the tracing
/// id and warnings. A custom payload is skipped.
pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameBodyExtensionsParseError> {
    let mut body = if flags & flag::COMPRESSION != 0 {
        let compression = compression.ok_or(FrameBodyExtensionsParseError::NoCompressionNegotiated)?;
        Bytes::from(compression.decompress(&body)?)
    } else {
        body
    };

    // Runs `read` over the front of `body` and drops what it consumed.
    fn take<T, E>(
        body: &mut Bytes,
        read: impl FnOnce(&mut &[u8]) -> Result<T, frame_errors::LowLevelDeserializationError>,
        wrap: impl FnOnce(frame_errors::LowLevelDeserializationError) -> E,
    ) -> Result<T, E> {
        let mut rest = &body[..];
        let value = read(&mut rest).map_err(wrap)?;
        let consumed = body.len() - rest.len();
        body.advance(consumed);
        Ok(value)
    }

    let trace_id = if flags & flag::TRACING != 0 {
        Some(take(&mut body, types::read_uuid, FrameBodyExtensionsParseError::TraceIdParse)?)
    } else {
        None
    };
    let warnings = if flags & flag::WARNING != 0 {
        take(&mut body, types::read_string_list, FrameBodyExtensionsParseError::WarningsParse)?
    } else {
        Vec::new()
    };
    if flags & flag::CUSTOM_PAYLOAD != 0 {
        take(&mut body, types::read_bytes_map, FrameBodyExtensionsParseError::CustomPayloadMapParse)?;
    }

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
    })
}

/// A byte that names no variant of an enum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{primitive:?} is not a valid `{enum_name}`")]
pub struct TryFromPrimitiveError<T: Copy + fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use bytes::{BufMut, Bytes};

    use super::{
        make_response_frame, parse_response_body_extensions, read_request_frame, read_response_frame,
        Compression, SerializedRequest,
    };
    use crate::frame::frame_errors::{FrameBodyExtensionsParseError, FrameHeaderParseError};
    use crate::frame::request::{Options, Prepare, RequestOpcode};
    use crate::frame::response::ResponseOpcode;
    use crate::frame::types;

    #[test]
    fn lz4_body_carries_its_length() {
        let mut out = b"head".to_vec();
        Compression::Lz4.compress_into(b", World!", &mut out).unwrap();
        assert_eq!(&out[..8], b"head\0\0\0\x08");

        let text = "Hello, World!".repeat(100);
        let mut compressed = Vec::new();
        Compression::Lz4.compress_into(text.as_bytes(), &mut compressed).unwrap();
        assert!(compressed.len() < text.len() / 10);
        assert_eq!(Compression::Lz4.decompress(&compressed).unwrap(), text.as_bytes());
    }

    #[test]
    fn snappy_body_decompresses() {
        let text = "SELECT * FROM ks.t".repeat(20);
        let mut compressed = Vec::new();
        Compression::Snappy.compress_into(text.as_bytes(), &mut compressed).unwrap();
        assert_eq!(Compression::Snappy.decompress(&compressed).unwrap(), text.as_bytes());
        assert_matches!(
            Compression::Lz4.decompress(&[1, 2]),
            Err(FrameBodyExtensionsParseError::Lz4Decompress(_))
        );
    }

    #[test]
    fn request_header_layout() {
        let mut req = SerializedRequest::make(&Options, None, false).unwrap();
        req.set_stream(0x1234);
        assert_eq!(req.get_data(), &[0x04, 0x00, 0x12, 0x34, 0x05, 0, 0, 0, 0]);
        assert_eq!(req.stream(), 0x1234);

        let traced = SerializedRequest::make(&Options, Some(Compression::Lz4), true).unwrap();
        assert_eq!(traced.get_data()[1], 0x01 | 0x02);
    }

    #[tokio::test]
    async fn compressed_request_reads_back() {
        let prepare = Prepare {
            query: "SELECT v FROM ks.t".into(),
        };
        let req = SerializedRequest::make(&prepare, Some(Compression::Lz4), false).unwrap();
        let (params, opcode, body) = read_request_frame(&mut req.get_data()).await.unwrap();
        assert_eq!(opcode, RequestOpcode::Prepare);
        assert_eq!(params.flags, 0x01);

        let body = Compression::Lz4.decompress(&body).unwrap();
        assert_eq!(types::read_long_string(&mut &body[..]).unwrap(), "SELECT v FROM ks.t");
    }

    #[tokio::test]
    async fn response_frame_reads_back() {
        let frame = make_response_frame(7, ResponseOpcode::Ready, &[]);
        let (params, opcode, body) = read_response_frame(&mut &frame[..]).await.unwrap();
        assert_eq!(params.stream, 7);
        assert_eq!(opcode, ResponseOpcode::Ready);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_are_rejected() {
        let mut truncated = make_response_frame(1, ResponseOpcode::Result, &[0, 0, 0, 1]);
        truncated.truncate(truncated.len() - 2);
        assert_matches!(
            read_response_frame(&mut &truncated[..]).await,
            Err(FrameHeaderParseError::ConnectionClosed(2, 4))
        );

        let request = SerializedRequest::make(&Options, None, false).unwrap();
        assert_matches!(
            read_response_frame(&mut request.get_data()).await,
            Err(FrameHeaderParseError::FrameFromClient)
        );

        let response = make_response_frame(0, ResponseOpcode::Ready, &[]);
        assert_matches!(
            read_request_frame(&mut &response[..]).await,
            Err(FrameHeaderParseError::FrameFromServer)
        );

        let mut v3 = make_response_frame(0, ResponseOpcode::Ready, &[]);
        v3[0] = 0x83;
        assert_matches!(
            read_response_frame(&mut &v3[..]).await,
            Err(FrameHeaderParseError::VersionNotSupported(3))
        );
    }

    #[test]
    fn extensions_are_taken_off_in_order() {
        let trace_id = uuid::Uuid::from_u128(0x1234);
        let mut body = Vec::new();
        types::write_uuid(&trace_id, &mut body);
        types::write_string_list(&["slow query".to_owned()], &mut body).unwrap();
        types::write_short(1, &mut body);
        types::write_string("key", &mut body).unwrap();
        types::write_bytes(b"value", &mut body).unwrap();
        body.put_slice(b"rest");

        let parsed = parse_response_body_extensions(0x02 | 0x04 | 0x08, None, Bytes::from(body)).unwrap();
        assert_eq!(parsed.trace_id, Some(trace_id));
        assert_eq!(parsed.warnings, ["slow query"]);
        assert_eq!(&parsed.body[..], b"rest");

        assert_matches!(
            parse_response_body_extensions(0x01, None, Bytes::new()),
            Err(FrameBodyExtensionsParseError::NoCompressionNegotiated)
        );
    }
}
