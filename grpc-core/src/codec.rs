//! Message framing and compression (section 4.1).
//!
//! Frames a message payload the way gRPC-over-HTTP/2 does: a 5-byte header
//! (1-byte compressed flag, 4-byte big-endian length) followed by the
//! (possibly compressed) payload. Protobuf encoding itself is out of
//! scope here; this module only ever sees opaque bytes.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;

use crate::error::{Code, RpcError};

const FRAME_HEADER_LEN: usize = 5;

/// The compression algorithms this core knows how to (de)inflate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Identity,
    Deflate,
    Gzip,
}

impl Algorithm {
    /// Parse a single `grpc-encoding` / `grpc-accept-encoding` token.
    pub fn parse(token: &str) -> Option<Algorithm> {
        match token.trim() {
            "identity" => Some(Algorithm::Identity),
            "deflate" => Some(Algorithm::Deflate),
            "gzip" => Some(Algorithm::Gzip),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::Identity => "identity",
            Algorithm::Deflate => "deflate",
            Algorithm::Gzip => "gzip",
        }
    }
}

/// Either an absolute byte bound, or a multiplier applied to the
/// compressed size of a particular message (section 3).
#[derive(Debug, Clone, Copy)]
pub enum DecompressionLimit {
    Bytes(usize),
    Ratio(f64),
}

impl DecompressionLimit {
    /// The effective byte bound for a message whose compressed size is
    /// `compressed_len`.
    fn bound_for(self, compressed_len: usize) -> usize {
        match self {
            DecompressionLimit::Bytes(n) => n,
            DecompressionLimit::Ratio(ratio) => ((compressed_len as f64) * ratio) as usize,
        }
    }
}

impl Default for DecompressionLimit {
    fn default() -> Self {
        // 4x the compressed size is the conventional zip-bomb guard default
        // used by gRPC implementations that support a ratio-based limit.
        DecompressionLimit::Ratio(4.0)
    }
}

/// A decoded message: payload bytes plus whether it arrived compressed
/// on the wire (section 3's "Message" data model).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Bytes,
    pub compressed: bool,
}

impl Message {
    pub fn uncompressed(payload: impl Into<Bytes>) -> Message {
        Message {
            payload: payload.into(),
            compressed: false,
        }
    }
}

/// Encode one message into a wire frame.
///
/// `compress` requests compression; it is a no-op when `algorithm` is
/// `Identity`, matching section 4.1: "When compress is true and the
/// configured algorithm is not identity, invokes the codec; otherwise
/// emits the payload verbatim with flag cleared."
pub fn encode(payload: &[u8], compress: bool, algorithm: Algorithm) -> Result<Bytes, RpcError> {
    let (flag, body) = if compress && algorithm != Algorithm::Identity {
        (1u8, deflate_with(payload, algorithm)?)
    } else {
        (0u8, Bytes::copy_from_slice(payload))
    };

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_u8(flag);
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Decode one wire frame into a message, enforcing `max_message_bytes` on
/// the uncompressed size and `decompression_limit` on inflation growth.
///
/// `negotiated_encoding` is the algorithm selected via "grpc-encoding"; it
/// is consulted only when the frame's compressed flag is set. A compressed
/// flag paired with `Algorithm::Identity` is a protocol violation, per
/// section 4.1's edge cases.
pub fn decode(
    bytes: &[u8],
    negotiated_encoding: Algorithm,
    max_message_bytes: Option<usize>,
    decompression_limit: DecompressionLimit,
) -> Result<Message, RpcError> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(RpcError::ProtocolViolation(format!(
            "frame shorter than {FRAME_HEADER_LEN}-byte header ({} bytes)",
            bytes.len()
        )));
    }

    let mut header = &bytes[..FRAME_HEADER_LEN];
    let flag = header.get_u8();
    let len = header.get_u32() as usize;
    let body = &bytes[FRAME_HEADER_LEN..];
    if body.len() != len {
        return Err(RpcError::ProtocolViolation(format!(
            "frame declared length {len} but body is {} bytes",
            body.len()
        )));
    }

    let compressed = flag != 0;
    if !compressed {
        if let Some(max) = max_message_bytes {
            if body.len() > max {
                return Err(RpcError::ResourceExceeded(format!(
                    "message of {} bytes exceeds max of {max} bytes",
                    body.len()
                )));
            }
        }
        return Ok(Message {
            payload: Bytes::copy_from_slice(body),
            compressed: false,
        });
    }

    if negotiated_encoding == Algorithm::Identity {
        return Err(RpcError::ProtocolViolation(
            "received compressed frame but grpc-encoding is identity".into(),
        ));
    }

    let limit = decompression_limit.bound_for(body.len());
    let limit = match max_message_bytes {
        Some(max) => limit.min(max),
        None => limit,
    };
    let payload = inflate(body, negotiated_encoding, limit)?;
    Ok(Message {
        payload: Bytes::from(payload),
        compressed: true,
    })
}

fn deflate_with(input: &[u8], algorithm: Algorithm) -> Result<Bytes, RpcError> {
    match algorithm {
        Algorithm::Identity => Ok(Bytes::copy_from_slice(input)),
        Algorithm::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(input)
                .map_err(|e| RpcError::status(Code::Internal, format!("deflate failed: {e}")))?;
            let out = encoder
                .finish()
                .map_err(|e| RpcError::status(Code::Internal, format!("deflate flush failed: {e}")))?;
            Ok(Bytes::from(out))
        }
        Algorithm::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(input)
                .map_err(|e| RpcError::status(Code::Internal, format!("gzip failed: {e}")))?;
            let out = encoder
                .finish()
                .map_err(|e| RpcError::status(Code::Internal, format!("gzip flush failed: {e}")))?;
            Ok(Bytes::from(out))
        }
    }
}

/// Stream `input` through the decompressor for `algorithm`, growing the
/// output buffer exponentially but never past `limit` bytes, per section
/// 4.1: "Fails with DecompressionLimitExceeded when the bound would be
/// crossed."
fn inflate(input: &[u8], algorithm: Algorithm, limit: usize) -> Result<Vec<u8>, RpcError> {
    let mut out = Vec::with_capacity(input.len().min(limit).max(64));
    let mut chunk = vec![0u8; 4096.min(limit.max(1))];

    macro_rules! pump {
        ($decoder:expr) => {{
            let mut decoder = $decoder;
            loop {
                let n = decoder.read(&mut chunk).map_err(|e| {
                    RpcError::status(Code::Internal, format!("decompression failed: {e}"))
                })?;
                if n == 0 {
                    break;
                }
                if out.len() + n > limit {
                    return Err(RpcError::ResourceExceeded(format!(
                        "decompressed payload exceeds limit of {limit} bytes"
                    )));
                }
                out.extend_from_slice(&chunk[..n]);
            }
        }};
    }

    match algorithm {
        Algorithm::Identity => return Ok(input.to_vec()),
        Algorithm::Deflate => pump!(DeflateDecoder::new(input)),
        Algorithm::Gzip => pump!(GzDecoder::new(input)),
    }

    Ok(out)
}
