//! Persistent-channel framing.
//!
//! ```text
//! [version u32][correlation id u64][flags u32][uncompressed length u32][payload]
//! ```
//! All integers are big-endian. Flag bit 0 marks a gzip payload, bit 1 marks
//! a response so both ends can number their own requests independently.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::TransportLimits;
use crate::p2p::error::TransportError;

pub const FRAME_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 20;
pub const FLAG_GZIP: u32 = 1;
pub const FLAG_RESPONSE: u32 = 1 << 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u64,
    pub response: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_message_size: usize,
    min_compress_size: usize,
}

impl FrameCodec {
    pub fn new(limits: &TransportLimits) -> Self {
        Self {
            max_message_size: limits.max_message_size,
            min_compress_size: limits.min_compress_size,
        }
    }

    pub fn encode(&self, id: u64, response: bool, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if payload.len() > self.max_message_size || payload.len() > u32::MAX as usize {
            return Err(TransportError::Frame(format!(
                "message of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.max_message_size
            )));
        }
        let mut flags = if response { FLAG_RESPONSE } else { 0 };
        let body = if payload.len() >= self.min_compress_size {
            flags |= FLAG_GZIP;
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder
                .write_all(payload)
                .map_err(|e| TransportError::Frame(e.to_string()))?;
            encoder
                .finish()
                .map_err(|e| TransportError::Frame(e.to_string()))?
        } else {
            payload.to_vec()
        };
        if body.len() > self.max_message_size {
            return Err(TransportError::Frame("encoded frame too large".into()));
        }

        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&FRAME_VERSION.to_be_bytes());
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(&flags.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, TransportError> {
        if bytes.len() < HEADER_LEN {
            return Err(TransportError::Frame(format!("short frame of {} bytes", bytes.len())));
        }
        let version = u32::from_be_bytes(be(&bytes[0..4]));
        if version != FRAME_VERSION {
            return Err(TransportError::Frame(format!("unsupported frame version {version}")));
        }
        let id = u64::from_be_bytes(be(&bytes[4..12]));
        let flags = u32::from_be_bytes(be(&bytes[12..16]));
        let length = u32::from_be_bytes(be(&bytes[16..20])) as usize;
        if length > self.max_message_size {
            return Err(TransportError::SizeExceeded {
                limit: self.max_message_size,
            });
        }
        let body = &bytes[HEADER_LEN..];

        let payload = if flags & FLAG_GZIP != 0 {
            let mut out = Vec::with_capacity(length);
            GzDecoder::new(body)
                .take(length as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| TransportError::Frame(e.to_string()))?;
            out
        } else {
            body.to_vec()
        };
        if payload.len() != length {
            return Err(TransportError::Frame(format!(
                "payload length {} does not match header length {}",
                payload.len(),
                length
            )));
        }
        Ok(Frame {
            id,
            response: flags & FLAG_RESPONSE != 0,
            payload,
        })
    }
}

fn be<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}
