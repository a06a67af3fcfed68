//! Frame ingestion.
//!
//! Both wire encodings decode into the same `FrameArrivalEvent`, which is all
//! the assembly and lifecycle core ever sees:
//! - `binary`: chunked frames behind the 32-byte header
//! - `json`: one base64 frame per message, clip named by serial + timestamp
//!
//! Decoders never surface errors. Anything that is not a frame is dropped at
//! this boundary without touching engine state.

use anyhow::{anyhow, Result};
use std::fmt;
use std::str::FromStr;

use crate::clip::ClipId;
use crate::transport::{parse_json_frame, ChunkHeader, MediaKind};

/// Position of a chunk within its frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPosition {
    pub chunk_id: u16,
    pub chunk_count: u16,
}

impl ChunkPosition {
    /// A frame delivered in one piece.
    pub const WHOLE: ChunkPosition = ChunkPosition {
        chunk_id: 0,
        chunk_count: 1,
    };
}

/// One decoded piece of a frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameArrivalEvent {
    pub clip: ClipId,
    pub frame_id: u32,
    /// None when the transport does not split frames.
    pub chunk: Option<ChunkPosition>,
    /// Declared length of the reassembled frame, when the transport states one.
    pub frame_size: Option<u32>,
    pub media: MediaKind,
    /// Total frames in the clip, when the transport states it per message.
    pub expected_frames: Option<u32>,
    pub timestamp_ms: Option<u32>,
    pub width: u16,
    pub height: u16,
    pub payload: Vec<u8>,
}

impl FrameArrivalEvent {
    pub fn position(&self) -> ChunkPosition {
        self.chunk.unwrap_or(ChunkPosition::WHOLE)
    }
}

/// Turns a data-topic payload into a frame arrival.
pub trait FrameDecoder: Send {
    fn decode(&self, payload: &[u8]) -> Option<FrameArrivalEvent>;

    fn name(&self) -> &'static str;
}

/// Decoder for the binary chunk header transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct BinaryChunkDecoder;

impl FrameDecoder for BinaryChunkDecoder {
    fn decode(&self, payload: &[u8]) -> Option<FrameArrivalEvent> {
        let (header, body) = ChunkHeader::decode(payload)?;
        Some(FrameArrivalEvent {
            clip: ClipId::Numeric(header.clip_id),
            frame_id: header.frame_id,
            chunk: Some(ChunkPosition {
                chunk_id: header.chunk_id,
                chunk_count: header.chunk_count,
            }),
            frame_size: Some(header.frame_size),
            media: header.media_kind(),
            expected_frames: None,
            timestamp_ms: Some(header.timestamp_ms),
            width: header.width,
            height: header.height,
            payload: body.to_vec(),
        })
    }

    fn name(&self) -> &'static str {
        "binary"
    }
}

/// Decoder for the JSON one-frame-per-message transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonFrameDecoder;

impl FrameDecoder for JsonFrameDecoder {
    fn decode(&self, payload: &[u8]) -> Option<FrameArrivalEvent> {
        let frame = match parse_json_frame(payload) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("Dropping json frame message: {}", e);
                return None;
            }
        };
        Some(FrameArrivalEvent {
            clip: ClipId::Named {
                serial: frame.serial,
                timestamp: frame.timestamp,
            },
            frame_id: frame.index,
            chunk: None,
            frame_size: None,
            media: MediaKind::Jpeg,
            expected_frames: Some(frame.outof),
            timestamp_ms: None,
            width: 0,
            height: 0,
            payload: frame.data,
        })
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

/// Which encoding the data topic carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireFormat {
    #[default]
    Binary,
    Json,
}

impl WireFormat {
    pub fn decoder(&self) -> Box<dyn FrameDecoder> {
        match self {
            Self::Binary => Box::new(BinaryChunkDecoder),
            Self::Json => Box::new(JsonFrameDecoder),
        }
    }
}

impl FromStr for WireFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "binary" | "bin" | "chunked" => Ok(Self::Binary),
            "json" | "text" => Ok(Self::Json),
            other => Err(anyhow!(
                "unknown wire format '{}': expected 'binary' or 'json'",
                other
            )),
        }
    }
}

impl fmt::Display for WireFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Json => write!(f, "json"),
        }
    }
}
