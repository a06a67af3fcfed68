//! Binary chunk header codec.
//!
//! Every message on the video data topic starts with a fixed 32-byte header.
//! All fields are little-endian:
//!
//! ```text
//! magic(4) clip_id(4) frame_id(4) timestamp_ms(4) chunk_id(2) chunk_count(2)
//! frame_size(4) media_type_tag(4) width(2) height(2)
//! ```
//!
//! The remainder of the message is the chunk payload. Payloads carry no length
//! prefix of their own; the header's sizes are used for ordering and the
//! post-assembly integrity check only.

use anyhow::{anyhow, Result};

/// Sentinel that opens every transport frame ("VID0" as a little-endian u32).
pub const VID_MAGIC: u32 = 0x5649_4430;

/// Encoded header length in bytes.
pub const HEADER_LEN: usize = 32;

/// Largest chunk payload the device emits.
pub const CHUNK_MAX: usize = 2048;

/// FourCC tag the device uses for JPEG frames.
pub const FOURCC_MJPG: u32 = fourcc(b"MJPG");

/// Pack a four character code the way the device firmware does.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*code)
}

/// Semantic kind of an assembled frame, chosen from the media type tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Jpeg,
    #[default]
    Opaque,
}

impl MediaKind {
    /// Unknown tags fall back to opaque binary.
    pub fn from_tag(tag: u32) -> Self {
        if tag == FOURCC_MJPG {
            Self::Jpeg
        } else {
            Self::Opaque
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Opaque => "bin",
        }
    }
}

/// Decoded chunk header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub clip_id: u32,
    pub frame_id: u32,
    /// Capture time on the device clock (informational).
    pub timestamp_ms: u32,
    /// 0-based index of this chunk within the frame.
    pub chunk_id: u16,
    /// Total number of chunks composing the frame (always >= 1).
    pub chunk_count: u16,
    /// Declared byte length of the reassembled frame.
    pub frame_size: u32,
    pub media_type_tag: u32,
    pub width: u16,
    pub height: u16,
}

impl ChunkHeader {
    /// Split a raw message into header and payload.
    ///
    /// Returns `None` for anything that is not a transport frame: messages
    /// shorter than the header, a wrong sentinel, or chunk indices outside
    /// `0..chunk_count`. Callers drop such messages without touching state.
    pub fn decode(message: &[u8]) -> Option<(ChunkHeader, &[u8])> {
        let header = message.get(..HEADER_LEN)?;
        if read_u32(header, 0)? != VID_MAGIC {
            return None;
        }

        let decoded = ChunkHeader {
            clip_id: read_u32(header, 4)?,
            frame_id: read_u32(header, 8)?,
            timestamp_ms: read_u32(header, 12)?,
            chunk_id: read_u16(header, 16)?,
            chunk_count: read_u16(header, 18)?,
            frame_size: read_u32(header, 20)?,
            media_type_tag: read_u32(header, 24)?,
            width: read_u16(header, 28)?,
            height: read_u16(header, 30)?,
        };
        if decoded.chunk_count == 0 || decoded.chunk_id >= decoded.chunk_count {
            return None;
        }

        let payload = message.get(HEADER_LEN..)?;
        Some((decoded, payload))
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&VID_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.clip_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.frame_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        out[16..18].copy_from_slice(&self.chunk_id.to_le_bytes());
        out[18..20].copy_from_slice(&self.chunk_count.to_le_bytes());
        out[20..24].copy_from_slice(&self.frame_size.to_le_bytes());
        out[24..28].copy_from_slice(&self.media_type_tag.to_le_bytes());
        out[28..30].copy_from_slice(&self.width.to_le_bytes());
        out[30..32].copy_from_slice(&self.height.to_le_bytes());
        out
    }

    pub fn media_kind(&self) -> MediaKind {
        MediaKind::from_tag(self.media_type_tag)
    }
}

/// Per-frame metadata the device stamps on every chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameMeta {
    pub clip_id: u32,
    pub frame_id: u32,
    pub timestamp_ms: u32,
    pub width: u16,
    pub height: u16,
}

/// Split one frame into transport messages, header included.
///
/// Mirrors the device packetizer: chunks of at most `CHUNK_MAX` bytes, all
/// sharing the same metadata and declared frame size.
pub fn packetize(meta: &FrameMeta, media_type_tag: u32, frame: &[u8]) -> Result<Vec<Vec<u8>>> {
    if frame.is_empty() {
        return Err(anyhow!("cannot packetize an empty frame"));
    }
    let frame_size = u32::try_from(frame.len())
        .map_err(|_| anyhow!("frame of {} bytes exceeds header range", frame.len()))?;
    let chunk_count = u16::try_from(frame.len().div_ceil(CHUNK_MAX))
        .map_err(|_| anyhow!("frame of {} bytes needs too many chunks", frame.len()))?;

    let mut messages = Vec::with_capacity(usize::from(chunk_count));
    for (chunk_id, chunk) in (0..chunk_count).zip(frame.chunks(CHUNK_MAX)) {
        let header = ChunkHeader {
            clip_id: meta.clip_id,
            frame_id: meta.frame_id,
            timestamp_ms: meta.timestamp_ms,
            chunk_id,
            chunk_count,
            frame_size,
            media_type_tag,
            width: meta.width,
            height: meta.height,
        };
        let mut message = Vec::with_capacity(HEADER_LEN + chunk.len());
        message.extend_from_slice(&header.encode());
        message.extend_from_slice(chunk);
        messages.push(message);
    }
    Ok(messages)
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u16(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_le_bytes(bytes.try_into().ok()?))
}
