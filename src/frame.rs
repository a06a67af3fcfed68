//! Frame assembly.
//!
//! - `FrameAssemblyBuffer`: chunks of one (clip, frame) pair in flight.
//! - `AssemblyTable`: every in-flight buffer, keyed by `FrameKey`.
//!
//! Buffers are keyed independently, so chunks of different frames and clips
//! may interleave in any order. A buffer leaves the table either when its
//! frame completes or when the evictor finds it stale.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::clip::ClipId;
use crate::ingest::FrameArrivalEvent;
use crate::transport::MediaKind;

/// Identity of a frame in flight.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub clip: ClipId,
    pub frame_id: u32,
}

/// Metadata carried alongside a frame, used for naming and logging.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub media: MediaKind,
    pub timestamp_ms: Option<u32>,
    pub width: u16,
    pub height: u16,
}

/// Chunks received so far for one frame.
#[derive(Debug)]
pub struct FrameAssemblyBuffer {
    chunk_count: u16,
    frame_size: Option<u32>,
    info: FrameInfo,
    /// Ordered by chunk id so assembly is a straight concatenation.
    chunks: BTreeMap<u16, Vec<u8>>,
    last_activity: Instant,
}

impl FrameAssemblyBuffer {
    pub fn new(chunk_count: u16, frame_size: Option<u32>, info: FrameInfo, now: Instant) -> Self {
        Self {
            chunk_count,
            frame_size,
            info,
            chunks: BTreeMap::new(),
            last_activity: now,
        }
    }

    /// Store a chunk. A repeated chunk id overwrites the earlier payload.
    pub fn add_chunk(&mut self, chunk_id: u16, payload: Vec<u8>, now: Instant) {
        self.chunks.insert(chunk_id, payload);
        self.last_activity = now;
    }

    pub fn chunk_count(&self) -> u16 {
        self.chunk_count
    }

    pub fn received_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.len() == usize::from(self.chunk_count)
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Concatenate payloads in ascending chunk order. None while incomplete.
    pub fn assemble(self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let total = self.chunks.values().map(Vec::len).sum();
        let mut frame = Vec::with_capacity(total);
        for chunk in self.chunks.into_values() {
            frame.extend_from_slice(&chunk);
        }
        Some(frame)
    }
}

/// A reassembled frame that passed the integrity check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledFrame {
    pub key: FrameKey,
    pub info: FrameInfo,
    pub data: Vec<u8>,
}

/// Result of feeding one chunk into the table.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored; the frame still misses chunks.
    Pending { received: usize, expected: u16 },
    /// The chunk disagrees with the buffer it belongs to and was dropped.
    Mismatched { expected_count: u16, got_count: u16 },
    /// Complete and matching its declared size.
    Complete(AssembledFrame),
    /// Complete but the length differs from the declared frame size.
    SizeMismatch {
        key: FrameKey,
        declared: u32,
        actual: usize,
    },
}

/// All frames currently in flight.
#[derive(Debug, Default)]
pub struct AssemblyTable {
    buffers: HashMap<FrameKey, FrameAssemblyBuffer>,
}

impl AssemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one arrival. A completed frame leaves the table whether or not it
    /// passes the size check.
    pub fn add_chunk(&mut self, arrival: FrameArrivalEvent, now: Instant) -> ChunkOutcome {
        let position = arrival.position();
        let key = FrameKey {
            clip: arrival.clip,
            frame_id: arrival.frame_id,
        };
        let info = FrameInfo {
            media: arrival.media,
            timestamp_ms: arrival.timestamp_ms,
            width: arrival.width,
            height: arrival.height,
        };
        let frame_size = arrival.frame_size;

        let buffer = self.buffers.entry(key.clone()).or_insert_with(|| {
            FrameAssemblyBuffer::new(position.chunk_count, frame_size, info, now)
        });
        if buffer.chunk_count() != position.chunk_count {
            return ChunkOutcome::Mismatched {
                expected_count: buffer.chunk_count(),
                got_count: position.chunk_count,
            };
        }
        buffer.add_chunk(position.chunk_id, arrival.payload, now);
        if !buffer.is_complete() {
            return ChunkOutcome::Pending {
                received: buffer.received_chunks(),
                expected: buffer.chunk_count(),
            };
        }

        let Some(buffer) = self.buffers.remove(&key) else {
            return ChunkOutcome::Pending {
                received: 0,
                expected: position.chunk_count,
            };
        };
        let declared = buffer.frame_size;
        let info = buffer.info;
        let Some(data) = buffer.assemble() else {
            return ChunkOutcome::Pending {
                received: 0,
                expected: position.chunk_count,
            };
        };

        match declared {
            Some(declared) if usize::try_from(declared).ok() != Some(data.len()) => {
                ChunkOutcome::SizeMismatch {
                    key,
                    declared,
                    actual: data.len(),
                }
            }
            _ => ChunkOutcome::Complete(AssembledFrame { key, info, data }),
        }
    }

    /// Drop buffers idle for longer than `timeout`. Returns how many were dropped.
    pub fn evict_stale(&mut self, now: Instant, timeout: Duration) -> usize {
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buffer| now.saturating_duration_since(buffer.last_activity()) <= timeout);
        before - self.buffers.len()
    }

    pub fn get(&self, key: &FrameKey) -> Option<&FrameAssemblyBuffer> {
        self.buffers.get(key)
    }

    pub fn contains(&self, key: &FrameKey) -> bool {
        self.buffers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ChunkPosition;

    fn chunk(
        frame_id: u32,
        chunk_id: u16,
        chunk_count: u16,
        size: u32,
        data: &[u8],
    ) -> FrameArrivalEvent {
        FrameArrivalEvent {
            clip: ClipId::Numeric(1),
            frame_id,
            chunk: Some(ChunkPosition {
                chunk_id,
                chunk_count,
            }),
            frame_size: Some(size),
            media: MediaKind::Jpeg,
            expected_frames: None,
            timestamp_ms: Some(0),
            width: 8,
            height: 8,
            payload: data.to_vec(),
        }
    }

    fn key(frame_id: u32) -> FrameKey {
        FrameKey {
            clip: ClipId::Numeric(1),
            frame_id,
        }
    }

    #[test]
    fn out_of_order_chunks_assemble_ascending() {
        let now = Instant::now();
        let mut table = AssemblyTable::new();
        let parts: [&[u8]; 3] = [b"aa", b"bbb", b"c"];

        for id in [2u16, 0, 1] {
            let outcome = table.add_chunk(chunk(0, id, 3, 6, parts[usize::from(id)]), now);
            if id != 1 {
                assert!(matches!(outcome, ChunkOutcome::Pending { .. }));
            } else {
                match outcome {
                    ChunkOutcome::Complete(frame) => assert_eq!(frame.data, b"aabbbc"),
                    other => panic!("unexpected outcome {:?}", other),
                }
            }
        }
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_chunk_overwrites() {
        let now = Instant::now();
        let mut table = AssemblyTable::new();
        table.add_chunk(chunk(0, 0, 2, 4, b"xx"), now);
        table.add_chunk(chunk(0, 0, 2, 4, b"ab"), now);
        match table.add_chunk(chunk(0, 1, 2, 4, b"cd"), now) {
            ChunkOutcome::Complete(frame) => assert_eq!(frame.data, b"abcd"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn duplicate_does_not_complete_frame() {
        let now = Instant::now();
        let mut table = AssemblyTable::new();
        for id in 0..4u16 {
            table.add_chunk(chunk(0, id, 5, 5, b"x"), now);
        }
        let outcome = table.add_chunk(chunk(0, 3, 5, 5, b"y"), now);
        assert_eq!(
            outcome,
            ChunkOutcome::Pending {
                received: 4,
                expected: 5
            }
        );
        assert!(!table.get(&key(0)).unwrap().is_complete());
    }

    #[test]
    fn size_mismatch_is_reported_and_buffer_removed() {
        let now = Instant::now();
        let mut table = AssemblyTable::new();
        let outcome = table.add_chunk(chunk(4, 0, 1, 10, b"short"), now);
        assert_eq!(
            outcome,
            ChunkOutcome::SizeMismatch {
                key: key(4),
                declared: 10,
                actual: 5
            }
        );
        assert!(!table.contains(&key(4)));
    }

    #[test]
    fn conflicting_chunk_count_is_dropped() {
        let now = Instant::now();
        let mut table = AssemblyTable::new();
        table.add_chunk(chunk(0, 0, 3, 3, b"a"), now);
        let outcome = table.add_chunk(chunk(0, 1, 2, 3, b"b"), now);
        assert_eq!(
            outcome,
            ChunkOutcome::Mismatched {
                expected_count: 3,
                got_count: 2
            }
        );
        assert_eq!(table.get(&key(0)).unwrap().received_chunks(), 1);
    }

    #[test]
    fn stale_buffers_are_evicted() {
        let t0 = Instant::now();
        let timeout = Duration::from_secs(10);
        let mut table = AssemblyTable::new();
        table.add_chunk(chunk(0, 0, 2, 2, b"a"), t0);
        table.add_chunk(chunk(1, 0, 2, 2, b"a"), t0 + Duration::from_secs(5));

        assert_eq!(table.evict_stale(t0 + timeout, timeout), 0);
        assert_eq!(table.evict_stale(t0 + Duration::from_secs(11), timeout), 1);
        assert!(!table.contains(&key(0)));
        assert!(table.contains(&key(1)));
    }

    #[test]
    fn assemble_incomplete_buffer_is_none() {
        let mut buffer = FrameAssemblyBuffer::new(2, None, FrameInfo::default(), Instant::now());
        buffer.add_chunk(0, b"a".to_vec(), Instant::now());
        assert!(buffer.assemble().is_none());
    }
}
