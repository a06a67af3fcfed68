//! Clip Receiver
//!
//! Reassembles camera frames that a constrained device publishes over MQTT in
//! small chunks, decides when a clip is complete and hands complete clips to
//! an external encoder exactly once.
//!
//! # Architecture
//!
//! Data flows one way:
//!
//! 1. **Ingest**: a `FrameDecoder` turns each data-topic payload into a
//!    `FrameArrivalEvent` (binary chunk header or JSON frame message).
//! 2. **Assembly**: the `AssemblyTable` collects chunks per (clip, frame) and
//!    yields whole frames that match their declared size.
//! 3. **Lifecycle**: the `ClipTable` counts stored frames per clip and closes
//!    clips on an expected count, an end signal or inactivity.
//! 4. **Render**: closed clips become `RenderJob`s for a `ClipEncoder`.
//!
//! A periodic tick evicts stale frame buffers and idle clips, and re-checks
//! completion that depends on elapsed time.
//!
//! # Module Structure
//!
//! - `transport`: wire codecs and MQTT/TLS glue
//! - `ingest`: decoders producing `FrameArrivalEvent`
//! - `frame`: per-frame assembly buffers
//! - `clip`: clip lifecycle state machine
//! - `store`: frame persistence and output paths
//! - `render`: encoder trait, ffmpeg encoder, retry policy
//! - `engine`: the single owner of all mutable state
//! - `worker`: channel-driven loop around the engine
//! - `config`: file and environment configuration

pub mod clip;
pub mod config;
pub mod engine;
pub mod frame;
pub mod ingest;
pub mod render;
pub mod store;
pub mod transport;
pub mod worker;

pub use clip::{ClipId, ClipPhase, ClipState, ClipTable, Trigger};
pub use config::ReceiverConfig;
pub use engine::{Engine, EngineConfig, EngineStats};
pub use frame::{AssembledFrame, AssemblyTable, ChunkOutcome, FrameAssemblyBuffer, FrameKey};
pub use ingest::{
    BinaryChunkDecoder, ChunkPosition, FrameArrivalEvent, FrameDecoder, JsonFrameDecoder,
    WireFormat,
};
pub use render::{
    ClipEncoder, FailureAction, FfmpegEncoder, RenderJob, RenderOutcome, RenderPolicy,
};
pub use store::{FrameStore, FsFrameStore, InMemoryFrameStore};
pub use worker::{Topics, Worker, WorkerEvent};
