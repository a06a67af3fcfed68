//! Reassembly and clip-completion engine.
//!
//! The engine owns the in-flight frame table and the clip table and is the
//! only thing that mutates them. It never blocks and never runs an encoder:
//! every operation returns the render jobs that became due, and the caller
//! reports each job's result back through `on_render_finished`.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::clip::{ClipId, ClipPhase, ClipTable, Trigger};
use crate::frame::{AssembledFrame, AssemblyTable, ChunkOutcome, FrameKey};
use crate::ingest::FrameArrivalEvent;
use crate::render::{RenderJob, RenderOutcome, RenderPolicy};
use crate::store::FrameStore;
use crate::transport::ControlSignal;

pub const DEFAULT_FRAME_RATE: u32 = 30;
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(2);
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CLIP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub output_dir: PathBuf,
    pub frame_rate: u32,
    /// Quiet period after the last frame that closes a clip when no control
    /// plane is in use.
    pub idle_threshold: Duration,
    /// In-flight frame buffers idle longer than this are dropped.
    pub frame_timeout: Duration,
    /// Clip states idle longer than this are dropped.
    pub clip_timeout: Duration,
    /// Whether clips are bounded by start/end signals.
    pub control_plane: bool,
    /// Delete a clip's saved frames when it is started again.
    pub clean_on_start: bool,
    pub render_policy: RenderPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("out"),
            frame_rate: DEFAULT_FRAME_RATE,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            clip_timeout: DEFAULT_CLIP_TIMEOUT,
            control_plane: true,
            clean_on_start: false,
            render_policy: RenderPolicy::Terminal,
        }
    }
}

/// Running counters, logged at shutdown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub chunks_accepted: u64,
    pub chunks_rejected: u64,
    pub frames_assembled: u64,
    pub integrity_failures: u64,
    pub store_failures: u64,
    pub buffers_evicted: u64,
    pub clips_evicted: u64,
    pub renders_dispatched: u64,
    pub renders_succeeded: u64,
    pub renders_failed: u64,
}

pub struct Engine {
    config: EngineConfig,
    frames: AssemblyTable,
    clips: ClipTable,
    store: Box<dyn FrameStore>,
    stats: EngineStats,
}

impl Engine {
    pub fn new(config: EngineConfig, store: Box<dyn FrameStore>) -> Self {
        Self {
            config,
            frames: AssemblyTable::new(),
            clips: ClipTable::new(),
            store,
            stats: EngineStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Feed one decoded data-topic message.
    pub fn on_frame(&mut self, arrival: FrameArrivalEvent, now: Instant) -> Vec<RenderJob> {
        let clip = arrival.clip.clone();
        let frame_id = arrival.frame_id;
        let expected = arrival.expected_frames;

        let state = self.clips.entry(&clip, now);
        state.touch(now);
        if let Some(expected) = expected {
            state.set_expected(expected);
        }

        match self.frames.add_chunk(arrival, now) {
            ChunkOutcome::Pending { .. } => {
                self.stats.chunks_accepted += 1;
            }
            ChunkOutcome::Mismatched {
                expected_count,
                got_count,
            } => {
                self.stats.chunks_rejected += 1;
                log::warn!(
                    "Dropping chunk of {} frame {}: chunk_count {} conflicts with {}",
                    clip,
                    frame_id,
                    got_count,
                    expected_count
                );
            }
            ChunkOutcome::SizeMismatch {
                key,
                declared,
                actual,
            } => {
                self.stats.chunks_accepted += 1;
                self.stats.integrity_failures += 1;
                log::warn!(
                    "Discarding {} frame {}: assembled {} bytes, header declared {}",
                    key.clip,
                    key.frame_id,
                    actual,
                    declared
                );
            }
            ChunkOutcome::Complete(frame) => {
                self.stats.chunks_accepted += 1;
                self.store_frame(&frame, now);
            }
        }

        self.evaluate(&clip, Trigger::Arrival, now)
            .into_iter()
            .collect()
    }

    fn store_frame(&mut self, frame: &AssembledFrame, now: Instant) {
        match self.store.save(frame) {
            Ok(path) => {
                self.stats.frames_assembled += 1;
                log_saved_frame(&path, frame);
                if let Some(state) = self.clips.get_mut(&frame.key.clip) {
                    state.record_frame(frame.key.frame_id, now);
                }
            }
            Err(e) => {
                self.stats.store_failures += 1;
                log::warn!(
                    "Could not store {} frame {}: {:#}",
                    frame.key.clip,
                    frame.key.frame_id,
                    e
                );
            }
        }
    }

    /// Feed one control-topic signal.
    pub fn on_control(&mut self, signal: ControlSignal, now: Instant) -> Vec<RenderJob> {
        let clip = ClipId::Numeric(signal.clip_id());
        match signal {
            ControlSignal::Start { .. } => {
                self.start_clip(clip, now);
                Vec::new()
            }
            ControlSignal::End {
                expected_frames, ..
            } => {
                let state = self.clips.entry(&clip, now);
                state.apply_end(expected_frames, now);
                match expected_frames {
                    Some(frames) => log::info!(
                        "End of {} announced with {} frame(s), {} received",
                        clip,
                        frames,
                        state.received_frame_count()
                    ),
                    None => log::info!("End of {} announced", clip),
                }
                self.evaluate(&clip, Trigger::Arrival, now)
                    .into_iter()
                    .collect()
            }
        }
    }

    fn start_clip(&mut self, clip: ClipId, now: Instant) {
        let busy = self.clips.is_rendered(&clip)
            || self
                .clips
                .get(&clip)
                .is_some_and(|state| state.phase() == ClipPhase::Rendering);
        if busy {
            log::info!("Ignoring start of {}: already rendering or rendered", clip);
            return;
        }
        if self.config.clean_on_start {
            match self.store.purge_clip(&clip) {
                Ok(removed) => log::info!("Removed {} stale frame(s) of {}", removed, clip),
                Err(e) => log::warn!("Could not clean frames of {}: {:#}", clip, e),
            }
        }
        self.clips.reset(&clip, now);
        log::info!("Start of {}", clip);
    }

    /// Periodic sweep: evict stale buffers, re-check every clip, evict idle clips.
    pub fn tick(&mut self, now: Instant) -> Vec<RenderJob> {
        let stale = self.frames.evict_stale(now, self.config.frame_timeout);
        if stale > 0 {
            self.stats.buffers_evicted += stale as u64;
            log::debug!("Evicted {} stale frame buffer(s)", stale);
        }

        let mut jobs = Vec::new();
        for clip in self.clips.ids() {
            jobs.extend(self.evaluate(&clip, Trigger::Tick, now));
        }

        let idle = self.clips.evict_idle(now, self.config.clip_timeout);
        if idle > 0 {
            self.stats.clips_evicted += idle as u64;
            log::debug!("Evicted {} idle clip(s)", idle);
        }
        jobs
    }

    fn evaluate(&mut self, clip: &ClipId, trigger: Trigger, now: Instant) -> Option<RenderJob> {
        let state = self.clips.get_mut(clip)?;
        if state.evaluate(
            trigger,
            self.config.control_plane,
            self.config.idle_threshold,
            now,
        ) {
            log::info!(
                "{} complete with {} frame(s)",
                clip,
                state.received_frame_count()
            );
        }
        let attempt = state.begin_render(now)?;
        self.stats.renders_dispatched += 1;
        log::info!("Rendering {} (attempt {})", clip, attempt);
        Some(RenderJob {
            clip: clip.clone(),
            output_dir: self.config.output_dir.clone(),
            frame_rate: self.config.frame_rate,
            attempt,
        })
    }

    /// Record the result of a dispatched render.
    pub fn on_render_finished(&mut self, outcome: RenderOutcome, now: Instant) {
        match outcome.result {
            Ok(path) => {
                self.stats.renders_succeeded += 1;
                self.clips.mark_rendered(&outcome.clip);
                log::info!("Rendered {} to {}", outcome.clip, path.display());
            }
            Err(reason) => {
                self.stats.renders_failed += 1;
                log::error!(
                    "Render of {} failed (attempt {}): {}",
                    outcome.clip,
                    outcome.attempt,
                    reason
                );
                if let Some(state) = self.clips.get_mut(&outcome.clip) {
                    let action = self
                        .config
                        .render_policy
                        .after_failure(state.render_attempts(), now);
                    state.render_failed(action);
                }
            }
        }
    }

    pub fn clip_phase(&self, clip: &ClipId) -> Option<ClipPhase> {
        if self.clips.is_rendered(clip) {
            return Some(ClipPhase::Rendered);
        }
        self.clips.get(clip).map(|state| state.phase())
    }

    pub fn received_frames(&self, clip: &ClipId) -> Option<u32> {
        self.clips.get(clip).map(|state| state.received_frame_count())
    }

    pub fn is_tracked(&self, clip: &ClipId) -> bool {
        self.clips.get(clip).is_some()
    }

    pub fn has_buffer(&self, key: &FrameKey) -> bool {
        self.frames.contains(key)
    }

    pub fn in_flight_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn tracked_clips(&self) -> usize {
        self.clips.len()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }
}

fn log_saved_frame(path: &Path, frame: &AssembledFrame) {
    let digest = hex::encode(Sha256::digest(&frame.data));
    let avg = if frame.data.is_empty() {
        0.0
    } else {
        frame.data.iter().map(|b| u64::from(*b)).sum::<u64>() as f64 / frame.data.len() as f64
    };
    let ts = frame
        .info
        .timestamp_ms
        .map(|ms| format!("{}ms", ms))
        .unwrap_or_else(|| "-".to_string());
    log::info!(
        "Saved {} ({} bytes, sha256={}, avg={:.1}, {}x{}, ts={})",
        path.display(),
        frame.data.len(),
        digest,
        avg,
        frame.info.width,
        frame.info.height,
        ts
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::ChunkPosition;
    use crate::store::InMemoryFrameStore;
    use crate::transport::MediaKind;

    fn engine(control_plane: bool) -> (Engine, InMemoryFrameStore) {
        let store = InMemoryFrameStore::new("out");
        let config = EngineConfig {
            control_plane,
            ..EngineConfig::default()
        };
        (Engine::new(config, Box::new(store.clone())), store)
    }

    fn whole_frame(clip_id: u32, frame_id: u32, data: &[u8]) -> FrameArrivalEvent {
        FrameArrivalEvent {
            clip: ClipId::Numeric(clip_id),
            frame_id,
            chunk: Some(ChunkPosition::WHOLE),
            frame_size: Some(data.len() as u32),
            media: MediaKind::Jpeg,
            expected_frames: None,
            timestamp_ms: Some(frame_id * 33),
            width: 4,
            height: 4,
            payload: data.to_vec(),
        }
    }

    #[test]
    fn saves_completed_frame_and_counts_it() {
        let (mut engine, store) = engine(true);
        let now = Instant::now();
        let jobs = engine.on_frame(whole_frame(1, 0, b"jpeg"), now);

        assert!(jobs.is_empty());
        assert_eq!(engine.received_frames(&ClipId::Numeric(1)), Some(1));
        assert_eq!(
            store.get(Path::new("out/clip1_frame0.jpg")),
            Some(b"jpeg".to_vec())
        );
        assert_eq!(engine.stats().frames_assembled, 1);
    }

    #[test]
    fn store_failure_does_not_count_frame() {
        let (mut engine, store) = engine(true);
        store.set_failing(true);
        engine.on_frame(whole_frame(1, 0, b"jpeg"), Instant::now());

        assert_eq!(engine.received_frames(&ClipId::Numeric(1)), Some(0));
        assert_eq!(engine.stats().store_failures, 1);
    }

    #[test]
    fn end_without_count_dispatches_once() {
        let (mut engine, _) = engine(true);
        let now = Instant::now();
        engine.on_frame(whole_frame(2, 0, b"a"), now);

        let jobs = engine.on_control(
            ControlSignal::End {
                clip_id: 2,
                expected_frames: None,
            },
            now,
        );
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt, 1);
        assert_eq!(jobs[0].frame_rate, DEFAULT_FRAME_RATE);
        assert!(engine.tick(now).is_empty());
        assert_eq!(engine.clip_phase(&ClipId::Numeric(2)), Some(ClipPhase::Rendering));
    }

    #[test]
    fn start_is_ignored_for_rendered_clip() {
        let (mut engine, _) = engine(true);
        let now = Instant::now();
        let clip = ClipId::Numeric(3);
        engine.on_frame(whole_frame(3, 0, b"a"), now);
        let jobs = engine.on_control(
            ControlSignal::End {
                clip_id: 3,
                expected_frames: Some(1),
            },
            now,
        );
        engine.on_render_finished(
            RenderOutcome {
                clip: clip.clone(),
                attempt: jobs[0].attempt,
                result: Ok(PathBuf::from("out/clip3.mp4")),
            },
            now,
        );

        engine.on_control(ControlSignal::Start { clip_id: 3 }, now);
        assert_eq!(engine.clip_phase(&clip), Some(ClipPhase::Rendered));
    }

    #[test]
    fn clean_start_purges_and_resets() {
        let store = InMemoryFrameStore::new("out");
        let config = EngineConfig {
            clean_on_start: true,
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(config, Box::new(store.clone()));
        let now = Instant::now();
        engine.on_frame(whole_frame(4, 0, b"a"), now);
        engine.on_frame(whole_frame(4, 1, b"b"), now);
        assert_eq!(store.len(), 2);

        engine.on_control(ControlSignal::Start { clip_id: 4 }, now);
        assert!(store.is_empty());
        assert_eq!(engine.received_frames(&ClipId::Numeric(4)), Some(0));
        assert_eq!(engine.clip_phase(&ClipId::Numeric(4)), Some(ClipPhase::Open));
    }

    #[test]
    fn json_expected_count_closes_clip() {
        let (mut engine, store) = engine(false);
        let now = Instant::now();
        let clip = ClipId::Named {
            serial: "cam".to_string(),
            timestamp: "t1".to_string(),
        };
        let arrival = |index: u32| FrameArrivalEvent {
            clip: clip.clone(),
            frame_id: index,
            chunk: None,
            frame_size: None,
            media: MediaKind::Jpeg,
            expected_frames: Some(2),
            timestamp_ms: None,
            width: 0,
            height: 0,
            payload: vec![index as u8],
        };

        assert!(engine.on_frame(arrival(0), now).is_empty());
        let jobs = engine.on_frame(arrival(1), now);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].clip, clip);
        assert!(store
            .paths()
            .contains(&PathBuf::from("out/cam/t1/frame000001.jpg")));
    }
}
