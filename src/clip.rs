//! Clip lifecycle.
//!
//! A clip moves `Open -> Closed -> Rendering -> Rendered`. `Rendering` is a
//! `Closed` clip whose render has been dispatched; a failed render drops it
//! back to `Closed`. Nothing leaves `Rendered`.
//!
//! Completion criteria, first match wins:
//! 1. expected frame count known: closed once that many distinct frames arrived
//! 2. end signal without a count: closed immediately
//! 3. no control plane at all: closed once no frame arrived for the idle
//!    threshold, checked on ticks only

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use crate::render::FailureAction;

/// Clip identity across both wire formats.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClipId {
    /// Binary transport: device-assigned clip number.
    Numeric(u32),
    /// Text transport: device serial plus clip timestamp, both sanitized.
    Named { serial: String, timestamp: String },
}

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(id) => write!(f, "clip{}", id),
            Self::Named { serial, timestamp } => write!(f, "{}/{}", serial, timestamp),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClipPhase {
    Open,
    Closed,
    Rendering,
    Rendered,
}

/// What caused a completion check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// A frame or control message arrived.
    Arrival,
    /// The periodic tick.
    Tick,
}

/// Per-clip bookkeeping.
#[derive(Clone, Debug)]
pub struct ClipState {
    expected_frame_count: Option<u32>,
    /// An explicit end-of-clip signal was seen.
    end_signalled: bool,
    frames: HashSet<u32>,
    last_frame_at: Option<Instant>,
    last_activity: Instant,
    phase: ClipPhase,
    render_attempts: u32,
    /// Failed render waits for new activity before it is dispatched again.
    parked: bool,
    retry_at: Option<Instant>,
}

impl ClipState {
    pub fn new(now: Instant) -> Self {
        Self {
            expected_frame_count: None,
            end_signalled: false,
            frames: HashSet::new(),
            last_frame_at: None,
            last_activity: now,
            phase: ClipPhase::Open,
            render_attempts: 0,
            parked: false,
            retry_at: None,
        }
    }

    fn rendered(now: Instant) -> Self {
        Self {
            phase: ClipPhase::Rendered,
            ..Self::new(now)
        }
    }

    pub fn phase(&self) -> ClipPhase {
        self.phase
    }

    pub fn expected_frame_count(&self) -> Option<u32> {
        self.expected_frame_count
    }

    pub fn end_signalled(&self) -> bool {
        self.end_signalled
    }

    /// Distinct frames successfully assembled and stored.
    pub fn received_frame_count(&self) -> u32 {
        u32::try_from(self.frames.len()).unwrap_or(u32::MAX)
    }

    pub fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at
    }

    pub fn render_attempts(&self) -> u32 {
        self.render_attempts
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
        self.parked = false;
    }

    pub fn set_expected(&mut self, expected: u32) {
        self.expected_frame_count = Some(expected);
    }

    pub fn record_frame(&mut self, frame_id: u32, now: Instant) {
        self.frames.insert(frame_id);
        self.last_frame_at = Some(now);
        self.touch(now);
    }

    pub fn apply_end(&mut self, expected: Option<u32>, now: Instant) {
        self.end_signalled = true;
        if let Some(expected) = expected {
            self.expected_frame_count = Some(expected);
        }
        self.touch(now);
    }

    /// Whether a completion criterion currently holds.
    pub fn completion_met(
        &self,
        trigger: Trigger,
        control_plane: bool,
        idle_threshold: Duration,
        now: Instant,
    ) -> bool {
        if let Some(expected) = self.expected_frame_count {
            return self.received_frame_count() >= expected;
        }
        if self.end_signalled {
            return true;
        }
        if control_plane || trigger != Trigger::Tick {
            return false;
        }
        match self.last_frame_at {
            Some(at) => now.saturating_duration_since(at) >= idle_threshold,
            None => false,
        }
    }

    /// Close the clip if a criterion holds. Returns true on the Open -> Closed edge.
    pub fn evaluate(
        &mut self,
        trigger: Trigger,
        control_plane: bool,
        idle_threshold: Duration,
        now: Instant,
    ) -> bool {
        if self.phase == ClipPhase::Open
            && self.completion_met(trigger, control_plane, idle_threshold, now)
        {
            self.phase = ClipPhase::Closed;
            return true;
        }
        false
    }

    pub fn ready_to_render(&self, now: Instant) -> bool {
        self.phase == ClipPhase::Closed
            && !self.parked
            && self.retry_at.map_or(true, |at| now >= at)
    }

    /// Closed -> Rendering. Returns the attempt number, or None when not ready.
    pub fn begin_render(&mut self, now: Instant) -> Option<u32> {
        if !self.ready_to_render(now) {
            return None;
        }
        self.phase = ClipPhase::Rendering;
        self.render_attempts += 1;
        self.retry_at = None;
        Some(self.render_attempts)
    }

    pub fn render_succeeded(&mut self) {
        self.phase = ClipPhase::Rendered;
        self.retry_at = None;
        self.parked = false;
    }

    pub fn render_failed(&mut self, action: FailureAction) {
        if self.phase != ClipPhase::Rendering {
            return;
        }
        self.phase = ClipPhase::Closed;
        match action {
            FailureAction::Park => self.parked = true,
            FailureAction::RetryAt(at) => self.retry_at = Some(at),
        }
    }

    /// A failed render is scheduled to run again.
    pub fn awaiting_retry(&self) -> bool {
        self.phase == ClipPhase::Closed && self.retry_at.is_some()
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// All clip states plus the ids that have ever been rendered.
#[derive(Debug, Default)]
pub struct ClipTable {
    clips: HashMap<ClipId, ClipState>,
    rendered: HashSet<ClipId>,
}

impl ClipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a clip, creating it on first reference.
    ///
    /// A clip that was rendered and later evicted comes back as `Rendered`.
    pub fn entry(&mut self, clip: &ClipId, now: Instant) -> &mut ClipState {
        let rendered = self.rendered.contains(clip);
        self.clips.entry(clip.clone()).or_insert_with(|| {
            if rendered {
                ClipState::rendered(now)
            } else {
                ClipState::new(now)
            }
        })
    }

    pub fn get(&self, clip: &ClipId) -> Option<&ClipState> {
        self.clips.get(clip)
    }

    pub fn get_mut(&mut self, clip: &ClipId) -> Option<&mut ClipState> {
        self.clips.get_mut(clip)
    }

    /// Replace a clip with a fresh `Open` state. Refused while rendering or once rendered.
    pub fn reset(&mut self, clip: &ClipId, now: Instant) -> bool {
        if self.rendered.contains(clip) {
            return false;
        }
        if let Some(state) = self.clips.get(clip) {
            if state.phase() == ClipPhase::Rendering {
                return false;
            }
        }
        self.clips.insert(clip.clone(), ClipState::new(now));
        true
    }

    pub fn is_rendered(&self, clip: &ClipId) -> bool {
        self.rendered.contains(clip)
    }

    pub fn mark_rendered(&mut self, clip: &ClipId) {
        if let Some(state) = self.clips.get_mut(clip) {
            state.render_succeeded();
        }
        self.rendered.insert(clip.clone());
    }

    pub fn ids(&self) -> Vec<ClipId> {
        self.clips.keys().cloned().collect()
    }

    /// Drop clips idle for longer than `keep`. In-flight renders and pending
    /// retries are kept.
    pub fn evict_idle(&mut self, now: Instant, keep: Duration) -> usize {
        let before = self.clips.len();
        self.clips.retain(|_, state| {
            state.phase() == ClipPhase::Rendering
                || state.awaiting_retry()
                || state.idle_for(now) <= keep
        });
        before - self.clips.len()
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }
}
