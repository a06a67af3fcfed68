//! Control-plane message parsing.
//!
//! The device announces clip boundaries on a separate topic:
//! `{"event": "start"|"end", "clip_id": 12, "frames": 40}`.
//! `frames` is optional and only meaningful on `end`.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use serde_json::Value;

use super::loose_u32;

#[derive(Debug, Deserialize)]
struct ControlMessage {
    event: Option<String>,
    clip_id: Option<Value>,
    frames: Option<Value>,
}

/// A decoded control-plane signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlSignal {
    Start {
        clip_id: u32,
    },
    End {
        clip_id: u32,
        /// Total frames the device produced for the clip, when it said so.
        expected_frames: Option<u32>,
    },
}

impl ControlSignal {
    pub fn clip_id(&self) -> u32 {
        match self {
            Self::Start { clip_id } | Self::End { clip_id, .. } => *clip_id,
        }
    }
}

/// Parse a control payload.
///
/// Returns an error for invalid JSON, unknown events or a missing clip id.
/// An unparsable or zero `frames` value is treated as absent.
pub fn parse_control(payload: &[u8]) -> Result<ControlSignal> {
    let message: ControlMessage =
        serde_json::from_slice(payload).map_err(|e| anyhow!("parse error: {}", e))?;

    let clip_id = message
        .clip_id
        .as_ref()
        .and_then(loose_u32)
        .ok_or_else(|| anyhow!("missing or invalid clip_id"))?;

    match message.event.as_deref() {
        Some("start") => Ok(ControlSignal::Start { clip_id }),
        Some("end") => {
            let expected_frames = message
                .frames
                .as_ref()
                .and_then(loose_u32)
                .filter(|frames| *frames > 0);
            Ok(ControlSignal::End {
                clip_id,
                expected_frames,
            })
        }
        Some(other) => Err(anyhow!("unknown control event '{}'", other)),
        None => Err(anyhow!("missing control event")),
    }
}
