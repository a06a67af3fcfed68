//! Wire formats and broker plumbing.
//!
//! - `header`: binary chunk header codec for the video data topic
//! - `control`: start/end clip signals on the control topic
//! - `json_frame`: one-frame-per-message text variant
//! - `tls`/`mqtt`: broker endpoint parsing, TLS transport and the publish pump

pub mod control;
pub mod header;
pub mod json_frame;
pub mod mqtt;
mod tls;

use serde_json::Value;

pub use control::{parse_control, ControlSignal};
pub use header::{
    fourcc, packetize, ChunkHeader, FrameMeta, MediaKind, CHUNK_MAX, FOURCC_MJPG, HEADER_LEN,
    VID_MAGIC,
};
pub use json_frame::{parse_json_frame, sanitize_name, JsonFrame};
pub use mqtt::{MqttSession, MqttSettings};
pub use tls::{parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, TlsMaterials};

/// Read an unsigned integer that devices may send as a number or a numeric string.
pub(crate) fn loose_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
