//! Text-encoded frame messages.
//!
//! Some firmware builds publish one whole frame per message as JSON:
//!
//! ```json
//! {"serial": "cam-01", "timestamp": "20250101T120000", "index": 3, "outof": 40, "frame": "<base64>"}
//! ```
//!
//! There is no sub-frame chunking. `serial` + `timestamp` name the clip and
//! `outof` is the total frame count of the clip.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::Value;

use super::loose_u32;

const UNKNOWN: &str = "unknown";

#[derive(Debug, Deserialize)]
struct JsonFrameMessage {
    #[serde(default)]
    serial: Option<Value>,
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default)]
    index: Option<Value>,
    #[serde(default)]
    outof: Option<Value>,
    #[serde(default)]
    frame: Option<String>,
}

/// A decoded text-variant frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsonFrame {
    /// Sanitized device serial.
    pub serial: String,
    /// Sanitized clip timestamp.
    pub timestamp: String,
    pub index: u32,
    pub outof: u32,
    pub data: Vec<u8>,
}

/// Parse a JSON frame payload.
///
/// Rejects invalid JSON, missing or non-integer `index`/`outof`, a zero
/// `outof`, an empty `frame` and undecodable base64.
pub fn parse_json_frame(payload: &[u8]) -> Result<JsonFrame> {
    let message: JsonFrameMessage =
        serde_json::from_slice(payload).map_err(|e| anyhow!("parse error: {}", e))?;

    let index = message
        .index
        .as_ref()
        .and_then(loose_u32)
        .ok_or_else(|| anyhow!("missing or invalid index"))?;
    let outof = message
        .outof
        .as_ref()
        .and_then(loose_u32)
        .filter(|outof| *outof > 0)
        .ok_or_else(|| anyhow!("missing or invalid outof"))?;
    let encoded = message
        .frame
        .filter(|frame| !frame.is_empty())
        .ok_or_else(|| anyhow!("missing frame data"))?;
    let data = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| anyhow!("invalid base64 frame: {}", e))?;

    Ok(JsonFrame {
        serial: sanitize_name(&display_value(message.serial.as_ref())),
        timestamp: sanitize_name(&display_value(message.timestamp.as_ref())),
        index,
        outof,
        data,
    })
}

/// Make a device-supplied string safe to use as a path component.
///
/// Keeps ASCII alphanumerics, '_' and '-'; everything else becomes '_'.
pub fn sanitize_name(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => UNKNOWN.to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_message() {
        let payload = format!(
            r#"{{"serial":"cam 01","timestamp":"2025-01-01T12:00","index":2,"outof":"5","frame":"{}"}}"#,
            STANDARD.encode(b"\xff\xd8jpeg")
        );
        let frame = parse_json_frame(payload.as_bytes()).unwrap();
        assert_eq!(frame.serial, "cam_01");
        assert_eq!(frame.timestamp, "2025-01-01T12_00");
        assert_eq!(frame.index, 2);
        assert_eq!(frame.outof, 5);
        assert_eq!(frame.data, b"\xff\xd8jpeg");
    }

    #[test]
    fn missing_identity_defaults_to_unknown() {
        let payload = r#"{"index":0,"outof":1,"frame":"AA=="}"#;
        let frame = parse_json_frame(payload.as_bytes()).unwrap();
        assert_eq!(frame.serial, "unknown");
        assert_eq!(frame.timestamp, "unknown");
        assert_eq!(frame.data, vec![0u8]);
    }

    #[test]
    fn numeric_serial_is_stringified() {
        let payload = r#"{"serial":42,"timestamp":"t","index":0,"outof":1,"frame":"AA=="}"#;
        assert_eq!(parse_json_frame(payload.as_bytes()).unwrap().serial, "42");
    }

    #[test]
    fn missing_fields_rejected() {
        assert!(parse_json_frame(br#"{"outof":1,"frame":"AA=="}"#).is_err());
        assert!(parse_json_frame(br#"{"index":0,"frame":"AA=="}"#).is_err());
        assert!(parse_json_frame(br#"{"index":0,"outof":1}"#).is_err());
        assert!(parse_json_frame(br#"{"index":0,"outof":1,"frame":""}"#).is_err());
    }

    #[test]
    fn bad_base64_rejected() {
        let err = parse_json_frame(br#"{"index":0,"outof":1,"frame":"***"}"#).unwrap_err();
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn sanitize_keeps_safe_characters() {
        assert_eq!(sanitize_name("a-b_C9"), "a-b_C9");
        assert_eq!(sanitize_name("../etc"), "___etc");
    }
}
