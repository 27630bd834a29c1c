//! Line codec for the wearable's Base64-wrapped ASCII protocol.
//!
//! Outbound commands are single characters with a trailing newline. Inbound
//! lines are either free-text status messages or a bracketed 4-element
//! minute array. The firmware's encoding mangles accented characters, so
//! status matching is deliberately fuzzy.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;

/// Single-character commands accepted by the wearable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `C`: begin the two-step blink calibration.
    Calibrate,
    /// `P`: record the 30-second baseline.
    Baseline,
    /// `S`: start the per-minute classification run.
    Start,
    /// `X`: abort whatever the device is doing.
    Abort,
}

impl Command {
    pub fn byte(self) -> u8 {
        match self {
            Command::Calibrate => b'C',
            Command::Baseline => b'P',
            Command::Start => b'S',
            Command::Abort => b'X',
        }
    }
}

/// Base64-wraps a command plus the newline terminator the firmware expects.
pub fn encode_command(command: Command) -> Vec<u8> {
    BASE64.encode([command.byte(), b'\n']).into_bytes()
}

/// Unwraps a notify payload into a trimmed text line. Returns `None` for
/// payloads that are not valid Base64 or decode to nothing but whitespace.
pub fn decode_line(payload: &[u8]) -> Option<String> {
    let decoded = BASE64.decode(payload).ok()?;
    let line = String::from_utf8_lossy(&decoded).trim().to_string();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlinkFlag {
    #[serde(rename = "S-")]
    Sleepy,
    #[serde(rename = "NS-")]
    NotSleepy,
}

/// One classified minute: `["M<n>", normal, slow, "S-"|"NS-"]` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinuteSample {
    pub minute: u32,
    pub normal_blinks: u32,
    pub slow_blinks: u32,
    pub flag: BlinkFlag,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    CalibrationFailed,
    CalibrationSucceeded,
    Minute(MinuteSample),
    /// Unrecognized or malformed; dropped without escalation.
    Ignored,
}

/// Tolerant classifier for inbound lines. The failure/success word stems
/// survive the firmware's corruption of accented characters, which is why
/// full-phrase matching is not used.
pub fn parse_line(line: &str) -> InboundLine {
    if line.starts_with('[') {
        return match parse_minute_array(line) {
            Some(sample) => InboundLine::Minute(sample),
            None => InboundLine::Ignored,
        };
    }

    let lower = line.to_lowercase();
    if (lower.contains("mal") && lower.contains("efetuada"))
        || (lower.contains("tente") && lower.contains("novamente"))
    {
        return InboundLine::CalibrationFailed;
    }
    if lower.contains("conclu") || lower.contains("sucesso") {
        return InboundLine::CalibrationSucceeded;
    }
    InboundLine::Ignored
}

fn parse_minute_array(line: &str) -> Option<MinuteSample> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let items = value.as_array()?;
    if items.len() != 4 {
        return None;
    }

    let minute = items[0].as_str()?.strip_prefix('M')?.parse().ok()?;
    let normal_blinks = u32::try_from(items[1].as_u64()?).ok()?;
    let slow_blinks = u32::try_from(items[2].as_u64()?).ok()?;
    let flag = match items[3].as_str()? {
        "S-" => BlinkFlag::Sleepy,
        "NS-" => BlinkFlag::NotSleepy,
        _ => return None,
    };

    Some(MinuteSample {
        minute,
        normal_blinks,
        slow_blinks,
        flag,
    })
}
