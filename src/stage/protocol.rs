//! Wire format for the Marlin-flavoured controller dialect.
//!
//! Pure text in, text out: command framing, acknowledgement
//! classification and response parsing live here so the driver's state
//! machine stays free of string handling. The controller acknowledges
//! every command with an `ok` line and reports failures with an `error`
//! line; the two are distinguished by content, never by timing.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{BoardIdentity, Position, StageBounds};

pub const CMD_IDENTIFY: &str = "M115";
pub const CMD_ABSOLUTE_MODE: &str = "G90";
pub const CMD_RELATIVE_MODE: &str = "G91";
pub const CMD_HOME_Z: &str = "G28 Z";
pub const CMD_HOME_XY: &str = "G28 X Y";
pub const CMD_WAIT_IDLE: &str = "M400";
pub const CMD_POSITION: &str = "M114";
pub const CMD_BOUNDS: &str = "M211";
pub const CMD_RESET_LINE_NUMBERS: &str = "M110 N0";

/// Classification of one response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckLine {
    /// Command acknowledged; payload lines before it belong to the command.
    Ok,
    /// Controller-reported failure, message included.
    Error(String),
    /// `echo:busy` keep-alive during long operations; neither ack nor error.
    Busy,
    /// Anything else: response payload (position report, capability lines).
    Data,
}

/// Classify a response line by content.
pub fn classify(line: &str) -> AckLine {
    let trimmed = line.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower == "ok" || lower.starts_with("ok ") || lower.starts_with("ok\t") {
        AckLine::Ok
    } else if let Some(rest) = lower
        .strip_prefix("error:")
        .or_else(|| lower.strip_prefix("error "))
    {
        let msg = trimmed[trimmed.len() - rest.len()..].trim().to_string();
        AckLine::Error(msg)
    } else if lower.starts_with("echo:busy") || lower.starts_with("busy:") {
        AckLine::Busy
    } else {
        AckLine::Data
    }
}

/// Format a relative move. Only nonzero axes are emitted; the feed is
/// converted from the user-facing mm/s to the controller's mm/min.
pub fn format_move(dx: f64, dy: f64, dz: f64, feed_mm_s: f64) -> String {
    let mut parts = vec!["G1".to_string()];
    if dx != 0.0 {
        parts.push(format!("X{dx:.4}"));
    }
    if dy != 0.0 {
        parts.push(format!("Y{dy:.4}"));
    }
    if dz != 0.0 {
        parts.push(format!("Z{dz:.4}"));
    }
    parts.push(format!("F{:.2}", feed_mm_s * 60.0));
    parts.join(" ")
}

static IDENTITY_TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(FIRMWARE_NAME|MACHINE_NAME|MACHINE_UUID|UUID)\s*:\s*([^\s;]+)")
        .unwrap()
});

/// Parse an `M115` response into a board identity.
///
/// Returns `None` when no firmware-name token is present — the response
/// came from something that is not a compatible controller.
pub fn parse_identity(response: &str) -> Option<BoardIdentity> {
    let mut firmware = None;
    let mut name = None;
    let mut uuid = None;
    for caps in IDENTITY_TOKENS.captures_iter(response) {
        let value = caps[2].trim().to_string();
        match caps[1].to_ascii_uppercase().as_str() {
            "FIRMWARE_NAME" => firmware = Some(value),
            "MACHINE_NAME" => name = Some(value),
            // UUID and MACHINE_UUID both appear in the wild.
            _ => uuid = Some(value),
        }
    }
    firmware.map(|firmware_name| BoardIdentity {
        firmware_name,
        machine_name: name,
        machine_uuid: uuid,
    })
}

static AXIS_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([XYZ]):\s*([-+]?\d*\.?\d+)").unwrap());

/// Parse an `M114` position report.
///
/// Some firmware builds append stepper counts after a `Count` token
/// (casing varies); everything from there on is ignored.
pub fn parse_position(response: &str) -> Option<Position> {
    let head = match response.to_ascii_lowercase().find("count") {
        Some(idx) => &response[..idx],
        None => response,
    };
    let mut x = None;
    let mut y = None;
    let mut z = None;
    for caps in AXIS_VALUE.captures_iter(head) {
        let value: f64 = caps[2].parse().ok()?;
        match &caps[1] {
            "X" => x = Some(value),
            "Y" => y = Some(value),
            _ => z = Some(value),
        }
    }
    Some(Position::new(x?, y?, z?))
}

/// Parse an `M211` soft-endstop report (Min/Max lines with axis values).
pub fn parse_bounds(response: &str) -> StageBounds {
    let mut bounds = StageBounds::default();
    for line in response.lines() {
        let lower = line.trim().to_ascii_lowercase();
        let target = if lower.starts_with("min") {
            &mut bounds.min
        } else if lower.starts_with("max") {
            &mut bounds.max
        } else {
            continue;
        };
        for caps in AXIS_VALUE.captures_iter(line) {
            let value: Option<f64> = caps[2].parse().ok();
            match &caps[1] {
                "X" => target[0] = value,
                "Y" => target[1] = value,
                _ => target[2] = value,
            }
        }
    }
    bounds
}
