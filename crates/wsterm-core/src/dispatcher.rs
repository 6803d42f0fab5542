//! Inbound websocket frames → pty operations.
//!
//! Wire format (text frames only):
//!
//! ```text
//! { "type": "resize", "data": [cols, rows] }
//! { "type": "data",   "data": "<raw text for the pty>" }
//! ```
//!
//! Binary frames and malformed messages are logged and skipped. An unknown
//! `type` or frame kind ends the connection.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::activity::ActivityTracker;
use crate::channel::{Frame, MessageSource};
use crate::error::{BridgeError, Result};
use crate::pty_session::PtySession;

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
    Data(String),
    /// Any `type` the protocol does not define.
    Unknown(String),
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Decode one text frame.
///
/// # Errors
///
/// Returns [`BridgeError::Decode`] for malformed JSON or a payload that does
/// not match its `type`. An unknown `type` is not an error here; it decodes
/// to [`ControlMessage::Unknown`].
pub fn parse_control_message(text: &str) -> Result<ControlMessage> {
    let envelope: Envelope = serde_json::from_str(text).map_err(BridgeError::decode)?;
    match envelope.kind.as_str() {
        "resize" => {
            let (cols, rows): (f64, f64) = serde_json::from_value(envelope.data)
                .map_err(|error| BridgeError::decode(format!("invalid resize message: {error}")))?;
            Ok(ControlMessage::Resize {
                cols: clamp_dimension(cols),
                rows: clamp_dimension(rows),
            })
        }
        "data" => {
            let data: String = serde_json::from_value(envelope.data)
                .map_err(|error| BridgeError::decode(format!("invalid data message: {error}")))?;
            Ok(ControlMessage::Data(data))
        }
        _ => Ok(ControlMessage::Unknown(envelope.kind)),
    }
}

/// Truncate toward zero and saturate into `u16`; NaN becomes 0.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_dimension(value: f64) -> u16 {
    value as u16
}

/// What the dispatcher needs from a pty.
pub trait PtyControl {
    /// Apply a window size. Never fails the session.
    fn resize(&mut self, rows: u16, cols: u16);

    /// # Errors
    ///
    /// Any error ends the dispatcher.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
}

impl PtyControl for PtySession {
    fn resize(&mut self, rows: u16, cols: u16) {
        PtySession::resize(self, rows, cols);
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        PtySession::write(self, bytes)
    }
}

/// Counters collected by one dispatcher run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub frames: u64,
    pub resize_events: u64,
    pub pty_in_bytes: u64,
    pub decode_errors: u64,
    pub ignored_binary: u64,
}

/// How a dispatcher run ended.
#[derive(Debug)]
pub struct DispatchExit {
    pub stats: DispatchStats,
    /// `Ok` when the peer closed cleanly, otherwise the error that ended the loop.
    pub outcome: Result<()>,
}

/// Read frames until the peer closes, the transport or pty fails, or the
/// peer violates the protocol.
pub fn run_dispatcher<S, P>(source: &mut S, pty: &mut P, activity: &ActivityTracker) -> DispatchExit
where
    S: MessageSource + ?Sized,
    P: PtyControl + ?Sized,
{
    let mut stats = DispatchStats::default();
    let outcome = dispatch_frames(source, pty, activity, &mut stats);
    DispatchExit { stats, outcome }
}

fn dispatch_frames<S, P>(
    source: &mut S,
    pty: &mut P,
    activity: &ActivityTracker,
    stats: &mut DispatchStats,
) -> Result<()>
where
    S: MessageSource + ?Sized,
    P: PtyControl + ?Sized,
{
    loop {
        let frame = source.recv()?;
        stats.frames = stats.frames.saturating_add(1);
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(payload) => {
                debug!(bytes = payload.len(), "ignoring binary message");
                stats.ignored_binary = stats.ignored_binary.saturating_add(1);
                continue;
            }
            Frame::Closed => return Ok(()),
            Frame::Other => {
                warn!("invalid websocket frame kind");
                return Err(BridgeError::ProtocolViolation(
                    "unsupported frame kind".to_string(),
                ));
            }
        };

        match parse_control_message(&text) {
            Ok(ControlMessage::Resize { cols, rows }) => {
                pty.resize(rows, cols);
                stats.resize_events = stats.resize_events.saturating_add(1);
            }
            Ok(ControlMessage::Data(data)) => {
                activity.notify_activity();
                pty.write(data.as_bytes())?;
                stats.pty_in_bytes = stats
                    .pty_in_bytes
                    .saturating_add(u64::try_from(data.len()).unwrap_or(u64::MAX));
            }
            Ok(ControlMessage::Unknown(kind)) => {
                warn!(kind = %kind, "invalid message type");
                return Err(BridgeError::ProtocolViolation(format!(
                    "unknown message type {kind:?}"
                )));
            }
            Err(error) => {
                warn!(%error, "invalid message");
                stats.decode_errors = stats.decode_errors.saturating_add(1);
            }
        }
    }
}
