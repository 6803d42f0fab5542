//! Websocket-to-PTY proxy engine.
//!
//! A browser terminal connects over a websocket; the server starts a process
//! on a fresh pty and wires the two together:
//!
//! - [`pty_session`] owns the child process and its pty,
//! - [`forwarder`] streams pty output as UTF-8 text frames without ever
//!   splitting a character,
//! - [`dispatcher`] applies `resize`/`data` control messages to the pty,
//! - [`activity`] reports user activity to the workspace API at a bounded rate,
//! - [`server`] accepts connections and runs one session per client.

#![forbid(unsafe_code)]

pub mod activity;
pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod pty_session;
pub mod server;

pub use activity::{
    ActivityConfig, ActivityTracker, DisabledNotifier, FlushTask, HttpNotifier, Notifier,
};
pub use channel::{Frame, MessageSink, MessageSource, WsChannel};
pub use dispatcher::{ControlMessage, DispatchExit, DispatchStats, PtyControl, parse_control_message, run_dispatcher};
pub use error::{BridgeError, Result};
pub use forwarder::{ForwarderExit, PendingRunes, RuneSafeForwarder};
pub use pty_session::{PtySession, SessionConfig};
pub use server::{SecretLookup, ServerConfig, SessionSummary, run_server, serve};
