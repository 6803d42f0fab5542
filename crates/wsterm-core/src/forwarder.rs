//! Pty output → websocket text frames, never splitting a character.
//!
//! Terminal output arrives in arbitrary byte chunks, so a multi-byte UTF-8
//! sequence may straddle two reads. [`PendingRunes`] keeps the incomplete
//! tail (at most three bytes) and prepends it to the next chunk.
//!
//! # Failure Modes
//!
//! | Failure | Cause | Behavior |
//! |---------|-------|----------|
//! | Empty read | Child hung up | Loop ends with `PtyClosed` |
//! | Read error | Pty closed by teardown | Loop ends with `Pty` |
//! | Invalid UTF-8 | Non-text output | Valid prefix is sent, loop ends with `InvalidEncoding` |
//! | Send error | Websocket gone | Loop ends with `Transport` |
//! | Read never returns | A grandchild still holds the pty slave open | Loop blocks; the server stops waiting for it after a bounded join |

use std::io::{self, Read};

use tracing::{debug, warn};

use crate::channel::MessageSink;
use crate::error::{BridgeError, Result};

/// Pty read buffer size.
pub const READ_BUFFER_SIZE: usize = 8192;

/// Longest possible incomplete UTF-8 prefix.
pub const MAX_PENDING: usize = 3;

/// Bytes of a not-yet-complete character carried over to the next read.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PendingRunes {
    buf: [u8; MAX_PENDING],
    len: usize,
}

impl PendingRunes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Decode `chunk` behind the carried bytes and return every complete
    /// character. An incomplete trailing sequence is kept for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidEncoding`] if the combined bytes contain
    /// a sequence that can never become valid UTF-8. `offset` counts from the
    /// start of the carried bytes.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<String> {
        match self.decode_prefix(chunk) {
            (text, None) => Ok(text),
            (_, Some(error)) => Err(error),
        }
    }

    /// Like [`Self::decode`], but also hands back the text decoded before an
    /// invalid sequence, alongside the error.
    pub fn decode_prefix(&mut self, chunk: &[u8]) -> (String, Option<BridgeError>) {
        let mut combined = Vec::with_capacity(self.len + chunk.len());
        combined.extend_from_slice(self.as_bytes());
        combined.extend_from_slice(chunk);
        self.len = 0;

        let (valid_up_to, invalid) = match std::str::from_utf8(&combined) {
            Ok(_) => (combined.len(), None),
            Err(error) => {
                let valid_up_to = error.valid_up_to();
                let tail = &combined[valid_up_to..];
                if error.error_len().is_some() || tail.len() > MAX_PENDING {
                    (
                        valid_up_to,
                        Some(BridgeError::InvalidEncoding {
                            offset: valid_up_to,
                        }),
                    )
                } else {
                    self.buf[..tail.len()].copy_from_slice(tail);
                    self.len = tail.len();
                    (valid_up_to, None)
                }
            }
        };

        combined.truncate(valid_up_to);
        match String::from_utf8(combined) {
            Ok(text) => (text, invalid),
            Err(error) => (
                String::new(),
                Some(BridgeError::InvalidEncoding {
                    offset: error.utf8_error().valid_up_to(),
                }),
            ),
        }
    }
}

/// Why a forwarder stopped, plus what it moved before stopping.
#[derive(Debug)]
pub struct ForwarderExit {
    /// Raw bytes read from the pty.
    pub pty_out_bytes: u64,
    /// Text frames delivered to the sink.
    pub frames_sent: u64,
    /// The error that ended the loop. A forwarder has no clean exit.
    pub reason: BridgeError,
}

/// Copies pty output into text frames until something breaks.
///
/// There is no cancellation signal: closing the pty (or the sink) is the
/// only way to stop it. On exit the sink is closed so the other half of the
/// connection wakes up.
#[derive(Debug)]
pub struct RuneSafeForwarder<R, S> {
    reader: R,
    sink: S,
    pending: PendingRunes,
    pty_out_bytes: u64,
    frames_sent: u64,
}

impl<R: Read, S: MessageSink> RuneSafeForwarder<R, S> {
    pub fn new(reader: R, sink: S) -> Self {
        Self {
            reader,
            sink,
            pending: PendingRunes::new(),
            pty_out_bytes: 0,
            frames_sent: 0,
        }
    }

    /// Run until the first read, decode or send failure.
    pub fn run(mut self) -> ForwarderExit {
        let reason = match self.pump() {
            Ok(never) => match never {},
            Err(reason) => reason,
        };
        match &reason {
            BridgeError::PtyClosed | BridgeError::Pty(_) => debug!(%reason, "pty forwarder finished"),
            _ => warn!(%reason, "pty forwarder failed"),
        }
        self.sink.close();
        ForwarderExit {
            pty_out_bytes: self.pty_out_bytes,
            frames_sent: self.frames_sent,
            reason,
        }
    }

    fn pump(&mut self) -> Result<std::convert::Infallible> {
        let mut buf = vec![0_u8; READ_BUFFER_SIZE];
        loop {
            let n = match self.reader.read(&mut buf) {
                Ok(0) => return Err(BridgeError::PtyClosed),
                Ok(n) => n,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(BridgeError::Pty(error)),
            };
            self.pty_out_bytes = self
                .pty_out_bytes
                .saturating_add(u64::try_from(n).unwrap_or(u64::MAX));

            let (text, invalid) = self.pending.decode_prefix(&buf[..n]);
            if !text.is_empty() {
                self.sink.send_text(&text)?;
                self.frames_sent = self.frames_sent.saturating_add(1);
            }
            if let Some(error) = invalid {
                return Err(error);
            }
        }
    }
}
