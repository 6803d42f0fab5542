//! Pseudo-terminal session lifecycle.
//!
//! A [`PtySession`] owns one child process attached to a freshly allocated
//! pty. The read side is handed off once via [`PtySession::take_reader`] so
//! output can be drained on another thread while this handle keeps serving
//! writes and resizes.
//!
//! # Invariants
//!
//! 1. **Single ownership**: each session owns exactly one child process and is
//!    owned by exactly one connection.
//! 2. **Single teardown**: [`PtySession::stop`] consumes the session, so it
//!    runs at most once. `Drop` only kills the child if `stop` never ran.
//! 3. **Resize never fails the session**: resize errors are logged and
//!    swallowed.

use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;

use portable_pty::{Child, CommandBuilder, ExitStatus, MasterPty, PtySize};
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

pub const DEFAULT_TERM: &str = "xterm";
pub const DEFAULT_ROWS: u16 = 60;
pub const DEFAULT_COLS: u16 = 200;
pub const DEFAULT_COMMAND: &str = "/bin/bash";

/// How to launch the process behind a terminal session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Executable to spawn in the pty.
    pub command: String,
    /// Command arguments.
    pub args: Vec<String>,
    /// Base environment of the child. `TERM` is always overridden.
    pub env: Vec<(String, String)>,
    /// Working directory; `None` lets the pty layer pick one.
    pub cwd: Option<PathBuf>,
    /// TERM value exported to the child process.
    pub term: String,
    /// Initial pty rows.
    pub rows: u16,
    /// Initial pty columns.
    pub cols: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            term: DEFAULT_TERM.to_string(),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Append every variable of the calling process to the base environment.
    #[must_use]
    pub fn inherit_env(mut self) -> Self {
        self.env.extend(std::env::vars());
        self
    }

    #[must_use]
    pub fn cwd(mut self, path: impl Into<PathBuf>) -> Self {
        self.cwd = Some(path.into());
        self
    }

    #[must_use]
    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    fn command_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.command);
        cmd.args(&self.args);
        cmd.env_clear();
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", &self.term);
        if let Some(cwd) = &self.cwd {
            cmd.cwd(cwd);
        }
        cmd
    }
}

/// One child process plus the master side of its pty.
pub struct PtySession {
    child: Box<dyn Child + Send + Sync>,
    master: Option<Box<dyn MasterPty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    reader: Option<Box<dyn Read + Send>>,
    rows: u16,
    cols: u16,
    stopped: bool,
}

impl fmt::Debug for PtySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtySession")
            .field("pid", &self.child.process_id())
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("reader_taken", &self.reader.is_none())
            .finish_non_exhaustive()
    }
}

impl PtySession {
    /// Allocate a pty and start `config.command` on its slave side.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Spawn`] if the pty cannot be allocated or the
    /// process cannot be started.
    pub fn start(config: &SessionConfig) -> Result<Self> {
        let pty_system = portable_pty::native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(BridgeError::spawn)?;

        let child = pair
            .slave
            .spawn_command(config.command_builder())
            .map_err(BridgeError::spawn)?;
        // The slave end must not stay open here, or reads never see the child hang up.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(BridgeError::spawn)?;
        let writer = pair.master.take_writer().map_err(BridgeError::spawn)?;

        debug!(
            command = %config.command,
            pid = ?child.process_id(),
            rows = config.rows,
            cols = config.cols,
            "pty session started"
        );

        Ok(Self {
            child,
            master: Some(pair.master),
            writer: Some(writer),
            reader: Some(reader),
            rows: config.rows,
            cols: config.cols,
            stopped: false,
        })
    }

    /// Hand out the read side of the pty. Only the first call succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::PtyClosed`] if the reader was already taken.
    pub fn take_reader(&mut self) -> Result<Box<dyn Read + Send>> {
        self.reader.take().ok_or(BridgeError::PtyClosed)
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    /// Last window size applied successfully, as `(rows, cols)`.
    #[must_use]
    pub fn size(&self) -> (u16, u16) {
        (self.rows, self.cols)
    }

    /// Window size as reported by the pty itself, as `(rows, cols)`.
    #[must_use]
    pub fn pty_size(&self) -> Option<(u16, u16)> {
        let size = self.master.as_ref()?.get_size().ok()?;
        Some((size.rows, size.cols))
    }

    /// Apply a new window size; the child receives SIGWINCH.
    pub fn resize(&mut self, rows: u16, cols: u16) {
        let Some(master) = self.master.as_ref() else {
            return;
        };
        let result = master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        });
        match result {
            Ok(()) => {
                self.rows = rows;
                self.cols = cols;
                debug!(rows, cols, "pty resized");
            }
            Err(error) => warn!(rows, cols, %error, "failed to resize pty"),
        }
    }

    /// Write raw bytes to the pty input.
    ///
    /// # Errors
    ///
    /// A failed write means the session is broken; callers stop streaming.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(BridgeError::PtyClosed)?;
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Close the pty and reap the child.
    ///
    /// Dropping the master alone does not hang up the child while a cloned
    /// reader is still alive on another thread, so the child is also killed.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the child fails.
    pub fn stop(mut self) -> Result<ExitStatus> {
        self.stopped = true;
        drop(self.writer.take());
        drop(self.master.take());
        drop(self.reader.take());
        // Fails when the child already exited, which is fine.
        let _ = self.child.kill();
        let status = self.child.wait()?;
        debug!(
            exit_code = status.exit_code(),
            signal = ?status.signal(),
            "pty session stopped"
        );
        Ok(status)
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.command, "/bin/bash");
        assert!(config.args.is_empty());
        assert!(config.env.is_empty());
        assert!(config.cwd.is_none());
        assert_eq!(config.term, "xterm");
        assert_eq!(config.rows, 60);
        assert_eq!(config.cols, 200);
    }

    #[test]
    fn session_config_builder_chain() {
        let config = SessionConfig::with_command("/bin/sh")
            .arg("-c")
            .arg("true")
            .env("FOO", "bar")
            .cwd("/tmp")
            .size(24, 80);
        assert_eq!(config.command, "/bin/sh");
        assert_eq!(config.args, vec!["-c", "true"]);
        assert_eq!(config.env, vec![("FOO".to_string(), "bar".to_string())]);
        assert_eq!(config.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!((config.rows, config.cols), (24, 80));
    }

    #[test]
    fn inherit_env_keeps_explicit_entries() {
        let config = SessionConfig::default().env("WSTERM_EXPLICIT", "1").inherit_env();
        assert_eq!(config.env[0], ("WSTERM_EXPLICIT".to_string(), "1".to_string()));
        assert_eq!(config.env.len(), 1 + std::env::vars().count());
    }

    #[test]
    fn start_with_missing_command_is_spawn_error() {
        let config = SessionConfig::with_command("/definitely/not/a/real/binary");
        let error = PtySession::start(&config).expect_err("spawn should fail");
        assert!(matches!(error, BridgeError::Spawn(_)));
    }

    #[cfg(unix)]
    mod unix {
        use std::io::Read;
        use std::sync::mpsc;
        use std::thread;
        use std::time::{Duration, Instant};

        use super::*;

        fn collect_until(
            reader: Box<dyn Read + Send>,
            needle: &'static str,
            timeout: Duration,
        ) -> String {
            let (tx, rx) = mpsc::channel::<Vec<u8>>();
            thread::spawn(move || {
                let mut reader = reader;
                let mut buf = [0_u8; 1024];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            let deadline = Instant::now() + timeout;
            let mut seen = Vec::new();
            while Instant::now() < deadline {
                if let Ok(chunk) = rx.recv_timeout(Duration::from_millis(50)) {
                    seen.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&seen).contains(needle) {
                        break;
                    }
                }
            }
            String::from_utf8_lossy(&seen).into_owned()
        }

        #[test]
        fn start_applies_default_window_size_and_term() {
            let config = SessionConfig::with_command("/bin/sh")
                .args(["-c", "stty size; echo term=$TERM"])
                .env("PATH", "/usr/bin:/bin");
            let mut session = PtySession::start(&config).expect("start session");
            assert_eq!(session.size(), (60, 200));
            let reader = session.take_reader().expect("reader");
            let output = collect_until(reader, "term=xterm", Duration::from_secs(5));
            assert!(output.contains("60 200"), "unexpected output: {output:?}");
            assert!(output.contains("term=xterm"), "unexpected output: {output:?}");
            session.stop().expect("stop");
        }

        #[test]
        fn resize_updates_pty_window_size() {
            let config = SessionConfig::with_command("/bin/sh").env("PATH", "/usr/bin:/bin");
            let mut session = PtySession::start(&config).expect("start session");
            session.resize(40, 120);
            assert_eq!(session.size(), (40, 120));
            assert_eq!(session.pty_size(), Some((40, 120)));
            session.stop().expect("stop");
        }

        #[test]
        fn write_reaches_child_and_stop_unblocks_reader() {
            let config = SessionConfig::with_command("/bin/cat");
            let mut session = PtySession::start(&config).expect("start session");
            let reader = session.take_reader().expect("reader");
            assert!(matches!(session.take_reader(), Err(BridgeError::PtyClosed)));

            let (done_tx, done_rx) = mpsc::channel();
            let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>();
            thread::spawn(move || {
                let mut reader = reader;
                let mut buf = [0_u8; 256];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let _ = data_tx.send(buf[..n].to_vec());
                        }
                    }
                }
                let _ = done_tx.send(());
            });

            session.write(b"ping-pty\n").expect("write");
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut seen = Vec::new();
            while Instant::now() < deadline && !String::from_utf8_lossy(&seen).contains("ping-pty") {
                if let Ok(chunk) = data_rx.recv_timeout(Duration::from_millis(50)) {
                    seen.extend_from_slice(&chunk);
                }
            }
            assert!(String::from_utf8_lossy(&seen).contains("ping-pty"));

            session.stop().expect("stop");
            done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("reader thread exits after stop");
        }
    }
}
