//! Message channel seams between the proxy loops and the websocket.
//!
//! The forwarder only needs to push text out ([`MessageSink`]) and the
//! dispatcher only needs to pull frames in ([`MessageSource`]). [`WsChannel`]
//! implements both over a single tungstenite socket so the two loops can run
//! on separate threads against one connection.

use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tungstenite::{Error as WsError, Message, WebSocket};

use crate::error::{BridgeError, Result};

/// One inbound frame, reduced to what the control protocol cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// A frame kind the protocol has no meaning for.
    Other,
    /// The peer closed the connection cleanly.
    Closed,
}

pub trait MessageSource {
    /// Block until the next frame arrives.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] on any failure other than a clean close.
    fn recv(&mut self) -> Result<Frame>;
}

pub trait MessageSink {
    /// Send one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] if the frame could not be delivered.
    fn send_text(&mut self, text: &str) -> Result<()>;

    /// Close the channel so that a peer blocked in [`MessageSource::recv`] wakes up.
    fn close(&mut self);
}

/// Duplex websocket shared by a connection's reader and writer threads.
///
/// The socket is switched to non-blocking mode; `recv` polls and sleeps
/// `poll_interval` outside the lock so senders are never starved.
#[derive(Debug, Clone)]
pub struct WsChannel {
    socket: Arc<Mutex<WebSocket<TcpStream>>>,
    poll_interval: Duration,
}

impl WsChannel {
    /// Wrap an accepted websocket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be switched to non-blocking mode.
    pub fn new(websocket: WebSocket<TcpStream>, poll_interval: Duration) -> io::Result<Self> {
        websocket.get_ref().set_nonblocking(true)?;
        Ok(Self {
            socket: Arc::new(Mutex::new(websocket)),
            poll_interval,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, WebSocket<TcpStream>>> {
        self.socket
            .lock()
            .map_err(|_| BridgeError::transport("websocket lock poisoned"))
    }

    fn flush_blocking(&self, websocket: &mut WebSocket<TcpStream>) -> Result<()> {
        loop {
            match websocket.flush() {
                Ok(()) => return Ok(()),
                Err(WsError::Io(error)) if error.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(self.poll_interval);
                }
                Err(error) => return Err(BridgeError::transport(error)),
            }
        }
    }
}

fn is_idle(error: &WsError) -> bool {
    matches!(
        error,
        WsError::Io(error)
            if matches!(error.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
    )
}

impl MessageSource for WsChannel {
    fn recv(&mut self) -> Result<Frame> {
        loop {
            let result = self.lock()?.read();
            match result {
                Ok(Message::Text(text)) => return Ok(Frame::Text(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => return Ok(Frame::Binary(bytes.to_vec())),
                // tungstenite queues the pong itself; it goes out with the next flush.
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Ok(Message::Close(_)) => return Ok(Frame::Closed),
                Ok(Message::Frame(_)) => return Ok(Frame::Other),
                Err(error) if is_idle(&error) => thread::sleep(self.poll_interval),
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return Ok(Frame::Closed),
                Err(error) => return Err(BridgeError::transport(error)),
            }
        }
    }
}

impl MessageSink for WsChannel {
    fn send_text(&mut self, text: &str) -> Result<()> {
        let mut websocket = self.lock()?;
        match websocket.write(Message::text(text)) {
            Ok(()) => {}
            // Queued in the write buffer; the flush below drains it.
            Err(error) if is_idle(&error) => {}
            Err(error) => return Err(BridgeError::transport(error)),
        }
        self.flush_blocking(&mut websocket)
    }

    fn close(&mut self) {
        let Ok(mut websocket) = self.socket.lock() else {
            return;
        };
        let _ = websocket.close(None);
        let _ = websocket.flush();
        let _ = websocket.get_ref().shutdown(Shutdown::Both);
    }
}
