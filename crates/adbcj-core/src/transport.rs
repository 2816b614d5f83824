//! Byte transport under a session.
//!
//! A [`Transport`] accepts outbound frame batches and reports its lifecycle;
//! inbound bytes are pumped by a dedicated per-session I/O thread into an
//! [`InboundHandler`]. Each `write` call is atomic with respect to other
//! writers, so concurrently issued operations never interleave on the wire.

use std::io::Read;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::error::{DbError, Result};

/// Outbound half of a session's connection.
pub trait Transport: Send + Sync {
    /// Write one batch of frames. The whole batch reaches the wire
    /// contiguously.
    fn write(&self, bytes: &[u8]) -> Result<()>;
    /// Tear the connection down.
    fn close(&self);
    /// True once the connection is closing or gone.
    fn is_closing(&self) -> bool;
}

/// Receives inbound transport events on the session's I/O thread.
pub trait InboundHandler: Send {
    /// A chunk of bytes arrived from the server.
    fn data(&mut self, bytes: &[u8]);
    /// The connection closed; `error` is set unless this was a clean EOF.
    fn closed(&mut self, error: Option<DbError>);
}

/// TCP transport over a blocking socket. Writes are serialized by an
/// internal lock; reads happen on the session's I/O thread.
pub struct TcpTransport {
    stream: Mutex<TcpStream>,
    closing: AtomicBool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            closing: AtomicBool::new(false),
        }
    }

    fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }
}

impl Transport for TcpTransport {
    fn write(&self, bytes: &[u8]) -> Result<()> {
        use std::io::Write;
        if self.is_closing() {
            return Err(DbError::transport_msg("transport is closed"));
        }
        let mut stream = self.stream.lock().unwrap();
        stream
            .write_all(bytes)
            .and_then(|()| stream.flush())
            .map_err(|e| {
                self.mark_closing();
                DbError::transport("failed to write to server", e)
            })
    }

    fn close(&self) {
        self.mark_closing();
        let stream = self.stream.lock().unwrap();
        let _ = stream.shutdown(Shutdown::Both);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// Run the inbound pump on the calling thread until the connection closes.
pub fn read_loop(
    mut stream: TcpStream,
    transport: &Arc<TcpTransport>,
    handler: &mut dyn InboundHandler,
) {
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                debug!("server closed the connection");
                transport.mark_closing();
                handler.closed(None);
                return;
            }
            Ok(n) => {
                trace!("read {} bytes", n);
                handler.data(&buf[..n]);
            }
            Err(e) => {
                let error = if transport.is_closing() {
                    // Local close raced the read; not an error.
                    None
                } else {
                    Some(DbError::transport("failed to read from server", e))
                };
                transport.mark_closing();
                handler.closed(error);
                return;
            }
        }
    }
}

/// In-memory transport double: records every write for inspection.
/// Backs the protocol tests that drive sessions with synthetic wire bytes.
#[derive(Default)]
pub struct MemoryTransport {
    writes: Mutex<Vec<Vec<u8>>>,
    closing: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every batch written so far, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// All written bytes, concatenated.
    pub fn written(&self) -> Vec<u8> {
        self.writes.lock().unwrap().concat()
    }

    /// Drop the recorded writes.
    pub fn clear(&self) {
        self.writes.lock().unwrap().clear();
    }
}

impl Transport for MemoryTransport {
    fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closing() {
            return Err(DbError::transport_msg("transport is closed"));
        }
        self.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}
