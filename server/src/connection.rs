//! The seam between the core and the transport layer. The core never
//! frames or parses bytes on its own; it hands fully-encoded notices to a
//! [`Connection`] and asks it for liveness.

use shared::ServerNotice;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One client socket as the core sees it. Implemented by the transport
/// layer; the core only sends already-encoded frames and polls liveness.
pub trait Connection: Send {
    fn send(&mut self, bytes: &[u8]);
    fn close(&mut self);
    fn is_open(&self) -> bool;
    fn peer_addr(&self) -> SocketAddr;
}

/// Connection that swallows everything. Used for discarded secondary links
/// and as a placeholder transport in the binary skeleton.
pub struct NullConnection {
    open: bool,
    addr: SocketAddr,
}

impl NullConnection {
    pub fn new() -> Self {
        Self {
            open: true,
            addr: default_addr(),
        }
    }
}

impl Default for NullConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for NullConnection {
    fn send(&mut self, _bytes: &[u8]) {}

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn peer_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Test double that records every frame sent and exposes a handle for
/// asserting on traffic and liveness after the connection has been boxed
/// into a session.
pub struct RecordingConnection {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    open: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            open: Arc::new(AtomicBool::new(true)),
            addr: default_addr(),
        }
    }

    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            addr,
            ..Self::new()
        }
    }

    pub fn handle(&self) -> RecordingHandle {
        RecordingHandle {
            sent: Arc::clone(&self.sent),
            open: Arc::clone(&self.open),
        }
    }
}

impl Default for RecordingConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for RecordingConnection {
    fn send(&mut self, bytes: &[u8]) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(bytes.to_vec());
        }
    }

    fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn peer_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Inspection handle onto a [`RecordingConnection`].
#[derive(Clone)]
pub struct RecordingHandle {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    open: Arc<AtomicBool>,
}

impl RecordingHandle {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Simulates the peer dropping the socket.
    pub fn sever(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn frames_sent(&self) -> usize {
        self.sent.lock().map(|sent| sent.len()).unwrap_or(0)
    }

    /// Decodes every recorded frame that parses as a [`ServerNotice`].
    pub fn notices(&self) -> Vec<ServerNotice> {
        self.sent
            .lock()
            .map(|sent| sent.iter().filter_map(|f| ServerNotice::decode(f)).collect())
            .unwrap_or_default()
    }

    pub fn last_notice(&self) -> Option<ServerNotice> {
        self.notices().pop()
    }
}

fn default_addr() -> SocketAddr {
    "127.0.0.1:4000".parse().expect("static address")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_connection_captures_frames() {
        let mut conn = RecordingConnection::new();
        let handle = conn.handle();

        conn.send(&ServerNotice::LoginProceed.encode());
        conn.send(&ServerNotice::QueuePosition { position: 3 }.encode());

        assert_eq!(handle.frames_sent(), 2);
        assert_eq!(
            handle.notices(),
            vec![
                ServerNotice::LoginProceed,
                ServerNotice::QueuePosition { position: 3 }
            ]
        );
        assert_eq!(
            handle.last_notice(),
            Some(ServerNotice::QueuePosition { position: 3 })
        );
    }

    #[test]
    fn test_handle_observes_close_from_either_side() {
        let mut conn = RecordingConnection::new();
        let handle = conn.handle();

        assert!(conn.is_open());
        conn.close();
        assert!(!handle.is_open());

        let conn2 = RecordingConnection::new();
        let handle2 = conn2.handle();
        handle2.sever();
        assert!(!conn2.is_open());
    }

    #[test]
    fn test_null_connection_liveness() {
        let mut conn = NullConnection::new();
        assert!(conn.is_open());
        conn.send(b"ignored");
        conn.close();
        assert!(!conn.is_open());
    }
}
