//! UDP link with an off-thread receiver.
//!
//! The socket is pumped by a background thread that pushes datagrams into a
//! bounded queue; the core thread drains the queue from [`Link::read`].
//! Transmission happens inline since UDP sends do not block meaningfully.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::core::error::{Result, ScrutinyError};
use crate::link::Link;

/// UDP link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpLinkConfig {
    /// Local bind address.
    pub bind_addr: String,

    /// Device address.
    pub remote_addr: String,

    /// Datagrams queued between the receiver thread and the core.
    pub rx_queue_depth: usize,
}

impl Default for UdpLinkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:0".to_string(),
            remote_addr: "127.0.0.1:12345".to_string(),
            rx_queue_depth: 1024,
        }
    }
}

impl UdpLinkConfig {
    /// Create a config targeting the given device address.
    pub fn new(remote_addr: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            ..Default::default()
        }
    }

    /// Set the local bind address.
    #[must_use]
    pub fn with_bind_addr(mut self, bind_addr: impl Into<String>) -> Self {
        self.bind_addr = bind_addr.into();
        self
    }
}

struct RxThread {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

/// A [`Link`] over a UDP socket.
pub struct UdpLink {
    config: UdpLinkConfig,
    socket: Option<UdpSocket>,
    rx: Option<Receiver<Vec<u8>>>,
    rx_thread: Option<RxThread>,
    operational: Arc<AtomicBool>,
}

impl UdpLink {
    /// Create a closed UDP link.
    pub fn new(config: UdpLinkConfig) -> Self {
        Self {
            config,
            socket: None,
            rx: None,
            rx_thread: None,
            operational: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawn_rx_thread(&mut self, socket: UdpSocket, tx: Sender<Vec<u8>>) -> std::io::Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let operational = Arc::clone(&self.operational);

        let handle = std::thread::Builder::new()
            .name("scrutiny-udp-rx".to_string())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                while !stop_flag.load(Ordering::SeqCst) {
                    match socket.recv(&mut buf) {
                        Ok(n) if n > 0 => match tx.try_send(buf[..n].to_vec()) {
                            Ok(()) | Err(TrySendError::Full(_)) => {
                                // Full queue: drop the datagram, the exchanger
                                // will time out and recover.
                            }
                            Err(TrySendError::Disconnected(_)) => break,
                        },
                        Ok(_) => {}
                        Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
                        Err(e) => {
                            error!(error = %e, "UDP receive failed");
                            operational.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                }
            })?;

        self.rx_thread = Some(RxThread { handle, stop });
        Ok(())
    }
}

impl Link for UdpLink {
    fn open(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind(&self.config.bind_addr)?;
        socket.connect(&self.config.remote_addr).map_err(|e| {
            ScrutinyError::config(format!("cannot target device at {}: {}", self.config.remote_addr, e))
        })?;
        // Periodic wakeup so the receiver thread notices shutdown.
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let (tx, rx) = bounded(self.config.rx_queue_depth);
        let rx_socket = socket.try_clone()?;
        self.spawn_rx_thread(rx_socket, tx)?;
        self.operational.store(true, Ordering::SeqCst);
        self.socket = Some(socket);
        self.rx = Some(rx);
        debug!(remote = %self.config.remote_addr, "UDP link opened");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(thread) = self.rx_thread.take() {
            thread.stop.store(true, Ordering::SeqCst);
            let _ = thread.handle.join();
        }
        self.socket = None;
        self.rx = None;
        self.operational.store(false, Ordering::SeqCst);
    }

    fn operational(&self) -> bool {
        self.operational.load(Ordering::SeqCst)
    }

    fn read(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(rx) = &self.rx {
            while let Ok(chunk) = rx.try_recv() {
                out.extend_from_slice(&chunk);
            }
        }
        out
    }

    fn write(&mut self, data: &[u8]) {
        if let Some(socket) = &self.socket {
            if let Err(e) = socket.send(data) {
                warn!(error = %e, "UDP send failed, marking link down");
                self.operational.store(false, Ordering::SeqCst);
            }
        }
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_roundtrip() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let mut link = UdpLink::new(UdpLinkConfig::new(peer_addr.to_string()).with_bind_addr("127.0.0.1:0"));
        link.open().unwrap();
        assert!(link.operational());

        link.write(&[1, 2, 3]);
        let mut buf = [0u8; 16];
        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let (n, from) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);

        peer.send_to(&[9, 8, 7], from).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        let mut received = Vec::new();
        while received.is_empty() && std::time::Instant::now() < deadline {
            received = link.read();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(received, vec![9, 8, 7]);

        link.close();
        assert!(!link.operational());
    }
}
