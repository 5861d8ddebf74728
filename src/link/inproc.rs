//! In-process link pair.
//!
//! Two [`InProcLink`]s joined back to back: bytes written on one side are read
//! on the other. The queues are bounded and thread-safe so one end can live in
//! an emulated device running on its own thread. The test harness uses pairs
//! of these the way a real deployment uses a serial port or a socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::warn;

use crate::core::error::Result;
use crate::link::Link;

/// Chunks each side may queue before the producer starts dropping.
const QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Default)]
struct SharedFlags {
    broken: AtomicBool,
}

/// Control handle over an [`InProcLink`] pair, usable from any thread.
#[derive(Debug, Clone)]
pub struct InProcLinkHandle {
    flags: Arc<SharedFlags>,
}

impl InProcLinkHandle {
    /// Silently drop all traffic in both directions, emulating a cut cable.
    /// The link keeps reporting itself operational; exchanges time out.
    pub fn set_broken(&self, broken: bool) {
        self.flags.broken.store(broken, Ordering::SeqCst);
    }

    /// Check the emulated-cut flag.
    pub fn is_broken(&self) -> bool {
        self.flags.broken.load(Ordering::SeqCst)
    }
}

/// One endpoint of an in-process byte channel.
#[derive(Debug)]
pub struct InProcLink {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    flags: Arc<SharedFlags>,
    opened: bool,
}

impl InProcLink {
    /// Create a connected pair of endpoints.
    pub fn pair() -> (InProcLink, InProcLink) {
        let (a_tx, b_rx) = bounded(QUEUE_DEPTH);
        let (b_tx, a_rx) = bounded(QUEUE_DEPTH);
        let flags = Arc::new(SharedFlags::default());
        let a = InProcLink {
            tx: a_tx,
            rx: a_rx,
            flags: Arc::clone(&flags),
            opened: false,
        };
        let b = InProcLink {
            tx: b_tx,
            rx: b_rx,
            flags,
            opened: false,
        };
        (a, b)
    }

    /// Get a control handle shared by both endpoints.
    pub fn handle(&self) -> InProcLinkHandle {
        InProcLinkHandle {
            flags: Arc::clone(&self.flags),
        }
    }
}

impl Link for InProcLink {
    fn open(&mut self) -> Result<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
    }

    fn operational(&self) -> bool {
        self.opened
    }

    fn read(&mut self) -> Vec<u8> {
        if self.flags.broken.load(Ordering::SeqCst) {
            // Drain and discard so stale frames don't surface after repair.
            while self.rx.try_recv().is_ok() {}
            return Vec::new();
        }
        let mut out = Vec::new();
        while let Ok(chunk) = self.rx.try_recv() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    fn write(&mut self, data: &[u8]) {
        if !self.opened || self.flags.broken.load(Ordering::SeqCst) {
            return;
        }
        match self.tx.try_send(data.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(bytes = data.len(), "in-process link queue full, dropping chunk");
            }
            Err(TrySendError::Disconnected(_)) => {
                // Peer endpoint dropped; nothing to deliver to anymore.
                self.opened = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_moves_bytes_both_ways() {
        let (mut a, mut b) = InProcLink::pair();
        a.open().unwrap();
        b.open().unwrap();

        a.write(&[1, 2, 3]);
        a.write(&[4]);
        assert_eq!(b.read(), vec![1, 2, 3, 4]);
        assert!(b.read().is_empty());

        b.write(&[9, 9]);
        assert_eq!(a.read(), vec![9, 9]);
    }

    #[test]
    fn test_broken_link_drops_traffic() {
        let (mut a, mut b) = InProcLink::pair();
        a.open().unwrap();
        b.open().unwrap();
        let handle = a.handle();

        handle.set_broken(true);
        a.write(&[1, 2, 3]);
        assert!(b.read().is_empty());
        assert!(a.operational()); // stays operational; only traffic is lost

        handle.set_broken(false);
        a.write(&[5]);
        assert_eq!(b.read(), vec![5]);
    }

    #[test]
    fn test_write_after_peer_drop_marks_not_operational() {
        let (mut a, b) = InProcLink::pair();
        a.open().unwrap();
        drop(b);
        a.write(&[1]);
        assert!(!a.operational());
    }
}
