//! Byte-level duplex channels to the device.
//!
//! A [`Link`] never blocks and never panics on I/O trouble: failures surface
//! through [`Link::operational`] and the exchanger treats a non-operational
//! link as lost. Links that do I/O off-thread hand bytes to the core through
//! bounded queues; a full queue drops and the exchange times out.

pub mod inproc;
pub mod udp;

pub use inproc::{InProcLink, InProcLinkHandle};
pub use udp::UdpLink;

use crate::core::error::Result;

/// A byte-oriented duplex channel with lifecycle management.
pub trait Link {
    /// Open the channel. Idempotent.
    fn open(&mut self) -> Result<()>;

    /// Close the channel and release resources.
    fn close(&mut self);

    /// Check if the channel is able to move bytes.
    fn operational(&self) -> bool;

    /// Non-blocking internal pump. Called once per core tick.
    fn process(&mut self) {}

    /// Drain bytes received since the last call. Possibly empty.
    fn read(&mut self) -> Vec<u8>;

    /// Queue bytes for transmission. Failures flip [`Link::operational`].
    fn write(&mut self, data: &[u8]);

    /// Bitrate ceiling imposed by the physical medium, if any.
    fn max_bitrate_bps(&self) -> Option<u32> {
        None
    }
}
