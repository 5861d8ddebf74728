//! Device lifecycle: discovery, session management, polling and the FSM.

pub mod emulator;
pub mod handler;
pub mod heartbeat;
pub mod info;
pub mod info_poller;
pub mod memory_reader;
pub mod memory_writer;
pub mod searcher;

pub use emulator::EmulatedDevice;
pub use handler::{ConnectionStatus, DeviceHandler, Diagnostics};
pub use heartbeat::HeartbeatGenerator;
pub use info::DeviceInfo;
pub use info_poller::InfoPoller;
pub use searcher::{DeviceSearcher, FoundDevice};

/// Dispatcher priorities of the core submitters. Higher pops first.
pub mod priorities {
    /// Discover broadcasts preempt everything.
    pub const DISCOVER: u8 = 255;
    /// Clean disconnects go out before anything user-scheduled.
    pub const DISCONNECT: u8 = 240;
    /// Heartbeats must not starve behind bulk memory traffic.
    pub const HEARTBEAT: u8 = 200;
    /// Info polling runs before user traffic, after liveness.
    pub const INFO_POLL: u8 = 100;
    /// Memory and RPV synchronization is the background workload.
    pub const MEMORY_IO: u8 = 0;
}
