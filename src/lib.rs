//! # Scrutiny Server Core
//!
//! Device-facing core of the Scrutiny embedded debugging server: the wire
//! protocol spoken with the firmware-resident agent, the framed exchanger
//! over a byte link, the priority/throttle request dispatcher, the device
//! lifecycle state machine and the in-memory datastore exposed to upper
//! layers.
//!
//! ## Architecture
//!
//! Upper layers mutate the [`datastore::Datastore`]. The memory reader and
//! writer observe it, synthesize requests and submit them to the
//! [`dispatcher::RequestDispatcher`]. The [`device::DeviceHandler`] pulls
//! ready requests and hands them to the [`exchanger::FrameExchanger`], which
//! moves bytes over a [`link::Link`] and reassembles the response. Searcher,
//! heartbeat and info poller are peer submitters active in specific
//! lifecycle states.
//!
//! The core is single-threaded cooperative: one `process()` call drives one
//! tick of everything, nothing blocks, and every failure is a value routed
//! to a retry path. Threads exist only inside links.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use scrutiny_core::config::DeviceHandlerConfig;
//! use scrutiny_core::datastore::Datastore;
//! use scrutiny_core::device::DeviceHandler;
//! use scrutiny_core::link::{UdpLink, udp::UdpLinkConfig};
//!
//! let datastore = Rc::new(RefCell::new(Datastore::new()));
//! let mut handler = DeviceHandler::new(DeviceHandlerConfig::default(), Rc::clone(&datastore));
//! handler.set_link(Box::new(UdpLink::new(UdpLinkConfig::new("192.168.1.50:12345"))));
//!
//! loop {
//!     handler.process();
//!     std::thread::sleep(std::time::Duration::from_millis(5));
//! }
//! ```

pub mod config;
pub mod core;
pub mod datastore;
pub mod device;
pub mod dispatcher;
pub mod exchanger;
pub mod link;
pub mod protocol;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::DeviceHandlerConfig;
    pub use crate::core::{EmbeddedDataType, Endianness, Result, RuntimePublishedValue, ScrutinyError, Value};
    pub use crate::datastore::{
        AliasDef, Datastore, DatastoreEntry, EntryDefinition, EntryId, EntryType, RpvDef, TargetUpdateResult,
        VariableDef,
    };
    pub use crate::device::{ConnectionStatus, DeviceHandler, DeviceInfo};
    pub use crate::dispatcher::RequestDispatcher;
    pub use crate::exchanger::FrameExchanger;
    pub use crate::link::{InProcLink, Link, UdpLink};
    pub use crate::protocol::{Protocol, Request, Response, ResponseCode};
}

// Re-export the workhorse types at the crate root.
pub use crate::core::error::{Result, ScrutinyError};
pub use crate::core::types::{EmbeddedDataType, Endianness, RuntimePublishedValue, Value};
pub use crate::datastore::Datastore;
pub use crate::device::{ConnectionStatus, DeviceHandler};
