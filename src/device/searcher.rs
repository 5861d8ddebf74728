//! Periodic Discover broadcasting.
//!
//! While started, emits a Discover request at a fixed interval and latches
//! the first well-formed answer. The device handler reads the result and
//! stops the searcher before connecting.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use crate::core::timer::Timer;
use crate::device::priorities;
use crate::dispatcher::RequestDispatcher;
use crate::protocol::messages::{Protocol, ResponseData};
use crate::protocol::response::ResponseCode;

/// Interval between Discover broadcasts.
const DISCOVER_INTERVAL: Duration = Duration::from_millis(500);

/// A device that answered a Discover broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundDevice {
    /// Raw firmware id.
    pub firmware_id: [u8; 16],
    /// Human-readable device name.
    pub display_name: String,
    /// Protocol version the device speaks.
    pub protocol_major: u8,
    pub protocol_minor: u8,
}

#[derive(Default)]
struct SearchState {
    found: Option<FoundDevice>,
    pending: bool,
}

/// Broadcasts Discover requests and latches the first response.
pub struct DeviceSearcher {
    state: Rc<RefCell<SearchState>>,
    started: bool,
    interval_timer: Timer,
}

impl Default for DeviceSearcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceSearcher {
    /// Create a stopped searcher.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SearchState::default())),
            started: false,
            interval_timer: Timer::new(DISCOVER_INTERVAL),
        }
    }

    /// Begin broadcasting. Clears any previous find.
    pub fn start(&mut self) {
        self.started = true;
        self.interval_timer.stop();
        let mut state = self.state.borrow_mut();
        state.found = None;
        state.pending = false;
    }

    /// Stop broadcasting.
    pub fn stop(&mut self) {
        self.started = false;
        self.interval_timer.stop();
        self.state.borrow_mut().pending = false;
    }

    /// Check if broadcasting.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// The first device that answered since the last start, if any.
    pub fn get_found_device(&self) -> Option<FoundDevice> {
        self.state.borrow().found.clone()
    }

    /// Submit the next broadcast when due. Call once per tick.
    pub fn process(&mut self, dispatcher: &mut RequestDispatcher, protocol: &Protocol) {
        if !self.started {
            return;
        }
        {
            let state = self.state.borrow();
            // One find is enough; hold fire until restarted.
            if state.found.is_some() || state.pending {
                return;
            }
        }
        if self.interval_timer.is_running() && !self.interval_timer.is_timed_out() {
            return;
        }

        self.interval_timer.start();
        self.state.borrow_mut().pending = true;

        let success_state = Rc::clone(&self.state);
        let failure_state = Rc::clone(&self.state);
        dispatcher.register_request(
            protocol.comm_discover(),
            Box::new(move |_request, response, data| {
                let mut state = success_state.borrow_mut();
                state.pending = false;
                if response.code != ResponseCode::Ok {
                    debug!(code = %response.code, "discover refused");
                    return;
                }
                if let ResponseData::Discover {
                    protocol_major,
                    protocol_minor,
                    firmware_id,
                    display_name,
                } = data
                {
                    debug!(name = %display_name, "device answered discover");
                    state.found = Some(FoundDevice {
                        firmware_id,
                        display_name,
                        protocol_major,
                        protocol_minor,
                    });
                }
            }),
            Box::new(move |_request| {
                failure_state.borrow_mut().pending = false;
            }),
            priorities::DISCOVER,
        );
    }
}
