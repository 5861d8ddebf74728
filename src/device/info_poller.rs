//! Post-connect device introspection.
//!
//! A sub-state machine that reads, in order: protocol version, communication
//! parameters, supported features, special memory regions, RPV definitions
//! and execution loops. Each state submits one request (or one batch) and
//! advances when the exchange completes. Any failure or malformed answer is
//! terminal for the poll; the device handler reacts by resetting the session.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error};

use crate::device::info::DeviceInfo;
use crate::device::priorities;
use crate::dispatcher::{RequestDispatcher, SuccessCallback};
use crate::protocol::commands::MemoryRegionType;
use crate::protocol::messages::{CommParams, Protocol, ResponseData, RPV_DEFINITION_SIZE};
use crate::protocol::response::{Response, ResponseCode};

/// States of the polling sub-FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollerState {
    Error,
    Init,
    GetProtocolVersion,
    GetCommParams,
    GetSupportedFeatures,
    GetSpecialMemoryRegionCount,
    GetForbiddenMemoryRegions,
    GetReadOnlyMemoryRegions,
    GetRpvCount,
    GetRpvDefinitions,
    GetLoopCount,
    GetLoopDefinitions,
    Done,
}

#[derive(Default)]
struct PollerShared {
    info: DeviceInfo,
    pending_requests: usize,
    request_failed: bool,
    error_message: String,
    nbr_forbidden: Option<u8>,
    nbr_readonly: Option<u8>,
    rpv_count: Option<u16>,
    loop_count: Option<u8>,
    comm_params: Option<CommParams>,
    comm_params_event: Option<CommParams>,
}

impl PollerShared {
    fn fail(&mut self, message: impl Into<String>) {
        self.request_failed = true;
        self.error_message = message.into();
    }
}

/// Gathers [`DeviceInfo`] from a freshly connected device.
pub struct InfoPoller {
    shared: Rc<RefCell<PollerShared>>,
    state: PollerState,
    last_state: PollerState,
    started: bool,
}

impl Default for InfoPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl InfoPoller {
    /// Create an idle poller.
    pub fn new() -> Self {
        Self {
            shared: Rc::new(RefCell::new(PollerShared::default())),
            state: PollerState::Init,
            last_state: PollerState::Init,
            started: false,
        }
    }

    /// Seed the info known before polling (from the Discover exchange).
    pub fn set_known_device(&mut self, device_id: impl Into<String>, display_name: impl Into<String>) {
        let mut shared = self.shared.borrow_mut();
        shared.info.device_id = Some(device_id.into());
        shared.info.display_name = Some(display_name.into());
    }

    /// Begin polling.
    pub fn start(&mut self) {
        self.started = true;
    }

    /// Abort and reset. In-flight callbacks land in an orphaned state cell.
    pub fn stop(&mut self) {
        let known = {
            let shared = self.shared.borrow();
            (shared.info.device_id.clone(), shared.info.display_name.clone())
        };
        self.shared = Rc::new(RefCell::new(PollerShared::default()));
        {
            let mut shared = self.shared.borrow_mut();
            shared.info.device_id = known.0;
            shared.info.display_name = known.1;
        }
        self.state = PollerState::Init;
        self.last_state = PollerState::Init;
        self.started = false;
    }

    /// Check if every item was gathered.
    pub fn done(&self) -> bool {
        self.state == PollerState::Done
    }

    /// Check if the poll failed.
    pub fn is_in_error(&self) -> bool {
        self.state == PollerState::Error
    }

    /// Human-readable reason of the failure.
    pub fn error_message(&self) -> String {
        self.shared.borrow().error_message.clone()
    }

    /// Snapshot of the gathered info.
    pub fn device_info(&self) -> DeviceInfo {
        self.shared.borrow().info.clone()
    }

    /// Communication parameters, once, as soon as they arrive. The device
    /// handler applies them mid-poll (buffer limits, throttle, address size).
    pub fn take_comm_params(&mut self) -> Option<CommParams> {
        self.shared.borrow_mut().comm_params_event.take()
    }

    fn register(
        &self,
        dispatcher: &mut RequestDispatcher,
        request: crate::protocol::request::Request,
        step: &'static str,
        on_data: impl Fn(&mut PollerShared, ResponseData) + 'static,
    ) {
        self.shared.borrow_mut().pending_requests += 1;

        let success_shared = Rc::clone(&self.shared);
        let failure_shared = Rc::clone(&self.shared);
        let success: SuccessCallback = Box::new(move |_request, response: &Response, data| {
            let mut shared = success_shared.borrow_mut();
            shared.pending_requests = shared.pending_requests.saturating_sub(1);
            if response.code != ResponseCode::Ok {
                shared.fail(format!("Device refused to give {}. Response code = {}", step, response.code));
                return;
            }
            on_data(&mut shared, data);
        });
        dispatcher.register_request(
            request,
            success,
            Box::new(move |_request| {
                let mut shared = failure_shared.borrow_mut();
                shared.pending_requests = shared.pending_requests.saturating_sub(1);
                shared.fail(format!("Failed to get {}", step));
            }),
            priorities::INFO_POLL,
        );
    }

    /// Drive the sub-FSM. Call once per tick.
    pub fn process(&mut self, dispatcher: &mut RequestDispatcher, protocol: &Protocol) {
        if !self.started {
            return;
        }

        let state_entry = self.state != self.last_state;
        let mut next_state = self.state;

        let (pending, failed) = {
            let shared = self.shared.borrow();
            (shared.pending_requests, shared.request_failed)
        };

        match self.state {
            PollerState::Init => {
                next_state = PollerState::GetProtocolVersion;
            }

            PollerState::GetProtocolVersion => {
                if state_entry {
                    self.register(dispatcher, protocol.get_protocol_version(), "protocol version", |shared, data| {
                        match data {
                            ResponseData::ProtocolVersion { major, minor } => {
                                shared.info.protocol_major = Some(major);
                                shared.info.protocol_minor = Some(minor);
                            }
                            _ => shared.fail("Device gave invalid data when polling for protocol version"),
                        }
                    });
                } else if failed {
                    next_state = PollerState::Error;
                } else if pending == 0 {
                    next_state = PollerState::GetCommParams;
                }
            }

            PollerState::GetCommParams => {
                if state_entry {
                    self.register(dispatcher, protocol.comm_get_params(), "communication params", |shared, data| {
                        match data {
                            ResponseData::GetParams(params) => {
                                shared.info.apply_comm_params(&params);
                                shared.comm_params = Some(params);
                                shared.comm_params_event = Some(params);
                            }
                            _ => shared.fail("Device gave invalid data when polling for communication params"),
                        }
                    });
                } else if failed {
                    next_state = PollerState::Error;
                } else if pending == 0 {
                    next_state = PollerState::GetSupportedFeatures;
                }
            }

            PollerState::GetSupportedFeatures => {
                if state_entry {
                    self.register(dispatcher, protocol.get_supported_features(), "supported features", |shared, data| {
                        match data {
                            ResponseData::SupportedFeatures(features) => {
                                shared.info.supported_features = Some(features);
                            }
                            _ => shared.fail("Device gave invalid data when polling for supported features"),
                        }
                    });
                } else if failed {
                    next_state = PollerState::Error;
                } else if pending == 0 {
                    next_state = PollerState::GetSpecialMemoryRegionCount;
                }
            }

            PollerState::GetSpecialMemoryRegionCount => {
                if state_entry {
                    self.register(
                        dispatcher,
                        protocol.get_special_memory_region_count(),
                        "special region count",
                        |shared, data| match data {
                            ResponseData::SpecialMemoryRegionCount {
                                nbr_readonly,
                                nbr_forbidden,
                            } => {
                                shared.nbr_readonly = Some(nbr_readonly);
                                shared.nbr_forbidden = Some(nbr_forbidden);
                            }
                            _ => shared.fail("Device gave invalid data when polling for special region count"),
                        },
                    );
                } else if failed {
                    next_state = PollerState::Error;
                } else if pending == 0 {
                    next_state = PollerState::GetForbiddenMemoryRegions;
                }
            }

            PollerState::GetForbiddenMemoryRegions => {
                let count = self.shared.borrow().nbr_forbidden;
                match count {
                    None => {
                        self.shared.borrow_mut().fail("Forbidden region count unknown");
                        next_state = PollerState::Error;
                    }
                    Some(count) => {
                        if state_entry {
                            self.shared.borrow_mut().info.forbidden_memory_regions = Some(Vec::new());
                            for index in 0..count {
                                self.register(
                                    dispatcher,
                                    protocol.get_special_memory_region_location(MemoryRegionType::Forbidden, index),
                                    "forbidden region list",
                                    |shared, data| match data {
                                        ResponseData::SpecialMemoryRegionLocation { region, .. } => {
                                            if let Some(regions) = shared.info.forbidden_memory_regions.as_mut() {
                                                regions.push(region);
                                            }
                                        }
                                        _ => shared.fail("Device gave invalid data when polling for forbidden region list"),
                                    },
                                );
                            }
                        } else if failed {
                            next_state = PollerState::Error;
                        } else if pending == 0 {
                            next_state = PollerState::GetReadOnlyMemoryRegions;
                        }
                    }
                }
            }

            PollerState::GetReadOnlyMemoryRegions => {
                let count = self.shared.borrow().nbr_readonly;
                match count {
                    None => {
                        self.shared.borrow_mut().fail("Readonly region count unknown");
                        next_state = PollerState::Error;
                    }
                    Some(count) => {
                        if state_entry {
                            self.shared.borrow_mut().info.readonly_memory_regions = Some(Vec::new());
                            for index in 0..count {
                                self.register(
                                    dispatcher,
                                    protocol.get_special_memory_region_location(MemoryRegionType::ReadOnly, index),
                                    "readonly region list",
                                    |shared, data| match data {
                                        ResponseData::SpecialMemoryRegionLocation { region, .. } => {
                                            if let Some(regions) = shared.info.readonly_memory_regions.as_mut() {
                                                regions.push(region);
                                            }
                                        }
                                        _ => shared.fail("Device gave invalid data when polling for readonly region list"),
                                    },
                                );
                            }
                        } else if failed {
                            next_state = PollerState::Error;
                        } else if pending == 0 {
                            next_state = PollerState::GetRpvCount;
                        }
                    }
                }
            }

            PollerState::GetRpvCount => {
                if state_entry {
                    self.register(dispatcher, protocol.get_rpv_count(), "RuntimePublishedValues count", |shared, data| {
                        match data {
                            ResponseData::RpvCount { count } => shared.rpv_count = Some(count),
                            _ => shared.fail("Device gave invalid data when polling for RuntimePublishedValues count"),
                        }
                    });
                } else if failed {
                    next_state = PollerState::Error;
                } else if pending == 0 {
                    next_state = PollerState::GetRpvDefinitions;
                }
            }

            PollerState::GetRpvDefinitions => {
                if state_entry {
                    self.shared.borrow_mut().info.runtime_published_values = Some(Vec::new());
                }
                let (rpv_count, max_tx, read_so_far) = {
                    let shared = self.shared.borrow();
                    (
                        shared.rpv_count,
                        shared.comm_params.map(|params| params.max_tx_data_size),
                        shared
                            .info
                            .runtime_published_values
                            .as_ref()
                            .map(Vec::len)
                            .unwrap_or(0),
                    )
                };
                match (rpv_count, max_tx) {
                    (Some(rpv_count), Some(max_tx)) => {
                        if failed {
                            next_state = PollerState::Error;
                        } else if pending == 0 {
                            if read_so_far < rpv_count as usize {
                                // Batch size bounded by what one response frame can carry.
                                let per_request = ((max_tx as usize).saturating_sub(Response::OVERHEAD)
                                    / RPV_DEFINITION_SIZE)
                                    .max(1);
                                let count = per_request.min(rpv_count as usize - read_so_far) as u16;
                                self.register(
                                    dispatcher,
                                    protocol.get_rpv_definition(read_so_far as u16, count),
                                    "RuntimePublishedValues definition",
                                    |shared, data| match data {
                                        ResponseData::RpvDefinition { rpvs } => {
                                            if let Some(all) = shared.info.runtime_published_values.as_mut() {
                                                all.extend(rpvs);
                                            }
                                        }
                                        _ => shared
                                            .fail("Device gave invalid data when polling for RuntimePublishedValues definition"),
                                    },
                                );
                            } else {
                                next_state = PollerState::GetLoopCount;
                            }
                        }
                    }
                    _ => {
                        self.shared.borrow_mut().fail("RPV count or buffer sizes unknown");
                        next_state = PollerState::Error;
                    }
                }
            }

            PollerState::GetLoopCount => {
                if state_entry {
                    self.register(dispatcher, protocol.get_loop_count(), "loop count", |shared, data| match data {
                        ResponseData::LoopCount { count } => shared.loop_count = Some(count),
                        _ => shared.fail("Device gave invalid data when polling for loop count"),
                    });
                } else if failed {
                    next_state = PollerState::Error;
                } else if pending == 0 {
                    next_state = PollerState::GetLoopDefinitions;
                }
            }

            PollerState::GetLoopDefinitions => {
                let count = self.shared.borrow().loop_count.unwrap_or(0);
                if state_entry {
                    self.shared.borrow_mut().info.loops = Some(Vec::new());
                    for loop_id in 0..count {
                        self.register(
                            dispatcher,
                            protocol.get_loop_definition(loop_id),
                            "loop definition",
                            |shared, data| match data {
                                ResponseData::LoopDefinition { exec_loop, .. } => {
                                    if let Some(loops) = shared.info.loops.as_mut() {
                                        loops.push(exec_loop);
                                    }
                                }
                                _ => shared.fail("Device gave invalid data when polling for loop definition"),
                            },
                        );
                    }
                    if count == 0 {
                        next_state = PollerState::Done;
                    }
                } else if failed {
                    next_state = PollerState::Error;
                } else if pending == 0 {
                    next_state = PollerState::Done;
                }
            }

            PollerState::Done | PollerState::Error => {}
        }

        if next_state != self.state {
            debug!(from = ?self.state, to = ?next_state, "info poller state change");
            if next_state == PollerState::Error {
                error!(message = %self.shared.borrow().error_message, "device info polling failed");
            }
        }
        self.last_state = self.state;
        self.state = next_state;
    }
}
