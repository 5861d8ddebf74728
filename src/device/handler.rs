//! Top-level device lifecycle state machine.
//!
//! Drives discovery, connection, info polling and the ready state where user
//! traffic flows. Any communication fault funnels back to INIT and the
//! handler rediscovers on its own; there is no fatal error in the core.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::DeviceHandlerConfig;
use crate::core::timer::Timer;
use crate::datastore::{Datastore, EntryDefinition, EntryType, RpvDef};
use crate::device::heartbeat::HeartbeatGenerator;
use crate::device::info::DeviceInfo;
use crate::device::info_poller::InfoPoller;
use crate::device::memory_reader::{IoLimits, MemoryReader};
use crate::device::memory_writer::MemoryWriter;
use crate::device::priorities;
use crate::device::searcher::{DeviceSearcher, FoundDevice};
use crate::dispatcher::RequestDispatcher;
use crate::exchanger::{FrameExchanger, LinkStats};
use crate::link::Link;
use crate::protocol::is_placeholder_firmware_id;
use crate::protocol::messages::{CommParams, Protocol, ResponseData};
use crate::protocol::request::Request;
use crate::protocol::response::{Response, ResponseCode};

/// Delay before retrying a refused or timed-out connect.
const RECONNECT_COOLDOWN: Duration = Duration::from_millis(500);

/// Floor of the heartbeat emission interval.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No link, or recovering from a fault.
    Disconnected,
    /// Broadcasting Discover requests.
    Discovering,
    /// Establishing a session.
    Connecting,
    /// Session open, reading device information.
    PollingInfo,
    /// Fully operational: user traffic flows.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsmState {
    Init,
    Discovering,
    Connecting,
    PollingInfo,
    Ready,
}

/// Snapshot of the handler state for upper layers and tooling.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Diagnostics {
    /// Lifecycle state.
    pub connection_status: ConnectionStatus,

    /// Firmware id of the current/last device, hex encoded.
    pub device_id: Option<String>,

    /// Session id, when connected.
    pub session_id: Option<u32>,

    /// Decode and protocol faults observed since construction.
    pub comm_error_count: u64,

    /// Requests queued in the dispatcher.
    pub pending_request_count: usize,

    /// Handler-specific information.
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// Orchestrates every device-facing component.
pub struct DeviceHandler {
    config: DeviceHandlerConfig,
    protocol: Protocol,
    dispatcher: RequestDispatcher,
    exchanger: FrameExchanger,
    searcher: DeviceSearcher,
    heartbeat: HeartbeatGenerator,
    info_poller: InfoPoller,
    memory_reader: MemoryReader,
    memory_writer: MemoryWriter,
    datastore: Rc<RefCell<Datastore>>,

    state: FsmState,
    last_state: FsmState,
    active_record: Option<crate::dispatcher::RequestRecord>,
    comm_broken: bool,
    connect_cooldown: Timer,
    connect_request: Option<Request>,

    found_device: Option<FoundDevice>,
    device_id: Option<String>,
    session_id: Option<u32>,
    device_info: Option<DeviceInfo>,

    comm_error_count: u64,
    disconnect_callback: Option<Box<dyn FnOnce(bool)>>,
    disconnect_outcome: Option<Rc<RefCell<Option<bool>>>>,

    monitor_since: Instant,
    monitor_base: LinkStats,
}

impl DeviceHandler {
    /// Create a handler over a shared datastore. No link attached yet.
    pub fn new(config: DeviceHandlerConfig, datastore: Rc<RefCell<Datastore>>) -> Self {
        let heartbeat_interval = (config.heartbeat_timeout.mul_f64(0.75)).max(MIN_HEARTBEAT_INTERVAL);
        Self {
            exchanger: FrameExchanger::new(config.response_timeout),
            heartbeat: HeartbeatGenerator::new(heartbeat_interval),
            config,
            protocol: Protocol::new(1, 0),
            dispatcher: RequestDispatcher::new(),
            searcher: DeviceSearcher::new(),
            info_poller: InfoPoller::new(),
            memory_reader: MemoryReader::new(Rc::clone(&datastore)),
            memory_writer: MemoryWriter::new(Rc::clone(&datastore)),
            datastore,
            state: FsmState::Init,
            last_state: FsmState::Init,
            active_record: None,
            comm_broken: false,
            connect_cooldown: Timer::new(RECONNECT_COOLDOWN),
            connect_request: None,
            found_device: None,
            device_id: None,
            session_id: None,
            device_info: None,
            comm_error_count: 0,
            disconnect_callback: None,
            disconnect_outcome: None,
            monitor_since: Instant::now(),
            monitor_base: LinkStats::default(),
        }
    }

    /// Attach (or replace) the link to the device. Any session drops and the
    /// handler rediscovers over the new link.
    pub fn set_link(&mut self, link: Box<dyn Link>) {
        self.exchanger.open(link);
        self.reset_comm();
        self.state = FsmState::Init;
        self.last_state = FsmState::Init;
    }

    /// Detach the link. The handler idles until a new one is attached.
    pub fn stop_comm(&mut self) {
        self.exchanger.close();
        self.reset_comm();
        self.state = FsmState::Init;
        self.last_state = FsmState::Init;
    }

    /// Externally visible lifecycle state.
    pub fn connection_status(&self) -> ConnectionStatus {
        match self.state {
            FsmState::Init => ConnectionStatus::Disconnected,
            FsmState::Discovering => ConnectionStatus::Discovering,
            FsmState::Connecting => ConnectionStatus::Connecting,
            FsmState::PollingInfo => ConnectionStatus::PollingInfo,
            FsmState::Ready => ConnectionStatus::Ready,
        }
    }

    /// Device knowledge of the current session, once READY.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.device_info.clone()
    }

    /// Session id of the current session, once connected.
    pub fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    /// Decode and protocol faults observed since construction.
    pub fn comm_error_count(&self) -> u64 {
        self.comm_error_count
    }

    /// Snapshot the handler state.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            connection_status: self.connection_status(),
            device_id: self.device_id.clone(),
            session_id: self.session_id,
            comm_error_count: self.comm_error_count,
            pending_request_count: self.dispatcher.pending_count(),
            extra: serde_json::json!({
                "throttling_enabled": self.dispatcher.is_throttling_enabled(),
                "throttling_bitrate_bps": self.dispatcher.throttling_bitrate_bps(),
                "link_open": self.exchanger.is_open(),
            }),
        }
    }

    /// Check if the bandwidth throttle is active.
    pub fn is_throttling_enabled(&self) -> bool {
        self.dispatcher.is_throttling_enabled()
    }

    /// Throttle bitrate, 0 when disabled.
    pub fn throttling_bitrate_bps(&self) -> u32 {
        self.dispatcher.throttling_bitrate_bps()
    }

    /// Restart the achieved-bitrate measurement window.
    pub fn reset_bitrate_monitor(&mut self) {
        self.monitor_base = self.exchanger.stats();
        self.monitor_since = Instant::now();
    }

    /// Average wire bitrate since the last monitor reset, bits per second.
    pub fn average_bitrate_bps(&self) -> f64 {
        let stats = self.exchanger.stats();
        let moved_bits =
            ((stats.sent_bytes - self.monitor_base.sent_bytes) + (stats.received_bytes - self.monitor_base.received_bytes)) * 8;
        let elapsed = self.monitor_since.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        moved_bits as f64 / elapsed
    }

    /// Request a clean disconnect. The callback fires exactly once with
    /// `clean = true` when the device acknowledged the Disconnect exchange,
    /// `false` otherwise; the handler then returns to INIT and rediscovers.
    pub fn send_disconnect(&mut self, callback: impl FnOnce(bool) + 'static) {
        if self.state != FsmState::Ready || self.session_id.is_none() {
            callback(false);
            return;
        }
        if self.disconnect_callback.is_some() {
            warn!("a disconnect is already in progress");
            callback(false);
            return;
        }
        self.disconnect_callback = Some(Box::new(callback));
    }

    /// Drive one cooperative tick: peer submitters, dispatcher, comm, FSM.
    pub fn process(&mut self) {
        self.searcher.process(&mut self.dispatcher, &self.protocol);
        self.heartbeat.process(&mut self.dispatcher, &self.protocol);
        self.info_poller.process(&mut self.dispatcher, &self.protocol);
        self.memory_reader.process(&mut self.dispatcher, &self.protocol);
        self.memory_writer.process(&mut self.dispatcher, &self.protocol);
        self.dispatcher.process();
        self.handle_comm();
        self.do_state_machine();
    }

    // Exchange dispatcher records with the device, one at a time.
    fn handle_comm(&mut self) {
        self.exchanger.process();
        if !self.exchanger.is_open() {
            return;
        }

        if self.active_record.is_none() {
            // The connect exchange bypasses the dispatcher and owns the
            // exchanger while it lasts.
            if !self.exchanger.waiting_response() && !self.exchanger.response_available() {
                if let Some(mut record) = self.dispatcher.next() {
                    match self.exchanger.send_request(record.request.clone()) {
                        Ok(()) => self.active_record = Some(record),
                        Err(e) => {
                            error!(error = %e, "cannot send request");
                            self.comm_broken = true;
                            record.complete_failure();
                        }
                    }
                }
            }
        } else if self.exchanger.has_timed_out() {
            self.comm_broken = true;
            self.exchanger.clear_timeout();
            if let Some(record) = self.active_record.as_mut() {
                record.complete_failure();
            }
        } else if self.exchanger.waiting_response() {
            if self.exchanger.response_available() {
                if let Some(response) = self.exchanger.get_response() {
                    let record = self.active_record.as_mut();
                    if let Some(record) = record {
                        match self.protocol.parse_response(&record.request, &response) {
                            Ok(data) => record.complete_success(&response, data),
                            Err(e) => {
                                error!(error = %e, "invalid response received");
                                self.comm_error_count += 1;
                                self.comm_broken = true;
                                record.complete_failure();
                            }
                        }
                    }
                }
            }
        } else {
            // Not waiting, no response, no timeout: the exchanger dropped the
            // frame (CRC or mismatch). The record dies with it.
            self.comm_error_count += 1;
            self.comm_broken = true;
            self.exchanger.reset();
            if let Some(record) = self.active_record.as_mut() {
                record.complete_failure();
            }
        }

        if self.active_record.as_ref().is_some_and(|record| record.is_completed()) {
            self.active_record = None;
        }

        self.exchanger.process();
    }

    fn do_state_machine(&mut self) {
        if self.comm_broken && self.state != FsmState::Init {
            if self.device_id.is_some() {
                info!("communication with device stopped, restarting");
            }
            self.state = FsmState::Init;
        }

        let state_entry = self.state != self.last_state;
        let mut next_state = self.state;

        match self.state {
            // ============= INIT =====================
            FsmState::Init => {
                self.reset_comm();
                if !self.connect_cooldown.is_running() || self.connect_cooldown.is_timed_out() {
                    self.connect_cooldown.stop();
                    if self.exchanger.is_open() {
                        next_state = FsmState::Discovering;
                    }
                }
            }

            // ============= DISCOVERING =====================
            FsmState::Discovering => {
                if state_entry {
                    self.searcher.start();
                }
                if self.device_id.is_none() {
                    if let Some(found) = self.searcher.get_found_device() {
                        let device_id = hex_encode(&found.firmware_id);
                        info!(device_id = %device_id, name = %found.display_name, "found a device");
                        if is_placeholder_firmware_id(&found.firmware_id) {
                            warn!(
                                "firmware id of this device is a default placeholder; \
                                 the firmware may not have been tagged by the build toolchain"
                            );
                        }
                        self.device_id = Some(device_id);
                        self.found_device = Some(found);
                    }
                }
                if self.device_id.is_some() {
                    self.searcher.stop();
                    next_state = FsmState::Connecting;
                }
            }

            // ============= CONNECTING =====================
            FsmState::Connecting => {
                if state_entry {
                    self.exchanger.reset();
                    self.connect_request = None;
                }
                if self.exchanger.has_timed_out() {
                    debug!("connect timed out");
                    self.exchanger.clear_timeout();
                    self.comm_broken = true;
                    self.connect_cooldown.start();
                } else if self.exchanger.response_available() {
                    if let Some(response) = self.exchanger.get_response() {
                        self.handle_connect_response(&response, &mut next_state);
                    }
                } else if !self.exchanger.waiting_response() {
                    let request = self.protocol.comm_connect();
                    self.connect_request = Some(request.clone());
                    if let Err(e) = self.exchanger.send_request(request) {
                        error!(error = %e, "cannot send connect");
                        self.comm_broken = true;
                    }
                }
            }

            // ============= POLLING_INFO =====================
            FsmState::PollingInfo => {
                if state_entry {
                    self.info_poller.stop();
                    if let (Some(device_id), Some(found)) = (&self.device_id, &self.found_device) {
                        self.info_poller.set_known_device(device_id.clone(), found.display_name.clone());
                    }
                    self.info_poller.start();
                }
                if let Some(params) = self.info_poller.take_comm_params() {
                    self.apply_comm_params(&params);
                }
                if self.info_poller.is_in_error() {
                    error!(message = %self.info_poller.error_message(), "device information polling failed");
                    self.comm_broken = true;
                } else if self.info_poller.done() {
                    let info = self.info_poller.device_info();
                    self.install_session_info(&info);
                    self.device_info = Some(info);
                    next_state = FsmState::Ready;
                }
            }

            // ============= READY =====================
            FsmState::Ready => {
                if state_entry {
                    info!(device_id = self.device_id.as_deref().unwrap_or("?"), "device is ready");
                    self.memory_reader.start();
                    self.memory_writer.start();
                }

                if !self.exchanger.link_operational() {
                    warn!("link is no longer operational");
                    self.comm_broken = true;
                }
                if let Some(last_valid) = self.heartbeat.last_valid_heartbeat() {
                    if last_valid.elapsed() > self.config.heartbeat_timeout {
                        warn!("device stopped answering heartbeats");
                        self.comm_broken = true;
                    }
                }

                if !self.comm_broken {
                    self.process_disconnect_request(&mut next_state);
                }
            }
        }

        self.last_state = self.state;
        if next_state != self.state {
            debug!(from = ?self.state, to = ?next_state, "device handler state change");
        }
        self.state = next_state;
    }

    fn handle_connect_response(&mut self, response: &Response, next_state: &mut FsmState) {
        let Some(request) = self.connect_request.take() else {
            self.comm_broken = true;
            return;
        };
        match response.code {
            ResponseCode::Ok => match self.protocol.parse_response(&request, response) {
                Ok(ResponseData::Connect { session_id, .. }) => {
                    debug!(session_id = %format_args!("0x{:08X}", session_id), "session opened");
                    self.session_id = Some(session_id);
                    self.heartbeat.set_session_id(session_id);
                    self.heartbeat.start();
                    // Session-scoped datastore state starts fresh.
                    let mut datastore = self.datastore.borrow_mut();
                    datastore.clear_entries_of_type(EntryType::Rpv);
                    drop(datastore);
                    *next_state = FsmState::PollingInfo;
                }
                Ok(_) | Err(_) => {
                    error!("malformed connect response");
                    self.comm_error_count += 1;
                    self.comm_broken = true;
                }
            },
            ResponseCode::Busy => {
                warn!("device is busy, retrying connection later");
                self.comm_broken = true;
                self.connect_cooldown.start();
            }
            code => {
                warn!(code = %code, "device refused the connection");
                self.comm_broken = true;
                self.connect_cooldown.start();
            }
        }
    }

    fn process_disconnect_request(&mut self, next_state: &mut FsmState) {
        if let Some(outcome) = self.disconnect_outcome.clone() {
            if let Some(clean) = outcome.borrow_mut().take() {
                self.disconnect_outcome = None;
                if let Some(callback) = self.disconnect_callback.take() {
                    callback(clean);
                }
                info!(clean, "disconnected from device");
                *next_state = FsmState::Init;
            }
            return;
        }

        if self.disconnect_callback.is_some() {
            let Some(session_id) = self.session_id else {
                return;
            };
            let outcome = Rc::new(RefCell::new(None));
            self.disconnect_outcome = Some(Rc::clone(&outcome));

            let success_outcome = Rc::clone(&outcome);
            let failure_outcome = Rc::clone(&outcome);
            self.dispatcher.register_request(
                self.protocol.comm_disconnect(session_id),
                Box::new(move |_request, response: &Response, _data| {
                    *success_outcome.borrow_mut() = Some(response.code == ResponseCode::Ok);
                }),
                Box::new(move |_request| {
                    *failure_outcome.borrow_mut() = Some(false);
                }),
                priorities::DISCONNECT,
            );
        }
    }

    // Apply negotiated comm params to the dispatcher, protocol and reader.
    fn apply_comm_params(&mut self, params: &CommParams) {
        debug!(?params, "applying communication parameters");
        self.dispatcher
            .set_size_limits(Some(params.max_rx_data_size as usize), Some(params.max_tx_data_size as usize));

        let link_cap = self.exchanger.link_max_bitrate_bps().unwrap_or(0);
        let device_cap = params.max_bitrate_bps;
        let effective = match (device_cap, link_cap) {
            (0, 0) => 0,
            (0, cap) | (cap, 0) => cap,
            (a, b) => a.min(b),
        };
        if effective > 0 {
            self.dispatcher.enable_throttling(effective);
        } else {
            self.dispatcher.disable_throttling();
        }

        if let Err(e) = self.protocol.set_address_size_bytes(params.address_size_bytes) {
            error!(error = %e, "device declared an unusable address size");
            self.comm_broken = true;
            return;
        }

        self.memory_reader.set_limits(IoLimits {
            max_request_payload: (params.max_rx_data_size as usize).saturating_sub(Request::OVERHEAD),
            max_response_payload: (params.max_tx_data_size as usize).saturating_sub(Response::OVERHEAD),
        });
    }

    // Register the polled RPVs with the protocol and the datastore.
    fn install_session_info(&mut self, info: &DeviceInfo) {
        let rpvs = info.runtime_published_values.clone().unwrap_or_default();
        self.protocol.configure_rpvs(&rpvs);

        let mut datastore = self.datastore.borrow_mut();
        for rpv in &rpvs {
            let result = datastore.add_entry(EntryDefinition::Rpv(RpvDef {
                display_path: format!("/rpv/x{:04X}", rpv.id),
                rpv: *rpv,
            }));
            if let Err(e) = result {
                warn!(error = %e, rpv_id = rpv.id, "cannot register RPV entry");
            }
        }
    }

    // Tear down every piece of session state. Idempotent.
    fn reset_comm(&mut self) {
        if self.comm_broken && self.device_id.is_some() {
            info!("resetting communication state");
        }

        self.searcher.stop();
        self.heartbeat.stop();
        self.info_poller.stop();
        self.memory_reader.stop();
        self.memory_writer.stop();

        if let Some(mut record) = self.active_record.take() {
            record.complete_failure();
        }
        self.dispatcher.clear();
        self.dispatcher.set_size_limits(None, None);
        self.dispatcher.disable_throttling();
        self.exchanger.reset();

        self.protocol.clear_rpvs();
        let _ = self.protocol.set_address_size_bytes(4);

        {
            let mut datastore = self.datastore.borrow_mut();
            datastore.fail_all_pending_target_updates();
            datastore.clear_entries_of_type(EntryType::Rpv);
        }

        if self.disconnect_callback.is_some() && self.disconnect_outcome.is_none() {
            // Disconnect requested but never submitted: report unclean.
            if let Some(callback) = self.disconnect_callback.take() {
                callback(false);
            }
        }
        self.disconnect_outcome = None;
        self.disconnect_callback = None;

        self.session_id = None;
        self.device_id = None;
        self.found_device = None;
        self.device_info = None;
        self.connect_request = None;
        self.comm_broken = false;
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(&[0x00, 0xAB, 0x10]), "00ab10");
        assert_eq!(hex_encode(&[]), "");
    }

    #[test]
    fn test_idle_without_link() {
        let datastore = Rc::new(RefCell::new(Datastore::new()));
        let mut handler = DeviceHandler::new(DeviceHandlerConfig::default(), datastore);
        for _ in 0..5 {
            handler.process();
        }
        assert_eq!(handler.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(handler.comm_error_count(), 0);
    }

    #[test]
    fn test_disconnect_without_session_reports_unclean() {
        let datastore = Rc::new(RefCell::new(Datastore::new()));
        let mut handler = DeviceHandler::new(DeviceHandlerConfig::default(), datastore);
        let outcome = Rc::new(RefCell::new(None));
        let o = Rc::clone(&outcome);
        handler.send_disconnect(move |clean| *o.borrow_mut() = Some(clean));
        assert_eq!(*outcome.borrow(), Some(false));
    }
}
