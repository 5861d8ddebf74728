//! Tick-driven device emulator.
//!
//! Speaks the full wire protocol over one end of an [`InProcLink`] pair, the
//! way a firmware agent would. Integration tests pump it in lockstep with the
//! device handler: `handler.process(); emulator.process();`. Not meant for
//! production use.

use std::collections::{BTreeMap, HashMap};

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::core::types::{EmbeddedDataType, RuntimePublishedValue, Value};
use crate::link::{InProcLink, Link};
use crate::protocol::commands::{Command, CommControlSubfn, MemoryRegionType};
use crate::protocol::messages::{
    AcquisitionMetadata, CommParams, DataloggerState, ExecLoop, MemoryBlock, MemoryRegion, Protocol, RequestData,
    SupportedFeatures,
};
use crate::protocol::request::Request;
use crate::protocol::response::{Response, ResponseCode};
use crate::protocol::{CONNECT_MAGIC, DISCOVER_MAGIC};

/// An in-process device emulator.
pub struct EmulatedDevice {
    link: InProcLink,
    protocol: Protocol,
    rx_buffer: BytesMut,

    firmware_id: [u8; 16],
    display_name: String,
    params: CommParams,
    features: SupportedFeatures,
    forbidden_regions: Vec<MemoryRegion>,
    readonly_regions: Vec<MemoryRegion>,
    loops: Vec<ExecLoop>,

    comm_enabled: bool,
    connected: bool,
    session_id: Option<u32>,
    next_session_id: u32,

    memory: HashMap<u64, u8>,
    rpvs: BTreeMap<u16, (RuntimePublishedValue, Value)>,

    datalogger_state: DataloggerState,
    datalog_config_id: u16,
    acquisition_id: u16,
}

impl EmulatedDevice {
    /// Create an emulator around the device side of a link pair.
    pub fn new(link: InProcLink) -> Self {
        let rpvs: BTreeMap<u16, (RuntimePublishedValue, Value)> = [
            (0x1000, EmbeddedDataType::Float64, Value::Float(0.0)),
            (0x1001, EmbeddedDataType::Float32, Value::Float(3.1415926f32 as f64)),
            (0x1002, EmbeddedDataType::Uint16, Value::Uint(0x1234)),
            (0x1003, EmbeddedDataType::Sint8, Value::Sint(-65)),
            (0x1004, EmbeddedDataType::Boolean, Value::Bool(true)),
        ]
        .into_iter()
        .map(|(id, datatype, value)| (id, (RuntimePublishedValue::new(id, datatype), value)))
        .collect();

        let mut protocol = Protocol::new(1, 0);
        let definitions: Vec<RuntimePublishedValue> = rpvs.values().map(|(def, _)| *def).collect();
        protocol.configure_rpvs(&definitions);

        let mut link = link;
        let _ = link.open();

        Self {
            link,
            protocol,
            rx_buffer: BytesMut::new(),
            firmware_id: std::array::from_fn(|i| i as u8),
            display_name: "EmulatedDevice".to_string(),
            params: CommParams {
                max_rx_data_size: 128,
                max_tx_data_size: 128,
                max_bitrate_bps: 100_000,
                heartbeat_timeout_us: 3_000_000,
                rx_timeout_us: 50_000,
                address_size_bytes: 4,
            },
            features: SupportedFeatures {
                memory_write: true,
                datalogging: false,
                user_command: false,
                sixtyfour_bits: false,
            },
            forbidden_regions: vec![
                MemoryRegion { start: 0x100, end: 0x1FF },
                MemoryRegion { start: 0x1000, end: 0x10FF },
            ],
            readonly_regions: vec![
                MemoryRegion { start: 0x200, end: 0x2FF },
                MemoryRegion { start: 0x800, end: 0x8FF },
                MemoryRegion { start: 0x900, end: 0x9FF },
            ],
            loops: vec![
                ExecLoop::fixed_freq("1KHz", 10_000),
                ExecLoop::fixed_freq("10KHz", 100_000),
                ExecLoop::variable_freq("Variable Freq 1"),
                ExecLoop::variable_freq("Idle Loop").without_datalogging(),
            ],
            comm_enabled: true,
            connected: false,
            session_id: None,
            next_session_id: 0x1234_0001,
            memory: HashMap::new(),
            rpvs,
            datalogger_state: DataloggerState::Idle,
            datalog_config_id: 0,
            acquisition_id: 0,
        }
    }

    // ===== Test-harness controls =====

    /// Disable the wire entirely: requests go unanswered.
    pub fn disable_comm(&mut self) {
        self.comm_enabled = false;
    }

    /// Re-enable the wire.
    pub fn enable_comm(&mut self) {
        self.comm_enabled = true;
    }

    /// Destroy the session device-side, as a rebooting target would.
    pub fn force_disconnect(&mut self) {
        self.connected = false;
        self.session_id = None;
    }

    /// Check if a session is open.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Requested bitrate ceiling. Takes effect on the next session.
    pub fn set_max_bitrate_bps(&mut self, bitrate: u32) {
        self.params.max_bitrate_bps = bitrate;
    }

    /// Write device memory directly, bypassing the wire.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) {
        for (offset, byte) in data.iter().enumerate() {
            self.memory.insert(address + offset as u64, *byte);
        }
    }

    /// Read device memory directly. Unwritten bytes read as zero.
    pub fn read_memory(&self, address: u64, length: usize) -> Vec<u8> {
        (0..length)
            .map(|offset| self.memory.get(&(address + offset as u64)).copied().unwrap_or(0))
            .collect()
    }

    /// Write an RPV directly, bypassing the wire.
    pub fn write_rpv(&mut self, id: u16, value: Value) {
        if let Some((_, stored)) = self.rpvs.get_mut(&id) {
            *stored = value;
        }
    }

    /// Read an RPV directly.
    pub fn rpv_value(&self, id: u16) -> Option<Value> {
        self.rpvs.get(&id).map(|(_, value)| *value)
    }

    /// RPV definitions, id-ordered.
    pub fn rpv_definitions(&self) -> Vec<RuntimePublishedValue> {
        self.rpvs.values().map(|(def, _)| *def).collect()
    }

    /// Advertised communication parameters.
    pub fn params(&self) -> CommParams {
        self.params
    }

    /// Advertised forbidden regions.
    pub fn forbidden_regions(&self) -> &[MemoryRegion] {
        &self.forbidden_regions
    }

    /// Advertised readonly regions.
    pub fn readonly_regions(&self) -> &[MemoryRegion] {
        &self.readonly_regions
    }

    /// Advertised execution loops.
    pub fn loops(&self) -> &[ExecLoop] {
        &self.loops
    }

    /// Advertised feature switches.
    pub fn features(&self) -> SupportedFeatures {
        self.features
    }

    // ===== Wire pump =====

    /// Drain the link, answer every complete request. Call once per tick.
    pub fn process(&mut self) {
        let data = self.link.read();
        if !data.is_empty() {
            self.rx_buffer.extend_from_slice(&data);
        }

        loop {
            if self.rx_buffer.len() < 4 {
                return;
            }
            let length = u16::from_be_bytes([self.rx_buffer[2], self.rx_buffer[3]]) as usize;
            let frame_size = Request::OVERHEAD + length;
            if self.rx_buffer.len() < frame_size {
                return;
            }

            let frame = self.rx_buffer.split_to(frame_size);
            let request = match Request::from_bytes(&frame) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "emulated device dropped a malformed request");
                    self.rx_buffer.clear();
                    return;
                }
            };

            if !self.comm_enabled {
                continue;
            }
            if let Some(response) = self.process_request(&request) {
                debug!(%response, "emulated device responding");
                self.link.write(&response.to_bytes());
            }
        }
    }

    fn process_request(&mut self, request: &Request) -> Option<Response> {
        if request.size_on_wire() > self.params.max_rx_data_size as usize {
            warn!(%request, "request does not fit the emulated rx buffer, dropping");
            return None;
        }

        let data = match self.protocol.parse_request(request) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "emulated device cannot parse request");
                return None;
            }
        };

        if !self.connected {
            let allowed = matches!(data, RequestData::Discover { .. } | RequestData::Connect { .. });
            if !allowed {
                warn!(%request, "request received while no session is active");
                return None;
            }
        }

        let response = match data {
            RequestData::Discover { magic } => {
                if magic != DISCOVER_MAGIC {
                    warn!("discover request with invalid magic");
                    return None;
                }
                self.protocol.respond_comm_discover(&self.firmware_id, &self.display_name)
            }
            RequestData::Connect { magic } => {
                if magic != CONNECT_MAGIC {
                    warn!("connect request with invalid magic");
                    return None;
                }
                if self.connected {
                    Response::empty(Command::CommControl, CommControlSubfn::Connect as u8, ResponseCode::Busy)
                } else {
                    let session_id = self.next_session_id;
                    self.next_session_id = self.next_session_id.wrapping_add(1);
                    self.session_id = Some(session_id);
                    self.connected = true;
                    self.protocol.respond_comm_connect(session_id)
                }
            }
            RequestData::Heartbeat { session_id, challenge } => {
                if Some(session_id) == self.session_id {
                    self.protocol
                        .respond_comm_heartbeat(session_id, crate::protocol::heartbeat_challenge_response(challenge))
                } else {
                    Response::empty(Command::CommControl, CommControlSubfn::Heartbeat as u8, ResponseCode::InvalidRequest)
                }
            }
            RequestData::Disconnect { session_id } => {
                if Some(session_id) == self.session_id {
                    self.force_disconnect();
                    self.protocol.respond_comm_disconnect()
                } else {
                    Response::empty(Command::CommControl, CommControlSubfn::Disconnect as u8, ResponseCode::InvalidRequest)
                }
            }
            RequestData::GetParams => self.protocol.respond_comm_get_params(&self.params),

            RequestData::GetProtocolVersion => self.protocol.respond_protocol_version(1, 0),
            RequestData::GetSupportedFeatures => self.protocol.respond_supported_features(&self.features),
            RequestData::GetSpecialMemoryRegionCount => self
                .protocol
                .respond_special_memory_region_count(self.readonly_regions.len() as u8, self.forbidden_regions.len() as u8),
            RequestData::GetSpecialMemoryRegionLocation { region_type, region_index } => {
                let region_list = match region_type {
                    MemoryRegionType::ReadOnly => &self.readonly_regions,
                    MemoryRegionType::Forbidden => &self.forbidden_regions,
                };
                match region_list.get(region_index as usize) {
                    Some(region) => self
                        .protocol
                        .respond_special_memory_region_location(region_type, region_index, region),
                    None => Response::empty(request.command, request.subfn, ResponseCode::Overflow),
                }
            }
            RequestData::GetRpvCount => self.protocol.respond_rpv_count(self.rpvs.len() as u16),
            RequestData::GetRpvDefinition { start, count } => {
                let definitions = self.rpv_definitions();
                let start = start as usize;
                let count = count as usize;
                if start + count > definitions.len() {
                    Response::empty(request.command, request.subfn, ResponseCode::FailureToProceed)
                } else {
                    self.protocol.respond_rpv_definition(&definitions[start..start + count])
                }
            }
            RequestData::GetLoopCount => self.protocol.respond_loop_count(self.loops.len() as u8),
            RequestData::GetLoopDefinition { loop_id } => match self.loops.get(loop_id as usize) {
                Some(exec_loop) => self.protocol.respond_loop_definition(loop_id, exec_loop),
                None => Response::empty(request.command, request.subfn, ResponseCode::FailureToProceed),
            },

            RequestData::MemoryRead { blocks } => {
                if blocks
                    .iter()
                    .any(|(address, length)| self.touches_forbidden(*address, *length as usize))
                {
                    Response::empty(request.command, request.subfn, ResponseCode::InvalidRequest)
                } else {
                    let read: Vec<MemoryBlock> = blocks
                        .iter()
                        .map(|(address, length)| MemoryBlock {
                            address: *address,
                            data: self.read_memory(*address, *length as usize).into(),
                        })
                        .collect();
                    self.protocol.respond_memory_read(&read)
                }
            }
            RequestData::MemoryWrite { blocks } => {
                if blocks
                    .iter()
                    .any(|(address, data)| self.write_refused(*address, data.len()))
                {
                    Response::empty(request.command, request.subfn, ResponseCode::InvalidRequest)
                } else {
                    let mut written = Vec::with_capacity(blocks.len());
                    for (address, data) in &blocks {
                        self.write_memory(*address, data);
                        written.push((*address, data.len() as u16));
                    }
                    self.protocol.respond_memory_write(&written)
                }
            }
            RequestData::MemoryWriteMasked { address, data, mask } => {
                if self.write_refused(address, data.len()) {
                    Response::empty(request.command, request.subfn, ResponseCode::InvalidRequest)
                } else {
                    let current = self.read_memory(address, data.len());
                    let merged: Vec<u8> = current
                        .iter()
                        .zip(data.iter().zip(mask.iter()))
                        .map(|(mem, (new, mask))| (new & mask) | (mem & !mask))
                        .collect();
                    self.write_memory(address, &merged);
                    self.protocol.respond_memory_write_masked(address, data.len() as u16)
                }
            }
            RequestData::ReadRpv { ids } => {
                if ids.iter().any(|id| !self.rpvs.contains_key(id)) {
                    Response::empty(request.command, request.subfn, ResponseCode::FailureToProceed)
                } else {
                    let values: Vec<(u16, Value)> =
                        ids.iter().map(|id| (*id, self.rpvs[id].1)).collect();
                    match self.protocol.respond_read_rpv(&values) {
                        Ok(response) => response,
                        Err(_) => Response::empty(request.command, request.subfn, ResponseCode::FailureToProceed),
                    }
                }
            }
            RequestData::WriteRpv { values } => {
                if values.iter().any(|(id, _)| !self.rpvs.contains_key(id)) {
                    Response::empty(request.command, request.subfn, ResponseCode::FailureToProceed)
                } else {
                    let mut ids = Vec::with_capacity(values.len());
                    for (id, value) in values {
                        self.write_rpv(id, value);
                        ids.push(id);
                    }
                    self.protocol.respond_write_rpv(&ids)
                }
            }

            RequestData::DatalogGetSetup => self.protocol.respond_datalog_get_setup(512, 0, 32),
            RequestData::DatalogConfigure { config_id, .. } => {
                self.datalog_config_id = config_id;
                self.datalogger_state = DataloggerState::Configured;
                Response::empty(request.command, request.subfn, ResponseCode::Ok)
            }
            RequestData::DatalogArmTrigger => {
                if matches!(
                    self.datalogger_state,
                    DataloggerState::Configured | DataloggerState::AcquisitionCompleted
                ) {
                    self.datalogger_state = DataloggerState::Armed;
                    self.acquisition_id = self.acquisition_id.wrapping_add(1);
                    Response::empty(request.command, request.subfn, ResponseCode::Ok)
                } else {
                    Response::empty(request.command, request.subfn, ResponseCode::FailureToProceed)
                }
            }
            RequestData::DatalogDisarmTrigger => {
                if matches!(
                    self.datalogger_state,
                    DataloggerState::Armed | DataloggerState::AcquisitionCompleted
                ) {
                    self.datalogger_state = DataloggerState::Configured;
                }
                Response::empty(request.command, request.subfn, ResponseCode::Ok)
            }
            RequestData::DatalogGetStatus => self.protocol.respond_datalog_get_status(self.datalogger_state),
            RequestData::DatalogGetAcquisitionMetadata => {
                if self.datalogger_state == DataloggerState::AcquisitionCompleted {
                    self.protocol.respond_datalog_acquisition_metadata(&AcquisitionMetadata {
                        acquisition_id: self.acquisition_id,
                        config_id: self.datalog_config_id,
                        nb_points: 0,
                        data_size: 0,
                        points_after_trigger: 0,
                    })
                } else {
                    Response::empty(request.command, request.subfn, ResponseCode::NoDataToReturn)
                }
            }
            RequestData::DatalogReadAcquisition => {
                if self.datalogger_state == DataloggerState::AcquisitionCompleted {
                    self.protocol.respond_datalog_read_acquisition(true, 0, self.acquisition_id, &[])
                } else {
                    Response::empty(request.command, request.subfn, ResponseCode::NoDataToReturn)
                }
            }

            RequestData::UserCommand { subfn, data } => {
                if self.features.user_command {
                    Response::new(Command::UserCommand, subfn, ResponseCode::Ok, data)
                } else {
                    Response::empty(Command::UserCommand, subfn, ResponseCode::UnsupportedFeature)
                }
            }
        };

        Some(response)
    }

    fn touches_forbidden(&self, address: u64, length: usize) -> bool {
        self.forbidden_regions.iter().any(|region| region.overlaps(address, length))
    }

    fn write_refused(&self, address: u64, length: usize) -> bool {
        self.touches_forbidden(address, length)
            || self.readonly_regions.iter().any(|region| region.overlaps(address, length))
            || !self.features.memory_write
    }
}
