//! Typed request builders and response parsers.
//!
//! [`Protocol`] turns operations into [`Request`]s and [`Response`]s into
//! typed data. It is address-size aware (the device declares how many bytes an
//! address occupies) and RPV-type aware (RPV payloads cannot be decoded
//! without the definitions gathered at connection time).

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::core::codecs;
use crate::core::error::{Result, ScrutinyError};
use crate::core::types::{EmbeddedDataType, Endianness, RuntimePublishedValue, Value};
use crate::protocol::commands::{
    Command, CommControlSubfn, DatalogControlSubfn, GetInfoSubfn, MemoryControlSubfn, MemoryRegionType,
};
use crate::protocol::request::Request;
use crate::protocol::response::{Response, ResponseCode};
use crate::protocol::{CONNECT_MAGIC, DISCOVER_MAGIC};

/// Wire size of one RPV definition: id (2) + type (1).
pub const RPV_DEFINITION_SIZE: usize = 3;

/// Communication parameters advertised by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommParams {
    /// Largest request frame the device can receive.
    pub max_rx_data_size: u16,
    /// Largest response frame the device can emit.
    pub max_tx_data_size: u16,
    /// Bitrate the server must not exceed. 0 means unlimited.
    pub max_bitrate_bps: u32,
    /// Session destruction delay without a heartbeat, in microseconds.
    pub heartbeat_timeout_us: u32,
    /// Device-side byte reassembly timeout, in microseconds.
    pub rx_timeout_us: u32,
    /// Bytes per memory address on this device.
    pub address_size_bytes: u8,
}

/// Feature switches advertised by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SupportedFeatures {
    pub memory_write: bool,
    pub datalogging: bool,
    pub user_command: bool,
    pub sixtyfour_bits: bool,
}

/// An address range advertised as special by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
}

impl MemoryRegion {
    /// Check if `[addr, addr+len)` touches this region.
    pub fn overlaps(&self, addr: u64, len: usize) -> bool {
        let last = addr.saturating_add(len.saturating_sub(1) as u64);
        len > 0 && addr <= self.end && last >= self.start
    }
}

/// Kind of firmware execution loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecLoopType {
    FixedFreq = 0,
    VariableFreq = 1,
}

/// A firmware execution loop able to service the datalogger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecLoop {
    pub name: String,
    pub loop_type: ExecLoopType,
    /// Tenths of Hz. Zero for variable-frequency loops.
    pub freq_x10: u32,
    pub datalogging_allowed: bool,
}

impl ExecLoop {
    /// Create a fixed-frequency loop descriptor.
    pub fn fixed_freq(name: impl Into<String>, freq_x10: u32) -> Self {
        Self {
            name: name.into(),
            loop_type: ExecLoopType::FixedFreq,
            freq_x10,
            datalogging_allowed: true,
        }
    }

    /// Create a variable-frequency loop descriptor.
    pub fn variable_freq(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            loop_type: ExecLoopType::VariableFreq,
            freq_x10: 0,
            datalogging_allowed: true,
        }
    }

    /// Disallow datalogging from this loop.
    #[must_use]
    pub fn without_datalogging(mut self) -> Self {
        self.datalogging_allowed = false;
        self
    }
}

/// Datalogger state byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataloggerState {
    Idle = 0,
    Configured = 1,
    Armed = 2,
    AcquisitionCompleted = 3,
    Error = 4,
}

impl DataloggerState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Idle),
            1 => Some(Self::Configured),
            2 => Some(Self::Armed),
            3 => Some(Self::AcquisitionCompleted),
            4 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Metadata of the acquisition currently held by the datalogger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionMetadata {
    pub acquisition_id: u16,
    pub config_id: u16,
    pub nb_points: u32,
    pub data_size: u32,
    pub points_after_trigger: u32,
}

/// A contiguous run of device memory.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryBlock {
    pub address: u64,
    pub data: Bytes,
}

/// Typed content of a parsed request (device side).
#[derive(Debug, Clone, PartialEq)]
pub enum RequestData {
    Discover { magic: [u8; 4] },
    Connect { magic: [u8; 4] },
    Heartbeat { session_id: u32, challenge: u16 },
    Disconnect { session_id: u32 },
    GetParams,
    GetProtocolVersion,
    GetSupportedFeatures,
    GetSpecialMemoryRegionCount,
    GetSpecialMemoryRegionLocation { region_type: MemoryRegionType, region_index: u8 },
    GetRpvCount,
    GetRpvDefinition { start: u16, count: u16 },
    GetLoopCount,
    GetLoopDefinition { loop_id: u8 },
    MemoryRead { blocks: Vec<(u64, u16)> },
    MemoryWrite { blocks: Vec<(u64, Bytes)> },
    MemoryWriteMasked { address: u64, data: Bytes, mask: Bytes },
    ReadRpv { ids: Vec<u16> },
    WriteRpv { values: Vec<(u16, Value)> },
    DatalogGetSetup,
    DatalogConfigure { config_id: u16, loop_id: u8, config: Bytes },
    DatalogArmTrigger,
    DatalogDisarmTrigger,
    DatalogGetStatus,
    DatalogGetAcquisitionMetadata,
    DatalogReadAcquisition,
    UserCommand { subfn: u8, data: Bytes },
}

/// Typed content of a parsed response (server side).
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    /// Non-OK responses and empty-payload responses carry no data.
    Empty,
    Discover {
        protocol_major: u8,
        protocol_minor: u8,
        firmware_id: [u8; 16],
        display_name: String,
    },
    Connect {
        magic: [u8; 4],
        session_id: u32,
    },
    Heartbeat {
        session_id: u32,
        challenge_response: u16,
    },
    GetParams(CommParams),
    ProtocolVersion {
        major: u8,
        minor: u8,
    },
    SupportedFeatures(SupportedFeatures),
    SpecialMemoryRegionCount {
        nbr_readonly: u8,
        nbr_forbidden: u8,
    },
    SpecialMemoryRegionLocation {
        region_type: MemoryRegionType,
        region_index: u8,
        region: MemoryRegion,
    },
    RpvCount {
        count: u16,
    },
    RpvDefinition {
        rpvs: Vec<RuntimePublishedValue>,
    },
    LoopCount {
        count: u8,
    },
    LoopDefinition {
        loop_id: u8,
        exec_loop: ExecLoop,
    },
    MemoryRead {
        blocks: Vec<MemoryBlock>,
    },
    MemoryWrite {
        blocks: Vec<(u64, u16)>,
    },
    ReadRpv {
        values: Vec<(u16, Value)>,
    },
    WriteRpv {
        ids: Vec<u16>,
    },
    DatalogSetup {
        buffer_size: u32,
        encoding: u8,
        max_signal_count: u8,
    },
    DatalogStatus {
        state: DataloggerState,
    },
    DatalogAcquisitionMetadata(AcquisitionMetadata),
    DatalogAcquisitionData {
        finished: bool,
        rolling_counter: u8,
        acquisition_id: u16,
        data: Bytes,
    },
    UserCommand {
        data: Bytes,
    },
}

/// Builder/parser for every protocol operation.
#[derive(Debug, Clone)]
pub struct Protocol {
    version_major: u8,
    version_minor: u8,
    address_size_bytes: u8,
    rpv_map: HashMap<u16, EmbeddedDataType>,
}

impl Protocol {
    /// Create a protocol for the given version, 32-bit addresses by default.
    pub fn new(version_major: u8, version_minor: u8) -> Self {
        Self {
            version_major,
            version_minor,
            address_size_bytes: 4,
            rpv_map: HashMap::new(),
        }
    }

    pub fn version_major(&self) -> u8 {
        self.version_major
    }

    pub fn version_minor(&self) -> u8 {
        self.version_minor
    }

    /// Set the device address size, from the comm params.
    pub fn set_address_size_bytes(&mut self, size: u8) -> Result<()> {
        match size {
            1 | 2 | 4 | 8 => {
                self.address_size_bytes = size;
                Ok(())
            }
            _ => Err(ScrutinyError::config(format!("unsupported address size: {} bytes", size))),
        }
    }

    pub fn address_size_bytes(&self) -> u8 {
        self.address_size_bytes
    }

    /// Teach the protocol the RPV definitions required to codec RPV payloads.
    pub fn configure_rpvs(&mut self, rpvs: &[RuntimePublishedValue]) {
        self.rpv_map = rpvs.iter().map(|rpv| (rpv.id, rpv.datatype)).collect();
    }

    /// Forget the RPV definitions (session teardown).
    pub fn clear_rpvs(&mut self) {
        self.rpv_map.clear();
    }

    /// Type of a known RPV.
    pub fn rpv_datatype(&self, id: u16) -> Option<EmbeddedDataType> {
        self.rpv_map.get(&id).copied()
    }

    fn put_address(&self, buf: &mut BytesMut, address: u64) {
        let be = address.to_be_bytes();
        buf.put_slice(&be[8 - self.address_size_bytes as usize..]);
    }

    fn get_address(&self, cursor: &mut &[u8]) -> Result<u64> {
        let size = self.address_size_bytes as usize;
        if cursor.len() < size {
            return Err(ScrutinyError::decode("payload too short for an address"));
        }
        let mut addr: u64 = 0;
        for _ in 0..size {
            addr = (addr << 8) | cursor.get_u8() as u64;
        }
        Ok(addr)
    }

    // ==================== Request builders ====================

    /// Broadcast probe for a listening device.
    pub fn comm_discover(&self) -> Request {
        Request::new(Command::CommControl, CommControlSubfn::Discover as u8, DISCOVER_MAGIC.to_vec())
            .with_response_payload_size(2 + 16 + 1 + 32)
    }

    /// Open a session.
    pub fn comm_connect(&self) -> Request {
        Request::new(Command::CommControl, CommControlSubfn::Connect as u8, CONNECT_MAGIC.to_vec())
            .with_response_payload_size(8)
    }

    /// Keep the session alive.
    pub fn comm_heartbeat(&self, session_id: u32, challenge: u16) -> Request {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u32(session_id);
        buf.put_u16(challenge);
        Request::new(Command::CommControl, CommControlSubfn::Heartbeat as u8, buf.freeze())
            .with_response_payload_size(6)
    }

    /// Tear the session down.
    pub fn comm_disconnect(&self, session_id: u32) -> Request {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(session_id);
        Request::new(Command::CommControl, CommControlSubfn::Disconnect as u8, buf.freeze())
    }

    /// Read the communication parameters.
    pub fn comm_get_params(&self) -> Request {
        Request::new(Command::CommControl, CommControlSubfn::GetParams as u8, Bytes::new())
            .with_response_payload_size(17)
    }

    /// Read the protocol version implemented by the device.
    pub fn get_protocol_version(&self) -> Request {
        Request::new(Command::GetInfo, GetInfoSubfn::GetProtocolVersion as u8, Bytes::new())
            .with_response_payload_size(2)
    }

    /// Read the feature switches.
    pub fn get_supported_features(&self) -> Request {
        Request::new(Command::GetInfo, GetInfoSubfn::GetSupportedFeatures as u8, Bytes::new())
            .with_response_payload_size(1)
    }

    /// Read how many readonly/forbidden regions the device declares.
    pub fn get_special_memory_region_count(&self) -> Request {
        Request::new(Command::GetInfo, GetInfoSubfn::GetSpecialMemoryRegionCount as u8, Bytes::new())
            .with_response_payload_size(2)
    }

    /// Read one special region location.
    pub fn get_special_memory_region_location(&self, region_type: MemoryRegionType, region_index: u8) -> Request {
        Request::new(
            Command::GetInfo,
            GetInfoSubfn::GetSpecialMemoryRegionLocation as u8,
            vec![region_type as u8, region_index],
        )
        .with_response_payload_size(2 + 2 * self.address_size_bytes as usize)
    }

    /// Read how many RPVs the device publishes.
    pub fn get_rpv_count(&self) -> Request {
        Request::new(Command::GetInfo, GetInfoSubfn::GetRuntimePublishedValuesCount as u8, Bytes::new())
            .with_response_payload_size(2)
    }

    /// Read a slice of the RPV definition table.
    pub fn get_rpv_definition(&self, start: u16, count: u16) -> Request {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u16(start);
        buf.put_u16(count);
        Request::new(Command::GetInfo, GetInfoSubfn::GetRuntimePublishedValuesDefinition as u8, buf.freeze())
            .with_response_payload_size(count as usize * RPV_DEFINITION_SIZE)
    }

    /// Read how many execution loops the firmware runs.
    pub fn get_loop_count(&self) -> Request {
        Request::new(Command::GetInfo, GetInfoSubfn::GetLoopCount as u8, Bytes::new()).with_response_payload_size(1)
    }

    /// Read one execution loop descriptor.
    pub fn get_loop_definition(&self, loop_id: u8) -> Request {
        Request::new(Command::GetInfo, GetInfoSubfn::GetLoopDefinition as u8, vec![loop_id])
            .with_response_payload_size(8 + 32)
    }

    /// Read a batch of memory blocks.
    pub fn memory_read(&self, blocks: &[(u64, u16)]) -> Request {
        let mut buf = BytesMut::with_capacity(blocks.len() * (self.address_size_bytes as usize + 2));
        let mut response_size = 0usize;
        for (address, length) in blocks {
            self.put_address(&mut buf, *address);
            buf.put_u16(*length);
            response_size += self.address_size_bytes as usize + *length as usize;
        }
        Request::new(Command::MemoryControl, MemoryControlSubfn::Read as u8, buf.freeze())
            .with_response_payload_size(response_size)
    }

    /// Write a batch of memory blocks.
    pub fn memory_write(&self, blocks: &[(u64, &[u8])]) -> Request {
        let mut buf = BytesMut::new();
        let mut response_size = 0usize;
        for (address, data) in blocks {
            self.put_address(&mut buf, *address);
            buf.put_u16(data.len() as u16);
            buf.put_slice(data);
            response_size += self.address_size_bytes as usize + 2;
        }
        Request::new(Command::MemoryControl, MemoryControlSubfn::Write as u8, buf.freeze())
            .with_response_payload_size(response_size)
    }

    /// Write one memory block through a bit mask.
    pub fn memory_write_masked(&self, address: u64, data: &[u8], mask: &[u8]) -> Request {
        let mut buf = BytesMut::with_capacity(self.address_size_bytes as usize + 2 + data.len() + mask.len());
        self.put_address(&mut buf, address);
        buf.put_u16(data.len() as u16);
        buf.put_slice(data);
        buf.put_slice(mask);
        Request::new(Command::MemoryControl, MemoryControlSubfn::WriteMasked as u8, buf.freeze())
            .with_response_payload_size(self.address_size_bytes as usize + 2)
    }

    /// Read a batch of RPVs. Ids must be known to the protocol.
    pub fn read_rpv(&self, ids: &[u16]) -> Result<Request> {
        let mut buf = BytesMut::with_capacity(ids.len() * 2);
        let mut response_size = 0usize;
        for id in ids {
            let datatype = self
                .rpv_datatype(*id)
                .ok_or_else(|| ScrutinyError::protocol(format!("RPV 0x{:04X} is not defined", id)))?;
            buf.put_u16(*id);
            response_size += 2 + datatype.size_bytes();
        }
        Ok(Request::new(Command::MemoryControl, MemoryControlSubfn::ReadRpv as u8, buf.freeze())
            .with_response_payload_size(response_size))
    }

    /// Write a batch of RPVs. Values travel big-endian.
    pub fn write_rpv(&self, values: &[(u16, Value)]) -> Result<Request> {
        let mut buf = BytesMut::new();
        for (id, value) in values {
            let datatype = self
                .rpv_datatype(*id)
                .ok_or_else(|| ScrutinyError::protocol(format!("RPV 0x{:04X} is not defined", id)))?;
            let encoded = codecs::encode(value, datatype, Endianness::Big)?;
            buf.put_u16(*id);
            buf.put_slice(&encoded);
        }
        Ok(Request::new(Command::MemoryControl, MemoryControlSubfn::WriteRpv as u8, buf.freeze())
            .with_response_payload_size(values.len() * 2))
    }

    /// Read the datalogger buffer setup.
    pub fn datalog_get_setup(&self) -> Request {
        Request::new(Command::DatalogControl, DatalogControlSubfn::GetSetup as u8, Bytes::new())
            .with_response_payload_size(6)
    }

    /// Push an acquisition configuration. The configuration block is opaque
    /// to the core.
    pub fn datalog_configure(&self, config_id: u16, loop_id: u8, config: &[u8]) -> Request {
        let mut buf = BytesMut::with_capacity(3 + config.len());
        buf.put_u16(config_id);
        buf.put_u8(loop_id);
        buf.put_slice(config);
        Request::new(Command::DatalogControl, DatalogControlSubfn::Configure as u8, buf.freeze())
    }

    /// Arm the datalogger trigger.
    pub fn datalog_arm_trigger(&self) -> Request {
        Request::new(Command::DatalogControl, DatalogControlSubfn::ArmTrigger as u8, Bytes::new())
    }

    /// Disarm the datalogger trigger.
    pub fn datalog_disarm_trigger(&self) -> Request {
        Request::new(Command::DatalogControl, DatalogControlSubfn::DisarmTrigger as u8, Bytes::new())
    }

    /// Read the datalogger state.
    pub fn datalog_get_status(&self) -> Request {
        Request::new(Command::DatalogControl, DatalogControlSubfn::GetStatus as u8, Bytes::new())
            .with_response_payload_size(1)
    }

    /// Read the metadata of the completed acquisition.
    pub fn datalog_get_acquisition_metadata(&self) -> Request {
        Request::new(Command::DatalogControl, DatalogControlSubfn::GetAcquisitionMetadata as u8, Bytes::new())
            .with_response_payload_size(16)
    }

    /// Read a chunk of the completed acquisition.
    pub fn datalog_read_acquisition(&self) -> Request {
        Request::new(Command::DatalogControl, DatalogControlSubfn::ReadAcquisition as u8, Bytes::new())
    }

    /// Opaque passthrough request.
    pub fn user_command(&self, subfn: u8, data: &[u8]) -> Request {
        Request::new(Command::UserCommand, subfn, data.to_vec())
    }

    // ==================== Request parsing (device side) ====================

    /// Parse a request payload into typed data.
    pub fn parse_request(&self, request: &Request) -> Result<RequestData> {
        let payload: &[u8] = &request.payload;
        match request.command {
            Command::CommControl => self.parse_comm_control_request(request.subfn, payload),
            Command::GetInfo => self.parse_get_info_request(request.subfn, payload),
            Command::MemoryControl => self.parse_memory_control_request(request.subfn, payload),
            Command::DatalogControl => self.parse_datalog_control_request(request.subfn, payload),
            Command::UserCommand => Ok(RequestData::UserCommand {
                subfn: request.subfn,
                data: request.payload.clone(),
            }),
            Command::Dummy => Ok(RequestData::UserCommand {
                subfn: request.subfn,
                data: request.payload.clone(),
            }),
        }
    }

    fn parse_comm_control_request(&self, subfn: u8, mut payload: &[u8]) -> Result<RequestData> {
        let subfn = CommControlSubfn::from_u8(subfn)
            .ok_or_else(|| ScrutinyError::protocol(format!("unknown CommControl subfunction {}", subfn)))?;
        match subfn {
            CommControlSubfn::Discover => {
                let magic = take_magic(&mut payload)?;
                Ok(RequestData::Discover { magic })
            }
            CommControlSubfn::Connect => {
                let magic = take_magic(&mut payload)?;
                Ok(RequestData::Connect { magic })
            }
            CommControlSubfn::Heartbeat => {
                check_len(payload, 6)?;
                Ok(RequestData::Heartbeat {
                    session_id: payload.get_u32(),
                    challenge: payload.get_u16(),
                })
            }
            CommControlSubfn::Disconnect => {
                check_len(payload, 4)?;
                Ok(RequestData::Disconnect {
                    session_id: payload.get_u32(),
                })
            }
            CommControlSubfn::GetParams => Ok(RequestData::GetParams),
        }
    }

    fn parse_get_info_request(&self, subfn: u8, mut payload: &[u8]) -> Result<RequestData> {
        let subfn = GetInfoSubfn::from_u8(subfn)
            .ok_or_else(|| ScrutinyError::protocol(format!("unknown GetInfo subfunction {}", subfn)))?;
        match subfn {
            GetInfoSubfn::GetProtocolVersion => Ok(RequestData::GetProtocolVersion),
            GetInfoSubfn::GetSupportedFeatures => Ok(RequestData::GetSupportedFeatures),
            GetInfoSubfn::GetSpecialMemoryRegionCount => Ok(RequestData::GetSpecialMemoryRegionCount),
            GetInfoSubfn::GetSpecialMemoryRegionLocation => {
                check_len(payload, 2)?;
                let region_type = MemoryRegionType::from_u8(payload.get_u8())
                    .ok_or_else(|| ScrutinyError::decode("unknown memory region type"))?;
                Ok(RequestData::GetSpecialMemoryRegionLocation {
                    region_type,
                    region_index: payload.get_u8(),
                })
            }
            GetInfoSubfn::GetRuntimePublishedValuesCount => Ok(RequestData::GetRpvCount),
            GetInfoSubfn::GetRuntimePublishedValuesDefinition => {
                check_len(payload, 4)?;
                Ok(RequestData::GetRpvDefinition {
                    start: payload.get_u16(),
                    count: payload.get_u16(),
                })
            }
            GetInfoSubfn::GetLoopCount => Ok(RequestData::GetLoopCount),
            GetInfoSubfn::GetLoopDefinition => {
                check_len(payload, 1)?;
                Ok(RequestData::GetLoopDefinition {
                    loop_id: payload.get_u8(),
                })
            }
        }
    }

    fn parse_memory_control_request(&self, subfn: u8, mut payload: &[u8]) -> Result<RequestData> {
        let subfn = MemoryControlSubfn::from_u8(subfn)
            .ok_or_else(|| ScrutinyError::protocol(format!("unknown MemoryControl subfunction {}", subfn)))?;
        match subfn {
            MemoryControlSubfn::Read => {
                let mut blocks = Vec::new();
                while !payload.is_empty() {
                    let address = self.get_address(&mut payload)?;
                    check_remaining(payload, 2)?;
                    blocks.push((address, payload.get_u16()));
                }
                Ok(RequestData::MemoryRead { blocks })
            }
            MemoryControlSubfn::Write => {
                let mut blocks = Vec::new();
                while !payload.is_empty() {
                    let address = self.get_address(&mut payload)?;
                    check_remaining(payload, 2)?;
                    let length = payload.get_u16() as usize;
                    check_remaining(payload, length)?;
                    blocks.push((address, Bytes::copy_from_slice(&payload[..length])));
                    payload.advance(length);
                }
                Ok(RequestData::MemoryWrite { blocks })
            }
            MemoryControlSubfn::WriteMasked => {
                let address = self.get_address(&mut payload)?;
                check_remaining(payload, 2)?;
                let length = payload.get_u16() as usize;
                check_len(payload, length * 2)?;
                Ok(RequestData::MemoryWriteMasked {
                    address,
                    data: Bytes::copy_from_slice(&payload[..length]),
                    mask: Bytes::copy_from_slice(&payload[length..length * 2]),
                })
            }
            MemoryControlSubfn::ReadRpv => {
                if payload.len() % 2 != 0 {
                    return Err(ScrutinyError::decode("odd ReadRPV payload length"));
                }
                let mut ids = Vec::with_capacity(payload.len() / 2);
                while !payload.is_empty() {
                    ids.push(payload.get_u16());
                }
                Ok(RequestData::ReadRpv { ids })
            }
            MemoryControlSubfn::WriteRpv => {
                let mut values = Vec::new();
                while !payload.is_empty() {
                    check_remaining(payload, 2)?;
                    let id = payload.get_u16();
                    let datatype = self
                        .rpv_datatype(id)
                        .ok_or_else(|| ScrutinyError::protocol(format!("RPV 0x{:04X} is not defined", id)))?;
                    let size = datatype.size_bytes();
                    check_remaining(payload, size)?;
                    let value = codecs::decode(&payload[..size], datatype, Endianness::Big)?;
                    payload.advance(size);
                    values.push((id, value));
                }
                Ok(RequestData::WriteRpv { values })
            }
        }
    }

    fn parse_datalog_control_request(&self, subfn: u8, mut payload: &[u8]) -> Result<RequestData> {
        let subfn = DatalogControlSubfn::from_u8(subfn)
            .ok_or_else(|| ScrutinyError::protocol(format!("unknown DatalogControl subfunction {}", subfn)))?;
        match subfn {
            DatalogControlSubfn::GetSetup => Ok(RequestData::DatalogGetSetup),
            DatalogControlSubfn::Configure => {
                check_remaining(payload, 3)?;
                let config_id = payload.get_u16();
                let loop_id = payload.get_u8();
                Ok(RequestData::DatalogConfigure {
                    config_id,
                    loop_id,
                    config: Bytes::copy_from_slice(payload),
                })
            }
            DatalogControlSubfn::ArmTrigger => Ok(RequestData::DatalogArmTrigger),
            DatalogControlSubfn::DisarmTrigger => Ok(RequestData::DatalogDisarmTrigger),
            DatalogControlSubfn::GetStatus => Ok(RequestData::DatalogGetStatus),
            DatalogControlSubfn::GetAcquisitionMetadata => Ok(RequestData::DatalogGetAcquisitionMetadata),
            DatalogControlSubfn::ReadAcquisition => Ok(RequestData::DatalogReadAcquisition),
        }
    }

    // ==================== Response builders (device side) ====================

    /// Answer a Discover probe.
    pub fn respond_comm_discover(&self, firmware_id: &[u8; 16], display_name: &str) -> Response {
        let name = display_name.as_bytes();
        let name_len = name.len().min(255);
        let mut buf = BytesMut::with_capacity(2 + 16 + 1 + name_len);
        buf.put_u8(self.version_major);
        buf.put_u8(self.version_minor);
        buf.put_slice(firmware_id);
        buf.put_u8(name_len as u8);
        buf.put_slice(&name[..name_len]);
        Response::new(Command::CommControl, CommControlSubfn::Discover as u8, ResponseCode::Ok, buf.freeze())
    }

    /// Answer a Connect request with a fresh session id.
    pub fn respond_comm_connect(&self, session_id: u32) -> Response {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_slice(&CONNECT_MAGIC);
        buf.put_u32(session_id);
        Response::new(Command::CommControl, CommControlSubfn::Connect as u8, ResponseCode::Ok, buf.freeze())
    }

    /// Answer a Heartbeat request.
    pub fn respond_comm_heartbeat(&self, session_id: u32, challenge_response: u16) -> Response {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u32(session_id);
        buf.put_u16(challenge_response);
        Response::new(Command::CommControl, CommControlSubfn::Heartbeat as u8, ResponseCode::Ok, buf.freeze())
    }

    /// Answer a Disconnect request.
    pub fn respond_comm_disconnect(&self) -> Response {
        Response::empty(Command::CommControl, CommControlSubfn::Disconnect as u8, ResponseCode::Ok)
    }

    /// Answer a GetParams request.
    pub fn respond_comm_get_params(&self, params: &CommParams) -> Response {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u16(params.max_rx_data_size);
        buf.put_u16(params.max_tx_data_size);
        buf.put_u32(params.max_bitrate_bps);
        buf.put_u32(params.heartbeat_timeout_us);
        buf.put_u32(params.rx_timeout_us);
        buf.put_u8(params.address_size_bytes);
        Response::new(Command::CommControl, CommControlSubfn::GetParams as u8, ResponseCode::Ok, buf.freeze())
    }

    /// Answer a GetProtocolVersion request.
    pub fn respond_protocol_version(&self, major: u8, minor: u8) -> Response {
        Response::new(Command::GetInfo, GetInfoSubfn::GetProtocolVersion as u8, ResponseCode::Ok, vec![major, minor])
    }

    /// Answer a GetSupportedFeatures request.
    pub fn respond_supported_features(&self, features: &SupportedFeatures) -> Response {
        let mut byte = 0u8;
        if features.memory_write {
            byte |= 0x80;
        }
        if features.datalogging {
            byte |= 0x40;
        }
        if features.user_command {
            byte |= 0x20;
        }
        if features.sixtyfour_bits {
            byte |= 0x10;
        }
        Response::new(Command::GetInfo, GetInfoSubfn::GetSupportedFeatures as u8, ResponseCode::Ok, vec![byte])
    }

    /// Answer a GetSpecialMemoryRegionCount request.
    pub fn respond_special_memory_region_count(&self, nbr_readonly: u8, nbr_forbidden: u8) -> Response {
        Response::new(
            Command::GetInfo,
            GetInfoSubfn::GetSpecialMemoryRegionCount as u8,
            ResponseCode::Ok,
            vec![nbr_readonly, nbr_forbidden],
        )
    }

    /// Answer a GetSpecialMemoryRegionLocation request.
    pub fn respond_special_memory_region_location(
        &self,
        region_type: MemoryRegionType,
        region_index: u8,
        region: &MemoryRegion,
    ) -> Response {
        let mut buf = BytesMut::with_capacity(2 + 2 * self.address_size_bytes as usize);
        buf.put_u8(region_type as u8);
        buf.put_u8(region_index);
        self.put_address(&mut buf, region.start);
        self.put_address(&mut buf, region.end);
        Response::new(
            Command::GetInfo,
            GetInfoSubfn::GetSpecialMemoryRegionLocation as u8,
            ResponseCode::Ok,
            buf.freeze(),
        )
    }

    /// Answer a GetRuntimePublishedValuesCount request.
    pub fn respond_rpv_count(&self, count: u16) -> Response {
        let mut buf = BytesMut::with_capacity(2);
        buf.put_u16(count);
        Response::new(
            Command::GetInfo,
            GetInfoSubfn::GetRuntimePublishedValuesCount as u8,
            ResponseCode::Ok,
            buf.freeze(),
        )
    }

    /// Answer a GetRuntimePublishedValuesDefinition request.
    pub fn respond_rpv_definition(&self, rpvs: &[RuntimePublishedValue]) -> Response {
        let mut buf = BytesMut::with_capacity(rpvs.len() * RPV_DEFINITION_SIZE);
        for rpv in rpvs {
            buf.put_u16(rpv.id);
            buf.put_u8(rpv.datatype.to_wire());
        }
        Response::new(
            Command::GetInfo,
            GetInfoSubfn::GetRuntimePublishedValuesDefinition as u8,
            ResponseCode::Ok,
            buf.freeze(),
        )
    }

    /// Answer a GetLoopCount request.
    pub fn respond_loop_count(&self, count: u8) -> Response {
        Response::new(Command::GetInfo, GetInfoSubfn::GetLoopCount as u8, ResponseCode::Ok, vec![count])
    }

    /// Answer a GetLoopDefinition request.
    pub fn respond_loop_definition(&self, loop_id: u8, exec_loop: &ExecLoop) -> Response {
        let name = exec_loop.name.as_bytes();
        let name_len = name.len().min(255);
        let mut buf = BytesMut::with_capacity(8 + name_len);
        buf.put_u8(loop_id);
        buf.put_u8(exec_loop.loop_type as u8);
        buf.put_u8(exec_loop.datalogging_allowed as u8);
        buf.put_u32(exec_loop.freq_x10);
        buf.put_u8(name_len as u8);
        buf.put_slice(&name[..name_len]);
        Response::new(Command::GetInfo, GetInfoSubfn::GetLoopDefinition as u8, ResponseCode::Ok, buf.freeze())
    }

    /// Answer a memory Read request.
    pub fn respond_memory_read(&self, blocks: &[MemoryBlock]) -> Response {
        let mut buf = BytesMut::new();
        for block in blocks {
            self.put_address(&mut buf, block.address);
            buf.put_slice(&block.data);
        }
        Response::new(Command::MemoryControl, MemoryControlSubfn::Read as u8, ResponseCode::Ok, buf.freeze())
    }

    /// Answer a memory Write request.
    pub fn respond_memory_write(&self, blocks: &[(u64, u16)]) -> Response {
        let mut buf = BytesMut::new();
        for (address, length) in blocks {
            self.put_address(&mut buf, *address);
            buf.put_u16(*length);
        }
        Response::new(Command::MemoryControl, MemoryControlSubfn::Write as u8, ResponseCode::Ok, buf.freeze())
    }

    /// Answer a WriteMasked request.
    pub fn respond_memory_write_masked(&self, address: u64, length: u16) -> Response {
        let mut buf = BytesMut::new();
        self.put_address(&mut buf, address);
        buf.put_u16(length);
        Response::new(Command::MemoryControl, MemoryControlSubfn::WriteMasked as u8, ResponseCode::Ok, buf.freeze())
    }

    /// Answer a ReadRPV request. Values travel big-endian.
    pub fn respond_read_rpv(&self, values: &[(u16, Value)]) -> Result<Response> {
        let mut buf = BytesMut::new();
        for (id, value) in values {
            let datatype = self
                .rpv_datatype(*id)
                .ok_or_else(|| ScrutinyError::protocol(format!("RPV 0x{:04X} is not defined", id)))?;
            buf.put_u16(*id);
            buf.put_slice(&codecs::encode(value, datatype, Endianness::Big)?);
        }
        Ok(Response::new(Command::MemoryControl, MemoryControlSubfn::ReadRpv as u8, ResponseCode::Ok, buf.freeze()))
    }

    /// Answer a WriteRPV request.
    pub fn respond_write_rpv(&self, ids: &[u16]) -> Response {
        let mut buf = BytesMut::with_capacity(ids.len() * 2);
        for id in ids {
            buf.put_u16(*id);
        }
        Response::new(Command::MemoryControl, MemoryControlSubfn::WriteRpv as u8, ResponseCode::Ok, buf.freeze())
    }

    /// Answer a datalog GetSetup request.
    pub fn respond_datalog_get_setup(&self, buffer_size: u32, encoding: u8, max_signal_count: u8) -> Response {
        let mut buf = BytesMut::with_capacity(6);
        buf.put_u32(buffer_size);
        buf.put_u8(encoding);
        buf.put_u8(max_signal_count);
        Response::new(Command::DatalogControl, DatalogControlSubfn::GetSetup as u8, ResponseCode::Ok, buf.freeze())
    }

    /// Answer a datalog GetStatus request.
    pub fn respond_datalog_get_status(&self, state: DataloggerState) -> Response {
        Response::new(Command::DatalogControl, DatalogControlSubfn::GetStatus as u8, ResponseCode::Ok, vec![state as u8])
    }

    /// Answer a datalog GetAcquisitionMetadata request.
    pub fn respond_datalog_acquisition_metadata(&self, metadata: &AcquisitionMetadata) -> Response {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u16(metadata.acquisition_id);
        buf.put_u16(metadata.config_id);
        buf.put_u32(metadata.nb_points);
        buf.put_u32(metadata.data_size);
        buf.put_u32(metadata.points_after_trigger);
        Response::new(
            Command::DatalogControl,
            DatalogControlSubfn::GetAcquisitionMetadata as u8,
            ResponseCode::Ok,
            buf.freeze(),
        )
    }

    /// Answer a datalog ReadAcquisition request.
    pub fn respond_datalog_read_acquisition(
        &self,
        finished: bool,
        rolling_counter: u8,
        acquisition_id: u16,
        data: &[u8],
    ) -> Response {
        let mut buf = BytesMut::with_capacity(4 + data.len());
        buf.put_u8(finished as u8);
        buf.put_u8(rolling_counter);
        buf.put_u16(acquisition_id);
        buf.put_slice(data);
        Response::new(
            Command::DatalogControl,
            DatalogControlSubfn::ReadAcquisition as u8,
            ResponseCode::Ok,
            buf.freeze(),
        )
    }

    // ==================== Response parsing (server side) ====================

    /// Parse a response against the request that produced it.
    ///
    /// Non-OK responses parse to [`ResponseData::Empty`]; checking the code is
    /// the caller's concern. The request provides the context some payloads
    /// need (memory read block lengths come from the request).
    pub fn parse_response(&self, request: &Request, response: &Response) -> Result<ResponseData> {
        if response.command != request.command {
            return Err(ScrutinyError::protocol(format!(
                "response command {} does not match request command {}",
                response.command, request.command
            )));
        }
        if response.subfn != request.subfn {
            return Err(ScrutinyError::protocol(format!(
                "response subfunction {} does not match request subfunction {}",
                response.subfn, request.subfn
            )));
        }
        if response.code != ResponseCode::Ok {
            return Ok(ResponseData::Empty);
        }

        let payload: &[u8] = &response.payload;
        match response.command {
            Command::CommControl => self.parse_comm_control_response(response.subfn, payload),
            Command::GetInfo => self.parse_get_info_response(response.subfn, payload),
            Command::MemoryControl => self.parse_memory_control_response(request, response.subfn, payload),
            Command::DatalogControl => self.parse_datalog_control_response(response.subfn, payload),
            Command::UserCommand => Ok(ResponseData::UserCommand {
                data: response.payload.clone(),
            }),
            Command::Dummy => Ok(ResponseData::Empty),
        }
    }

    fn parse_comm_control_response(&self, subfn: u8, mut payload: &[u8]) -> Result<ResponseData> {
        let subfn = CommControlSubfn::from_u8(subfn)
            .ok_or_else(|| ScrutinyError::protocol(format!("unknown CommControl subfunction {}", subfn)))?;
        match subfn {
            CommControlSubfn::Discover => {
                check_remaining(payload, 2 + 16 + 1)?;
                let protocol_major = payload.get_u8();
                let protocol_minor = payload.get_u8();
                let mut firmware_id = [0u8; 16];
                payload.copy_to_slice(&mut firmware_id);
                let name_len = payload.get_u8() as usize;
                check_len(payload, name_len)?;
                let display_name = String::from_utf8_lossy(&payload[..name_len]).into_owned();
                Ok(ResponseData::Discover {
                    protocol_major,
                    protocol_minor,
                    firmware_id,
                    display_name,
                })
            }
            CommControlSubfn::Connect => {
                check_len(payload, 8)?;
                let mut magic = [0u8; 4];
                payload.copy_to_slice(&mut magic);
                if magic != CONNECT_MAGIC {
                    return Err(ScrutinyError::protocol("connect response magic mismatch"));
                }
                Ok(ResponseData::Connect {
                    magic,
                    session_id: payload.get_u32(),
                })
            }
            CommControlSubfn::Heartbeat => {
                check_len(payload, 6)?;
                Ok(ResponseData::Heartbeat {
                    session_id: payload.get_u32(),
                    challenge_response: payload.get_u16(),
                })
            }
            CommControlSubfn::Disconnect => Ok(ResponseData::Empty),
            CommControlSubfn::GetParams => {
                check_len(payload, 17)?;
                Ok(ResponseData::GetParams(CommParams {
                    max_rx_data_size: payload.get_u16(),
                    max_tx_data_size: payload.get_u16(),
                    max_bitrate_bps: payload.get_u32(),
                    heartbeat_timeout_us: payload.get_u32(),
                    rx_timeout_us: payload.get_u32(),
                    address_size_bytes: payload.get_u8(),
                }))
            }
        }
    }

    fn parse_get_info_response(&self, subfn: u8, mut payload: &[u8]) -> Result<ResponseData> {
        let subfn = GetInfoSubfn::from_u8(subfn)
            .ok_or_else(|| ScrutinyError::protocol(format!("unknown GetInfo subfunction {}", subfn)))?;
        match subfn {
            GetInfoSubfn::GetProtocolVersion => {
                check_len(payload, 2)?;
                Ok(ResponseData::ProtocolVersion {
                    major: payload.get_u8(),
                    minor: payload.get_u8(),
                })
            }
            GetInfoSubfn::GetSupportedFeatures => {
                check_len(payload, 1)?;
                let byte = payload.get_u8();
                Ok(ResponseData::SupportedFeatures(SupportedFeatures {
                    memory_write: byte & 0x80 != 0,
                    datalogging: byte & 0x40 != 0,
                    user_command: byte & 0x20 != 0,
                    sixtyfour_bits: byte & 0x10 != 0,
                }))
            }
            GetInfoSubfn::GetSpecialMemoryRegionCount => {
                check_len(payload, 2)?;
                Ok(ResponseData::SpecialMemoryRegionCount {
                    nbr_readonly: payload.get_u8(),
                    nbr_forbidden: payload.get_u8(),
                })
            }
            GetInfoSubfn::GetSpecialMemoryRegionLocation => {
                check_len(payload, 2 + 2 * self.address_size_bytes as usize)?;
                let region_type = MemoryRegionType::from_u8(payload.get_u8())
                    .ok_or_else(|| ScrutinyError::decode("unknown memory region type"))?;
                let region_index = payload.get_u8();
                let start = self.get_address(&mut payload)?;
                let end = self.get_address(&mut payload)?;
                Ok(ResponseData::SpecialMemoryRegionLocation {
                    region_type,
                    region_index,
                    region: MemoryRegion { start, end },
                })
            }
            GetInfoSubfn::GetRuntimePublishedValuesCount => {
                check_len(payload, 2)?;
                Ok(ResponseData::RpvCount {
                    count: payload.get_u16(),
                })
            }
            GetInfoSubfn::GetRuntimePublishedValuesDefinition => {
                if payload.len() % RPV_DEFINITION_SIZE != 0 {
                    return Err(ScrutinyError::decode("RPV definition payload length is not a multiple of 3"));
                }
                let mut rpvs = Vec::with_capacity(payload.len() / RPV_DEFINITION_SIZE);
                while !payload.is_empty() {
                    let id = payload.get_u16();
                    let type_byte = payload.get_u8();
                    let datatype = EmbeddedDataType::from_wire(type_byte).ok_or_else(|| {
                        ScrutinyError::decode(format!("unknown datatype 0x{:02X} for RPV 0x{:04X}", type_byte, id))
                    })?;
                    rpvs.push(RuntimePublishedValue::new(id, datatype));
                }
                Ok(ResponseData::RpvDefinition { rpvs })
            }
            GetInfoSubfn::GetLoopCount => {
                check_len(payload, 1)?;
                Ok(ResponseData::LoopCount {
                    count: payload.get_u8(),
                })
            }
            GetInfoSubfn::GetLoopDefinition => {
                check_remaining(payload, 8)?;
                let loop_id = payload.get_u8();
                let type_byte = payload.get_u8();
                let datalogging_allowed = payload.get_u8() != 0;
                let freq_x10 = payload.get_u32();
                let name_len = payload.get_u8() as usize;
                check_len(payload, name_len)?;
                let name = String::from_utf8_lossy(&payload[..name_len]).into_owned();
                let loop_type = match type_byte {
                    0 => ExecLoopType::FixedFreq,
                    1 => ExecLoopType::VariableFreq,
                    _ => return Err(ScrutinyError::decode(format!("unknown loop type {}", type_byte))),
                };
                Ok(ResponseData::LoopDefinition {
                    loop_id,
                    exec_loop: ExecLoop {
                        name,
                        loop_type,
                        freq_x10,
                        datalogging_allowed,
                    },
                })
            }
        }
    }

    fn parse_memory_control_response(&self, request: &Request, subfn: u8, mut payload: &[u8]) -> Result<ResponseData> {
        let subfn = MemoryControlSubfn::from_u8(subfn)
            .ok_or_else(|| ScrutinyError::protocol(format!("unknown MemoryControl subfunction {}", subfn)))?;
        match subfn {
            MemoryControlSubfn::Read => {
                // Block lengths are not echoed; recover them from the request.
                let requested = match self.parse_request(request)? {
                    RequestData::MemoryRead { blocks } => blocks,
                    _ => return Err(ScrutinyError::internal("memory read response matched against a non-read request")),
                };
                let mut blocks = Vec::with_capacity(requested.len());
                for (expected_address, length) in requested {
                    let address = self.get_address(&mut payload)?;
                    if address != expected_address {
                        return Err(ScrutinyError::protocol(format!(
                            "memory read response block address 0x{:X} does not match requested 0x{:X}",
                            address, expected_address
                        )));
                    }
                    check_remaining(payload, length as usize)?;
                    blocks.push(MemoryBlock {
                        address,
                        data: Bytes::copy_from_slice(&payload[..length as usize]),
                    });
                    payload.advance(length as usize);
                }
                if !payload.is_empty() {
                    return Err(ScrutinyError::decode("trailing bytes in memory read response"));
                }
                Ok(ResponseData::MemoryRead { blocks })
            }
            MemoryControlSubfn::Write | MemoryControlSubfn::WriteMasked => {
                let mut blocks = Vec::new();
                while !payload.is_empty() {
                    let address = self.get_address(&mut payload)?;
                    check_remaining(payload, 2)?;
                    blocks.push((address, payload.get_u16()));
                }
                Ok(ResponseData::MemoryWrite { blocks })
            }
            MemoryControlSubfn::ReadRpv => {
                let mut values = Vec::new();
                while !payload.is_empty() {
                    check_remaining(payload, 2)?;
                    let id = payload.get_u16();
                    let datatype = self
                        .rpv_datatype(id)
                        .ok_or_else(|| ScrutinyError::protocol(format!("RPV 0x{:04X} is not defined", id)))?;
                    let size = datatype.size_bytes();
                    check_remaining(payload, size)?;
                    values.push((id, codecs::decode(&payload[..size], datatype, Endianness::Big)?));
                    payload.advance(size);
                }
                Ok(ResponseData::ReadRpv { values })
            }
            MemoryControlSubfn::WriteRpv => {
                if payload.len() % 2 != 0 {
                    return Err(ScrutinyError::decode("odd WriteRPV response payload length"));
                }
                let mut ids = Vec::with_capacity(payload.len() / 2);
                while !payload.is_empty() {
                    ids.push(payload.get_u16());
                }
                Ok(ResponseData::WriteRpv { ids })
            }
        }
    }

    fn parse_datalog_control_response(&self, subfn: u8, mut payload: &[u8]) -> Result<ResponseData> {
        let subfn = DatalogControlSubfn::from_u8(subfn)
            .ok_or_else(|| ScrutinyError::protocol(format!("unknown DatalogControl subfunction {}", subfn)))?;
        match subfn {
            DatalogControlSubfn::GetSetup => {
                check_len(payload, 6)?;
                Ok(ResponseData::DatalogSetup {
                    buffer_size: payload.get_u32(),
                    encoding: payload.get_u8(),
                    max_signal_count: payload.get_u8(),
                })
            }
            DatalogControlSubfn::Configure
            | DatalogControlSubfn::ArmTrigger
            | DatalogControlSubfn::DisarmTrigger => Ok(ResponseData::Empty),
            DatalogControlSubfn::GetStatus => {
                check_len(payload, 1)?;
                let byte = payload.get_u8();
                let state = DataloggerState::from_u8(byte)
                    .ok_or_else(|| ScrutinyError::decode(format!("unknown datalogger state {}", byte)))?;
                Ok(ResponseData::DatalogStatus { state })
            }
            DatalogControlSubfn::GetAcquisitionMetadata => {
                check_len(payload, 16)?;
                Ok(ResponseData::DatalogAcquisitionMetadata(AcquisitionMetadata {
                    acquisition_id: payload.get_u16(),
                    config_id: payload.get_u16(),
                    nb_points: payload.get_u32(),
                    data_size: payload.get_u32(),
                    points_after_trigger: payload.get_u32(),
                }))
            }
            DatalogControlSubfn::ReadAcquisition => {
                check_remaining(payload, 4)?;
                let finished = payload.get_u8() != 0;
                let rolling_counter = payload.get_u8();
                let acquisition_id = payload.get_u16();
                Ok(ResponseData::DatalogAcquisitionData {
                    finished,
                    rolling_counter,
                    acquisition_id,
                    data: Bytes::copy_from_slice(payload),
                })
            }
        }
    }
}

fn check_len(payload: &[u8], expected: usize) -> Result<()> {
    if payload.len() != expected {
        return Err(ScrutinyError::decode(format!(
            "payload length mismatch: expected {} bytes, got {}",
            expected,
            payload.len()
        )));
    }
    Ok(())
}

fn check_remaining(payload: &[u8], needed: usize) -> Result<()> {
    if payload.len() < needed {
        return Err(ScrutinyError::decode(format!(
            "payload truncated: {} bytes remaining, {} needed",
            payload.len(),
            needed
        )));
    }
    Ok(())
}

fn take_magic(payload: &mut &[u8]) -> Result<[u8; 4]> {
    check_len(payload, 4)?;
    let mut magic = [0u8; 4];
    payload.copy_to_slice(&mut magic);
    Ok(magic)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol() -> Protocol {
        Protocol::new(1, 0)
    }

    #[test]
    fn test_discover_roundtrip() {
        let proto = protocol();
        let req = proto.comm_discover();
        assert_eq!(req.payload.as_ref(), &DISCOVER_MAGIC);
        assert_eq!(proto.parse_request(&req).unwrap(), RequestData::Discover { magic: DISCOVER_MAGIC });

        let fw_id: [u8; 16] = std::array::from_fn(|i| i as u8);
        let resp = proto.respond_comm_discover(&fw_id, "TestDevice");
        match proto.parse_response(&req, &resp).unwrap() {
            ResponseData::Discover {
                protocol_major,
                protocol_minor,
                firmware_id,
                display_name,
            } => {
                assert_eq!((protocol_major, protocol_minor), (1, 0));
                assert_eq!(firmware_id, fw_id);
                assert_eq!(display_name, "TestDevice");
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_connect_heartbeat_roundtrip() {
        let proto = protocol();
        let req = proto.comm_connect();
        let resp = proto.respond_comm_connect(0x12345678);
        assert_eq!(
            proto.parse_response(&req, &resp).unwrap(),
            ResponseData::Connect {
                magic: CONNECT_MAGIC,
                session_id: 0x12345678
            }
        );

        let req = proto.comm_heartbeat(0x12345678, 0xAAAA);
        assert_eq!(
            proto.parse_request(&req).unwrap(),
            RequestData::Heartbeat {
                session_id: 0x12345678,
                challenge: 0xAAAA
            }
        );
        let resp = proto.respond_comm_heartbeat(0x12345678, !0xAAAAu16);
        assert_eq!(
            proto.parse_response(&req, &resp).unwrap(),
            ResponseData::Heartbeat {
                session_id: 0x12345678,
                challenge_response: 0x5555
            }
        );
    }

    #[test]
    fn test_get_params_roundtrip() {
        let proto = protocol();
        let params = CommParams {
            max_rx_data_size: 128,
            max_tx_data_size: 128,
            max_bitrate_bps: 100_000,
            heartbeat_timeout_us: 3_000_000,
            rx_timeout_us: 50_000,
            address_size_bytes: 4,
        };
        let req = proto.comm_get_params();
        let resp = proto.respond_comm_get_params(&params);
        assert_eq!(resp.payload.len(), 17);
        assert_eq!(proto.parse_response(&req, &resp).unwrap(), ResponseData::GetParams(params));
    }

    #[test]
    fn test_memory_read_roundtrip() {
        let proto = protocol();
        let req = proto.memory_read(&[(0x1000, 4), (0x2000, 2)]);
        assert_eq!(req.payload.len(), 2 * (4 + 2));
        assert_eq!(req.response_payload_size, (4 + 4) + (4 + 2));
        assert_eq!(
            proto.parse_request(&req).unwrap(),
            RequestData::MemoryRead {
                blocks: vec![(0x1000, 4), (0x2000, 2)]
            }
        );

        let resp = proto.respond_memory_read(&[
            MemoryBlock {
                address: 0x1000,
                data: Bytes::from_static(&[1, 2, 3, 4]),
            },
            MemoryBlock {
                address: 0x2000,
                data: Bytes::from_static(&[5, 6]),
            },
        ]);
        match proto.parse_response(&req, &resp).unwrap() {
            ResponseData::MemoryRead { blocks } => {
                assert_eq!(blocks.len(), 2);
                assert_eq!(blocks[0].address, 0x1000);
                assert_eq!(blocks[0].data.as_ref(), &[1, 2, 3, 4]);
                assert_eq!(blocks[1].data.as_ref(), &[5, 6]);
            }
            other => panic!("unexpected parse result: {:?}", other),
        }
    }

    #[test]
    fn test_memory_read_response_wrong_address_rejected() {
        let proto = protocol();
        let req = proto.memory_read(&[(0x1000, 2)]);
        let resp = proto.respond_memory_read(&[MemoryBlock {
            address: 0x1004,
            data: Bytes::from_static(&[1, 2]),
        }]);
        assert!(proto.parse_response(&req, &resp).is_err());
    }

    #[test]
    fn test_rpv_roundtrip() {
        let mut proto = protocol();
        proto.configure_rpvs(&[
            RuntimePublishedValue::new(0x1000, EmbeddedDataType::Float32),
            RuntimePublishedValue::new(0x1001, EmbeddedDataType::Uint16),
        ]);

        let req = proto.read_rpv(&[0x1000, 0x1001]).unwrap();
        assert_eq!(req.response_payload_size, (2 + 4) + (2 + 2));

        let resp = proto
            .respond_read_rpv(&[(0x1000, Value::Float(1.5)), (0x1001, Value::Uint(0x1234))])
            .unwrap();
        match proto.parse_response(&req, &resp).unwrap() {
            ResponseData::ReadRpv { values } => {
                assert_eq!(values[0], (0x1000, Value::Float(1.5)));
                assert_eq!(values[1], (0x1001, Value::Uint(0x1234)));
            }
            other => panic!("unexpected parse result: {:?}", other),
        }

        let req = proto.write_rpv(&[(0x1001, Value::Uint(99))]).unwrap();
        assert_eq!(
            proto.parse_request(&req).unwrap(),
            RequestData::WriteRpv {
                values: vec![(0x1001, Value::Uint(99))]
            }
        );
    }

    #[test]
    fn test_unknown_rpv_rejected() {
        let proto = protocol();
        assert!(proto.read_rpv(&[0x4444]).is_err());
    }

    #[test]
    fn test_rpv_definition_roundtrip() {
        let proto = protocol();
        let rpvs = vec![
            RuntimePublishedValue::new(0x1000, EmbeddedDataType::Float64),
            RuntimePublishedValue::new(0x1004, EmbeddedDataType::Boolean),
        ];
        let req = proto.get_rpv_definition(0, 2);
        let resp = proto.respond_rpv_definition(&rpvs);
        assert_eq!(proto.parse_response(&req, &resp).unwrap(), ResponseData::RpvDefinition { rpvs });
    }

    #[test]
    fn test_non_ok_response_parses_empty() {
        let proto = protocol();
        let req = proto.get_rpv_count();
        let resp = Response::empty(Command::GetInfo, GetInfoSubfn::GetRuntimePublishedValuesCount as u8, ResponseCode::Busy);
        assert_eq!(proto.parse_response(&req, &resp).unwrap(), ResponseData::Empty);
    }

    #[test]
    fn test_mismatched_subfn_rejected() {
        let proto = protocol();
        let req = proto.get_rpv_count();
        let resp = proto.respond_loop_count(2);
        assert!(proto.parse_response(&req, &resp).is_err());
    }

    #[test]
    fn test_write_masked_roundtrip() {
        let proto = protocol();
        let req = proto.memory_write_masked(0x8000, &[0xF0, 0x00], &[0xF0, 0x0F]);
        assert_eq!(
            proto.parse_request(&req).unwrap(),
            RequestData::MemoryWriteMasked {
                address: 0x8000,
                data: Bytes::from_static(&[0xF0, 0x00]),
                mask: Bytes::from_static(&[0xF0, 0x0F]),
            }
        );
    }

    #[test]
    fn test_loop_definition_roundtrip() {
        let proto = protocol();
        let exec_loop = ExecLoop::fixed_freq("10KHz", 100_000);
        let req = proto.get_loop_definition(1);
        let resp = proto.respond_loop_definition(1, &exec_loop);
        assert_eq!(
            proto.parse_response(&req, &resp).unwrap(),
            ResponseData::LoopDefinition { loop_id: 1, exec_loop }
        );
    }

    #[test]
    fn test_address_size_is_honored() {
        let mut proto = protocol();
        proto.set_address_size_bytes(2).unwrap();
        let req = proto.memory_read(&[(0xBEEF, 1)]);
        assert_eq!(req.payload.len(), 2 + 2);
        assert!(proto.set_address_size_bytes(3).is_err());
    }
}
