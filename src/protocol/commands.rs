//! Command and subfunction identifiers.

/// Top-level protocol command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Device introspection (version, features, memory map, RPVs, loops)
    GetInfo,
    /// Session management (discover, connect, heartbeat, disconnect, params)
    CommControl,
    /// Memory and RPV reads/writes
    MemoryControl,
    /// Opaque passthrough to firmware-defined handlers
    UserCommand,
    /// Embedded datalogger control
    DatalogControl,
    /// Reserved id 0, used by the dispatcher tests
    Dummy,
}

impl Command {
    /// Command byte on the wire.
    pub fn id(&self) -> u8 {
        match self {
            Self::Dummy => 0,
            Self::GetInfo => 1,
            Self::CommControl => 2,
            Self::MemoryControl => 3,
            Self::UserCommand => 4,
            Self::DatalogControl => 6,
        }
    }

    /// Decode a command byte (response bit 7 must be stripped first).
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Dummy),
            1 => Some(Self::GetInfo),
            2 => Some(Self::CommControl),
            3 => Some(Self::MemoryControl),
            4 => Some(Self::UserCommand),
            6 => Some(Self::DatalogControl),
            _ => None,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::GetInfo => "GetInfo",
            Self::CommControl => "CommControl",
            Self::MemoryControl => "MemoryControl",
            Self::UserCommand => "UserCommand",
            Self::DatalogControl => "DatalogControl",
            Self::Dummy => "Dummy",
        };
        write!(f, "{}", s)
    }
}

/// Subfunctions of [`Command::CommControl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommControlSubfn {
    Discover = 1,
    Connect = 2,
    Heartbeat = 3,
    Disconnect = 4,
    GetParams = 5,
}

impl CommControlSubfn {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Discover),
            2 => Some(Self::Connect),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::Disconnect),
            5 => Some(Self::GetParams),
            _ => None,
        }
    }
}

/// Subfunctions of [`Command::GetInfo`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GetInfoSubfn {
    GetProtocolVersion = 1,
    GetSupportedFeatures = 2,
    GetSpecialMemoryRegionCount = 3,
    GetSpecialMemoryRegionLocation = 4,
    GetRuntimePublishedValuesCount = 5,
    GetRuntimePublishedValuesDefinition = 6,
    GetLoopCount = 7,
    GetLoopDefinition = 8,
}

impl GetInfoSubfn {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::GetProtocolVersion),
            2 => Some(Self::GetSupportedFeatures),
            3 => Some(Self::GetSpecialMemoryRegionCount),
            4 => Some(Self::GetSpecialMemoryRegionLocation),
            5 => Some(Self::GetRuntimePublishedValuesCount),
            6 => Some(Self::GetRuntimePublishedValuesDefinition),
            7 => Some(Self::GetLoopCount),
            8 => Some(Self::GetLoopDefinition),
            _ => None,
        }
    }
}

/// Subfunctions of [`Command::MemoryControl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryControlSubfn {
    Read = 1,
    Write = 2,
    WriteMasked = 3,
    ReadRpv = 4,
    WriteRpv = 5,
}

impl MemoryControlSubfn {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            3 => Some(Self::WriteMasked),
            4 => Some(Self::ReadRpv),
            5 => Some(Self::WriteRpv),
            _ => None,
        }
    }
}

/// Subfunctions of [`Command::DatalogControl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DatalogControlSubfn {
    GetSetup = 1,
    Configure = 2,
    ArmTrigger = 3,
    DisarmTrigger = 4,
    GetStatus = 5,
    GetAcquisitionMetadata = 6,
    ReadAcquisition = 7,
}

impl DatalogControlSubfn {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::GetSetup),
            2 => Some(Self::Configure),
            3 => Some(Self::ArmTrigger),
            4 => Some(Self::DisarmTrigger),
            5 => Some(Self::GetStatus),
            6 => Some(Self::GetAcquisitionMetadata),
            7 => Some(Self::ReadAcquisition),
            _ => None,
        }
    }
}

/// Kind of special memory region advertised by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryRegionType {
    /// Writable only by the firmware
    ReadOnly = 0,
    /// Not accessible at all (memory-mapped peripherals, traps)
    Forbidden = 1,
}

impl MemoryRegionType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::ReadOnly),
            1 => Some(Self::Forbidden),
            _ => None,
        }
    }
}
