//! Aggregated device knowledge, populated by the info poller.

use serde::{Deserialize, Serialize};

use crate::core::types::RuntimePublishedValue;
use crate::protocol::messages::{CommParams, ExecLoop, MemoryRegion, SupportedFeatures};

/// Everything the server knows about the connected device.
///
/// Filled in once per session by the info poller; read-only afterwards and
/// dropped when the session ends. Fields are optional because they arrive one
/// exchange at a time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Firmware id, hex encoded.
    pub device_id: Option<String>,

    /// Human-readable name advertised in the Discover response.
    pub display_name: Option<String>,

    /// Protocol version implemented by the device.
    pub protocol_major: Option<u8>,
    pub protocol_minor: Option<u8>,

    /// Largest request frame the device accepts.
    pub max_rx_data_size: Option<u16>,

    /// Largest response frame the device emits.
    pub max_tx_data_size: Option<u16>,

    /// Bitrate ceiling requested by the device. 0 means unlimited.
    pub max_bitrate_bps: Option<u32>,

    /// Session destruction delay without a heartbeat, in microseconds.
    pub heartbeat_timeout_us: Option<u32>,

    /// Device-side byte reassembly timeout, in microseconds.
    pub rx_timeout_us: Option<u32>,

    /// Address width of the device, in bits.
    pub address_size_bits: Option<u8>,

    /// Feature switches.
    pub supported_features: Option<SupportedFeatures>,

    /// Regions the server must never touch.
    pub forbidden_memory_regions: Option<Vec<MemoryRegion>>,

    /// Regions the server must never write.
    pub readonly_memory_regions: Option<Vec<MemoryRegion>>,

    /// RPVs published by the firmware.
    pub runtime_published_values: Option<Vec<RuntimePublishedValue>>,

    /// Execution loops declared by the firmware.
    pub loops: Option<Vec<ExecLoop>>,
}

impl DeviceInfo {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb the communication parameters.
    pub fn apply_comm_params(&mut self, params: &CommParams) {
        self.max_rx_data_size = Some(params.max_rx_data_size);
        self.max_tx_data_size = Some(params.max_tx_data_size);
        self.max_bitrate_bps = Some(params.max_bitrate_bps);
        self.heartbeat_timeout_us = Some(params.heartbeat_timeout_us);
        self.rx_timeout_us = Some(params.rx_timeout_us);
        self.address_size_bits = Some(params.address_size_bytes * 8);
    }

    /// Check that every poll step delivered its data.
    ///
    /// Loop descriptors are optional: devices without datalogging support do
    /// not advertise loops.
    pub fn all_ready(&self) -> bool {
        self.device_id.is_some()
            && self.display_name.is_some()
            && self.protocol_major.is_some()
            && self.protocol_minor.is_some()
            && self.max_rx_data_size.is_some()
            && self.max_tx_data_size.is_some()
            && self.max_bitrate_bps.is_some()
            && self.heartbeat_timeout_us.is_some()
            && self.rx_timeout_us.is_some()
            && self.address_size_bits.is_some()
            && self.supported_features.is_some()
            && self.forbidden_memory_regions.is_some()
            && self.readonly_memory_regions.is_some()
            && self.runtime_published_values.is_some()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_ready_requires_every_field() {
        let mut info = DeviceInfo::new();
        assert!(!info.all_ready());

        info.device_id = Some("00112233".to_string());
        info.display_name = Some("Device".to_string());
        info.protocol_major = Some(1);
        info.protocol_minor = Some(0);
        info.apply_comm_params(&CommParams {
            max_rx_data_size: 128,
            max_tx_data_size: 128,
            max_bitrate_bps: 0,
            heartbeat_timeout_us: 3_000_000,
            rx_timeout_us: 50_000,
            address_size_bytes: 4,
        });
        info.supported_features = Some(SupportedFeatures::default());
        info.forbidden_memory_regions = Some(vec![]);
        assert!(!info.all_ready());

        info.readonly_memory_regions = Some(vec![]);
        info.runtime_published_values = Some(vec![]);
        assert!(info.all_ready());

        info.clear();
        assert!(!info.all_ready());
    }
}
