//! Datastore entry model.

use std::collections::BTreeMap;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{Result, ScrutinyError};
use crate::core::types::{EmbeddedDataType, Endianness, RuntimePublishedValue, Value};

/// Stable entry identifier, hashed from the display path.
pub type EntryId = u64;

/// Kind of datastore entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Memory-backed variable
    Variable,
    /// Affine view over another entry
    Alias,
    /// Runtime published value
    Rpv,
}

/// Sub-byte slice of an integer variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitfield {
    /// Least significant bit of the field.
    pub offset: u8,
    /// Width in bits.
    pub size: u8,
}

/// Named values attached to an integer variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueEnum {
    pub name: String,
    pub values: BTreeMap<String, i64>,
}

/// Definition of a memory-backed variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDef {
    pub display_path: String,
    pub datatype: EmbeddedDataType,
    pub address: u64,
    pub endianness: Endianness,
    pub bitfield: Option<Bitfield>,
    pub value_enum: Option<ValueEnum>,
}

/// Definition of an RPV-backed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpvDef {
    pub display_path: String,
    pub rpv: RuntimePublishedValue,
}

/// Definition of an alias over another (non-alias) entry.
///
/// Values convert with `user = gain * device + offset`, clamped to
/// `[min, max]` on the user side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasDef {
    pub display_path: String,
    pub target: EntryId,
    pub gain: f64,
    pub offset: f64,
    pub min: f64,
    pub max: f64,
}

impl AliasDef {
    /// An identity alias: no scaling, no clamping.
    pub fn direct(display_path: impl Into<String>, target: EntryId) -> Self {
        Self {
            display_path: display_path.into(),
            target,
            gain: 1.0,
            offset: 0.0,
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
        }
    }

    /// Convert a device-side value to the user-facing one.
    pub fn device_to_user(&self, value: Value) -> Value {
        let user = self.gain * value.as_f64() + self.offset;
        Value::Float(user.clamp(self.min, self.max))
    }

    /// Convert a user-facing value to the device-side one.
    pub fn user_to_device(&self, value: Value) -> Result<Value> {
        if self.gain == 0.0 {
            return Err(ScrutinyError::config(format!(
                "alias {} has a zero gain, cannot write through it",
                self.display_path
            )));
        }
        let clamped = value.as_f64().clamp(self.min, self.max);
        Ok(Value::Float((clamped - self.offset) / self.gain))
    }
}

/// Tagged entry definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryDefinition {
    Variable(VariableDef),
    Alias(AliasDef),
    Rpv(RpvDef),
}

impl EntryDefinition {
    /// Kind of entry this definition produces.
    pub fn entry_type(&self) -> EntryType {
        match self {
            Self::Variable(_) => EntryType::Variable,
            Self::Alias(_) => EntryType::Alias,
            Self::Rpv(_) => EntryType::Rpv,
        }
    }

    /// Display path of the entry.
    pub fn display_path(&self) -> &str {
        match self {
            Self::Variable(def) => &def.display_path,
            Self::Alias(def) => &def.display_path,
            Self::Rpv(def) => &def.display_path,
        }
    }
}

/// Outcome of a target update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetUpdateResult {
    /// The device acknowledged the write.
    Completed,
    /// The exchange failed or the session went down.
    Failed,
    /// A newer write on the same entry replaced this one.
    Superseded,
}

/// A host-initiated write waiting for the memory writer.
pub struct PendingTargetUpdate {
    value: Value,
    in_flight: bool,
    completion: Option<Box<dyn FnOnce(TargetUpdateResult)>>,
}

impl PendingTargetUpdate {
    /// Create a pending update, not yet picked up.
    pub fn new(value: Value, completion: Option<Box<dyn FnOnce(TargetUpdateResult)>>) -> Self {
        Self {
            value,
            in_flight: false,
            completion,
        }
    }

    /// Device-side value to write.
    pub fn value(&self) -> Value {
        self.value
    }

    /// Fire the completion callback.
    pub fn complete(mut self, result: TargetUpdateResult) {
        if let Some(completion) = self.completion.take() {
            completion(result);
        }
    }
}

impl std::fmt::Debug for PendingTargetUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTargetUpdate")
            .field("value", &self.value)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

/// Callback fired with `(watcher_id, entry)` on every value update.
pub type WatchCallback = Rc<dyn Fn(&str, &DatastoreEntry)>;

/// Snapshot of an entry for upper layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub id: EntryId,
    pub entry_type: EntryType,
    pub display_path: String,
    pub datatype: Option<EmbeddedDataType>,
    pub address: Option<u64>,
}

/// A datastore entry: definition, last known value, watchers and at most one
/// pending target update.
pub struct DatastoreEntry {
    id: EntryId,
    definition: EntryDefinition,
    value: Option<Value>,
    update_timestamp: Option<DateTime<Utc>>,
    watchers: BTreeMap<String, WatchCallback>,
    pending_target: Option<PendingTargetUpdate>,
}

impl DatastoreEntry {
    /// Build an entry, deriving its id from the display path.
    pub fn new(definition: EntryDefinition) -> Result<Self> {
        if definition.display_path().is_empty() {
            return Err(ScrutinyError::config("entry display path cannot be empty"));
        }
        if let EntryDefinition::Variable(def) = &definition {
            if let Some(bitfield) = &def.bitfield {
                if def.datatype.is_float() {
                    return Err(ScrutinyError::config("bitfields are not allowed on floating-point variables"));
                }
                if bitfield.size == 0 || (bitfield.offset as usize + bitfield.size as usize) > def.datatype.size_bits()
                {
                    return Err(ScrutinyError::config(format!(
                        "bitfield [{}+{}] does not fit in {}",
                        bitfield.offset, bitfield.size, def.datatype
                    )));
                }
            }
        }
        let id = entry_id(definition.entry_type(), definition.display_path());
        Ok(Self {
            id,
            definition,
            value: None,
            update_timestamp: None,
            watchers: BTreeMap::new(),
            pending_target: None,
        })
    }

    /// Stable id of this entry.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Kind of entry.
    pub fn entry_type(&self) -> EntryType {
        self.definition.entry_type()
    }

    /// Display path of this entry.
    pub fn display_path(&self) -> &str {
        self.definition.display_path()
    }

    /// Full definition.
    pub fn definition(&self) -> &EntryDefinition {
        &self.definition
    }

    /// Last value reported by the device, if any.
    pub fn value(&self) -> Option<Value> {
        self.value
    }

    /// Timestamp of the last value update, if any.
    pub fn update_timestamp(&self) -> Option<DateTime<Utc>> {
        self.update_timestamp
    }

    /// Check if any watcher observes this entry.
    pub fn is_watched(&self) -> bool {
        !self.watchers.is_empty()
    }

    /// Watcher ids currently attached.
    pub fn watchers(&self) -> Vec<String> {
        self.watchers.keys().cloned().collect()
    }

    /// Check if a target update is pending or in flight.
    pub fn has_pending_target(&self) -> bool {
        self.pending_target.is_some()
    }

    /// Snapshot metadata for upper layers.
    pub fn metadata(&self) -> EntryMetadata {
        let (datatype, address) = match &self.definition {
            EntryDefinition::Variable(def) => (Some(def.datatype), Some(def.address)),
            EntryDefinition::Rpv(def) => (Some(def.rpv.datatype), None),
            EntryDefinition::Alias(_) => (None, None),
        };
        EntryMetadata {
            id: self.id,
            entry_type: self.entry_type(),
            display_path: self.display_path().to_string(),
            datatype,
            address,
        }
    }

    pub(crate) fn add_watcher(&mut self, watcher: String, callback: WatchCallback) {
        self.watchers.entry(watcher).or_insert(callback);
    }

    pub(crate) fn remove_watcher(&mut self, watcher: &str) {
        self.watchers.remove(watcher);
    }

    pub(crate) fn watcher_callbacks(&self) -> Vec<(String, WatchCallback)> {
        self.watchers
            .iter()
            .map(|(watcher, callback)| (watcher.clone(), Rc::clone(callback)))
            .collect()
    }

    pub(crate) fn store_value(&mut self, value: Value, timestamp: DateTime<Utc>) {
        self.value = Some(value);
        self.update_timestamp = Some(timestamp);
    }

    pub(crate) fn set_pending_target(&mut self, pending: PendingTargetUpdate) {
        self.pending_target = Some(pending);
    }

    pub(crate) fn take_pending_target(&mut self) -> Option<PendingTargetUpdate> {
        self.pending_target.take()
    }

    pub(crate) fn has_idle_pending_target(&self) -> bool {
        self.pending_target.as_ref().is_some_and(|pending| !pending.in_flight)
    }

    pub(crate) fn mark_pending_target_in_flight(&mut self) -> Option<Value> {
        let pending = self.pending_target.as_mut()?;
        pending.in_flight = true;
        Some(pending.value)
    }
}

impl std::fmt::Debug for DatastoreEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatastoreEntry")
            .field("id", &format_args!("0x{:016X}", self.id))
            .field("path", &self.display_path())
            .field("type", &self.entry_type())
            .field("value", &self.value)
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

// FNV-1a 64, domain-separated per entry type so the same path can exist under
// two types without colliding.
fn entry_id(entry_type: EntryType, display_path: &str) -> EntryId {
    const FNV_OFFSET: u64 = 0xCBF2_9CE4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

    let tag: u8 = match entry_type {
        EntryType::Variable => b'v',
        EntryType::Alias => b'a',
        EntryType::Rpv => b'r',
    };
    let mut hash = FNV_OFFSET;
    hash ^= tag as u64;
    hash = hash.wrapping_mul(FNV_PRIME);
    for byte in display_path.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_id_is_stable_and_type_separated() {
        let a = entry_id(EntryType::Variable, "/a/b");
        assert_eq!(a, entry_id(EntryType::Variable, "/a/b"));
        assert_ne!(a, entry_id(EntryType::Rpv, "/a/b"));
        assert_ne!(a, entry_id(EntryType::Variable, "/a/c"));
    }

    #[test]
    fn test_alias_conversion_math() {
        let alias = AliasDef {
            display_path: "/alias".to_string(),
            target: 1,
            gain: 0.5,
            offset: -3.0,
            min: -10.0,
            max: 10.0,
        };
        assert_eq!(alias.device_to_user(Value::Float(8.0)), Value::Float(1.0));
        assert_eq!(alias.device_to_user(Value::Float(100.0)), Value::Float(10.0)); // clamped
        assert_eq!(alias.user_to_device(Value::Float(1.0)).unwrap(), Value::Float(8.0));
        // Write clamps on the user side before converting
        assert_eq!(alias.user_to_device(Value::Float(50.0)).unwrap(), Value::Float(26.0));
    }

    #[test]
    fn test_zero_gain_write_rejected() {
        let alias = AliasDef {
            gain: 0.0,
            ..AliasDef::direct("/alias", 1)
        };
        assert!(alias.user_to_device(Value::Float(1.0)).is_err());
    }

    #[test]
    fn test_bitfield_validation() {
        let def = |bitfield| {
            EntryDefinition::Variable(VariableDef {
                display_path: "/v".to_string(),
                datatype: EmbeddedDataType::Uint16,
                address: 0,
                endianness: Endianness::Little,
                bitfield,
                value_enum: None,
            })
        };
        assert!(DatastoreEntry::new(def(Some(Bitfield { offset: 4, size: 12 }))).is_ok());
        assert!(DatastoreEntry::new(def(Some(Bitfield { offset: 9, size: 8 }))).is_err());
        assert!(DatastoreEntry::new(def(Some(Bitfield { offset: 0, size: 0 }))).is_err());
    }
}
