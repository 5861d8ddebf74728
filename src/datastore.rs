//! In-memory store of watchable device values.
//!
//! Entries come in three kinds: variables (memory-backed), RPVs
//! (id-addressed firmware values) and aliases (affine views over another
//! entry). Upper layers watch entries and request target writes; the memory
//! reader/writer keeps entries synchronized with the device.

pub mod entry;

pub use entry::{
    AliasDef, Bitfield, DatastoreEntry, EntryDefinition, EntryId, EntryMetadata, EntryType, PendingTargetUpdate,
    RpvDef, TargetUpdateResult, ValueEnum, VariableDef, WatchCallback,
};

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::core::error::{Result, ScrutinyError};
use crate::core::types::Value;

/// A target write picked up by the memory writer.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    /// Entry to write.
    pub id: EntryId,
    /// Device-side value to write.
    pub value: Value,
}

/// The in-memory datastore.
#[derive(Default)]
pub struct Datastore {
    entries: HashMap<EntryId, DatastoreEntry>,
    ids_by_path: HashMap<(EntryType, String), EntryId>,
    // target entry -> aliases observing it
    alias_backrefs: HashMap<EntryId, Vec<EntryId>>,
}

impl Datastore {
    /// Create an empty datastore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. Fails on id or display-path collision, and on aliases
    /// whose target is missing or is itself an alias.
    pub fn add_entry(&mut self, definition: EntryDefinition) -> Result<EntryId> {
        let entry = DatastoreEntry::new(definition)?;
        let id = entry.id();
        let key = (entry.entry_type(), entry.display_path().to_string());

        if self.entries.contains_key(&id) {
            return Err(ScrutinyError::Duplicate(format!("entry id 0x{:016X}", id)));
        }
        if self.ids_by_path.contains_key(&key) {
            return Err(ScrutinyError::Duplicate(format!("display path {}", key.1)));
        }

        if let EntryDefinition::Alias(alias) = entry.definition() {
            let target = self
                .entries
                .get(&alias.target)
                .ok_or_else(|| ScrutinyError::unknown(format!("alias target 0x{:016X}", alias.target)))?;
            if target.entry_type() == EntryType::Alias {
                return Err(ScrutinyError::config("aliases cannot reference other aliases"));
            }
            self.alias_backrefs.entry(alias.target).or_default().push(id);
        }

        self.ids_by_path.insert(key, id);
        self.entries.insert(id, entry);
        Ok(id)
    }

    /// Fetch an entry.
    pub fn get_entry(&self, id: EntryId) -> Result<&DatastoreEntry> {
        self.entries
            .get(&id)
            .ok_or_else(|| ScrutinyError::unknown(format!("entry id 0x{:016X}", id)))
    }

    /// Resolve a display path of the given type.
    pub fn get_entry_by_path(&self, entry_type: EntryType, display_path: &str) -> Result<&DatastoreEntry> {
        let id = self
            .ids_by_path
            .get(&(entry_type, display_path.to_string()))
            .ok_or_else(|| ScrutinyError::unknown(format!("display path {}", display_path)))?;
        self.get_entry(*id)
    }

    /// Describe an entry without exposing its internals.
    pub fn get_metadata(&self, id: EntryId) -> Result<EntryMetadata> {
        self.get_entry(id).map(DatastoreEntry::metadata)
    }

    /// List entry ids, optionally restricted to one type, in stable order.
    pub fn list_entries(&self, type_filter: Option<EntryType>) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|entry| type_filter.is_none_or(|t| entry.entry_type() == t))
            .map(DatastoreEntry::id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Count entries, optionally restricted to one type.
    pub fn count(&self, type_filter: Option<EntryType>) -> usize {
        self.entries
            .values()
            .filter(|entry| type_filter.is_none_or(|t| entry.entry_type() == t))
            .count()
    }

    /// List watched entry ids, optionally restricted to one type.
    pub fn watched_entries(&self, type_filter: Option<EntryType>) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self
            .entries
            .values()
            .filter(|entry| entry.is_watched())
            .filter(|entry| type_filter.is_none_or(|t| entry.entry_type() == t))
            .map(DatastoreEntry::id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Attach a watcher callback. Idempotent per `(id, watcher)`.
    pub fn start_watching(
        &mut self,
        id: EntryId,
        watcher: impl Into<String>,
        callback: impl Fn(&str, &DatastoreEntry) + 'static,
    ) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| ScrutinyError::unknown(format!("entry id 0x{:016X}", id)))?;
        entry.add_watcher(watcher.into(), Rc::new(callback));
        Ok(())
    }

    /// Detach one watcher from one entry.
    pub fn stop_watching(&mut self, id: EntryId, watcher: &str) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| ScrutinyError::unknown(format!("entry id 0x{:016X}", id)))?;
        entry.remove_watcher(watcher);
        Ok(())
    }

    /// Detach a watcher from every entry. Used on client disconnect.
    pub fn stop_watching_all(&mut self, watcher: &str) {
        for entry in self.entries.values_mut() {
            entry.remove_watcher(watcher);
        }
    }

    /// Record a fresh device-reported value and fire every watcher callback
    /// synchronously, then refresh the aliases observing the entry.
    ///
    /// Aliases derive their value; calling this on one is an error.
    pub fn set_value(&mut self, id: EntryId, value: Value) -> Result<()> {
        {
            let entry = self.get_entry(id)?;
            if entry.entry_type() == EntryType::Alias {
                return Err(ScrutinyError::config("aliases derive their value from their target"));
            }
        }
        self.apply_value(id, value);

        if let Some(alias_ids) = self.alias_backrefs.get(&id).cloned() {
            for alias_id in alias_ids {
                let converted = match self.entries.get(&alias_id).map(DatastoreEntry::definition) {
                    Some(EntryDefinition::Alias(alias)) => alias.device_to_user(value),
                    _ => continue,
                };
                self.apply_value(alias_id, converted);
            }
        }
        Ok(())
    }

    // Store the value and fire the watchers of a single entry.
    fn apply_value(&mut self, id: EntryId, value: Value) {
        let callbacks: Vec<(String, WatchCallback)> = match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.store_value(value, Utc::now());
                entry.watcher_callbacks()
            }
            None => return,
        };
        if let Some(entry) = self.entries.get(&id) {
            for (watcher, callback) in callbacks {
                callback(&watcher, entry);
            }
        }
    }

    /// Record a host-initiated write. The memory writer picks it up; the
    /// completion callback fires exactly once. A newer write on the same
    /// entry supersedes a pending one, completing it as superseded.
    ///
    /// Writing an alias clamps/converts the value and targets the underlying
    /// entry.
    pub fn update_target_value(
        &mut self,
        id: EntryId,
        value: Value,
        completion: Option<Box<dyn FnOnce(TargetUpdateResult)>>,
    ) -> Result<()> {
        let (target_id, device_value) = match self.get_entry(id)?.definition() {
            EntryDefinition::Alias(alias) => (alias.target, alias.user_to_device(value)?),
            _ => (id, value),
        };

        let entry = self
            .entries
            .get_mut(&target_id)
            .ok_or_else(|| ScrutinyError::unknown(format!("entry id 0x{:016X}", target_id)))?;
        if let Some(old) = entry.take_pending_target() {
            debug!(entry = entry.display_path(), "superseding pending target update");
            old.complete(TargetUpdateResult::Superseded);
        }
        entry.set_pending_target(PendingTargetUpdate::new(device_value, completion));
        Ok(())
    }

    /// Hand the next pending write to the memory writer, marking it in
    /// flight. In-flight writes are not returned again.
    pub fn pop_pending_write(&mut self) -> Option<PendingWrite> {
        let mut candidates: Vec<EntryId> = self
            .entries
            .values()
            .filter(|entry| entry.has_idle_pending_target())
            .map(DatastoreEntry::id)
            .collect();
        candidates.sort_unstable();
        let id = *candidates.first()?;
        let entry = self.entries.get_mut(&id)?;
        let value = entry.mark_pending_target_in_flight()?;
        Some(PendingWrite { id, value })
    }

    /// Complete the in-flight target update of an entry.
    pub fn complete_target_update(&mut self, id: EntryId, success: bool) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| ScrutinyError::unknown(format!("entry id 0x{:016X}", id)))?;
        if let Some(pending) = entry.take_pending_target() {
            pending.complete(if success {
                TargetUpdateResult::Completed
            } else {
                TargetUpdateResult::Failed
            });
        }
        Ok(())
    }

    /// Fail every pending target update. Used on session teardown.
    pub fn fail_all_pending_target_updates(&mut self) {
        for entry in self.entries.values_mut() {
            if let Some(pending) = entry.take_pending_target() {
                pending.complete(TargetUpdateResult::Failed);
            }
        }
    }

    /// Read an entry value. Aliases convert their target's value on the fly.
    pub fn get_value(&self, id: EntryId) -> Result<Option<Value>> {
        let entry = self.get_entry(id)?;
        match entry.definition() {
            EntryDefinition::Alias(alias) => {
                let target = self.get_entry(alias.target)?;
                Ok(target.value().map(|v| alias.device_to_user(v)))
            }
            _ => Ok(entry.value()),
        }
    }

    /// Drop every entry of one type, failing their pending writes. Aliases
    /// left dangling by the removal go with their target.
    pub fn clear_entries_of_type(&mut self, entry_type: EntryType) {
        let removed: HashSet<EntryId> = self
            .entries
            .values()
            .filter(|entry| entry.entry_type() == entry_type)
            .map(DatastoreEntry::id)
            .collect();
        if removed.is_empty() {
            return;
        }

        let mut to_remove = removed.clone();
        for entry in self.entries.values() {
            if let EntryDefinition::Alias(alias) = entry.definition() {
                if removed.contains(&alias.target) {
                    to_remove.insert(entry.id());
                }
            }
        }

        let count = to_remove.len();
        for id in to_remove {
            if let Some(mut entry) = self.entries.remove(&id) {
                if let Some(pending) = entry.take_pending_target() {
                    pending.complete(TargetUpdateResult::Failed);
                }
                self.ids_by_path.remove(&(entry.entry_type(), entry.display_path().to_string()));
                self.alias_backrefs.remove(&id);
                if let EntryDefinition::Alias(alias) = entry.definition() {
                    if let Some(backrefs) = self.alias_backrefs.get_mut(&alias.target) {
                        backrefs.retain(|alias_id| *alias_id != entry.id());
                    }
                }
            }
        }
        warn!(count, ?entry_type, "cleared datastore entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use crate::core::types::{EmbeddedDataType, Endianness, RuntimePublishedValue};

    fn float_var(path: &str, address: u64) -> EntryDefinition {
        EntryDefinition::Variable(VariableDef {
            display_path: path.to_string(),
            datatype: EmbeddedDataType::Float32,
            address,
            endianness: Endianness::Little,
            bitfield: None,
            value_enum: None,
        })
    }

    fn rpv_entry(path: &str, id: u16) -> EntryDefinition {
        EntryDefinition::Rpv(RpvDef {
            display_path: path.to_string(),
            rpv: RuntimePublishedValue::new(id, EmbeddedDataType::Uint16),
        })
    }

    #[test]
    fn test_add_and_lookup() {
        let mut ds = Datastore::new();
        let id = ds.add_entry(float_var("/a/b/var1", 0x1000)).unwrap();
        assert_eq!(ds.get_entry(id).unwrap().display_path(), "/a/b/var1");
        assert_eq!(ds.get_entry_by_path(EntryType::Variable, "/a/b/var1").unwrap().id(), id);
        assert_eq!(ds.count(Some(EntryType::Variable)), 1);
        assert_eq!(ds.count(Some(EntryType::Rpv)), 0);
        assert!(ds.get_entry(id ^ 1).is_err());
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let mut ds = Datastore::new();
        ds.add_entry(float_var("/a/var", 0x1000)).unwrap();
        assert!(ds.add_entry(float_var("/a/var", 0x2000)).is_err());
        // Same path under a different type is fine.
        ds.add_entry(rpv_entry("/a/var", 7)).unwrap();
    }

    #[test]
    fn test_watchers_fire_in_order() {
        let mut ds = Datastore::new();
        let id = ds.add_entry(float_var("/var", 0x1000)).unwrap();

        let log: Rc<RefCell<Vec<(String, f64)>>> = Rc::new(RefCell::new(Vec::new()));
        for watcher in ["client-b", "client-a"] {
            let log = Rc::clone(&log);
            ds.start_watching(id, watcher, move |w, entry| {
                log.borrow_mut().push((w.to_string(), entry.value().unwrap().as_f64()));
            })
            .unwrap();
        }

        ds.set_value(id, Value::Float(1.5)).unwrap();
        ds.set_value(id, Value::Float(2.5)).unwrap();

        // Per-entry total order matches set_value order; watchers in id order.
        assert_eq!(
            *log.borrow(),
            vec![
                ("client-a".to_string(), 1.5),
                ("client-b".to_string(), 1.5),
                ("client-a".to_string(), 2.5),
                ("client-b".to_string(), 2.5),
            ]
        );
    }

    #[test]
    fn test_stop_watching() {
        let mut ds = Datastore::new();
        let id = ds.add_entry(float_var("/var", 0x1000)).unwrap();
        let count = Rc::new(RefCell::new(0u32));

        let c = Rc::clone(&count);
        ds.start_watching(id, "w", move |_, _| *c.borrow_mut() += 1).unwrap();
        ds.set_value(id, Value::Float(1.0)).unwrap();
        ds.stop_watching(id, "w").unwrap();
        ds.set_value(id, Value::Float(2.0)).unwrap();
        assert_eq!(*count.borrow(), 1);
        assert!(ds.watched_entries(None).is_empty());
    }

    #[test]
    fn test_target_update_supersede() {
        let mut ds = Datastore::new();
        let id = ds.add_entry(float_var("/var", 0x1000)).unwrap();

        let results: Rc<RefCell<Vec<TargetUpdateResult>>> = Rc::new(RefCell::new(Vec::new()));
        for value in [1.0f64, 2.0] {
            let results = Rc::clone(&results);
            ds.update_target_value(
                id,
                Value::Float(value),
                Some(Box::new(move |outcome| results.borrow_mut().push(outcome))),
            )
            .unwrap();
        }
        // First write superseded by the second before any pickup.
        assert_eq!(*results.borrow(), vec![TargetUpdateResult::Superseded]);

        let write = ds.pop_pending_write().unwrap();
        assert_eq!(write, PendingWrite { id, value: Value::Float(2.0) });
        assert!(ds.pop_pending_write().is_none()); // in flight, not returned again

        ds.complete_target_update(id, true).unwrap();
        assert_eq!(
            *results.borrow(),
            vec![TargetUpdateResult::Superseded, TargetUpdateResult::Completed]
        );
    }

    #[test]
    fn test_alias_conversion() {
        let mut ds = Datastore::new();
        let var_id = ds.add_entry(float_var("/var", 0x1000)).unwrap();
        let alias_id = ds
            .add_entry(EntryDefinition::Alias(AliasDef {
                display_path: "/alias/var".to_string(),
                target: var_id,
                gain: 2.0,
                offset: 10.0,
                min: 0.0,
                max: 100.0,
            }))
            .unwrap();

        // Read path: device 5.0 -> user 2*5+10 = 20
        ds.set_value(var_id, Value::Float(5.0)).unwrap();
        assert_eq!(ds.get_value(alias_id).unwrap(), Some(Value::Float(20.0)));

        // Clamping: device 100 -> 210, clamped to 100
        ds.set_value(var_id, Value::Float(100.0)).unwrap();
        assert_eq!(ds.get_value(alias_id).unwrap(), Some(Value::Float(100.0)));

        // Write path: user 30 -> device (30-10)/2 = 10, lands on the target
        ds.update_target_value(alias_id, Value::Float(30.0), None).unwrap();
        let write = ds.pop_pending_write().unwrap();
        assert_eq!(write, PendingWrite { id: var_id, value: Value::Float(10.0) });
    }

    #[test]
    fn test_alias_watchers_follow_target() {
        let mut ds = Datastore::new();
        let var_id = ds.add_entry(float_var("/var", 0x1000)).unwrap();
        let alias_id = ds
            .add_entry(EntryDefinition::Alias(AliasDef {
                display_path: "/alias/var".to_string(),
                target: var_id,
                gain: 1.0,
                offset: 1.0,
                min: f64::NEG_INFINITY,
                max: f64::INFINITY,
            }))
            .unwrap();

        let seen: Rc<RefCell<Vec<f64>>> = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        ds.start_watching(alias_id, "w", move |_, entry| {
            s.borrow_mut().push(entry.value().unwrap().as_f64());
        })
        .unwrap();

        ds.set_value(var_id, Value::Float(3.0)).unwrap();
        assert_eq!(*seen.borrow(), vec![4.0]);
    }

    #[test]
    fn test_alias_of_alias_rejected() {
        let mut ds = Datastore::new();
        let var_id = ds.add_entry(float_var("/var", 0x1000)).unwrap();
        let alias_id = ds
            .add_entry(EntryDefinition::Alias(AliasDef::direct("/alias1", var_id)))
            .unwrap();
        assert!(ds.add_entry(EntryDefinition::Alias(AliasDef::direct("/alias2", alias_id))).is_err());
    }

    #[test]
    fn test_clear_entries_of_type_takes_dangling_aliases() {
        let mut ds = Datastore::new();
        let rpv_id = ds.add_entry(rpv_entry("/rpv/x1000", 0x1000)).unwrap();
        ds.add_entry(EntryDefinition::Alias(AliasDef::direct("/alias/rpv", rpv_id))).unwrap();
        let var_id = ds.add_entry(float_var("/var", 0x1000)).unwrap();

        let results: Rc<RefCell<Vec<TargetUpdateResult>>> = Rc::new(RefCell::new(Vec::new()));
        let r = Rc::clone(&results);
        ds.update_target_value(rpv_id, Value::Uint(1), Some(Box::new(move |o| r.borrow_mut().push(o))))
            .unwrap();

        ds.clear_entries_of_type(EntryType::Rpv);
        assert_eq!(ds.count(None), 1);
        assert_eq!(ds.get_entry(var_id).unwrap().id(), var_id);
        assert_eq!(*results.borrow(), vec![TargetUpdateResult::Failed]);
    }

    #[test]
    fn test_set_value_on_alias_rejected() {
        let mut ds = Datastore::new();
        let var_id = ds.add_entry(float_var("/var", 0x1000)).unwrap();
        let alias_id = ds
            .add_entry(EntryDefinition::Alias(AliasDef::direct("/alias", var_id)))
            .unwrap();
        assert!(ds.set_value(alias_id, Value::Float(1.0)).is_err());
    }
}
