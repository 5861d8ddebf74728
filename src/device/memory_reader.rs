//! Keeps watched datastore entries fresh.
//!
//! Round-robins over watched variable entries (coalescing adjacent memory
//! into multi-block reads bounded by the negotiated buffer sizes) and watched
//! RPV entries, alternating between the two so neither starves. Read results
//! are decoded per entry and pushed into the datastore, which fires watcher
//! callbacks.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::core::codecs;
use crate::core::types::{EmbeddedDataType, Endianness, Value};
use crate::datastore::{Bitfield, Datastore, EntryDefinition, EntryId, EntryType};
use crate::device::priorities;
use crate::dispatcher::RequestDispatcher;
use crate::protocol::messages::{MemoryBlock, Protocol, ResponseData};
use crate::protocol::request::Request;
use crate::protocol::response::{Response, ResponseCode};

/// Payload budgets derived from the device comm params.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoLimits {
    /// Largest request payload the device accepts.
    pub max_request_payload: usize,
    /// Largest response payload the device emits.
    pub max_response_payload: usize,
}

#[derive(Debug, Clone, Copy)]
struct VariableReadout {
    id: EntryId,
    address: u64,
    datatype: EmbeddedDataType,
    endianness: Endianness,
    bitfield: Option<Bitfield>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Variables,
    Rpvs,
}

#[derive(Default)]
struct ReaderShared {
    pending: bool,
}

/// Synthesizes Read/ReadRPV requests for watched entries.
pub struct MemoryReader {
    datastore: Rc<RefCell<Datastore>>,
    shared: Rc<RefCell<ReaderShared>>,
    limits: Option<IoLimits>,
    started: bool,
    phase: ReadPhase,
    var_cursor: usize,
    rpv_cursor: usize,
}

impl MemoryReader {
    /// Create a stopped reader over the given datastore.
    pub fn new(datastore: Rc<RefCell<Datastore>>) -> Self {
        Self {
            datastore,
            shared: Rc::new(RefCell::new(ReaderShared::default())),
            limits: None,
            started: false,
            phase: ReadPhase::Variables,
            var_cursor: 0,
            rpv_cursor: 0,
        }
    }

    /// Apply the payload budgets from the device comm params.
    pub fn set_limits(&mut self, limits: IoLimits) {
        self.limits = Some(limits);
    }

    /// Begin reading.
    pub fn start(&mut self) {
        self.started = true;
    }

    /// Stop reading and drop per-session state.
    pub fn stop(&mut self) {
        self.started = false;
        self.limits = None;
        self.var_cursor = 0;
        self.rpv_cursor = 0;
        self.phase = ReadPhase::Variables;
        self.shared = Rc::new(RefCell::new(ReaderShared::default()));
    }

    /// Submit the next read when idle. Call once per tick.
    pub fn process(&mut self, dispatcher: &mut RequestDispatcher, protocol: &Protocol) {
        if !self.started || self.shared.borrow().pending {
            return;
        }
        let Some(limits) = self.limits else {
            return;
        };

        // Alternate between variable and RPV rounds so neither starves.
        let first = self.phase;
        for _ in 0..2 {
            let submitted = match self.phase {
                ReadPhase::Variables => self.submit_variable_read(dispatcher, protocol, limits),
                ReadPhase::Rpvs => self.submit_rpv_read(dispatcher, protocol, limits),
            };
            self.phase = match self.phase {
                ReadPhase::Variables => ReadPhase::Rpvs,
                ReadPhase::Rpvs => ReadPhase::Variables,
            };
            if submitted || self.phase == first {
                break;
            }
        }
    }

    fn watched_variables(&self) -> Vec<VariableReadout> {
        let datastore = self.datastore.borrow();
        let mut readouts: Vec<VariableReadout> = datastore
            .watched_entries(Some(EntryType::Variable))
            .into_iter()
            .filter_map(|id| {
                let entry = datastore.get_entry(id).ok()?;
                match entry.definition() {
                    EntryDefinition::Variable(def) => Some(VariableReadout {
                        id,
                        address: def.address,
                        datatype: def.datatype,
                        endianness: def.endianness,
                        bitfield: def.bitfield,
                    }),
                    _ => None,
                }
            })
            .collect();
        readouts.sort_by_key(|readout| readout.address);
        readouts
    }

    fn submit_variable_read(
        &mut self,
        dispatcher: &mut RequestDispatcher,
        protocol: &Protocol,
        limits: IoLimits,
    ) -> bool {
        let readouts = self.watched_variables();
        if readouts.is_empty() {
            self.var_cursor = 0;
            return false;
        }
        self.var_cursor %= readouts.len();

        let address_size = protocol.address_size_bytes() as usize;
        let block_overhead_req = address_size + 2;

        // Greedy coalescing pass from the cursor, bounded by both frames.
        let mut blocks: Vec<(u64, u16)> = Vec::new();
        let mut covered: Vec<VariableReadout> = Vec::new();
        let mut taken = 0usize;
        for offset in 0..readouts.len() {
            let readout = readouts[(self.var_cursor + offset) % readouts.len()];
            let size = readout.datatype.size_bytes() as u64;
            let end = readout.address + size;

            let mut candidate = blocks.clone();
            match candidate.last_mut() {
                // Merge when adjacent or overlapping the previous block. The
                // cursor may wrap to lower addresses; those get a new block.
                Some((start, length))
                    if readout.address >= *start && readout.address <= *start + *length as u64 =>
                {
                    let new_end = end.max(*start + *length as u64);
                    *length = (new_end - *start) as u16;
                }
                _ => candidate.push((readout.address, size as u16)),
            }

            let request_payload = candidate.len() * block_overhead_req;
            let response_payload: usize =
                candidate.len() * address_size + candidate.iter().map(|(_, len)| *len as usize).sum::<usize>();
            if request_payload > limits.max_request_payload || response_payload > limits.max_response_payload {
                if covered.is_empty() {
                    error!(
                        entry = readout.id,
                        "watched variable does not fit the negotiated buffers, skipping"
                    );
                    self.var_cursor = (self.var_cursor + 1) % readouts.len();
                }
                break;
            }

            blocks = candidate;
            covered.push(readout);
            taken += 1;
        }

        if covered.is_empty() {
            return false;
        }
        self.var_cursor = (self.var_cursor + taken) % readouts.len();

        let request = protocol.memory_read(&blocks);
        self.register_read(dispatcher, request, move |datastore, data| {
            let ResponseData::MemoryRead { blocks } = data else {
                warn!("memory read answered with unexpected data");
                return;
            };
            distribute_blocks(datastore, &blocks, &covered);
        });
        true
    }

    fn submit_rpv_read(&mut self, dispatcher: &mut RequestDispatcher, protocol: &Protocol, limits: IoLimits) -> bool {
        let (rpv_ids, entry_by_rpv): (Vec<u16>, std::collections::HashMap<u16, EntryId>) = {
            let datastore = self.datastore.borrow();
            let mut ids = Vec::new();
            let mut map = std::collections::HashMap::new();
            for entry_id in datastore.watched_entries(Some(EntryType::Rpv)) {
                if let Ok(entry) = datastore.get_entry(entry_id) {
                    if let EntryDefinition::Rpv(def) = entry.definition() {
                        ids.push(def.rpv.id);
                        map.insert(def.rpv.id, entry_id);
                    }
                }
            }
            (ids, map)
        };
        if rpv_ids.is_empty() {
            self.rpv_cursor = 0;
            return false;
        }
        self.rpv_cursor %= rpv_ids.len();

        // Pack ids from the cursor while both frames hold.
        let mut batch: Vec<u16> = Vec::new();
        let mut response_payload = 0usize;
        for offset in 0..rpv_ids.len() {
            let rpv_id = rpv_ids[(self.rpv_cursor + offset) % rpv_ids.len()];
            let Some(datatype) = protocol.rpv_datatype(rpv_id) else {
                warn!(rpv_id, "watched RPV unknown to the protocol, skipping");
                continue;
            };
            let next_request = (batch.len() + 1) * 2;
            let next_response = response_payload + 2 + datatype.size_bytes();
            if next_request > limits.max_request_payload || next_response > limits.max_response_payload {
                break;
            }
            batch.push(rpv_id);
            response_payload = next_response;
        }
        if batch.is_empty() {
            return false;
        }
        self.rpv_cursor = (self.rpv_cursor + batch.len()) % rpv_ids.len();

        let request = match protocol.read_rpv(&batch) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "cannot build RPV read request");
                return false;
            }
        };
        self.register_read(dispatcher, request, move |datastore, data| {
            let ResponseData::ReadRpv { values } = data else {
                warn!("RPV read answered with unexpected data");
                return;
            };
            for (rpv_id, value) in values {
                if let Some(entry_id) = entry_by_rpv.get(&rpv_id) {
                    if let Err(e) = datastore.set_value(*entry_id, value) {
                        debug!(error = %e, rpv_id, "dropping read value");
                    }
                }
            }
        });
        true
    }

    fn register_read(
        &self,
        dispatcher: &mut RequestDispatcher,
        request: Request,
        apply: impl FnOnce(&mut Datastore, ResponseData) + 'static,
    ) {
        self.shared.borrow_mut().pending = true;

        let success_shared = Rc::clone(&self.shared);
        let failure_shared = Rc::clone(&self.shared);
        let datastore = Rc::clone(&self.datastore);
        dispatcher.register_request(
            request,
            Box::new(move |_request, response: &Response, data| {
                success_shared.borrow_mut().pending = false;
                if response.code != ResponseCode::Ok {
                    warn!(code = %response.code, "device refused a read");
                    return;
                }
                apply(&mut datastore.borrow_mut(), data);
            }),
            Box::new(move |_request| {
                failure_shared.borrow_mut().pending = false;
            }),
            priorities::MEMORY_IO,
        );
    }
}

// Slice each entry's bytes out of the returned blocks and store the decoded
// value.
fn distribute_blocks(datastore: &mut Datastore, blocks: &[MemoryBlock], covered: &[VariableReadout]) {
    for readout in covered {
        let size = readout.datatype.size_bytes();
        let slice = blocks.iter().find_map(|block| {
            let block_end = block.address + block.data.len() as u64;
            if readout.address >= block.address && readout.address + size as u64 <= block_end {
                let start = (readout.address - block.address) as usize;
                Some(&block.data[start..start + size])
            } else {
                None
            }
        });
        let Some(bytes) = slice else {
            warn!(entry = readout.id, "memory read response does not cover a requested entry");
            continue;
        };

        let decoded: Result<Value, _> = match readout.bitfield {
            Some(bitfield) => {
                codecs::decode_bitfield(bytes, readout.datatype, readout.endianness, bitfield.offset, bitfield.size)
            }
            None => codecs::decode(bytes, readout.datatype, readout.endianness),
        };
        match decoded {
            Ok(value) => {
                if let Err(e) = datastore.set_value(readout.id, value) {
                    debug!(error = %e, entry = readout.id, "dropping read value");
                }
            }
            Err(e) => warn!(error = %e, entry = readout.id, "cannot decode read value"),
        }
    }
}
