//! Pushes pending target updates to the device.
//!
//! One write in flight at a time. Plain variables go out as Write blocks,
//! bitfield variables as WriteMasked, RPV entries as WriteRPV. The target
//! update completes exactly once, success or failure; the subsequent read
//! round refreshes the entry value.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, error, warn};

use crate::core::codecs;
use crate::datastore::{Datastore, EntryDefinition, EntryId};
use crate::device::priorities;
use crate::dispatcher::RequestDispatcher;
use crate::protocol::messages::{Protocol, ResponseData};
use crate::protocol::request::Request;
use crate::protocol::response::{Response, ResponseCode};

#[derive(Default)]
struct WriterShared {
    pending: bool,
}

/// Consumes pending target updates and issues write requests.
pub struct MemoryWriter {
    datastore: Rc<RefCell<Datastore>>,
    shared: Rc<RefCell<WriterShared>>,
    started: bool,
}

impl MemoryWriter {
    /// Create a stopped writer over the given datastore.
    pub fn new(datastore: Rc<RefCell<Datastore>>) -> Self {
        Self {
            datastore,
            shared: Rc::new(RefCell::new(WriterShared::default())),
            started: false,
        }
    }

    /// Begin writing.
    pub fn start(&mut self) {
        self.started = true;
    }

    /// Stop writing.
    pub fn stop(&mut self) {
        self.started = false;
        self.shared = Rc::new(RefCell::new(WriterShared::default()));
    }

    /// Pick up and submit the next pending write. Call once per tick.
    pub fn process(&mut self, dispatcher: &mut RequestDispatcher, protocol: &Protocol) {
        if !self.started || self.shared.borrow().pending {
            return;
        }

        let Some(write) = self.datastore.borrow_mut().pop_pending_write() else {
            return;
        };

        let request = self.build_request(protocol, write.id, write.value);
        match request {
            Ok(request) => self.register_write(dispatcher, request, write.id),
            Err(e) => {
                error!(error = %e, entry = write.id, "cannot encode target update");
                let _ = self.datastore.borrow_mut().complete_target_update(write.id, false);
            }
        }
    }

    fn build_request(
        &self,
        protocol: &Protocol,
        id: EntryId,
        value: crate::core::types::Value,
    ) -> crate::core::error::Result<Request> {
        let datastore = self.datastore.borrow();
        let entry = datastore.get_entry(id)?;
        match entry.definition() {
            EntryDefinition::Variable(def) => match def.bitfield {
                Some(bitfield) => {
                    let (data, mask) =
                        codecs::encode_bitfield(&value, def.datatype, def.endianness, bitfield.offset, bitfield.size)?;
                    Ok(protocol.memory_write_masked(def.address, &data, &mask))
                }
                None => {
                    let data = codecs::encode(&value, def.datatype, def.endianness)?;
                    Ok(protocol.memory_write(&[(def.address, &data)]))
                }
            },
            EntryDefinition::Rpv(def) => protocol.write_rpv(&[(def.rpv.id, value)]),
            EntryDefinition::Alias(_) => Err(crate::core::error::ScrutinyError::internal(
                "alias target updates must resolve to their target entry",
            )),
        }
    }

    fn register_write(&self, dispatcher: &mut RequestDispatcher, request: Request, id: EntryId) {
        self.shared.borrow_mut().pending = true;

        let success_shared = Rc::clone(&self.shared);
        let failure_shared = Rc::clone(&self.shared);
        let success_datastore = Rc::clone(&self.datastore);
        let failure_datastore = Rc::clone(&self.datastore);
        dispatcher.register_request(
            request,
            Box::new(move |_request, response: &Response, _data: ResponseData| {
                success_shared.borrow_mut().pending = false;
                let accepted = response.code == ResponseCode::Ok;
                if !accepted {
                    warn!(code = %response.code, entry = id, "device refused a write");
                }
                if let Err(e) = success_datastore.borrow_mut().complete_target_update(id, accepted) {
                    debug!(error = %e, entry = id, "write completion lost its entry");
                }
            }),
            Box::new(move |_request| {
                failure_shared.borrow_mut().pending = false;
                let _ = failure_datastore.borrow_mut().complete_target_update(id, false);
            }),
            priorities::MEMORY_IO,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EmbeddedDataType, Endianness, RuntimePublishedValue, Value};
    use crate::datastore::{Bitfield, RpvDef, TargetUpdateResult, VariableDef};
    use crate::protocol::messages::RequestData;
    use bytes::Bytes;

    fn writer_fixture() -> (Rc<RefCell<Datastore>>, MemoryWriter, RequestDispatcher, Protocol) {
        let datastore = Rc::new(RefCell::new(Datastore::new()));
        let mut writer = MemoryWriter::new(Rc::clone(&datastore));
        writer.start();
        (datastore, writer, RequestDispatcher::new(), Protocol::new(1, 0))
    }

    fn add_float_var(datastore: &Rc<RefCell<Datastore>>, address: u64) -> EntryId {
        datastore
            .borrow_mut()
            .add_entry(EntryDefinition::Variable(VariableDef {
                display_path: format!("/var/{:X}", address),
                datatype: EmbeddedDataType::Float32,
                address,
                endianness: Endianness::Little,
                bitfield: None,
                value_enum: None,
            }))
            .unwrap()
    }

    #[test]
    fn test_variable_write_roundtrip() {
        let (datastore, mut writer, mut dispatcher, protocol) = writer_fixture();
        let id = add_float_var(&datastore, 0x10000);

        let outcome = Rc::new(RefCell::new(None));
        let o = Rc::clone(&outcome);
        datastore
            .borrow_mut()
            .update_target_value(id, Value::Float(2.7), Some(Box::new(move |r| *o.borrow_mut() = Some(r))))
            .unwrap();

        writer.process(&mut dispatcher, &protocol);
        let mut record = dispatcher.next().expect("a write must go out");
        assert_eq!(
            protocol.parse_request(&record.request).unwrap(),
            RequestData::MemoryWrite {
                blocks: vec![(0x10000, Bytes::from_static(&[0xCD, 0xCC, 0x2C, 0x40]))]
            }
        );

        let response = protocol.respond_memory_write(&[(0x10000, 4)]);
        let data = protocol.parse_response(&record.request, &response).unwrap();
        record.complete_success(&response, data);
        assert_eq!(*outcome.borrow(), Some(TargetUpdateResult::Completed));
        assert!(!datastore.borrow().get_entry(id).unwrap().has_pending_target());
    }

    #[test]
    fn test_bitfield_write_uses_masked_variant() {
        let (datastore, mut writer, mut dispatcher, protocol) = writer_fixture();
        let id = datastore
            .borrow_mut()
            .add_entry(EntryDefinition::Variable(VariableDef {
                display_path: "/flags".to_string(),
                datatype: EmbeddedDataType::Uint16,
                address: 0x2000,
                endianness: Endianness::Little,
                bitfield: Some(Bitfield { offset: 4, size: 3 }),
                value_enum: None,
            }))
            .unwrap();

        datastore.borrow_mut().update_target_value(id, Value::Uint(0b101), None).unwrap();
        writer.process(&mut dispatcher, &protocol);
        let record = dispatcher.next().unwrap();
        assert_eq!(
            protocol.parse_request(&record.request).unwrap(),
            RequestData::MemoryWriteMasked {
                address: 0x2000,
                data: Bytes::from_static(&[0x50, 0x00]),
                mask: Bytes::from_static(&[0x70, 0x00]),
            }
        );
    }

    #[test]
    fn test_rpv_write() {
        let (datastore, mut writer, mut dispatcher, mut protocol) = writer_fixture();
        protocol.configure_rpvs(&[RuntimePublishedValue::new(0x1002, EmbeddedDataType::Uint16)]);
        let id = datastore
            .borrow_mut()
            .add_entry(EntryDefinition::Rpv(RpvDef {
                display_path: "/rpv/x1002".to_string(),
                rpv: RuntimePublishedValue::new(0x1002, EmbeddedDataType::Uint16),
            }))
            .unwrap();

        datastore.borrow_mut().update_target_value(id, Value::Uint(0x4242), None).unwrap();
        writer.process(&mut dispatcher, &protocol);
        let record = dispatcher.next().unwrap();
        assert_eq!(
            protocol.parse_request(&record.request).unwrap(),
            RequestData::WriteRpv {
                values: vec![(0x1002, Value::Uint(0x4242))]
            }
        );
    }

    #[test]
    fn test_unencodable_value_fails_target() {
        let (datastore, mut writer, mut dispatcher, protocol) = writer_fixture();
        let id = datastore
            .borrow_mut()
            .add_entry(EntryDefinition::Variable(VariableDef {
                display_path: "/tiny".to_string(),
                datatype: EmbeddedDataType::Uint8,
                address: 0x3000,
                endianness: Endianness::Little,
                bitfield: None,
                value_enum: None,
            }))
            .unwrap();

        let outcome = Rc::new(RefCell::new(None));
        let o = Rc::clone(&outcome);
        datastore
            .borrow_mut()
            .update_target_value(id, Value::Uint(4096), Some(Box::new(move |r| *o.borrow_mut() = Some(r))))
            .unwrap();

        writer.process(&mut dispatcher, &protocol);
        assert!(dispatcher.next().is_none());
        assert_eq!(*outcome.borrow(), Some(TargetUpdateResult::Failed));
    }

    #[test]
    fn test_failed_exchange_fails_target() {
        let (datastore, mut writer, mut dispatcher, protocol) = writer_fixture();
        let id = add_float_var(&datastore, 0x10000);

        let outcome = Rc::new(RefCell::new(None));
        let o = Rc::clone(&outcome);
        datastore
            .borrow_mut()
            .update_target_value(id, Value::Float(1.0), Some(Box::new(move |r| *o.borrow_mut() = Some(r))))
            .unwrap();

        writer.process(&mut dispatcher, &protocol);
        let mut record = dispatcher.next().unwrap();
        record.complete_failure();
        assert_eq!(*outcome.borrow(), Some(TargetUpdateResult::Failed));

        // Writer idle again afterwards.
        writer.process(&mut dispatcher, &protocol);
        assert!(dispatcher.next().is_none());
    }
}
