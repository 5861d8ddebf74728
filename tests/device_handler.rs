//! End-to-end tests: the device handler against the emulated device, pumped
//! in lockstep over an in-process link pair.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use scrutiny_core::config::DeviceHandlerConfig;
use scrutiny_core::datastore::{Datastore, EntryDefinition, EntryId, EntryType, VariableDef};
use scrutiny_core::device::emulator::EmulatedDevice;
use scrutiny_core::device::{ConnectionStatus, DeviceHandler};
use scrutiny_core::link::{InProcLink, InProcLinkHandle, Link};
use scrutiny_core::{EmbeddedDataType, Endianness, Value};

struct Harness {
    datastore: Rc<RefCell<Datastore>>,
    handler: DeviceHandler,
    device: EmulatedDevice,
    link_handle: InProcLinkHandle,
}

fn make_harness(tune: impl FnOnce(&mut EmulatedDevice)) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (mut host, device_side) = InProcLink::pair();
    host.open().unwrap();
    let link_handle = host.handle();

    let mut device = EmulatedDevice::new(device_side);
    tune(&mut device);

    let datastore = Rc::new(RefCell::new(Datastore::new()));
    let config = DeviceHandlerConfig::new()
        .with_response_timeout(Duration::from_millis(250))
        .with_heartbeat_timeout(Duration::from_secs(2));
    let mut handler = DeviceHandler::new(config, Rc::clone(&datastore));
    handler.set_link(Box::new(host));

    Harness {
        datastore,
        handler,
        device,
        link_handle,
    }
}

impl Harness {
    /// Pump both sides until the predicate holds or the deadline passes.
    fn spin_until(&mut self, deadline: Duration, mut predicate: impl FnMut(&mut Harness) -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            self.handler.process();
            self.device.process();
            if predicate(self) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn spin_for(&mut self, duration: Duration) {
        self.spin_until(duration, |_| false);
    }

    fn wait_ready(&mut self) {
        let ready = self.spin_until(Duration::from_millis(1500), |h| {
            h.handler.connection_status() == ConnectionStatus::Ready
        });
        assert!(ready, "handler did not reach READY in time");
    }
}

fn add_watched_variable(
    datastore: &Rc<RefCell<Datastore>>,
    path: &str,
    address: u64,
    datatype: EmbeddedDataType,
) -> EntryId {
    let mut ds = datastore.borrow_mut();
    let id = ds
        .add_entry(EntryDefinition::Variable(VariableDef {
            display_path: path.to_string(),
            datatype,
            address,
            endianness: Endianness::Little,
            bitfield: None,
            value_enum: None,
        }))
        .unwrap();
    ds.start_watching(id, "integration-test", |_, _| {}).unwrap();
    id
}

#[test]
fn test_discover_connect_ready() {
    let mut harness = make_harness(|_| {});
    harness.wait_ready();

    assert!(harness.device.is_connected());
    assert_eq!(harness.handler.comm_error_count(), 0);
    assert!(harness.handler.session_id().is_some());

    let info = harness.handler.device_info().expect("device info must be populated");
    assert!(info.all_ready());
    assert_eq!(info.display_name.as_deref(), Some("EmulatedDevice"));
    assert_eq!(info.device_id.as_deref(), Some("000102030405060708090a0b0c0d0e0f"));
    assert_eq!(info.protocol_major, Some(1));
    assert_eq!(info.max_rx_data_size, Some(harness.device.params().max_rx_data_size));
    assert_eq!(info.max_tx_data_size, Some(harness.device.params().max_tx_data_size));
    assert_eq!(info.max_bitrate_bps, Some(harness.device.params().max_bitrate_bps));
    assert_eq!(info.heartbeat_timeout_us, Some(harness.device.params().heartbeat_timeout_us));
    assert_eq!(info.rx_timeout_us, Some(harness.device.params().rx_timeout_us));
    assert_eq!(info.address_size_bits, Some(32));
    assert_eq!(info.supported_features, Some(harness.device.features()));
    assert_eq!(info.forbidden_memory_regions.as_deref(), Some(harness.device.forbidden_regions()));
    assert_eq!(info.readonly_memory_regions.as_deref(), Some(harness.device.readonly_regions()));
    assert_eq!(info.runtime_published_values.as_deref(), Some(&harness.device.rpv_definitions()[..]));
    assert_eq!(info.loops.as_deref(), Some(harness.device.loops()));

    let diagnostics = harness.handler.diagnostics();
    assert_eq!(diagnostics.connection_status, ConnectionStatus::Ready);
    assert_eq!(diagnostics.comm_error_count, 0);
    assert_eq!(diagnostics.extra["link_open"], serde_json::json!(true));
}

#[test]
fn test_connection_holds_through_heartbeats() {
    let mut harness = make_harness(|_| {});
    harness.wait_ready();

    // Long enough for several heartbeat rounds (interval 1.5 s).
    let lost = harness.spin_until(Duration::from_secs(4), |h| {
        h.handler.connection_status() != ConnectionStatus::Ready
    });
    assert!(!lost, "connection did not hold");
    assert!(harness.device.is_connected());
    assert_eq!(harness.handler.comm_error_count(), 0);
}

#[test]
fn test_throttling_follows_device_declaration() {
    let mut harness = make_harness(|device| device.set_max_bitrate_bps(5_000));
    harness.wait_ready();

    assert!(harness.handler.is_throttling_enabled());
    assert_eq!(harness.handler.throttling_bitrate_bps(), 5_000);

    // With enough watched variables the reader saturates the wire; the
    // achieved bitrate must stay in the vicinity of the cap.
    for i in 0..10u64 {
        add_watched_variable(
            &harness.datastore,
            &format!("/m/var{}", i),
            0x20000 + i * 0x100,
            EmbeddedDataType::Uint64,
        );
    }
    harness.handler.reset_bitrate_monitor();
    harness.spin_for(Duration::from_millis(1500));
    let measured = harness.handler.average_bitrate_bps();
    assert!(measured < 5_000.0 * 1.5, "measured {} bps, cap 5000 bps", measured);
}

#[test]
fn test_auto_disconnect_when_device_goes_silent() {
    let mut harness = make_harness(|_| {});
    harness.wait_ready();

    harness.device.disable_comm();
    let lost = harness.spin_until(Duration::from_secs(5), |h| {
        h.handler.connection_status() != ConnectionStatus::Ready
    });
    assert!(lost, "handler kept a dead session alive");
}

#[test]
fn test_auto_disconnect_when_device_resets() {
    let mut harness = make_harness(|_| {});
    harness.wait_ready();

    harness.device.force_disconnect();
    let lost = harness.spin_until(Duration::from_secs(5), |h| {
        h.handler.connection_status() != ConnectionStatus::Ready
    });
    assert!(lost, "handler did not notice the device reset");
}

#[test]
fn test_reconnects_after_broken_link_heals() {
    let mut harness = make_harness(|_| {});
    harness.wait_ready();

    harness.link_handle.set_broken(true);
    let lost = harness.spin_until(Duration::from_secs(5), |h| {
        h.handler.connection_status() != ConnectionStatus::Ready
    });
    assert!(lost, "handler did not notice the broken link");

    // Heal the link; free the device-side session so the connect is accepted.
    harness.device.force_disconnect();
    harness.link_handle.set_broken(false);
    let recovered = harness.spin_until(Duration::from_secs(5), |h| {
        h.handler.connection_status() == ConnectionStatus::Ready
    });
    assert!(recovered, "handler did not reconnect after the link healed");
    assert!(harness.device.is_connected());
}

#[test]
fn test_clean_disconnect() {
    let mut harness = make_harness(|_| {});
    harness.wait_ready();

    let outcome: Rc<RefCell<Option<bool>>> = Rc::new(RefCell::new(None));
    let o = Rc::clone(&outcome);
    harness.handler.send_disconnect(move |clean| *o.borrow_mut() = Some(clean));

    let done = harness.spin_until(Duration::from_secs(2), |_| outcome.borrow().is_some());
    assert!(done, "disconnect callback never fired");
    assert_eq!(*outcome.borrow(), Some(true));
    assert!(!harness.device.is_connected());
}

#[test]
fn test_session_teardown_clears_rpv_entries() {
    let mut harness = make_harness(|_| {});
    harness.wait_ready();
    assert_eq!(harness.datastore.borrow().count(Some(EntryType::Rpv)), 5);
    let session_id = harness.handler.session_id();
    assert!(session_id.is_some());

    harness.device.disable_comm();
    harness.spin_until(Duration::from_secs(5), |h| {
        h.handler.connection_status() != ConnectionStatus::Ready
    });

    assert!(harness.handler.session_id().is_none());
    assert_eq!(harness.datastore.borrow().count(Some(EntryType::Rpv)), 0);
}

#[test]
fn test_read_write_variables() {
    let mut harness = make_harness(|_| {});

    let float_id = add_watched_variable(&harness.datastore, "/dummy_float32", 0x10000, EmbeddedDataType::Float32);
    let int_id = add_watched_variable(&harness.datastore, "/dummy_sint64", 0x10010, EmbeddedDataType::Sint64);
    let bool_id = add_watched_variable(&harness.datastore, "/dummy_bool", 0x10020, EmbeddedDataType::Boolean);

    harness.wait_ready();

    // Device-side memory changes must surface in the datastore.
    harness.device.write_memory(0x10000, &3.1415926f32.to_le_bytes());
    harness.device.write_memory(0x10010, &0x0123_4567_89AB_CDEFi64.to_le_bytes());
    harness.device.write_memory(0x10020, &[1]);

    let read_back = harness.spin_until(Duration::from_secs(2), |h| {
        let ds = h.datastore.borrow();
        ds.get_value(float_id).unwrap() == Some(Value::Float(3.1415926f32 as f64))
            && ds.get_value(int_id).unwrap() == Some(Value::Sint(0x0123_4567_89AB_CDEF))
            && ds.get_value(bool_id).unwrap() == Some(Value::Bool(true))
    });
    assert!(read_back, "device memory never surfaced in the datastore");

    // Host-side writes must land in device memory, then read back.
    {
        let mut ds = harness.datastore.borrow_mut();
        ds.update_target_value(float_id, Value::Float(2.7), None).unwrap();
        ds.update_target_value(int_id, Value::Sint(0x1122_3344_5566_7788), None).unwrap();
        ds.update_target_value(bool_id, Value::Bool(false), None).unwrap();
    }

    let written = harness.spin_until(Duration::from_secs(2), |h| {
        h.device.read_memory(0x10000, 4) == vec![0xCD, 0xCC, 0x2C, 0x40]
            && h.device.read_memory(0x10010, 8) == 0x1122_3344_5566_7788i64.to_le_bytes().to_vec()
            && h.device.read_memory(0x10020, 1) == vec![0]
    });
    assert!(written, "target updates never reached device memory");

    let observed = harness.spin_until(Duration::from_secs(2), |h| {
        let ds = h.datastore.borrow();
        ds.get_value(float_id).unwrap() == Some(Value::Float(2.7f32 as f64))
            && ds.get_value(int_id).unwrap() == Some(Value::Sint(0x1122_3344_5566_7788))
            && ds.get_value(bool_id).unwrap() == Some(Value::Bool(false))
    });
    assert!(observed, "written values never read back");
    assert_eq!(harness.handler.comm_error_count(), 0);
}

#[test]
fn test_discover_read_write_rpvs() {
    let mut harness = make_harness(|_| {});
    harness.wait_ready();

    let rpv_entries: Vec<EntryId> = {
        let ds = harness.datastore.borrow();
        assert_eq!(ds.count(Some(EntryType::Variable)), 0);
        assert_eq!(ds.count(Some(EntryType::Rpv)), 5);
        ds.list_entries(Some(EntryType::Rpv))
    };
    for id in &rpv_entries {
        harness
            .datastore
            .borrow_mut()
            .start_watching(*id, "integration-test", |_, _| {})
            .unwrap();
    }

    let path_of = |harness: &Harness, id: EntryId| {
        harness.datastore.borrow().get_entry(id).unwrap().display_path().to_string()
    };
    let entry_for = |harness: &Harness, rpv_id: u16| {
        *rpv_entries
            .iter()
            .find(|id| path_of(harness, **id) == format!("/rpv/x{:04X}", rpv_id))
            .unwrap()
    };

    // Host-side writes reach the device.
    let writes: Vec<(u16, Value)> = vec![
        (0x1000, Value::Float(1.5)),
        (0x1001, Value::Float(-2.25)),
        (0x1002, Value::Uint(0xBEEF)),
        (0x1003, Value::Sint(-12)),
        (0x1004, Value::Bool(false)),
    ];
    for (rpv_id, value) in &writes {
        let entry = entry_for(&harness, *rpv_id);
        harness.datastore.borrow_mut().update_target_value(entry, *value, None).unwrap();
    }
    let landed = harness.spin_until(Duration::from_secs(3), |h| {
        writes.iter().all(|(rpv_id, value)| h.device.rpv_value(*rpv_id) == Some(*value))
    });
    assert!(landed, "RPV writes never reached the device");

    // Device-side writes surface in the datastore.
    harness.device.write_rpv(0x1002, Value::Uint(0x0F0F));
    harness.device.write_rpv(0x1004, Value::Bool(true));
    let surfaced = harness.spin_until(Duration::from_secs(3), |h| {
        let ds = h.datastore.borrow();
        ds.get_value(entry_for(h, 0x1002)).unwrap() == Some(Value::Uint(0x0F0F))
            && ds.get_value(entry_for(h, 0x1004)).unwrap() == Some(Value::Bool(true))
    });
    assert!(surfaced, "device RPV writes never surfaced");
    assert_eq!(harness.handler.comm_error_count(), 0);
}

#[test]
fn test_change_link_mid_comm() {
    // A handler with no link idles quietly.
    let datastore = Rc::new(RefCell::new(Datastore::new()));
    let config = DeviceHandlerConfig::new()
        .with_response_timeout(Duration::from_millis(250))
        .with_heartbeat_timeout(Duration::from_secs(2));
    let mut handler = DeviceHandler::new(config, Rc::clone(&datastore));
    for _ in 0..3 {
        handler.process();
    }
    assert_eq!(handler.connection_status(), ConnectionStatus::Disconnected);

    let (mut host1, side1) = InProcLink::pair();
    host1.open().unwrap();
    let mut device1 = EmulatedDevice::new(side1);
    let (mut host2, side2) = InProcLink::pair();
    host2.open().unwrap();
    let mut device2 = EmulatedDevice::new(side2);

    handler.set_link(Box::new(host1));
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        handler.process();
        device1.process();
        if handler.connection_status() == ConnectionStatus::Ready {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(handler.connection_status(), ConnectionStatus::Ready);
    assert!(device1.is_connected());
    assert!(!device2.is_connected());

    // Swap the link: the session drops and the handler adopts device 2.
    handler.set_link(Box::new(host2));
    handler.process();
    assert_ne!(handler.connection_status(), ConnectionStatus::Ready);

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        handler.process();
        device2.process();
        if handler.connection_status() == ConnectionStatus::Ready {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(handler.connection_status(), ConnectionStatus::Ready);
    assert!(device2.is_connected());
    assert_eq!(handler.comm_error_count(), 0);
}
