//! End-to-end transport tests against an in-memory simulated bus.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use hublink_core::channel::{BusChannel, ChannelFactory};
use hublink_core::clock::SystemClock;
use hublink_core::discovery::ModuleDescriptor;
use hublink_core::protocol::{
    Datagram, FrameParser, TransportError, PACKET_ID_ACK, PACKET_ID_CHANGE_ADDRESS,
    PACKET_ID_DISCOVERY, PACKET_ID_DISCOVERY_RESPONSE, PACKET_ID_NACK, PACKET_ID_PING,
    PACKET_ID_QUERY_INTERFACE, PACKET_ID_QUERY_VERSION,
};
use hublink_core::recovery::{ensure_embedded_module, NullResetController};
use hublink_core::transport::{TransportConfig, UsbTransport};

#[derive(Clone)]
struct SimDevice {
    is_parent: bool,
    interface: String,
    version: String,
    nack_reason: Option<u8>,
    silent: bool,
    ping_count: u32,
}

impl SimDevice {
    fn new(is_parent: bool, interface: &str) -> Self {
        Self {
            is_parent,
            interface: interface.to_string(),
            version: "1.2.3".to_string(),
            nack_reason: None,
            silent: false,
            ping_count: 0,
        }
    }
}

struct SimState {
    devices: Mutex<HashMap<u8, SimDevice>>,
    rx: Mutex<VecDeque<u8>>,
    rx_cv: Condvar,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    garbage: AtomicBool,
}

impl SimState {
    fn new(devices: HashMap<u8, SimDevice>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
            rx: Mutex::new(VecDeque::new()),
            rx_cv: Condvar::new(),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            garbage: AtomicBool::new(false),
        })
    }

    fn ping_count(&self, address: u8) -> u32 {
        self.devices
            .lock()
            .unwrap()
            .get(&address)
            .map(|d| d.ping_count)
            .unwrap_or(0)
    }

    fn push_reply(&self, datagram: Datagram) {
        let mut rx = self.rx.lock().unwrap();
        if self.garbage.load(Ordering::SeqCst) {
            // Line noise before every reply; the parser must resync.
            rx.extend([0x00, 0xFF, 0x13]);
        }
        rx.extend(datagram.encode());
        self.rx_cv.notify_all();
    }

    /// The simulated bus side: react to one host frame.
    fn handle_frame(&self, request: &Datagram) {
        if request.packet_id == PACKET_ID_DISCOVERY {
            let devices = self.devices.lock().unwrap();
            let replies: Vec<Datagram> = devices
                .iter()
                .map(|(addr, dev)| {
                    Datagram::new(
                        *addr,
                        PACKET_ID_DISCOVERY_RESPONSE,
                        1,
                        request.msg_num,
                        vec![dev.is_parent as u8],
                    )
                })
                .collect();
            drop(devices);
            for reply in replies {
                self.push_reply(reply);
            }
            return;
        }

        let address = request.source;
        let mut devices = self.devices.lock().unwrap();
        let Some(device) = devices.get_mut(&address) else {
            return;
        };
        if device.silent {
            return;
        }
        if let Some(reason) = device.nack_reason {
            let reply = Datagram::new(address, PACKET_ID_NACK, 1, request.msg_num, vec![reason]);
            drop(devices);
            self.push_reply(reply);
            return;
        }

        let mut moved_to = None;
        let payload = match request.packet_id {
            PACKET_ID_PING => {
                device.ping_count += 1;
                Vec::new()
            }
            PACKET_ID_QUERY_INTERFACE => device.interface.clone().into_bytes(),
            PACKET_ID_QUERY_VERSION => device.version.clone().into_bytes(),
            PACKET_ID_CHANGE_ADDRESS => {
                moved_to = request.payload.first().copied();
                Vec::new()
            }
            _ => Vec::new(),
        };
        let reply = Datagram::new(address, PACKET_ID_ACK, 1, request.msg_num, payload);
        if let Some(new_address) = moved_to {
            if let Some(device) = devices.remove(&address) {
                devices.insert(new_address, device);
            }
        }
        drop(devices);
        self.push_reply(reply);
    }
}

struct SimChannel {
    state: Arc<SimState>,
    parser: FrameParser,
    timeout: Duration,
}

impl BusChannel for SimChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.state.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sim read failure"));
        }
        let deadline = Instant::now() + self.timeout;
        let mut rx = self.state.rx.lock().unwrap();
        loop {
            if !rx.is_empty() {
                let n = buf.len().min(rx.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = rx.pop_front().unwrap();
                }
                return Ok(n);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "sim read timeout"));
            }
            let (guard, _) = self.state.rx_cv.wait_timeout(rx, deadline - now).unwrap();
            rx = guard;
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "sim write failure"));
        }
        for datagram in self.parser.extend(buf) {
            self.state.handle_frame(&datagram);
        }
        Ok(())
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.state.rx.lock().unwrap().clear();
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn BusChannel>> {
        Ok(Box::new(SimChannel {
            state: Arc::clone(&self.state),
            parser: FrameParser::new(),
            timeout: self.timeout,
        }))
    }
}

struct SimFactory {
    state: Arc<SimState>,
}

impl ChannelFactory for SimFactory {
    fn open(&self) -> Result<Box<dyn BusChannel>, TransportError> {
        Ok(Box::new(SimChannel {
            state: Arc::clone(&self.state),
            parser: FrameParser::new(),
            timeout: Duration::from_millis(100),
        }))
    }
}

fn test_config() -> TransportConfig {
    TransportConfig {
        port_name: "sim".into(),
        // High baud keeps the discovery window short in real time.
        baud_rate: 1_000_000,
        response_timeout: Duration::from_millis(200),
        capability_timeout: Duration::from_millis(1000),
        keepalive_interval: Duration::from_secs(60),
        discovery_slot: Duration::ZERO,
        discovery_margin: Duration::from_millis(10),
        system_operation_workers: 2,
    }
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn sim_transport(config: TransportConfig, state: &Arc<SimState>) -> UsbTransport {
    init_logging();
    UsbTransport::with_parts(
        config,
        Box::new(SimFactory {
            state: Arc::clone(state),
        }),
        Arc::new(SystemClock),
        Box::new(NullResetController),
    )
}

fn hub_descriptor(user_module: bool) -> ModuleDescriptor {
    ModuleDescriptor {
        address: 173,
        parent_address: 173,
        user_module,
        name: "hub".into(),
    }
}

fn three_module_bus() -> Arc<SimState> {
    let mut devices = HashMap::new();
    devices.insert(173, SimDevice::new(true, "hub-if"));
    devices.insert(1, SimDevice::new(false, "leg-a"));
    devices.insert(2, SimDevice::new(false, "leg-b"));
    SimState::new(devices)
}

#[test]
fn arm_bring_up_and_ping() {
    let state = three_module_bus();
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();
    assert!(transport.is_armed());
    assert!(transport.is_engaged());

    let hub = transport.get_or_add_module(&hub_descriptor(true)).unwrap();
    assert!(hub.is_open());
    assert_eq!(hub.interface(), Some("hub-if".to_string()));
    assert_eq!(hub.firmware_version(), Some("1.2.3".to_string()));

    hub.ping(false).unwrap();
    assert!(state.ping_count(173) >= 2);
    transport.disarm();
    assert!(!transport.is_armed());
}

#[test]
fn discovery_enumerates_parent_and_children() {
    let state = three_module_bus();
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();

    let metas = transport.discover_modules(true).unwrap();
    assert_eq!(metas.len(), 3);
    assert_eq!(metas.iter().filter(|m| m.is_parent).count(), 1);
    // Parents are reported before children.
    assert!(metas[0].is_parent);
    assert_eq!(metas[0].address, 173);
    for meta in &metas {
        assert!(meta.interface.is_some(), "missing identity for {}", meta.address);
    }

    // Discovery-created modules are leased, queried, and auto-closed;
    // the registry is left as it was found.
    thread::sleep(Duration::from_millis(100));
    assert!(transport.modules().is_empty());
}

#[test]
fn discovery_is_idempotent() {
    let state = three_module_bus();
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();

    let first = transport.discover_modules(true).unwrap();
    thread::sleep(Duration::from_millis(100));
    let second = transport.discover_modules(true).unwrap();
    assert_eq!(first, second);
}

#[test]
fn nack_surfaces_reason_and_rolls_back_bring_up() {
    let mut devices = HashMap::new();
    let mut grumpy = SimDevice::new(true, "hub-if");
    grumpy.nack_reason = Some(0x42);
    devices.insert(173, grumpy);
    let state = SimState::new(devices);
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();

    let err = transport
        .get_or_add_module(&hub_descriptor(true))
        .unwrap_err();
    assert!(matches!(
        err,
        TransportError::Nack {
            address: 173,
            reason: 0x42
        }
    ));
    // Failed bring-up leaves no registry entry behind.
    assert!(transport.module(173).is_none());
}

#[test]
fn silent_module_times_out() {
    let mut devices = HashMap::new();
    let mut mute = SimDevice::new(true, "hub-if");
    mute.silent = true;
    devices.insert(173, mute);
    let state = SimState::new(devices);
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();

    let err = transport
        .get_or_add_module(&hub_descriptor(true))
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout));
}

#[test]
fn responses_survive_line_noise() {
    let state = three_module_bus();
    state.garbage.store(true, Ordering::SeqCst);
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();

    let hub = transport.get_or_add_module(&hub_descriptor(true)).unwrap();
    hub.ping(false).unwrap();
    assert_eq!(hub.interface(), Some("hub-if".to_string()));
}

#[test]
fn system_operation_timeout_releases_leases() {
    let state = three_module_bus();
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();
    let hub = transport.get_or_add_module(&hub_descriptor(true)).unwrap();

    let err = transport
        .perform_system_operation(
            173,
            173,
            |_m| {
                thread::sleep(Duration::from_millis(300));
                Ok(())
            },
            Duration::from_millis(50),
        )
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout));

    // The abandoned worker finishes eventually and its lease releases.
    thread::sleep(Duration::from_millis(400));
    assert_eq!(hub.system_operation_count(), 0);
    // User modules survive the lease cycle.
    assert!(hub.is_open());
    assert!(transport.module(173).is_some());
}

#[test]
fn non_user_module_auto_closes_after_lease_cycle() {
    let state = three_module_bus();
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();
    transport.get_or_add_module(&hub_descriptor(true)).unwrap();
    transport
        .get_or_add_module(&ModuleDescriptor {
            address: 1,
            parent_address: 173,
            user_module: false,
            name: "leg-a".into(),
        })
        .unwrap();

    transport
        .perform_system_operation(1, 173, |m| m.ping(true), Duration::from_secs(2))
        .unwrap();

    // The lease guard drops on the worker after the result is delivered.
    thread::sleep(Duration::from_millis(100));
    assert!(transport.module(1).is_none(), "non-user module must auto-close");
    assert!(transport.module(173).is_some(), "user parent must survive");
}

#[test]
fn write_failure_latches_abnormal_shutdown_until_rearm() {
    let state = three_module_bus();
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();
    let hub = transport.get_or_add_module(&hub_descriptor(true)).unwrap();

    state.fail_writes.store(true, Ordering::SeqCst);
    let err = hub.ping(true).unwrap_err();
    assert!(matches!(err, TransportError::TransportUnavailable));
    assert!(transport.is_abnormally_shut_down());

    // Latched: still unavailable even though writes would now succeed.
    state.fail_writes.store(false, Ordering::SeqCst);
    assert!(matches!(
        hub.ping(true),
        Err(TransportError::TransportUnavailable)
    ));

    // Only an explicit re-arm clears the latch.
    transport.disarm();
    transport.arm().unwrap();
    assert!(!transport.is_abnormally_shut_down());
    hub.ping(false).unwrap();
}

#[test]
fn read_failure_latches_and_wakes_blocked_callers() {
    let state = three_module_bus();
    let mut config = test_config();
    // Long enough that only the shutdown drain can wake the caller.
    config.response_timeout = Duration::from_secs(5);
    let transport = sim_transport(config, &state);
    transport.arm().unwrap();
    let hub = transport.get_or_add_module(&hub_descriptor(true)).unwrap();

    // Mute the device so the next command blocks awaiting its reply.
    state.devices.lock().unwrap().get_mut(&173).unwrap().silent = true;
    let started = Instant::now();
    let pinger = {
        let hub = Arc::clone(&hub);
        thread::spawn(move || hub.ping(true))
    };
    thread::sleep(Duration::from_millis(50));
    state.fail_reads.store(true, Ordering::SeqCst);

    let result = pinger.join().unwrap();
    assert!(matches!(result, Err(TransportError::TransportUnavailable)));
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "caller must be woken by the drain, not its own timeout"
    );
    assert!(transport.is_abnormally_shut_down());
}

#[test]
fn unreachable_known_module_recorded_missing_at_arm() {
    let state = three_module_bus();
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();
    transport.get_or_add_module(&hub_descriptor(true)).unwrap();
    transport
        .get_or_add_module(&ModuleDescriptor {
            address: 1,
            parent_address: 173,
            user_module: true,
            name: "leg-a".into(),
        })
        .unwrap();
    assert!(transport.missing_modules().is_empty());

    transport.disarm();
    state.devices.lock().unwrap().get_mut(&1).unwrap().silent = true;
    transport.arm().unwrap();

    let missing = transport.missing_modules();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].address, 1);
    assert_eq!(missing[0].name, "leg-a");
    // Unreachable modules stay registered; the record is diagnostic only.
    assert!(transport.module(1).is_some());

    // A later arm where the module answers clears the record.
    transport.disarm();
    state.devices.lock().unwrap().get_mut(&1).unwrap().silent = false;
    transport.arm().unwrap();
    assert!(transport.missing_modules().is_empty());
}

#[test]
fn disengage_blocks_traffic_without_closing() {
    let state = three_module_bus();
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();
    let hub = transport.get_or_add_module(&hub_descriptor(true)).unwrap();

    transport.disengage();
    assert!(transport.is_armed());
    assert!(hub.ping(true).is_err());

    transport.engage();
    hub.ping(false).unwrap();
}

#[test]
fn renumbering_moves_module_and_device() {
    let mut devices = HashMap::new();
    devices.insert(42, SimDevice::new(true, "hub-if"));
    let state = SimState::new(devices);
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();

    let module = transport
        .get_or_add_module(&ModuleDescriptor {
            address: 42,
            parent_address: 42,
            user_module: true,
            name: "hub".into(),
        })
        .unwrap();

    transport
        .change_module_address(&module, 99, |m| {
            // Mid-renumber the module is reachable under both addresses.
            assert!(transport.module(42).is_some());
            assert!(transport.module(99).is_some());
            m.send_change_address(99)
        })
        .unwrap();

    assert_eq!(module.address(), 99);
    assert_eq!(module.parent_address(), 99);
    assert!(transport.module(42).is_none());
    assert!(transport.module(99).is_some());
    // The device really moved: traffic works at the new address.
    module.ping(false).unwrap();
    assert!(state.ping_count(99) >= 1);
    assert_eq!(state.ping_count(42), 0);
}

#[test]
fn renumbering_never_drops_new_address_visibility() {
    let mut devices = HashMap::new();
    devices.insert(42, SimDevice::new(true, "hub-if"));
    let state = SimState::new(devices);
    let transport = Arc::new(sim_transport(test_config(), &state));
    transport.arm().unwrap();
    let module = transport
        .get_or_add_module(&ModuleDescriptor {
            address: 42,
            parent_address: 42,
            user_module: true,
            name: "hub".into(),
        })
        .unwrap();

    // Once the module becomes visible under the new address it must stay
    // visible through the handover from shadow map to registry.
    let stop = Arc::new(AtomicBool::new(false));
    let went_dark = Arc::new(AtomicBool::new(false));
    let watcher = {
        let transport = Arc::clone(&transport);
        let stop = Arc::clone(&stop);
        let went_dark = Arc::clone(&went_dark);
        thread::spawn(move || {
            let mut was_visible = false;
            while !stop.load(Ordering::SeqCst) {
                let visible = transport.module(99).is_some();
                if was_visible && !visible {
                    went_dark.store(true, Ordering::SeqCst);
                }
                was_visible |= visible;
                thread::yield_now();
            }
        })
    };

    transport
        .change_module_address(&module, 99, |m| m.send_change_address(99))
        .unwrap();
    stop.store(true, Ordering::SeqCst);
    watcher.join().unwrap();

    assert!(!went_dark.load(Ordering::SeqCst));
    assert!(transport.module(99).is_some());
}

#[test]
fn renumbering_to_occupied_address_is_rejected() {
    let state = three_module_bus();
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();
    let hub = transport.get_or_add_module(&hub_descriptor(true)).unwrap();
    transport
        .get_or_add_module(&ModuleDescriptor {
            address: 1,
            parent_address: 173,
            user_module: true,
            name: "leg-a".into(),
        })
        .unwrap();

    let err = transport
        .change_module_address(&hub, 1, |m| m.send_change_address(1))
        .unwrap_err();
    assert!(matches!(err, TransportError::AddressInUse(1)));
    assert_eq!(hub.address(), 173);
}

#[test]
fn recovery_renumbers_stray_parent() {
    // Expected at 173, actually answering at 200.
    let mut devices = HashMap::new();
    devices.insert(200, SimDevice::new(true, "hub-if"));
    let state = SimState::new(devices);
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();

    let module = ensure_embedded_module(&transport, &hub_descriptor(true), None).unwrap();
    assert_eq!(module.address(), 173);
    module.ping(false).unwrap();
    assert!(transport.module(173).is_some());
    assert!(transport.module(200).is_none());
}

#[test]
fn keepalive_pings_idle_modules() {
    let state = three_module_bus();
    let mut config = test_config();
    config.keepalive_interval = Duration::from_millis(50);
    let transport = sim_transport(config, &state);
    transport.arm().unwrap();
    let hub = transport.get_or_add_module(&hub_descriptor(true)).unwrap();
    assert!(hub.is_open());

    let after_bring_up = state.ping_count(173);
    thread::sleep(Duration::from_millis(500));
    assert!(
        state.ping_count(173) > after_bring_up,
        "keepalive should ping an idle module"
    );
}

#[test]
fn counters_track_traffic() {
    let state = three_module_bus();
    let transport = sim_transport(test_config(), &state);
    transport.arm().unwrap();
    let hub = transport.get_or_add_module(&hub_descriptor(true)).unwrap();
    hub.ping(false).unwrap();

    let (tx_bytes, rx_bytes, tx_frames, rx_frames) = transport.counters();
    assert!(tx_frames >= 4, "bring-up plus ping is at least four frames");
    assert!(rx_frames >= 4);
    assert!(tx_bytes > tx_frames);
    assert!(rx_bytes > rx_frames);
}
