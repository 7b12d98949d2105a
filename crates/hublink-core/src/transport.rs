//! Transport engine
//!
//! Owns the physical USB connection to the bus: the registry of known
//! modules, the background reader that resynchronizes to frame
//! boundaries and demultiplexes datagrams, the keyed bus lock, periodic
//! keepalive pinging, system-operation leasing, and the broadcast
//! discovery procedure.
//!
//! Lifecycle: unarmed → armed (device open, reader running, keepalive
//! active) → disarmed → dropped. Engage/disengage is a secondary switch
//! layered on the armed state that suspends traffic without tearing down
//! the USB handle, supporting suspend/resume without re-discovery.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::channel::{BusChannel, ChannelFactory, SerialChannelFactory};
use crate::clock::{Clock, SystemClock};
use crate::discovery::{discovery_window, DiscoveredInfo, ModuleDescriptor, ModuleMeta};
use crate::module::Module;
use crate::protocol::{
    Message, MessageKeyedLock, TransportError, DEFAULT_BAUD_RATE, PACKET_ID_DISCOVERY,
    PACKET_ID_DISCOVERY_RESPONSE,
};
use crate::recovery::{hardware_reset, NullResetController, ResetController};
use crate::worker::WorkerPool;

/// How long a single blocking read may hold the reader thread before it
/// re-checks its shutdown signal.
const READER_POLL: Duration = Duration::from_millis(100);

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Serial port name.
    pub port_name: String,
    /// Baud rate of the USB serial link.
    pub baud_rate: u32,
    /// Per-exchange response timeout.
    pub response_timeout: Duration,
    /// Per-module timeout for identity queries during discovery.
    pub capability_timeout: Duration,
    /// Idle interval after which a module is pinged to keep it alive.
    pub keepalive_interval: Duration,
    /// Response slot reserved for each addressable module during the
    /// discovery window.
    pub discovery_slot: Duration,
    /// Safety margin added to the discovery window.
    pub discovery_margin: Duration,
    /// Worker threads available for background system operations.
    pub system_operation_workers: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            response_timeout: Duration::from_millis(crate::protocol::DEFAULT_TIMEOUT_MS),
            capability_timeout: Duration::from_millis(1000),
            keepalive_interval: Duration::from_millis(2500),
            discovery_slot: Duration::from_millis(3),
            discovery_margin: Duration::from_millis(50),
            system_operation_workers: 2,
        }
    }
}

/// Shared engine state: everything the reader thread, keepalive thread,
/// worker pool, and caller threads touch.
pub(crate) struct TransportCore {
    config: TransportConfig,
    clock: Arc<dyn Clock>,
    bus_lock: MessageKeyedLock,
    channel: Mutex<Option<Box<dyn BusChannel>>>,
    modules: RwLock<HashMap<u8, Arc<Module>>>,
    // Transient second key for a module whose address is mid-renumber,
    // so lookups by either address succeed during the window.
    changing: Mutex<HashMap<u8, Arc<Module>>>,
    discovered: Mutex<HashMap<u8, DiscoveredInfo>>,
    missing: Mutex<Vec<ModuleDescriptor>>,
    workers: WorkerPool,
    armed: AtomicBool,
    engaged: AtomicBool,
    abnormal: AtomicBool,
    reader_run: AtomicBool,
    keepalive_run: AtomicBool,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    tx_frames: AtomicU64,
    rx_frames: AtomicU64,
}

impl TransportCore {
    pub(crate) fn bus_lock(&self) -> &MessageKeyedLock {
        &self.bus_lock
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    fn lock_channel(&self) -> MutexGuard<'_, Option<Box<dyn BusChannel>>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_modules_write(&self) -> RwLockWriteGuard<'_, HashMap<u8, Arc<Module>>> {
        self.modules.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_changing(&self) -> MutexGuard<'_, HashMap<u8, Arc<Module>>> {
        self.changing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_discovered(&self) -> MutexGuard<'_, HashMap<u8, DiscoveredInfo>> {
        self.discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_missing(&self) -> MutexGuard<'_, Vec<ModuleDescriptor>> {
        self.missing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look a module up by address, consulting the renumbering shadow map
    /// as well so mid-renumber lookups by either address succeed.
    pub(crate) fn find_module(&self, address: u8) -> Option<Arc<Module>> {
        if let Some(module) = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
        {
            return Some(Arc::clone(module));
        }
        self.lock_changing().get(&address).cloned()
    }

    fn modules_snapshot(&self) -> Vec<Arc<Module>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Remove `module` from the registry and shadow map. Ignores entries
    /// that are a different module at the same address.
    pub(crate) fn unregister(&self, module: &Module) {
        let address = module.address();
        {
            let mut registry = self.lock_modules_write();
            if let Some(existing) = registry.get(&address) {
                if std::ptr::eq(existing.as_ref(), module) {
                    registry.remove(&address);
                }
            }
        }
        self.lock_changing()
            .retain(|_, m| !std::ptr::eq(m.as_ref(), module));
    }

    /// Write one message to the bus.
    ///
    /// Any I/O failure latches the whole transport into abnormal
    /// shutdown: byte-level corruption cannot be safely partially
    /// retried, so one failed write poisons the transport. The message
    /// is not stamped in that case ("pretend transmit"), leaving
    /// higher-level retry logic free to treat it as never sent.
    pub(crate) fn transmit(&self, message: &Message) -> Result<(), TransportError> {
        if self.abnormal.load(Ordering::SeqCst) {
            return Err(TransportError::TransportUnavailable);
        }
        if !self.armed.load(Ordering::SeqCst) {
            return Err(TransportError::NotArmed);
        }
        if !self.engaged.load(Ordering::SeqCst) {
            return Err(TransportError::NotEngaged);
        }

        let bytes = message.datagram().encode();
        let result = {
            let mut guard = self.lock_channel();
            match guard.as_mut() {
                Some(channel) => channel.write_all(&bytes),
                None => return Err(TransportError::NotArmed),
            }
        };
        match result {
            Ok(()) => {
                self.tx_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                self.tx_frames.fetch_add(1, Ordering::Relaxed);
                message.mark_transmitted(Instant::now());
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "bus write failed; latching abnormal shutdown");
                self.latch_abnormal_shutdown();
                Err(TransportError::TransportUnavailable)
            }
        }
    }

    /// Latch the abnormal-shutdown state and drain every in-flight
    /// command with a "pretend finish" so no caller is left waiting on a
    /// reply that will never arrive. Runs at most once per arm cycle.
    fn latch_abnormal_shutdown(&self) {
        if self.abnormal.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("transport latched abnormal shutdown; draining in-flight commands");
        for module in self.modules_snapshot() {
            module.fail_pending();
        }
        let changing: Vec<Arc<Module>> = self.lock_changing().values().cloned().collect();
        for module in changing {
            module.fail_pending();
        }
    }

    /// Reader thread body: resynchronize, decode, demultiplex.
    fn read_loop(self: Arc<Self>, mut channel: Box<dyn BusChannel>) {
        debug!("reader thread started");
        let mut parser = crate::protocol::FrameParser::new();
        let mut buf = [0u8; 512];
        while self.reader_run.load(Ordering::SeqCst) {
            match channel.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    self.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    for datagram in parser.extend(&buf[..n]) {
                        self.rx_frames.fetch_add(1, Ordering::Relaxed);
                        self.route(datagram);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    if self.reader_run.load(Ordering::SeqCst) {
                        error!(error = %e, "bus read failed");
                        self.latch_abnormal_shutdown();
                    }
                    break;
                }
            }
        }
        debug!(
            frames = parser.stats().frames,
            garbage = parser.stats().garbage_bytes,
            checksum_failures = parser.stats().checksum_failures,
            "reader thread exiting"
        );
    }

    /// Route one decoded datagram: discovery responses are handled
    /// bus-wide, everything else goes to the owning module. Datagrams
    /// for unknown addresses are silently dropped; the bus may carry
    /// modules this host has not configured.
    fn route(&self, datagram: crate::protocol::Datagram) {
        if datagram.packet_id == PACKET_ID_DISCOVERY_RESPONSE {
            let is_parent = datagram.payload.first().map(|b| b & 1 == 1).unwrap_or(false);
            let address = datagram.source;
            // First writer wins, so a duplicated reply cannot flip the
            // classification mid-discovery.
            self.lock_discovered()
                .entry(address)
                .or_insert(DiscoveredInfo { address, is_parent });
            return;
        }
        match self.find_module(datagram.source) {
            Some(module) => module.handle_incoming(datagram),
            None => trace!(
                source = datagram.source,
                packet_id = datagram.packet_id,
                "dropping datagram for unknown address"
            ),
        }
    }

    fn keepalive_loop(self: Arc<Self>) {
        debug!("keepalive thread started");
        let interval = self.config.keepalive_interval;
        let poll = interval.min(Duration::from_millis(250));
        while self.keepalive_run.load(Ordering::SeqCst) {
            // Pace on real time: the injected clock governs protocol
            // delays, and a manual clock would turn this loop into a spin.
            thread::sleep(poll);
            if !self.keepalive_run.load(Ordering::SeqCst) {
                break;
            }
            if !self.armed.load(Ordering::SeqCst)
                || !self.engaged.load(Ordering::SeqCst)
                || self.abnormal.load(Ordering::SeqCst)
            {
                continue;
            }
            let now = Instant::now();
            for module in self.modules_snapshot() {
                if module.is_open() && module.keepalive_due(now, interval) {
                    if let Err(e) = module.ping(true) {
                        debug!(address = module.address(), error = %e, "keepalive ping failed");
                    }
                }
            }
        }
        debug!("keepalive thread exiting");
    }
}

/// Releases system-operation leases on every exit path, including worker
/// panic.
struct LeaseGuard {
    modules: Vec<Arc<Module>>,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        for module in &self.modules {
            module.end_system_operation();
        }
    }
}

/// The root aggregate: one physical USB device carrying a bus of
/// addressable modules.
pub struct UsbTransport {
    core: Arc<TransportCore>,
    factory: Box<dyn ChannelFactory>,
    reset: Box<dyn ResetController>,
    has_reset: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl UsbTransport {
    /// Transport over the serial port named in `config`, with the real
    /// clock and no reset lines.
    pub fn new(config: TransportConfig) -> Self {
        let factory = SerialChannelFactory::new(config.port_name.clone(), config.baud_rate);
        Self::with_parts(
            config,
            Box::new(factory),
            Arc::new(SystemClock),
            Box::new(NullResetController),
        )
    }

    /// Transport with injected channel factory, clock, and reset
    /// controller. This is the seam tests and bespoke hardware use.
    pub fn with_parts(
        config: TransportConfig,
        factory: Box<dyn ChannelFactory>,
        clock: Arc<dyn Clock>,
        reset: Box<dyn ResetController>,
    ) -> Self {
        let workers = WorkerPool::new(config.system_operation_workers);
        let core = Arc::new(TransportCore {
            config,
            clock,
            bus_lock: MessageKeyedLock::new(),
            channel: Mutex::new(None),
            modules: RwLock::new(HashMap::new()),
            changing: Mutex::new(HashMap::new()),
            discovered: Mutex::new(HashMap::new()),
            missing: Mutex::new(Vec::new()),
            workers,
            armed: AtomicBool::new(false),
            engaged: AtomicBool::new(false),
            abnormal: AtomicBool::new(false),
            reader_run: AtomicBool::new(false),
            keepalive_run: AtomicBool::new(false),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_frames: AtomicU64::new(0),
            rx_frames: AtomicU64::new(0),
        });
        Self {
            core,
            factory,
            reset,
            has_reset: AtomicBool::new(false),
            reader: Mutex::new(None),
            keepalive: Mutex::new(None),
        }
    }

    /// Open the device, start the reader and keepalive threads, and
    /// bring up all already-known modules (parents before children — a
    /// child may only be reachable through its parent's routing).
    ///
    /// A hardware reset is performed only on the first arm of this
    /// transport: resets are destructive to in-flight peripheral state.
    pub fn arm(&self) -> Result<(), TransportError> {
        if self.core.armed.load(Ordering::SeqCst) {
            return Err(TransportError::AlreadyArmed);
        }
        info!("arming transport");

        if !self.has_reset.swap(true, Ordering::SeqCst) {
            hardware_reset(self.reset.as_ref(), self.core.clock())?;
        }

        let mut channel = self.factory.open()?;
        channel.set_read_timeout(READER_POLL)?;
        channel.clear_buffers()?;
        let reader_channel = channel.try_clone()?;
        *self.core.lock_channel() = Some(channel);

        self.core.abnormal.store(false, Ordering::SeqCst);
        self.core.armed.store(true, Ordering::SeqCst);
        self.core.engaged.store(true, Ordering::SeqCst);
        self.core.reader_run.store(true, Ordering::SeqCst);

        let core = Arc::clone(&self.core);
        let reader = thread::Builder::new()
            .name("hublink-reader".into())
            .spawn(move || core.read_loop(reader_channel))?;
        *self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reader);

        self.initial_module_pass();

        self.core.keepalive_run.store(true, Ordering::SeqCst);
        let core = Arc::clone(&self.core);
        let keepalive = thread::Builder::new()
            .name("hublink-keepalive".into())
            .spawn(move || core.keepalive_loop())?;
        *self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(keepalive);

        info!("transport armed");
        Ok(())
    }

    /// Re-confirm every known module, parents first. Unreachable modules
    /// are recorded for diagnostics, not removed.
    fn initial_module_pass(&self) {
        self.core.lock_missing().clear();
        let mut modules = self.core.modules_snapshot();
        modules.sort_by_key(|m| (!m.is_parent(), m.address()));
        for module in modules {
            if let Err(e) = module.ping_and_query_known_interfaces() {
                warn!(
                    address = module.address(),
                    name = module.name(),
                    error = %e,
                    "known module unreachable at arm"
                );
                self.core.lock_missing().push(module.descriptor());
            }
        }
    }

    /// Stop keepalive and the reader, fail-safe open modules, and close
    /// the physical handle. Disarming an unarmed transport is a no-op.
    pub fn disarm(&self) {
        if !self.core.armed.load(Ordering::SeqCst) {
            return;
        }
        info!("disarming transport");

        // Best effort: put peripherals into a safe state while the bus
        // still carries traffic.
        if !self.core.abnormal.load(Ordering::SeqCst) {
            for module in self.core.modules_snapshot() {
                if module.is_open() {
                    module.fail_safe();
                }
            }
        }

        self.core.keepalive_run.store(false, Ordering::SeqCst);
        self.core.reader_run.store(false, Ordering::SeqCst);
        self.core.armed.store(false, Ordering::SeqCst);
        self.core.engaged.store(false, Ordering::SeqCst);

        if let Some(handle) = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = handle.join();
        }
        if let Some(handle) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            // The reader's blocking read times out within READER_POLL and
            // re-checks its shutdown signal, so the join is bounded.
            let _ = handle.join();
        }
        *self.core.lock_channel() = None;
        info!("transport disarmed");
    }

    /// Resume traffic after [`disengage`](Self::disengage).
    pub fn engage(&self) {
        if !self.core.armed.load(Ordering::SeqCst) {
            warn!("engage called on unarmed transport");
            return;
        }
        self.core.engaged.store(true, Ordering::SeqCst);
        debug!("transport engaged");
    }

    /// Suspend transmits and keepalive pinging without tearing down the
    /// USB handle. Supports suspend/resume without full re-discovery.
    pub fn disengage(&self) {
        self.core.engaged.store(false, Ordering::SeqCst);
        debug!("transport disengaged");
    }

    /// Whether the transport is armed.
    pub fn is_armed(&self) -> bool {
        self.core.armed.load(Ordering::SeqCst)
    }

    /// Whether the transport is engaged.
    pub fn is_engaged(&self) -> bool {
        self.core.engaged.load(Ordering::SeqCst)
    }

    /// Whether a fatal I/O failure has latched the transport. Cleared
    /// only by an explicit re-arm.
    pub fn is_abnormally_shut_down(&self) -> bool {
        self.core.abnormal.load(Ordering::SeqCst)
    }

    /// One-way fatal stop: poisons the bus lock so no thread can ever
    /// acquire it again for the remaining process lifetime.
    pub fn hang_all_future_traffic(&self) {
        self.core.bus_lock().hang_all_future_acquisitions();
    }

    /// Cumulative (tx bytes, rx bytes, tx frames, rx frames).
    pub fn counters(&self) -> (u64, u64, u64, u64) {
        (
            self.core.tx_bytes.load(Ordering::Relaxed),
            self.core.rx_bytes.load(Ordering::Relaxed),
            self.core.tx_frames.load(Ordering::Relaxed),
            self.core.rx_frames.load(Ordering::Relaxed),
        )
    }

    /// Module registered at `address`, if any (including mid-renumber
    /// shadow entries).
    pub fn module(&self, address: u8) -> Option<Arc<Module>> {
        self.core.find_module(address)
    }

    /// Snapshot of all registered modules.
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.core.modules_snapshot()
    }

    /// Modules that were configured but unreachable during the last arm.
    /// Diagnostic reporting only.
    pub fn missing_modules(&self) -> Vec<ModuleDescriptor> {
        self.core.lock_missing().clone()
    }

    /// Return the module registered at the descriptor's address, or
    /// create it: register, ping, and query identity. A module whose
    /// initial bring-up fails is rolled back out of the registry
    /// entirely rather than left half-open.
    pub fn get_or_add_module(
        &self,
        descriptor: &ModuleDescriptor,
    ) -> Result<Arc<Module>, TransportError> {
        if let Some(existing) = self.core.find_module(descriptor.address) {
            return Ok(existing);
        }
        let module = Arc::new(Module::new(Arc::downgrade(&self.core), descriptor));
        {
            let mut registry = self.core.lock_modules_write();
            if let Some(existing) = registry.get(&descriptor.address) {
                return Ok(Arc::clone(existing));
            }
            registry.insert(descriptor.address, Arc::clone(&module));
        }
        match module.ping_and_query_known_interfaces() {
            Ok(()) => {
                debug!(
                    address = descriptor.address,
                    name = %descriptor.name,
                    "module added"
                );
                Ok(module)
            }
            Err(e) => {
                warn!(
                    address = descriptor.address,
                    error = %e,
                    "module bring-up failed; rolling back"
                );
                let mut registry = self.core.lock_modules_write();
                if let Some(existing) = registry.get(&descriptor.address) {
                    if Arc::ptr_eq(existing, &module) {
                        registry.remove(&descriptor.address);
                    }
                }
                Err(e)
            }
        }
    }

    /// Run `operation` against the module at `module_address` on a
    /// background worker with a hard wall-clock timeout, leasing both the
    /// target and its parent open for the operation's duration.
    ///
    /// Leases are released on every path — completion, failure, timeout,
    /// worker panic — so the registry never leaks an open-but-
    /// unreferenced module. On timeout the worker is abandoned (the
    /// operation itself cannot be preempted) and its leases release when
    /// it eventually finishes.
    pub fn perform_system_operation<F, R>(
        &self,
        module_address: u8,
        parent_address: u8,
        operation: F,
        timeout: Duration,
    ) -> Result<R, TransportError>
    where
        F: FnOnce(&Arc<Module>) -> Result<R, TransportError> + Send + 'static,
        R: Send + 'static,
    {
        let module = self
            .core
            .find_module(module_address)
            .ok_or(TransportError::ModuleNotFound(module_address))?;
        let parent = self
            .core
            .find_module(parent_address)
            .ok_or(TransportError::ModuleNotFound(parent_address))?;

        module.begin_system_operation();
        let mut leased = vec![Arc::clone(&module)];
        if !Arc::ptr_eq(&module, &parent) {
            parent.begin_system_operation();
            leased.push(parent);
        }
        let guard = LeaseGuard { modules: leased };

        let (tx, rx) = mpsc::channel();
        let target = Arc::clone(&module);
        let submitted = self.core.workers().execute(move || {
            let _guard = guard;
            let result = operation(&target);
            let _ = tx.send(result);
        });
        if !submitted {
            return Err(TransportError::SystemOperation(
                "worker pool unavailable".into(),
            ));
        }

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    module = module_address,
                    timeout_ms = timeout.as_millis() as u64,
                    "system operation exceeded its deadline; abandoning worker"
                );
                Err(TransportError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::SystemOperation(
                "operation worker terminated unexpectedly".into(),
            )),
        }
    }

    /// Broadcast a discovery request, wait out the bounded reply window,
    /// and classify every replier. With `check_capabilities` each
    /// discovered module's identity is additionally queried through the
    /// system-operation path with a short per-module timeout; a single
    /// module's query failing is logged, not fatal to the discovery.
    pub fn discover_modules(
        &self,
        check_capabilities: bool,
    ) -> Result<Vec<ModuleMeta>, TransportError> {
        if !self.core.armed.load(Ordering::SeqCst) {
            return Err(TransportError::NotArmed);
        }
        self.core.lock_discovered().clear();

        info!("broadcasting module discovery");
        let placeholder = Module::placeholder(Arc::downgrade(&self.core));
        placeholder.send_broadcast(PACKET_ID_DISCOVERY)?;

        let window = discovery_window(
            self.core.config.discovery_slot,
            self.core.config.baud_rate,
            self.core.config.discovery_margin,
        );
        self.core.clock.sleep(window);

        let mut found: Vec<DiscoveredInfo> =
            self.core.lock_discovered().values().copied().collect();
        // Parents first so a child's identity query can lease an
        // already-registered parent.
        found.sort_by_key(|info| (!info.is_parent, info.address));
        info!(count = found.len(), "discovery window closed");

        let mut metas = Vec::with_capacity(found.len());
        if !check_capabilities {
            for info in found {
                metas.push(ModuleMeta {
                    address: info.address,
                    is_parent: info.is_parent,
                    interface: None,
                    firmware_version: None,
                });
            }
            return Ok(metas);
        }

        let parent_address = found.iter().find(|i| i.is_parent).map(|i| i.address);
        let mut parent_lease: Option<Arc<Module>> = None;
        for info in &found {
            let routed_through = if info.is_parent {
                info.address
            } else {
                parent_address.unwrap_or(info.address)
            };
            let descriptor = ModuleDescriptor {
                address: info.address,
                parent_address: routed_through,
                user_module: false,
                name: format!("discovered-{}", info.address),
            };
            let mut meta = ModuleMeta {
                address: info.address,
                is_parent: info.is_parent,
                interface: None,
                firmware_version: None,
            };
            match self.get_or_add_module(&descriptor) {
                Ok(module) => {
                    if info.is_parent && parent_lease.is_none() {
                        // Keep the parent open for the whole capability
                        // pass; children are routed through it.
                        module.begin_system_operation();
                        parent_lease = Some(Arc::clone(&module));
                    }
                    let query = self.perform_system_operation(
                        info.address,
                        routed_through,
                        |m: &Arc<Module>| {
                            m.query_interface()?;
                            let _ = m.query_firmware_version();
                            Ok(())
                        },
                        self.core.config.capability_timeout,
                    );
                    match query {
                        Ok(()) => {
                            meta.interface = module.interface();
                            meta.firmware_version = module.firmware_version();
                        }
                        Err(e) => warn!(
                            address = info.address,
                            error = %e,
                            "identity query failed during discovery"
                        ),
                    }
                }
                Err(e) => warn!(
                    address = info.address,
                    error = %e,
                    "could not open discovered module"
                ),
            }
            metas.push(meta);
        }
        if let Some(parent) = parent_lease {
            parent.end_system_operation();
        }
        Ok(metas)
    }

    /// Renumber `module` to `new_address`. For the duration of the
    /// `renumber` callback the module is reachable under both addresses
    /// via a shadow map; afterwards it is moved atomically to only the
    /// new address. The callback typically sends
    /// [`Module::send_change_address`].
    pub fn change_module_address<F>(
        &self,
        module: &Arc<Module>,
        new_address: u8,
        renumber: F,
    ) -> Result<(), TransportError>
    where
        F: FnOnce(&Arc<Module>) -> Result<(), TransportError>,
    {
        let old_address = module.address();
        if old_address == new_address {
            return renumber(module);
        }
        if self.core.find_module(new_address).is_some() {
            return Err(TransportError::AddressInUse(new_address));
        }

        self.core
            .lock_changing()
            .insert(new_address, Arc::clone(module));
        let result = renumber(module);

        if result.is_ok() {
            let mut registry = self.core.lock_modules_write();
            if let Some(existing) = registry.get(&old_address) {
                if Arc::ptr_eq(existing, module) {
                    registry.remove(&old_address);
                }
            }
            if module.parent_address() == old_address {
                module.set_parent_address(new_address);
            }
            module.set_address(new_address);
            registry.insert(new_address, Arc::clone(module));
            info!(old = old_address, new = new_address, "module renumbered");
        }
        // The shadow entry outlives the registry move, so the module never
        // goes dark under the new address between the two maps.
        self.core.lock_changing().remove(&new_address);
        result
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.disarm();
    }
}
