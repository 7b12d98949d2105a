//! Logical bus modules
//!
//! A [`Module`] represents one addressable peripheral reachable over the
//! bus. It owns the request/response lifecycle for traffic it originates:
//! sequence-number assignment, the pending-response table the reader
//! thread resolves against, retry pacing, and the lease counter that
//! keeps its channel open while background system operations run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::discovery::ModuleDescriptor;
use crate::protocol::{
    Datagram, Message, SendOutcome, TransportError, HOST_ADDRESS, PACKET_ID_CHANGE_ADDRESS,
    PACKET_ID_FAIL_SAFE, PACKET_ID_NACK, PACKET_ID_PING, PACKET_ID_QUERY_INTERFACE,
    PACKET_ID_QUERY_VERSION, RESEND_INTERVAL_MS,
};
use crate::transport::TransportCore;

/// Lifecycle of a module.
///
/// `Created → Open` once the initial ping and interface query succeed; a
/// failed bring-up rolls the module back out of the registry instead of
/// leaving it half-open. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Constructed but not yet confirmed reachable.
    Created,
    /// Reachable and registered.
    Open,
    /// Unregistered; no further traffic.
    Closed,
}

/// One logical addressable peripheral on the bus.
#[derive(Debug)]
pub struct Module {
    core: Weak<TransportCore>,
    name: String,
    address: AtomicU8,
    parent_address: AtomicU8,
    user_module: bool,
    state: Mutex<ModuleState>,
    interface: Mutex<Option<String>>,
    firmware_version: Mutex<Option<String>>,
    pending: Mutex<HashMap<u16, Arc<Message>>>,
    // Dedicated lock object, distinct from the registry's own
    // synchronization, so lease bookkeeping never contends with lookups.
    op_counter: Mutex<i32>,
    next_msg_num: AtomicU16,
    last_activity: Mutex<Instant>,
}

impl Module {
    pub(crate) fn new(core: Weak<TransportCore>, descriptor: &ModuleDescriptor) -> Self {
        Self {
            core,
            name: descriptor.name.clone(),
            address: AtomicU8::new(descriptor.address),
            parent_address: AtomicU8::new(descriptor.parent_address),
            user_module: descriptor.user_module,
            state: Mutex::new(ModuleState::Created),
            interface: Mutex::new(None),
            firmware_version: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            op_counter: Mutex::new(0),
            next_msg_num: AtomicU16::new(1),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Disposable module used to originate broadcasts; never registered,
    /// its address is irrelevant to recipients.
    pub(crate) fn placeholder(core: Weak<TransportCore>) -> Self {
        Self::new(
            core,
            &ModuleDescriptor {
                address: HOST_ADDRESS,
                parent_address: HOST_ADDRESS,
                user_module: false,
                name: "broadcast-placeholder".into(),
            },
        )
    }

    /// Current bus address. May change at runtime when the bus topology
    /// is renumbered.
    pub fn address(&self) -> u8 {
        self.address.load(Ordering::SeqCst)
    }

    /// Address of the parent module this one is routed through.
    pub fn parent_address(&self) -> u8 {
        self.parent_address.load(Ordering::SeqCst)
    }

    /// Whether this module is directly attached via the USB link.
    pub fn is_parent(&self) -> bool {
        self.address() == self.parent_address()
    }

    /// Whether user code references this module. User modules are never
    /// auto-closed by lease accounting.
    pub fn is_user_module(&self) -> bool {
        self.user_module
    }

    /// Human-readable label.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ModuleState {
        *self.lock_state()
    }

    /// Whether the module is open for traffic.
    pub fn is_open(&self) -> bool {
        self.state() == ModuleState::Open
    }

    /// Interface string from the last successful identity query.
    pub fn interface(&self) -> Option<String> {
        self.interface
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Firmware version from the last successful version query.
    pub fn firmware_version(&self) -> Option<String> {
        self.firmware_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Outstanding system-operation leases. Diagnostic; never negative in
    /// correct operation.
    pub fn system_operation_count(&self) -> i32 {
        *self
            .op_counter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, ModuleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_msg_num(&self) -> u16 {
        // Wraps modulo 2^16; correlation is by exact value match.
        let mut num = self.next_msg_num.fetch_add(1, Ordering::Relaxed);
        if num == 0 {
            num = self.next_msg_num.fetch_add(1, Ordering::Relaxed);
        }
        num
    }

    fn response_timeout(&self) -> Duration {
        self.core
            .upgrade()
            .map(|c| c.config().response_timeout)
            .unwrap_or(Duration::from_millis(crate::protocol::DEFAULT_TIMEOUT_MS))
    }

    /// Send a request and block for its correlated response.
    ///
    /// Holds the bus lock for the whole exchange: the bus has no
    /// collision arbitration, so at most one request may be awaiting a
    /// reply across the whole transport. Retransmits at the resend
    /// interval until `timeout` elapses.
    pub fn send_and_await(
        &self,
        packet_id: u8,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let core = self
            .core
            .upgrade()
            .ok_or(TransportError::TransportUnavailable)?;
        if self.state() == ModuleState::Closed {
            return Err(TransportError::ModuleClosed(self.address()));
        }

        let datagram = Datagram::new(self.address(), packet_id, self.next_msg_num(), 0, payload);
        let message = Arc::new(Message::new(datagram));

        core.bus_lock().acquire(message.key());
        let outcome = self.exchange(&core, &message, timeout);
        core.bus_lock().release(message.key());

        match outcome {
            SendOutcome::Success(payload) => Ok(payload),
            SendOutcome::Nack(reason) => Err(TransportError::Nack {
                address: self.address(),
                reason,
            }),
            SendOutcome::Timeout => Err(TransportError::Timeout),
            SendOutcome::TransportUnavailable => Err(TransportError::TransportUnavailable),
        }
    }

    /// Transmit-and-wait with retransmission. Caller holds the bus lock.
    fn exchange(
        &self,
        core: &Arc<TransportCore>,
        message: &Arc<Message>,
        timeout: Duration,
    ) -> SendOutcome {
        let msg_num = message.msg_num();
        self.lock_pending().insert(msg_num, Arc::clone(message));

        let deadline = Instant::now() + timeout;
        let resend = Duration::from_millis(RESEND_INTERVAL_MS);
        let outcome = loop {
            if core.transmit(message).is_err() {
                break SendOutcome::TransportUnavailable;
            }
            self.touch();

            let now = Instant::now();
            if now >= deadline {
                break SendOutcome::Timeout;
            }
            if let Some(outcome) = message.completion().wait_for(resend.min(deadline - now)) {
                break outcome;
            }
            if Instant::now() >= deadline {
                break SendOutcome::Timeout;
            }
            trace!(
                address = self.address(),
                msg_num,
                attempt = message.attempts(),
                "no response yet, retransmitting"
            );
        };

        self.lock_pending().remove(&msg_num);
        // A drain racing this exchange may already have completed the
        // message; the first outcome sticks either way.
        message.completion().complete(outcome.clone());
        message
            .completion()
            .peek()
            .unwrap_or(SendOutcome::TransportUnavailable)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<u16, Arc<Message>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Minimal liveness request. A NACK means the peripheral actively
    /// rejected it; a timeout means no reply within the resend window.
    pub fn ping(&self, quiet: bool) -> Result<(), TransportError> {
        match self.send_and_await(PACKET_ID_PING, Vec::new(), self.response_timeout()) {
            Ok(_) => {
                if !quiet {
                    debug!(address = self.address(), "ping ok");
                }
                Ok(())
            }
            Err(e) => {
                if !quiet {
                    warn!(address = self.address(), error = %e, "ping failed");
                }
                Err(e)
            }
        }
    }

    /// Query the module's interface/capability string.
    pub fn query_interface(&self) -> Result<String, TransportError> {
        let payload =
            self.send_and_await(PACKET_ID_QUERY_INTERFACE, Vec::new(), self.response_timeout())?;
        let interface = String::from_utf8_lossy(&payload).trim().to_string();
        *self
            .interface
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(interface.clone());
        Ok(interface)
    }

    /// Query the module's firmware version string.
    pub fn query_firmware_version(&self) -> Result<String, TransportError> {
        let payload =
            self.send_and_await(PACKET_ID_QUERY_VERSION, Vec::new(), self.response_timeout())?;
        let version = String::from_utf8_lossy(&payload).trim().to_string();
        *self
            .firmware_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(version.clone());
        Ok(version)
    }

    /// Initial bring-up: confirm liveness and fetch identity. On success
    /// the module transitions to `Open`; on failure the caller rolls it
    /// back out of the registry.
    pub(crate) fn ping_and_query_known_interfaces(&self) -> Result<(), TransportError> {
        self.ping(false)?;
        self.query_interface()?;
        if let Err(e) = self.query_firmware_version() {
            // Older firmware may not implement the version query.
            debug!(address = self.address(), error = %e, "firmware version query failed");
        }
        *self.lock_state() = ModuleState::Open;
        Ok(())
    }

    /// Best-effort command putting the peripheral into its safe output
    /// state. Failures are logged, not propagated: this is typically
    /// called during shutdown when propagation has no recipient.
    pub fn fail_safe(&self) {
        if let Err(e) = self.send_and_await(PACKET_ID_FAIL_SAFE, Vec::new(), self.response_timeout())
        {
            warn!(address = self.address(), error = %e, "fail-safe command failed");
        }
    }

    /// Ask the peripheral to move to a new bus address. Used inside the
    /// renumbering callback of
    /// [`UsbTransport::change_module_address`](crate::transport::UsbTransport::change_module_address).
    pub fn send_change_address(&self, new_address: u8) -> Result<(), TransportError> {
        self.send_and_await(
            PACKET_ID_CHANGE_ADDRESS,
            vec![new_address],
            self.response_timeout(),
        )?;
        Ok(())
    }

    /// Fire-and-forget transmit with no correlated response. Discovery
    /// broadcasts use this: repliers answer in their own response slots,
    /// so there is no single reply to await.
    pub(crate) fn send_broadcast(&self, packet_id: u8) -> Result<(), TransportError> {
        let core = self
            .core
            .upgrade()
            .ok_or(TransportError::TransportUnavailable)?;
        let datagram = Datagram::new(self.address(), packet_id, self.next_msg_num(), 0, Vec::new());
        let message = Arc::new(Message::new(datagram));
        core.bus_lock().acquire(message.key());
        let result = core.transmit(&message);
        core.bus_lock().release(message.key());
        result
    }

    /// Close the module and unregister it. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.lock_state();
            if *state == ModuleState::Closed {
                return;
            }
            *state = ModuleState::Closed;
        }
        self.fail_pending();
        if let Some(core) = self.core.upgrade() {
            core.unregister(self);
        }
        debug!(address = self.address(), name = %self.name, "module closed");
    }

    /// Take a lease that keeps this module's channel open while a
    /// background system operation runs.
    pub fn begin_system_operation(&self) {
        *self
            .op_counter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
    }

    /// Release a system-operation lease. A non-user module whose lease
    /// count drops to zero is auto-closed; a user module never is.
    pub fn end_system_operation(&self) {
        let count = {
            let mut counter = self
                .op_counter
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *counter -= 1;
            *counter
        };
        if count < 0 {
            error!(
                address = self.address(),
                count, "system operation counter went negative"
            );
        }
        if count <= 0 && !self.user_module && self.is_open() {
            debug!(
                address = self.address(),
                "auto-closing module with no outstanding leases"
            );
            self.close();
        }
    }

    /// Route a received datagram to the in-flight message it answers.
    /// Uncorrelated datagrams are dropped; the bus is lossy and upstream
    /// retransmission covers them.
    pub(crate) fn handle_incoming(&self, datagram: Datagram) {
        let message = self.lock_pending().get(&datagram.ref_num).cloned();
        match message {
            Some(message) => {
                let outcome = if datagram.packet_id == PACKET_ID_NACK {
                    SendOutcome::Nack(datagram.payload.first().copied().unwrap_or(0))
                } else {
                    SendOutcome::Success(datagram.payload)
                };
                if !message.completion().complete(outcome) {
                    trace!(
                        address = self.address(),
                        ref_num = datagram.ref_num,
                        "late response for already-completed message"
                    );
                }
            }
            None => trace!(
                address = self.address(),
                ref_num = datagram.ref_num,
                "dropping datagram with no pending message"
            ),
        }
    }

    /// Force-complete every pending command with "transport unavailable"
    /// so no caller is left waiting on a reply that will never arrive.
    pub(crate) fn fail_pending(&self) {
        let pending: Vec<Arc<Message>> = self.lock_pending().values().cloned().collect();
        for message in pending {
            message
                .completion()
                .complete(SendOutcome::TransportUnavailable);
        }
    }

    pub(crate) fn set_address(&self, new_address: u8) {
        self.address.store(new_address, Ordering::SeqCst);
    }

    pub(crate) fn set_parent_address(&self, new_parent: u8) {
        self.parent_address.store(new_parent, Ordering::SeqCst);
    }

    pub(crate) fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn keepalive_due(&self, now: Instant, interval: Duration) -> bool {
        let last = *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        now.duration_since(last) >= interval
    }

    pub(crate) fn descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor {
            address: self.address(),
            parent_address: self.parent_address(),
            user_module: self.user_module,
            name: self.name.clone(),
        }
    }
}
