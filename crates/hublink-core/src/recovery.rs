//! Hardware reset and firmware bring-up recovery
//!
//! A freshly attached (or mis-flashed) embedded module may answer at the
//! wrong address, or not at all. [`ensure_embedded_module`] walks the
//! escalation ladder: direct contact, bus-wide discovery with
//! renumbering, then a one-shot firmware reflash before giving up.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::discovery::ModuleDescriptor;
use crate::module::Module;
use crate::protocol::TransportError;
use crate::transport::UsbTransport;

/// Hold time for the asserted reset line.
const RESET_SETTLE: Duration = Duration::from_millis(100);

/// Time allowed for firmware to boot after the reset line releases.
const RESET_RECOVERY: Duration = Duration::from_millis(2000);

/// Control over a hardware reset line wired to the embedded module.
pub trait ResetController: Send + Sync {
    /// Whether a reset line is actually wired. Controllers without one
    /// skip the reset pulse and its settle delays entirely.
    fn has_reset_line(&self) -> bool {
        true
    }

    /// Drive the reset line active.
    fn assert_reset(&self) -> Result<(), TransportError>;

    /// Release the reset line.
    fn release_reset(&self) -> Result<(), TransportError>;
}

/// Reset controller for hardware without a wired reset line.
pub struct NullResetController;

impl ResetController for NullResetController {
    fn has_reset_line(&self) -> bool {
        false
    }

    fn assert_reset(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn release_reset(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Pulse the reset line and wait out the firmware boot time. A no-op
/// when no reset line is wired.
pub fn hardware_reset(
    controller: &dyn ResetController,
    clock: &dyn Clock,
) -> Result<(), TransportError> {
    if !controller.has_reset_line() {
        return Ok(());
    }
    info!("pulsing hardware reset");
    controller.assert_reset()?;
    clock.sleep(RESET_SETTLE);
    controller.release_reset()?;
    clock.sleep(RESET_RECOVERY);
    Ok(())
}

/// Reflashes the embedded module's firmware out-of-band (bootloader,
/// DFU, debug probe). Invoked at most once per recovery attempt.
pub trait FirmwareFlasher {
    /// Write known-good firmware to the module.
    fn flash(&self) -> Result<(), TransportError>;
}

/// Bring the embedded module described by `descriptor` to a usable,
/// correctly addressed state.
///
/// Escalation order:
/// 1. contact it directly at the expected address;
/// 2. discover the bus and, if a parent module answers from a different
///    address, renumber it to the expected one;
/// 3. with a flasher available, reflash once and repeat steps 1–2.
///
/// Fails with [`TransportError::EmbeddedModuleUnreachable`] when every
/// rung is exhausted.
pub fn ensure_embedded_module(
    transport: &UsbTransport,
    descriptor: &ModuleDescriptor,
    flasher: Option<&dyn FirmwareFlasher>,
) -> Result<Arc<Module>, TransportError> {
    if let Some(module) = locate(transport, descriptor) {
        return Ok(module);
    }

    if let Some(flasher) = flasher {
        warn!(
            address = descriptor.address,
            "embedded module unreachable; reflashing firmware"
        );
        flasher.flash()?;
        if let Some(module) = locate(transport, descriptor) {
            return Ok(module);
        }
    }

    Err(TransportError::EmbeddedModuleUnreachable(descriptor.address))
}

/// Direct contact, then discovery-and-renumber. `None` means the module
/// could not be reached either way.
fn locate(transport: &UsbTransport, descriptor: &ModuleDescriptor) -> Option<Arc<Module>> {
    match transport.get_or_add_module(descriptor) {
        Ok(module) => return Some(module),
        Err(e) => info!(
            address = descriptor.address,
            error = %e,
            "module not reachable at expected address"
        ),
    }

    let found = match transport.discover_modules(false) {
        Ok(found) => found,
        Err(e) => {
            warn!(error = %e, "discovery failed during recovery");
            return None;
        }
    };

    // A parent answering from any other address is assumed to be the
    // module we want with a stale or factory-default address.
    let stray = found
        .iter()
        .find(|meta| meta.is_parent && meta.address != descriptor.address)?;
    info!(
        found = stray.address,
        expected = descriptor.address,
        "parent module found at unexpected address; renumbering"
    );

    let interim = ModuleDescriptor {
        address: stray.address,
        parent_address: stray.address,
        user_module: descriptor.user_module,
        name: descriptor.name.clone(),
    };
    let module = match transport.get_or_add_module(&interim) {
        Ok(module) => module,
        Err(e) => {
            warn!(address = stray.address, error = %e, "could not open stray module");
            return None;
        }
    };

    let target = descriptor.address;
    match transport.change_module_address(&module, target, |m| m.send_change_address(target)) {
        Ok(()) => Some(module),
        Err(e) => {
            warn!(
                address = stray.address,
                target,
                error = %e,
                "renumbering failed during recovery"
            );
            None
        }
    }
}
