//! Discovery types and window sizing
//!
//! The broadcast discovery procedure enumerates every module reachable on
//! the bus. Replies all arrive within a bounded window sized from the
//! maximum module count and the per-module response slot, so discovery is
//! a single bounded wait rather than a polling loop.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::protocol::MAX_FRAME_SIZE;

/// Highest number of addressable modules the protocol allows on one bus.
pub const MAX_MODULES: u32 = 254;

/// Configuration-level description of a module the host expects to find.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Bus address of the module.
    pub address: u8,
    /// Address of the parent module it is routed through. A module whose
    /// parent address equals its own address is itself a parent.
    pub parent_address: u8,
    /// Whether user code references this module. User modules are never
    /// auto-closed by lease accounting.
    pub user_module: bool,
    /// Human-readable label.
    pub name: String,
}

impl ModuleDescriptor {
    /// Whether this descriptor names a parent module.
    pub fn is_parent(&self) -> bool {
        self.address == self.parent_address
    }
}

/// Identity and capability metadata for one discovered module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMeta {
    /// Bus address the module replied from.
    pub address: u8,
    /// Whether the module is directly attached via the USB link.
    pub is_parent: bool,
    /// Interface/capability string, when the identity query succeeded.
    pub interface: Option<String>,
    /// Firmware version string, when the identity query succeeded.
    pub firmware_version: Option<String>,
}

/// A module seen during the discovery window, not yet promoted to a full
/// registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DiscoveredInfo {
    pub address: u8,
    pub is_parent: bool,
}

/// Worst-case wait for all discovery replies: one response slot per
/// addressable module, plus the transmission time of one maximum-size
/// frame, plus a safety margin. The protocol guarantees every reply
/// arrives inside this window or not at all.
pub fn discovery_window(slot: Duration, baud_rate: u32, margin: Duration) -> Duration {
    let baud = baud_rate.max(1) as u64;
    // 10 bits per byte on the wire (start + 8 data + stop).
    let packet_nanos = (MAX_FRAME_SIZE as u64) * 10 * 1_000_000_000 / baud;
    slot * MAX_MODULES + Duration::from_nanos(packet_nanos) + margin
}
