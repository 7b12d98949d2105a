//! # HubLink Core Library
//!
//! Host-side communication fabric for USB-attached module buses.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Framed, checksummed datagram protocol over a USB serial link
//! - A keyed bus lock serializing request/response exchanges
//! - A module registry with lease counting and runtime renumbering
//! - A transport engine with background reading and keepalive pinging
//! - Broadcast discovery with a bounded reply window
//! - Firmware bring-up and recovery for embedded modules
//!
//! ## Example
//!
//! ```rust,ignore
//! use hublink_core::discovery::ModuleDescriptor;
//! use hublink_core::transport::{TransportConfig, UsbTransport};
//!
//! let transport = UsbTransport::new(TransportConfig {
//!     port_name: "/dev/ttyACM0".into(),
//!     ..TransportConfig::default()
//! });
//! transport.arm()?;
//!
//! // Enumerate everything on the bus, identities included.
//! for meta in transport.discover_modules(true)? {
//!     println!("module {} parent={}", meta.address, meta.is_parent);
//! }
//!
//! let hub = transport.get_or_add_module(&ModuleDescriptor {
//!     address: 173,
//!     parent_address: 173,
//!     user_module: true,
//!     name: "hub".into(),
//! })?;
//! hub.ping(false)?;
//! ```

pub mod channel;
pub mod clock;
pub mod discovery;
pub mod module;
pub mod protocol;
pub mod recovery;
pub mod transport;
pub mod worker;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::channel::{list_ports, BusChannel, ChannelFactory, PortInfo};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::discovery::{ModuleDescriptor, ModuleMeta};
    pub use crate::module::{Module, ModuleState};
    pub use crate::protocol::{Datagram, FrameParser, SendOutcome, TransportError};
    pub use crate::recovery::{
        ensure_embedded_module, FirmwareFlasher, NullResetController, ResetController,
    };
    pub use crate::transport::{TransportConfig, UsbTransport};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
