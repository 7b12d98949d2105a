//! Physical bus channel
//!
//! Abstraction over the USB serial link plus helpers for enumerating and
//! opening ports. The transport engine only ever talks to a
//! [`BusChannel`], so tests substitute an in-memory bus.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io;
use std::time::Duration;

use crate::protocol::TransportError;

/// Abstraction over the physical link to the bus.
///
/// The write side is used by whichever thread holds the bus lock; the
/// read side is cloned once and owned exclusively by the reader thread.
/// Reads must honor the configured timeout so the reader can observe its
/// shutdown signal instead of blocking forever.
pub trait BusChannel: Send {
    /// Read available bytes, blocking at most the configured read
    /// timeout. A timeout surfaces as `ErrorKind::TimedOut`.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all bytes to the bus.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Bound the time a single `read` call may block.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discard any buffered input and output.
    fn clear_buffers(&mut self) -> io::Result<()>;

    /// Clone the channel so reads and writes can proceed from different
    /// threads against the same underlying device.
    fn try_clone(&self) -> io::Result<Box<dyn BusChannel>>;
}

/// Opens a fresh channel each time the transport arms.
pub trait ChannelFactory: Send + Sync {
    /// Open the physical device.
    fn open(&self) -> Result<Box<dyn BusChannel>, TransportError>;
}

/// Serial port wrapper implementing [`BusChannel`].
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an already-open serial port.
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl BusChannel for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn clear_buffers(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn try_clone(&self) -> io::Result<Box<dyn BusChannel>> {
        let port_clone = self
            .port
            .try_clone()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Box::new(SerialChannel::new(port_clone)))
    }
}

/// Factory that opens and configures a named serial port.
pub struct SerialChannelFactory {
    port_name: String,
    baud_rate: u32,
}

impl SerialChannelFactory {
    /// Factory for the given port and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
        }
    }
}

impl ChannelFactory for SerialChannelFactory {
    fn open(&self) -> Result<Box<dyn BusChannel>, TransportError> {
        let port = open_port(&self.port_name, self.baud_rate)?;
        Ok(Box::new(SerialChannel::new(port)))
    }
}

/// Metadata for one serial port the host could open.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// OS-level port name ("/dev/ttyACM0", "COM4", ...).
    pub name: String,

    /// USB vendor id, when the port is a USB adapter.
    pub vid: Option<u16>,

    /// USB product id, when the port is a USB adapter.
    pub pid: Option<u16>,

    /// Manufacturer string reported by the adapter.
    pub manufacturer: Option<String>,

    /// Product string reported by the adapter.
    pub product: Option<String>,

    /// Adapter serial number.
    pub serial_number: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// Sort key placing CDC-ACM ports first (bus adapters enumerate as
/// ttyACM*), USB serial converters second, and everything else last,
/// each group in numeric suffix order.
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// Enumerate candidate serial ports in a deterministic order, most
/// likely bus adapters first.
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
    {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Some Linux setups have tty nodes the enumeration API misses; scan
    // /dev directly for the two prefixes a bus adapter can appear under.
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        manufacturer: None,
                        product: None,
                        serial_number: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open a serial port configured for bus communication (8N1, short read
/// timeout so the reader thread stays interruptible).
pub fn open_port(name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, TransportError> {
    let port = serialport::new(name, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| TransportError::Serial(e.to_string()))?;
    Ok(port)
}
