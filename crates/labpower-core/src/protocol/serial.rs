//! Serial port handling
//!
//! [`SerialLink`] is the [`Link`] used against real hardware.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Link, ProtocolError, SerialSettings};

/// A port the supply might be attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Name to pass to [`Link::open_port`] (`/dev/ttyUSB0`, `COM3`)
    pub name: String,
    /// Adapter identity, for USB serial ports
    pub usb: Option<UsbAdapter>,
}

/// USB identity of a serial adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbAdapter {
    /// Vendor ID
    pub vid: u16,
    /// Product ID
    pub pid: u16,
    /// Product string reported by the adapter
    pub product: Option<String>,
}

impl PortInfo {
    /// A port known only by name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            usb: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let usb = match info.port_type {
            SerialPortType::UsbPort(usb) => Some(UsbAdapter {
                vid: usb.vid,
                pid: usb.pid,
                product: usb.product,
            }),
            _ => None,
        };
        Self {
            name: info.port_name,
            usb,
        }
    }
}

/// Port families in listing order
const PORT_FAMILIES: [&str; 3] = ["ttyUSB", "ttyACM", "COM"];

/// Listing order: by family, then by port number, then by name
fn port_rank(name: &str) -> (usize, u32, &str) {
    let base = name.rsplit('/').next().unwrap_or(name);
    PORT_FAMILIES
        .iter()
        .enumerate()
        .find_map(|(family, prefix)| {
            let number = base.strip_prefix(prefix)?.parse::<u32>().ok()?;
            Some((family, number, base))
        })
        .unwrap_or((PORT_FAMILIES.len(), 0, base))
}

/// Merge enumerated ports with bare device names, keeping the richer entry
/// for duplicates, in listing order
fn merge_ports(
    enumerated: impl IntoIterator<Item = PortInfo>,
    device_names: impl IntoIterator<Item = String>,
) -> Vec<PortInfo> {
    let mut by_name: BTreeMap<String, PortInfo> = enumerated
        .into_iter()
        .map(|port| (port.name.clone(), port))
        .collect();
    for name in device_names {
        by_name
            .entry(name)
            .or_insert_with_key(|name| PortInfo::named(name.as_str()));
    }

    let mut ports: Vec<PortInfo> = by_name.into_values().collect();
    ports.sort_by(|a, b| port_rank(&a.name).cmp(&port_rank(&b.name)));
    ports
}

/// USB serial device nodes under `/dev`, which udev enumeration can miss
#[cfg(target_os = "linux")]
fn usb_tty_nodes() -> Vec<String> {
    let Ok(entries) = std::fs::read_dir("/dev") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("ttyUSB") || name.starts_with("ttyACM"))
        .map(|name| format!("/dev/{}", name))
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn usb_tty_nodes() -> Vec<String> {
    Vec::new()
}

/// Serial ports on this machine, USB adapters first
pub fn list_ports() -> Vec<PortInfo> {
    let enumerated = serialport::available_ports().unwrap_or_else(|e| {
        warn!("Can't enumerate serial ports: {}", e);
        Vec::new()
    });
    merge_ports(enumerated.into_iter().map(PortInfo::from), usb_tty_nodes())
}

/// Open a serial port with the supply's line settings
pub fn open_port(name: &str, settings: &SerialSettings) -> Result<Box<dyn SerialPort>, ProtocolError> {
    serialport::new(name, settings.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(settings.read_timeout_ms))
        .open()
        .map_err(|e| ProtocolError::ConnectionFailed(format!("{}: {}", name, e)))
}

/// Clear whatever the supply sent before we were listening
pub fn clear_input(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(serialport::ClearBuffer::Input)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))
}

/// [`Link`] over a real serial port
#[derive(Default)]
pub struct SerialLink {
    port: Option<Box<dyn SerialPort>>,
    port_name: Option<String>,
}

impl SerialLink {
    /// A link with no port open
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the open port, if any
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, ProtocolError> {
        self.port.as_mut().ok_or(ProtocolError::NotConnected)
    }
}

impl Link for SerialLink {
    fn open_port(&mut self, name: &str, settings: &SerialSettings) -> Result<(), ProtocolError> {
        if self.port.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }

        let mut port = open_port(name, settings)?;
        clear_input(port.as_mut())?;

        info!("Opened {} at {} baud (8N1)", name, settings.baud_rate);
        self.port = Some(port);
        self.port_name = Some(name.to_string());
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), ProtocolError> {
        // Dropping the handle closes the descriptor
        if self.port.take().is_some() {
            if let Some(name) = self.port_name.take() {
                info!("Closed {}", name);
            }
        }
        Ok(())
    }

    fn write_string(&mut self, data: &str) -> Result<(), ProtocolError> {
        let port = self.port_mut()?;
        port.write_all(data.as_bytes())?;
        port.flush()?;
        debug!("Sent to serial port: {}", data);
        Ok(())
    }

    fn read_available_string(&mut self) -> Result<String, ProtocolError> {
        let port = self.port_mut()?;
        let available = port.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(String::new());
        }

        let mut buf = vec![0u8; available];
        let n = match port.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(e.into()),
        };
        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        debug!("Received from serial port: {:?}", text);
        Ok(text)
    }

    fn list_port_names(&self) -> Vec<String> {
        list_ports().into_iter().map(|p| p.name).collect()
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        let _ = self.close_port();
    }
}
