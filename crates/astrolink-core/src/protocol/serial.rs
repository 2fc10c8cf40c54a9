//! Serial port handling
//!
//! Opening and configuring the RS-232/USB links used by the mount and the
//! focusers, plus port discovery for the host's diagnostics.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};

use super::ProtocolError;

/// Per-read timeout of the OS handle; transports enforce the real deadline
const READ_SLICE: Duration = Duration::from_millis(50);

/// USB identity of a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
    pub product: Option<String>,
}

impl UsbId {
    /// Bridge chip family, from the vendor ID
    pub fn bridge(&self) -> Option<&'static str> {
        match self.vid {
            0x0403 => Some("FTDI"),
            0x067b => Some("Prolific PL2303"),
            0x10c4 => Some("Silicon Labs CP210x"),
            0x1a86 => Some("WCH CH340"),
            0x2341 | 0x2a03 => Some("Arduino"),
            _ => None,
        }
    }
}

/// A serial port found on this machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// e.g. "/dev/ttyUSB0" or "COM3"
    pub name: String,
    pub usb: Option<UsbId>,
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(usb) = &self.usb {
            write!(f, " [{:04x}:{:04x}", usb.vid, usb.pid)?;
            if let Some(bridge) = usb.bridge() {
                write!(f, " {}", bridge)?;
            }
            if let Some(product) = &usb.product {
                write!(f, " \"{}\"", product)?;
            }
            write!(f, "]")?;
        }
        Ok(())
    }
}

/// USB adapters first (ttyUSB, then ttyACM, numerically), then the rest by name
fn port_rank(name: &str) -> (u8, usize, String) {
    let base = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in [(0, "ttyUSB"), (1, "ttyACM")] {
        if let Some(number) = base.strip_prefix(prefix) {
            return (rank, number.parse().unwrap_or(usize::MAX), base.to_string());
        }
    }
    (2, 0, base.to_string())
}

fn sorted(ports: impl IntoIterator<Item = PortInfo>) -> Vec<PortInfo> {
    let mut by_name: BTreeMap<String, PortInfo> = BTreeMap::new();
    for port in ports {
        by_name.entry(port.name.clone()).or_insert(port);
    }
    let mut ports: Vec<PortInfo> = by_name.into_values().collect();
    ports.sort_by_key(|p| port_rank(&p.name));
    ports
}

/// Ports the OS reports, plus `/dev/ttyUSB*` and `/dev/ttyACM*` nodes it missed
pub fn list_ports() -> Vec<PortInfo> {
    let reported = serialport::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|info| PortInfo {
            usb: match info.port_type {
                SerialPortType::UsbPort(usb) => Some(UsbId {
                    vid: usb.vid,
                    pid: usb.pid,
                    product: usb.product,
                }),
                _ => None,
            },
            name: info.port_name,
        });

    #[cfg(target_os = "linux")]
    let nodes: Vec<PortInfo> = std::fs::read_dir("/dev")
        .map(|entries| {
            entries
                .flatten()
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .filter(|n| n.starts_with("ttyUSB") || n.starts_with("ttyACM"))
                .map(|n| PortInfo {
                    name: format!("/dev/{}", n),
                    usb: None,
                })
                .collect()
        })
        .unwrap_or_default();
    #[cfg(not(target_os = "linux"))]
    let nodes: Vec<PortInfo> = Vec::new();

    // OS entries win over bare device nodes
    sorted(reported.chain(nodes))
}

fn serial_error(e: serialport::Error) -> ProtocolError {
    ProtocolError::SerialError(e.to_string())
}

/// Open `name` at `baud_rate`
pub fn open_port(name: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, ProtocolError> {
    serialport::new(name, baud_rate)
        .timeout(READ_SLICE)
        .open()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(name.to_string()),
            _ => serial_error(e),
        })
}

/// 8 data bits, no parity, 1 stop bit, no flow control; DTR and RTS raised
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.set_data_bits(DataBits::Eight).map_err(serial_error)?;
    port.set_parity(Parity::None).map_err(serial_error)?;
    port.set_stop_bits(StopBits::One).map_err(serial_error)?;
    port.set_flow_control(FlowControl::None).map_err(serial_error)?;

    // Some adapters hold the controller in reset while DTR is low
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::debug!("could not raise DTR: {}", e);
    }
    if let Err(e) = port.write_request_to_send(true) {
        tracing::debug!("could not raise RTS: {}", e);
    }
    Ok(())
}

pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), ProtocolError> {
    port.clear(ClearBuffer::All).map_err(serial_error)
}
