//! Serial port handling
//!
//! Enumerates, opens and configures the serial port the firmware is attached to.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::time::Duration;

use super::{TransportError, DEFAULT_BAUD_RATE};

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Sort key: ttyACM* first (numeric suffix order), then ttyUSB*, then the rest by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    let ranked = ["ttyACM", "ttyUSB"]
        .iter()
        .enumerate()
        .find_map(|(rank, prefix)| Some((rank as u8, basename.strip_prefix(prefix)?)));
    match ranked {
        Some((rank, suffix)) => (rank, suffix.parse().unwrap_or(usize::MAX), basename.to_string()),
        None => (2, 0, basename.to_string()),
    }
}

fn sort_ports(ports: &mut [PortInfo]) {
    ports.sort_by_key(|p| port_sort_key(&p.name));
}

/// List candidate controller ports in a deterministic order
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // udev may not have tagged a freshly plugged board yet
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    sort_ports(&mut ports);
    ports
}

/// Open a serial port
pub fn open_port(
    name: &str,
    baud_rate: Option<u32>,
) -> Result<Box<dyn SerialPort>, TransportError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    serialport::new(name, baud)
        .timeout(Duration::from_millis(100))
        .open()
        .map_err(|e| TransportError::Serial(format!("{}: {}", name, e)))
}

/// Configure 8N1, no flow control, DTR asserted
pub fn configure_port(port: &mut dyn SerialPort) -> Result<(), TransportError> {
    let serial_err = |e: serialport::Error| TransportError::Serial(e.to_string());
    port.set_data_bits(serialport::DataBits::Eight).map_err(serial_err)?;
    port.set_parity(serialport::Parity::None).map_err(serial_err)?;
    port.set_stop_bits(serialport::StopBits::One).map_err(serial_err)?;
    port.set_flow_control(serialport::FlowControl::None).map_err(serial_err)?;

    // Some USB bridges refuse modem-line control; that only disables hard reset
    if let Err(e) = port.write_data_terminal_ready(true) {
        tracing::warn!("configure_port: failed to assert DTR: {}", e);
    }

    Ok(())
}

/// Clear the serial port buffers
pub fn clear_buffers(port: &mut dyn SerialPort) -> Result<(), TransportError> {
    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| TransportError::Serial(e.to_string()))
}
