//! Probe management module.
//!
//! Handles probe enumeration, connection, and firmware detection. Both
//! firmwares enumerate as USB CDC serial ports under the same vendor id; the
//! Black Magic Probe has its own product id, anything else is assumed to run
//! Blackstrike and is confirmed by asking its interpreter to multiply.

use crate::config::{ProbeConfig, Timeouts};
use crate::diagnostics::Diagnostics;
use crate::error::Result as TargetResult;
use crate::target::{Blackmagic, Blackstrike, Target};
use crate::transport::Transport;
use anyhow::{bail, Context, Result};

pub const PROBE_VENDOR_ID: u16 = 0x1d50;
pub const BLACKMAGIC_PRODUCT_ID: u16 = 0x6018;

const CONFIRM_QUERY: &[u8] = b"12 12 * .\n";
const CONFIRM_REPLY: &[u8] = b"144";
#[cfg(feature = "hardware")]
const BAUD_RATE: u32 = 115_200;

/// Information about an available debug probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub port_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub probe_type: ProbeType,
}

/// Firmware running on the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeType {
    Blackmagic,
    Blackstrike,
}

impl ProbeInfo {
    /// Classify a USB serial port. `None` for ports of other vendors.
    pub fn from_usb(port_name: &str, vendor_id: u16, product_id: u16, serial_number: Option<String>) -> Option<Self> {
        if vendor_id != PROBE_VENDOR_ID {
            return None;
        }
        let probe_type = if product_id == BLACKMAGIC_PRODUCT_ID {
            ProbeType::Blackmagic
        } else {
            ProbeType::Blackstrike
        };
        Some(Self {
            port_name: port_name.to_string(),
            vendor_id,
            product_id,
            serial_number,
            probe_type,
        })
    }

    /// Get a human-readable name for this probe.
    pub fn name(&self) -> String {
        let firmware = match self.probe_type {
            ProbeType::Blackmagic => "Black Magic Probe",
            ProbeType::Blackstrike => "Blackstrike",
        };
        format!("{firmware} ({:04X}:{:04X}) on {}", self.vendor_id, self.product_id, self.port_name)
    }
}

/// Ask a Forth interpreter for `12 12 * .` and check that it answers 144.
pub fn confirm_blackstrike(transport: &mut dyn Transport, timeouts: &Timeouts) -> TargetResult<bool> {
    transport.read_all()?;
    transport.write(CONFIRM_QUERY)?;
    let mut reply = Vec::new();
    loop {
        if reply.windows(CONFIRM_REPLY.len()).any(|w| w == CONFIRM_REPLY) {
            return Ok(true);
        }
        if transport.bytes_available()? > 0 {
            reply.extend(transport.read_all()?);
        } else if !transport.wait_for_ready_read(timeouts.short_reply())? {
            return Ok(false);
        }
    }
}

/// Probe manager for enumerating and connecting to debug probes.
#[derive(Debug, Clone, Default)]
pub struct ProbeManager {
    config: ProbeConfig,
    diagnostics: Diagnostics,
}

impl ProbeManager {
    pub const fn new(config: ProbeConfig, diagnostics: Diagnostics) -> Self {
        Self { config, diagnostics }
    }

    /// List all serial ports that look like one of our probes.
    #[cfg(feature = "hardware")]
    pub fn list_probes(&self) -> Result<Vec<ProbeInfo>> {
        use serialport::SerialPortType;

        let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
        Ok(ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => {
                    ProbeInfo::from_usb(&port.port_name, usb.vid, usb.pid, usb.serial_number)
                }
                _ => None,
            })
            .collect())
    }

    /// Open a probe's serial port and connect to its target.
    #[cfg(feature = "hardware")]
    pub fn open(&self, info: &ProbeInfo) -> Result<Box<dyn Target>> {
        let transport = crate::transport::SerialTransport::open(
            &info.port_name,
            BAUD_RATE,
            &self.config.timeouts,
            &self.diagnostics,
        )
        .with_context(|| format!("Failed to open {}", info.port_name))?;
        self.attach(info.probe_type, Box::new(transport))
    }

    /// Open the first available probe.
    #[cfg(feature = "hardware")]
    pub fn open_first_probe(&self) -> Result<Box<dyn Target>> {
        let info = self.list_probes()?.into_iter().next().context("No debug probes found")?;
        self.open(&info)
    }

    /// Bring up the client for `probe_type` over an already open transport.
    pub fn attach(&self, probe_type: ProbeType, mut transport: Box<dyn Transport>) -> Result<Box<dyn Target>> {
        match probe_type {
            ProbeType::Blackmagic => {
                let mut target = Blackmagic::new(transport, &self.config, self.diagnostics.clone());
                target.connect().context("Failed to attach to target")?;
                Ok(Box::new(target))
            }
            ProbeType::Blackstrike => {
                if !confirm_blackstrike(transport.as_mut(), &self.config.timeouts)? {
                    bail!("probe did not answer like a Blackstrike interpreter");
                }
                self.diagnostics.info("blackstrike probe confirmed");
                Ok(Box::new(Blackstrike::new(transport, &self.config, self.diagnostics.clone())))
            }
        }
    }
}
