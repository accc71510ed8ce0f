//! Black Magic Probe target.
//!
//! Speaks the GDB remote protocol over the probe's GDB serial port. Every
//! request is a single packet answered by a `+` acknowledgement and, for most
//! requests, a reply packet. Run control is asynchronous: `resume` and
//! `request_single_step` return as soon as the request is acknowledged, and
//! the stop reply is picked up later by [`Target::poll_halt`].

use super::{ExecutionState, HaltReason, HaltWatch, Target, TargetEvent, TargetKind};
use crate::config::{AckPolicy, PacketSettings, ProbeConfig, Timeouts};
use crate::diagnostics::Diagnostics;
use crate::error::{Result, TargetError};
use crate::flash::{self, FlashAccess, FlashProgress, FlashReport};
use crate::gdb_remote;
use crate::memory::MemoryImage;
use crate::registers::{RegisterCache, RegisterSource};
use crate::transport::Transport;
use crossbeam_channel::Receiver;

const WAKE_SEQUENCE: &[u8] = b"+++";
const INTERRUPT: u8 = 0x03;
const SCAN_COMMAND: &str = "swdp_scan";
const ATTACH_HALT_REASON: &[u8] = b"T05";
const HALT_REASONS: [&[u8]; 2] = [b"T05", b"T02"];

/// Packet-level access to the probe.
struct PacketLink {
    transport: Box<dyn Transport>,
    timeouts: Timeouts,
    ack_policy: AckPolicy,
    diagnostics: Diagnostics,
}

impl PacketLink {
    fn get_char(&mut self, waiting_for: &'static str) -> Result<u8> {
        let timeout = self.timeouts.packet();
        self.transport
            .read_byte(timeout)?
            .ok_or(TargetError::Timeout { waiting_for, timeout })
    }

    /// Send a packet and wait for its acknowledgement.
    fn put_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.diagnostics.trace(format_args!("sending gdb packet: {}", String::from_utf8_lossy(packet)));
        self.transport.write(packet)?;
        loop {
            match self.get_char("packet acknowledgement")? {
                b'+' => return Ok(()),
                b'-' if self.ack_policy == AckPolicy::Strict => {
                    return Err(TargetError::protocol("probe rejected packet"));
                }
                other => self.diagnostics.warn(format_args!(
                    "ignoring byte {:?} while waiting for acknowledgement",
                    char::from(other)
                )),
            }
        }
    }

    /// Receive one packet and acknowledge it.
    fn get_packet(&mut self) -> Result<Vec<u8>> {
        while self.get_char("packet start")? != b'$' {}
        let mut packet = vec![b'$'];
        loop {
            let c = self.get_char("packet end")?;
            packet.push(c);
            if c == b'#' {
                break;
            }
        }
        packet.push(self.get_char("packet checksum")?);
        packet.push(self.get_char("packet checksum")?);
        self.transport.write(b"+")?;
        self.diagnostics.trace(format_args!("received gdb packet: {}", String::from_utf8_lossy(&packet)));
        if !gdb_remote::is_valid_packet(&packet) {
            return Err(TargetError::protocol(format!(
                "bad packet checksum: {}",
                String::from_utf8_lossy(&packet)
            )));
        }
        Ok(packet)
    }

    fn request(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        self.put_packet(packet)?;
        self.get_packet()
    }

    /// Discard whatever the probe sends until it goes quiet.
    fn drain(&mut self) -> Result<()> {
        self.transport.read_all()?;
        while self.transport.wait_for_ready_read(self.timeouts.wake_drain())? {
            if self.transport.read_all()?.is_empty() {
                break;
            }
        }
        Ok(())
    }
}

impl RegisterSource for PacketLink {
    fn fetch_registers(&mut self) -> Result<Vec<u32>> {
        let reply = self.request(&gdb_remote::read_registers_request())?;
        if let Some(code) = gdb_remote::error_code(&reply) {
            return Err(TargetError::TargetReported {
                code: Some(code),
                context: "reading registers".to_string(),
            });
        }
        gdb_remote::read_registers(&reply)
    }
}

/// A Black Magic Probe speaking the GDB remote protocol.
pub struct Blackmagic {
    link: PacketLink,
    registers: RegisterCache,
    halt: HaltWatch,
    settings: PacketSettings,
}

impl std::fmt::Debug for Blackmagic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Blackmagic({:?})", self.halt.state())
    }
}

impl Blackmagic {
    pub fn new(transport: Box<dyn Transport>, config: &ProbeConfig, diagnostics: Diagnostics) -> Self {
        Self {
            link: PacketLink {
                transport,
                timeouts: config.timeouts,
                ack_policy: config.packets.ack_policy,
                diagnostics,
            },
            registers: RegisterCache::new(),
            halt: HaltWatch::new(),
            settings: config.packets,
        }
    }

    /// Open the probe's GDB port.
    #[cfg(feature = "hardware")]
    pub fn open(port_name: &str, config: &ProbeConfig, diagnostics: Diagnostics) -> Result<Self> {
        let transport = crate::transport::SerialTransport::open(port_name, 115_200, &config.timeouts, &diagnostics)?;
        Ok(Self::new(Box::new(transport), config, diagnostics))
    }

    /// Wake the probe, scan for a target and attach to it.
    ///
    /// Any reply other than the expected ones leaves the link in an unknown
    /// state and is reported as a protocol violation.
    pub fn connect(&mut self) -> Result<()> {
        self.link.transport.set_data_terminal_ready(true)?;
        self.link.transport.write(WAKE_SEQUENCE)?;
        self.link.drain()?;

        self.link.put_packet(&gdb_remote::monitor_request(SCAN_COMMAND))?;
        let mut replies = Vec::new();
        loop {
            let reply = self.link.get_packet()?;
            if gdb_remote::is_ok_response(&reply) {
                break;
            }
            if let Some(code) = gdb_remote::error_code(&reply) {
                return Err(TargetError::TargetReported {
                    code: Some(code),
                    context: format!("running monitor {SCAN_COMMAND}"),
                });
            }
            replies.push(reply);
        }
        for reply in &replies {
            if let Some(text) = gdb_remote::console_output(&gdb_remote::packet_data(reply)) {
                self.link.diagnostics.info(format_args!("probe: {}", text.trim_end()));
            }
        }

        let reply = self.link.request(&gdb_remote::attach_request())?;
        let payload = gdb_remote::packet_data(&reply);
        if payload != ATTACH_HALT_REASON {
            return Err(TargetError::protocol(format!(
                "attach replied {:?}, expected T05",
                String::from_utf8_lossy(&payload)
            )));
        }
        self.registers.invalidate();
        self.halt.halted(HaltReason::Generic);
        Ok(())
    }

    /// Fetch the complete register set, bypassing the cache.
    pub fn read_all_registers(&mut self) -> Result<Vec<u32>> {
        let registers = self.link.fetch_registers()?;
        self.registers.store(registers.clone());
        Ok(registers)
    }

    /// Running is only reported once the probe has taken the request.
    fn start_running(&mut self, request: &[u8]) -> Result<()> {
        self.registers.invalidate();
        if let Err(e) = self.link.put_packet(request) {
            self.halt.abort_run();
            return Err(e);
        }
        self.halt.running();
        self.halt.arm();
        Ok(())
    }
}

impl Target for Blackmagic {
    fn kind(&self) -> TargetKind {
        TargetKind::Blackmagic
    }

    fn read_bytes(&mut self, address: u32, count: usize, allow_failure: bool) -> Result<Option<Vec<u8>>> {
        let requests = gdb_remote::read_memory_request(address, count, self.settings.memory_read_chunk);
        let mut replies = Vec::with_capacity(requests.len());
        for request in &requests {
            replies.push(self.link.request(request)?);
        }
        if let Some(code) = replies.iter().find_map(|reply| gdb_remote::error_code(reply)) {
            if allow_failure {
                return Ok(None);
            }
            return Err(TargetError::TargetReported {
                code: Some(code),
                context: format!("reading {count} bytes at {address:#010x}"),
            });
        }
        gdb_remote::read_memory(&replies, count, self.settings.memory_read_chunk)
    }

    fn read_raw_register(&mut self, register: u32) -> Result<u32> {
        self.registers.get(register, &mut self.link)
    }

    fn request_single_step(&mut self) -> Result<()> {
        self.start_running(&gdb_remote::single_step_request())
    }

    fn resume(&mut self) -> Result<()> {
        self.start_running(&gdb_remote::continue_request())
    }

    fn request_halt(&mut self) -> Result<()> {
        self.link.transport.write(&[INTERRUPT])
    }

    fn reset(&mut self) -> Result<()> {
        self.registers.invalidate();
        self.link.put_packet(&gdb_remote::reset_request())
    }

    fn breakpoint_set(&mut self, address: u32, length: u32) -> Result<bool> {
        let reply = self.link.request(&gdb_remote::set_hardware_breakpoint_request(address, length))?;
        Ok(gdb_remote::is_ok_response(&reply))
    }

    fn breakpoint_clear(&mut self, address: u32, length: u32) -> Result<bool> {
        let reply = self.link.request(&gdb_remote::remove_hardware_breakpoint_request(address, length))?;
        Ok(gdb_remote::is_ok_response(&reply))
    }

    fn memory_map(&mut self) -> Result<String> {
        let mut xml = Vec::new();
        loop {
            let request = gdb_remote::memory_map_read_request(xml.len(), self.settings.memory_map_chunk);
            let reply = self.link.request(&request)?;
            if let Some(code) = gdb_remote::error_code(&reply) {
                return Err(TargetError::TargetReported {
                    code: Some(code),
                    context: "reading the memory map".to_string(),
                });
            }
            let (data, last) = gdb_remote::memory_map_read_data(&reply)?;
            if data.is_empty() && !last {
                return Err(TargetError::protocol("empty memory map chunk"));
            }
            xml.extend_from_slice(&data);
            if last {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&xml).into_owned())
    }

    fn sync_flash(&mut self, image: &MemoryImage, progress: &mut FlashProgress) -> Result<FlashReport> {
        let diagnostics = self.link.diagnostics.clone();
        flash::sync_flash(self, image, progress, &diagnostics)
    }

    fn poll_halt(&mut self) -> Result<Option<HaltReason>> {
        if !self.halt.is_armed() || self.link.transport.bytes_available()? == 0 {
            return Ok(None);
        }
        self.halt.fire();
        let packet = match self.link.get_packet() {
            Ok(packet) => packet,
            Err(e) => {
                self.halt.violation(e.to_string());
                return Err(e);
            }
        };
        let payload = gdb_remote::packet_data(&packet);
        self.link.diagnostics.debug(format_args!("halt reason: {}", String::from_utf8_lossy(&payload)));
        if HALT_REASONS.contains(&payload.as_slice()) {
            self.halt.halted(HaltReason::Generic);
            Ok(Some(HaltReason::Generic))
        } else {
            let text = format!("unexpected halt reason {:?}", String::from_utf8_lossy(&payload));
            self.halt.violation(text.clone());
            Err(TargetError::Protocol(text))
        }
    }

    fn execution_state(&self) -> ExecutionState {
        self.halt.state()
    }

    fn events(&self) -> Receiver<TargetEvent> {
        self.halt.subscribe()
    }
}

impl FlashAccess for Blackmagic {
    fn flash_chunk_size(&self) -> usize {
        self.settings.flash_write_chunk
    }

    fn flash_erase(&mut self, address: u32, length: u32) -> Result<bool> {
        let reply = self.link.request(&gdb_remote::erase_flash_request(address, length))?;
        Ok(gdb_remote::is_ok_response(&reply))
    }

    fn flash_write(&mut self, address: u32, data: &[u8]) -> Result<bool> {
        for request in gdb_remote::write_flash_request(address, data, self.settings.flash_write_chunk) {
            if !gdb_remote::is_ok_response(&self.link.request(&request)?) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn flash_done(&mut self) -> Result<bool> {
        let reply = self.link.request(&gdb_remote::flash_done_request())?;
        Ok(gdb_remote::is_ok_response(&reply))
    }
}
