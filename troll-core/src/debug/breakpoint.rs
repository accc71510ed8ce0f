//! Breakpoint management module.

use crate::target::Target;
use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;

/// Thumb instructions are two bytes wide.
pub const BREAKPOINT_LENGTH: u32 = 2;

/// Manager for hardware breakpoints.
#[derive(Debug, Default)]
pub struct BreakpointManager {
    breakpoints: BTreeSet<u32>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a hardware breakpoint at the given address.
    pub fn set_breakpoint(&mut self, target: &mut dyn Target, address: u32) -> Result<()> {
        let accepted = target
            .breakpoint_set(address, BREAKPOINT_LENGTH)
            .context("Failed to set hardware breakpoint")?;
        if !accepted {
            bail!("Target refused breakpoint @ 0x{address:08X}");
        }
        self.breakpoints.insert(address);
        Ok(())
    }

    /// Clear a hardware breakpoint at the given address.
    pub fn clear_breakpoint(&mut self, target: &mut dyn Target, address: u32) -> Result<()> {
        let accepted = target
            .breakpoint_clear(address, BREAKPOINT_LENGTH)
            .context("Failed to clear hardware breakpoint")?;
        if !accepted {
            bail!("Target refused to clear breakpoint @ 0x{address:08X}");
        }
        self.breakpoints.remove(&address);
        Ok(())
    }

    /// Clear all breakpoints.
    pub fn clear_all(&mut self, target: &mut dyn Target) -> Result<()> {
        while let Some(&address) = self.breakpoints.iter().next() {
            self.clear_breakpoint(target, address)
                .with_context(|| format!("Failed to clear breakpoint @ 0x{address:08X}"))?;
        }
        Ok(())
    }

    /// Toggle a hardware breakpoint at the given address.
    pub fn toggle_breakpoint(&mut self, target: &mut dyn Target, address: u32) -> Result<()> {
        if self.breakpoints.contains(&address) {
            self.clear_breakpoint(target, address)
        } else {
            self.set_breakpoint(target, address)
        }
    }

    /// Active breakpoint addresses, lowest first.
    pub fn list(&self) -> Vec<u32> {
        self.breakpoints.iter().copied().collect()
    }

    /// Drop every record without talking to the target.
    pub fn forget_all(&mut self) {
        self.breakpoints.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;
    use crate::diagnostics::Diagnostics;
    use crate::gdb_remote;
    use crate::target::Blackmagic;
    use crate::transport::MockTransport;

    /// Accepts breakpoints below 0x0800_1000 only.
    fn target() -> Blackmagic {
        let transport = MockTransport::with_responder(|data| {
            if data.first() != Some(&b'$') {
                return Vec::new();
            }
            let payload = String::from_utf8_lossy(&gdb_remote::packet_data(data)).into_owned();
            let address = payload
                .get(3..)
                .and_then(|rest| rest.split(',').next())
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .unwrap_or(u32::MAX);
            let reply: &[u8] = if address < 0x0800_1000 { b"OK" } else { b"E01" };
            let mut out = b"+".to_vec();
            out.extend(gdb_remote::make_packet(reply));
            out
        });
        Blackmagic::new(Box::new(transport), &ProbeConfig::default(), Diagnostics::silent())
    }

    #[test]
    fn test_breakpoint_manager_tracking() {
        let mut mgr = BreakpointManager::new();
        let mut target = target();
        assert!(mgr.list().is_empty());

        mgr.set_breakpoint(&mut target, 0x0800_0200).unwrap();
        mgr.set_breakpoint(&mut target, 0x0800_0100).unwrap();
        assert_eq!(mgr.list(), vec![0x0800_0100, 0x0800_0200]);

        mgr.toggle_breakpoint(&mut target, 0x0800_0100).unwrap();
        assert_eq!(mgr.list(), vec![0x0800_0200]);

        mgr.clear_all(&mut target).unwrap();
        assert!(mgr.list().is_empty());
    }

    #[test]
    fn test_refused_breakpoint_is_not_recorded() {
        let mut mgr = BreakpointManager::new();
        let mut target = target();
        assert!(mgr.set_breakpoint(&mut target, 0x2000_0000).is_err());
        assert!(mgr.list().is_empty());
    }
}
