//! Debug control module.
//!
//! Handles core debug operations: halt, resume, step, and register access.
//! Run control on the probes is asynchronous; the blocking variants here wait
//! for the halt notification with a bound.

pub mod breakpoint;

pub use breakpoint::BreakpointManager;

use crate::target::{ExecutionState, HaltReason, Target};
use anyhow::{Context, Result};
use std::time::Duration;

/// ARM Cortex-M program counter.
pub const PC_REGISTER: u32 = 15;
/// Registers shown by a full register dump: r0-r12, sp, lr, pc, xpsr.
pub const CORE_REGISTER_COUNT: u32 = 17;

/// Manager for debug operations.
#[derive(Debug, Clone, Copy)]
pub struct DebugManager {
    halt_timeout: Duration,
}

impl DebugManager {
    pub const fn new(halt_timeout: Duration) -> Self {
        Self { halt_timeout }
    }

    /// Halt the core and wait for it to stop.
    pub fn halt(&self, target: &mut dyn Target) -> Result<Option<HaltReason>> {
        if target.execution_state() == ExecutionState::Halted {
            return Ok(Some(HaltReason::Generic));
        }
        target.request_halt().context("Failed to halt core")?;
        target.wait_for_halt(self.halt_timeout).context("Failed to halt core")
    }

    /// Resume the core.
    pub fn resume(&self, target: &mut dyn Target) -> Result<()> {
        target.resume().context("Failed to resume core")
    }

    /// Step the core by one instruction and wait for it to stop again.
    pub fn step(&self, target: &mut dyn Target) -> Result<Option<HaltReason>> {
        target.request_single_step().context("Failed to step core")?;
        target.wait_for_halt(self.halt_timeout).context("Failed to step core")
    }

    /// Get the current status of the core.
    pub fn status(&self, target: &dyn Target) -> ExecutionState {
        target.execution_state()
    }

    /// Read a core register.
    pub fn read_core_reg(&self, target: &mut dyn Target, register: u32) -> Result<u32> {
        target
            .read_raw_register(register)
            .with_context(|| format!("Failed to read core register {register}"))
    }

    /// Read r0 through xpsr.
    pub fn read_core_regs(&self, target: &mut dyn Target) -> Result<Vec<u32>> {
        (0..CORE_REGISTER_COUNT).map(|r| self.read_core_reg(target, r)).collect()
    }

    pub fn pc(&self, target: &mut dyn Target) -> Result<u32> {
        self.read_core_reg(target, PC_REGISTER)
    }
}

impl Default for DebugManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}
