//! Session management module.
//!
//! A session owns the active target and turns commands into target
//! operations. Results and execution state changes are broadcast as
//! [`DebugEvent`]s, so any number of front ends can follow along.
//!
//! Everything runs on the caller's thread: `execute` blocks for the duration
//! of one command and `poll` has to be called regularly to pick up halt
//! notifications while the target runs.

use crate::debug::{BreakpointManager, DebugManager};
use crate::diagnostics::Diagnostics;
use crate::error::TargetError;
use crate::flash::{FlashManager, FlashProgress, FlashReport, FlashingProgress};
use crate::target::{ExecutionState, HaltReason, Target, TargetEvent, TargetKind};
use anyhow::Result;
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugCommand {
    Halt,
    Resume,
    Step,
    Reset,
    ReadRegister(u32),
    ReadRegisters,
    ReadMemory(u32, usize),
    SetBreakpoint(u32),
    ClearBreakpoint(u32),
    ToggleBreakpoint(u32),
    ListBreakpoints,
    ReadMemoryMap,
    PollStatus,
    /// Flash a raw binary at the given address.
    StartFlashing(PathBuf, u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DebugEvent {
    Halted { pc: Option<u32>, reason: HaltReason },
    Resumed,
    RegisterValue(u32, u32),
    Registers(Vec<u32>),
    MemoryData(u32, Vec<u8>),
    Breakpoints(Vec<u32>),
    MemoryMap(String),
    Status(ExecutionState),
    TargetChanged(TargetKind),
    ProtocolViolation(String),
    Error(String),
    FlashProgress(f32),
    FlashStatus(String),
    FlashDone(FlashReport),
}

pub struct Session {
    target: Box<dyn Target>,
    target_events: Receiver<TargetEvent>,
    debug: DebugManager,
    breakpoints: BreakpointManager,
    flash: FlashManager,
    event_tx: broadcast::Sender<DebugEvent>,
    diagnostics: Diagnostics,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target.kind())
            .field("breakpoints", &self.breakpoints)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(target: Box<dyn Target>) -> Self {
        Self::with_debug_manager(target, DebugManager::default())
    }

    pub fn with_debug_manager(target: Box<dyn Target>, debug: DebugManager) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let target_events = target.events();
        Self {
            target,
            target_events,
            debug,
            breakpoints: BreakpointManager::new(),
            flash: FlashManager::new(),
            event_tx,
            diagnostics: Diagnostics::default(),
        }
    }

    /// Send session diagnostics to `diagnostics` instead of the log.
    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Subscribe to debug events
    pub fn subscribe(&self) -> broadcast::Receiver<DebugEvent> {
        self.event_tx.subscribe()
    }

    pub fn target(&mut self) -> &mut dyn Target {
        self.target.as_mut()
    }

    /// Switch to another probe or corefile, returning the previous target.
    ///
    /// Breakpoints belong to the old target and are forgotten.
    pub fn replace_target(&mut self, target: Box<dyn Target>) -> Box<dyn Target> {
        self.target_events = target.events();
        self.breakpoints.forget_all();
        let previous = std::mem::replace(&mut self.target, target);
        self.diagnostics
            .info(format_args!("switched target from {} to {}", previous.kind(), self.target.kind()));
        self.emit(DebugEvent::TargetChanged(self.target.kind()));
        self.emit(DebugEvent::Status(self.target.execution_state()));
        previous
    }

    fn emit(&self, event: DebugEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Run one command. Failures are broadcast as [`DebugEvent::Error`] and
    /// returned.
    pub fn execute(&mut self, command: DebugCommand) -> Result<()> {
        self.diagnostics.debug(format_args!("executing {command:?}"));
        let result = self.dispatch(command);
        self.forward_target_events();
        if let Err(e) = &result {
            self.diagnostics.error(format_args!("{e:#}"));
            self.emit(DebugEvent::Error(format!("{e:#}")));
        }
        result
    }

    fn dispatch(&mut self, command: DebugCommand) -> Result<()> {
        let Self { target, debug, breakpoints, flash, event_tx, .. } = self;
        let target = target.as_mut();
        let tx: &broadcast::Sender<DebugEvent> = event_tx;
        let emit = |event: DebugEvent| {
            let _ = tx.send(event);
        };
        match command {
            DebugCommand::Halt => {
                if debug.halt(target)?.is_none() {
                    anyhow::bail!("Target did not halt within the timeout");
                }
            }
            DebugCommand::Resume => debug.resume(target)?,
            DebugCommand::Step => {
                if debug.step(target)?.is_none() {
                    anyhow::bail!("Target did not stop after single step");
                }
            }
            DebugCommand::Reset => {
                target.reset()?;
                emit(DebugEvent::Status(target.execution_state()));
            }
            DebugCommand::ReadRegister(register) => {
                emit(DebugEvent::RegisterValue(register, debug.read_core_reg(target, register)?));
            }
            DebugCommand::ReadRegisters => emit(DebugEvent::Registers(debug.read_core_regs(target)?)),
            DebugCommand::ReadMemory(address, count) => {
                let data = target
                    .read_bytes(address, count, false)?
                    .ok_or(TargetError::Unmapped { address, len: count })?;
                emit(DebugEvent::MemoryData(address, data));
            }
            DebugCommand::SetBreakpoint(address) => {
                breakpoints.set_breakpoint(target, address)?;
                emit(DebugEvent::Breakpoints(breakpoints.list()));
            }
            DebugCommand::ClearBreakpoint(address) => {
                breakpoints.clear_breakpoint(target, address)?;
                emit(DebugEvent::Breakpoints(breakpoints.list()));
            }
            DebugCommand::ToggleBreakpoint(address) => {
                breakpoints.toggle_breakpoint(target, address)?;
                emit(DebugEvent::Breakpoints(breakpoints.list()));
            }
            DebugCommand::ListBreakpoints => emit(DebugEvent::Breakpoints(breakpoints.list())),
            DebugCommand::ReadMemoryMap => emit(DebugEvent::MemoryMap(target.memory_map()?)),
            DebugCommand::PollStatus => emit(DebugEvent::Status(debug.status(target))),
            DebugCommand::StartFlashing(path, address) => {
                let report = flash_bin(flash, target, tx, &path, address)?;
                emit(DebugEvent::FlashStatus(report.message()));
                if !report.is_success() {
                    anyhow::bail!("Flash failed: {}", report.message());
                }
                emit(DebugEvent::FlashDone(report));
            }
        }
        Ok(())
    }

    /// Pick up a pending halt notification and broadcast what changed.
    pub fn poll(&mut self) -> Result<Option<HaltReason>> {
        let result = self.target.poll_halt();
        self.forward_target_events();
        result.map_err(anyhow::Error::from)
    }

    fn forward_target_events(&mut self) {
        while let Ok(event) = self.target_events.try_recv() {
            let event = match event {
                TargetEvent::Running => DebugEvent::Resumed,
                TargetEvent::Halted(reason) => {
                    let pc = self.debug.pc(self.target.as_mut()).ok();
                    DebugEvent::Halted { pc, reason }
                }
                TargetEvent::ProtocolViolation(text) => DebugEvent::ProtocolViolation(text),
            };
            self.emit(event);
        }
    }
}

fn flash_bin(
    flash: &FlashManager,
    target: &mut dyn Target,
    tx: &broadcast::Sender<DebugEvent>,
    path: &Path,
    address: u32,
) -> Result<FlashReport> {
    let tx = tx.clone();
    let mut total = 0u32;
    let mut done = 0u32;
    let mut progress = FlashProgress::new(move |event| {
        let update = match event {
            FlashingProgress::Started => DebugEvent::FlashStatus("Started".to_string()),
            FlashingProgress::Erasing { address, size } => {
                DebugEvent::FlashStatus(format!("Erasing {size:#x} bytes at {address:#010x}"))
            }
            FlashingProgress::Programming { total: bytes } => {
                total = bytes;
                DebugEvent::FlashStatus("Programming".to_string())
            }
            FlashingProgress::Progress { bytes } => {
                done += bytes;
                DebugEvent::FlashProgress(if total > 0 { done as f32 / total as f32 } else { 0.0 })
            }
            FlashingProgress::Verifying => DebugEvent::FlashStatus("Verifying".to_string()),
            FlashingProgress::Message(text) => DebugEvent::FlashStatus(text),
            FlashingProgress::Finished | FlashingProgress::Failed => return,
        };
        let _ = tx.send(update);
    });
    Ok(flash.flash_bin(target, path, address, &mut progress)?)
}
