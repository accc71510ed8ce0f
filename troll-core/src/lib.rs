//! Troll Core - probe protocols and target access for the troll debugger.
//!
//! This crate talks to ARM Cortex-M targets through two serial debug probe
//! firmwares (Black Magic Probe over the GDB remote protocol, Blackstrike
//! over its Forth interpreter) and reads post-mortem corefiles. Everything a
//! front end needs sits behind the [`Target`] trait and the [`Session`].

pub mod config;
pub mod debug;
pub mod diagnostics;
pub mod dwarf;
pub mod error;
pub mod flash;
pub mod gdb_remote;
pub mod memory;
pub mod probe;
pub mod registers;
pub mod session;
pub mod target;
pub mod transport;

// Re-export commonly used types
pub use config::{AckPolicy, CorefileLayout, PacketSettings, ProbeConfig, Timeouts};
pub use debug::{BreakpointManager, DebugManager};
pub use diagnostics::{DiagnosticSink, Diagnostics, LogSink, MemorySink, NullSink};
pub use dwarf::{DwarfError, DwarfEvaluator, DwarfExpressionValue, StackMachine};
pub use error::{Result, TargetError};
pub use flash::{FlashManager, FlashProgress, FlashReport, FlashStatus, FlashingProgress, MpscFlashProgress};
pub use memory::{MemoryImage, MemoryRange};
pub use probe::{ProbeInfo, ProbeManager, ProbeType};
pub use registers::RegisterCache;
pub use session::{DebugCommand, DebugEvent, Session};
pub use target::{
    Blackmagic, Blackstrike, CorefileTarget, ExecutionState, HaltReason, QueryResponse, Target, TargetEvent,
    TargetKind,
};
pub use transport::{MockHandle, MockTransport, Transport};
#[cfg(feature = "hardware")]
pub use transport::SerialTransport;
