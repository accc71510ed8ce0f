//! Target abstraction.
//!
//! A [`Target`] is anything that can be read, halted, resumed and flashed:
//! one of the two probe firmwares, or a corefile snapshot on disk.

pub mod blackmagic;
pub mod blackstrike;
pub mod corefile;

pub use blackmagic::Blackmagic;
pub use blackstrike::{Blackstrike, QueryResponse};
pub use corefile::CorefileTarget;

use crate::error::{Result, TargetError};
use crate::flash::{FlashProgress, FlashReport};
use crate::memory::MemoryImage;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Why the target stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    Generic,
    Breakpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    Halted,
    Running,
}

/// Execution state changes, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    Running,
    Halted(HaltReason),
    /// The halt notification could not be understood.
    ProtocolViolation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetKind {
    Blackmagic,
    Blackstrike,
    Corefile,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Blackmagic => "blackmagic",
            Self::Blackstrike => "blackstrike",
            Self::Corefile => "corefile",
        })
    }
}

/// The capability set shared by every target.
///
/// Operations a target cannot perform fail with [`TargetError::Unsupported`].
pub trait Target: Send {
    fn kind(&self) -> TargetKind;

    /// Read `count` bytes at `address`.
    ///
    /// With `allow_failure` set, a target-reported read error yields
    /// `Ok(None)` instead of an error.
    fn read_bytes(&mut self, address: u32, count: usize, allow_failure: bool) -> Result<Option<Vec<u8>>>;

    /// Read a little-endian 32-bit word.
    fn read_word(&mut self, address: u32) -> Result<u32> {
        let bytes = self
            .read_bytes(address, 4, false)?
            .ok_or(TargetError::Unmapped { address, len: 4 })?;
        let word: [u8; 4] = bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| TargetError::protocol(format!("short read at {address:#010x}")))?;
        Ok(u32::from_le_bytes(word))
    }

    /// Register value from the current register set, fetching it if needed.
    fn read_raw_register(&mut self, register: u32) -> Result<u32>;

    /// Start a single step; completion is reported through [`Target::poll_halt`].
    fn request_single_step(&mut self) -> Result<()>;

    /// Resume execution; completion is reported through [`Target::poll_halt`].
    fn resume(&mut self) -> Result<()>;

    /// Ask the target to stop. Does not wait for it to happen.
    fn request_halt(&mut self) -> Result<()>;

    fn reset(&mut self) -> Result<()>;

    fn breakpoint_set(&mut self, address: u32, length: u32) -> Result<bool>;

    fn breakpoint_clear(&mut self, address: u32, length: u32) -> Result<bool>;

    /// The target's memory map description (GDB memory-map XML).
    fn memory_map(&mut self) -> Result<String>;

    /// Make target memory match `image`, erasing and programming flash as needed.
    fn sync_flash(&mut self, image: &MemoryImage, progress: &mut FlashProgress) -> Result<FlashReport>;

    /// Deliver a pending halt notification, if the halt listener is armed
    /// and data has arrived. Never blocks for longer than one reply.
    fn poll_halt(&mut self) -> Result<Option<HaltReason>>;

    fn execution_state(&self) -> ExecutionState;

    /// Subscribe to execution state changes.
    fn events(&self) -> Receiver<TargetEvent>;

    /// Poll for a halt notification until `timeout` elapses.
    fn wait_for_halt(&mut self, timeout: Duration) -> Result<Option<HaltReason>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(reason) = self.poll_halt()? {
                return Ok(Some(reason));
            }
            if self.execution_state() == ExecutionState::Halted || Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

const EVENT_CAPACITY: usize = 16;

/// One-shot halt listener plus the execution state machine.
///
/// `arm` is called when the target starts running; `fire` disarms the
/// listener before the halt reply is processed, so each run produces at most
/// one terminal event. Every subscriber gets its own bounded queue and only
/// sees events published after it subscribed.
#[derive(Debug)]
pub struct HaltWatch {
    state: ExecutionState,
    armed: bool,
    subscribers: Mutex<Vec<Sender<TargetEvent>>>,
}

impl Default for HaltWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl HaltWatch {
    pub const fn new() -> Self {
        Self { state: ExecutionState::Halted, armed: false, subscribers: Mutex::new(Vec::new()) }
    }

    pub fn subscribe(&self) -> Receiver<TargetEvent> {
        let (tx, rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    pub const fn state(&self) -> ExecutionState {
        self.state
    }

    pub const fn is_armed(&self) -> bool {
        self.armed
    }

    /// Report that the target is about to run.
    pub fn running(&mut self) {
        self.state = ExecutionState::Running;
        self.publish(TargetEvent::Running);
    }

    pub fn arm(&mut self) {
        self.armed = true;
    }

    /// Disarm the listener. Returns whether it was armed.
    pub fn fire(&mut self) -> bool {
        std::mem::replace(&mut self.armed, false)
    }

    pub fn halted(&mut self, reason: HaltReason) {
        self.state = ExecutionState::Halted;
        self.publish(TargetEvent::Halted(reason));
    }

    /// The halt reply could not be understood; the target counts as stopped.
    pub fn violation(&mut self, text: String) {
        self.state = ExecutionState::Halted;
        self.publish(TargetEvent::ProtocolViolation(text));
    }

    /// A run request never reached the target.
    pub fn abort_run(&mut self) {
        self.armed = false;
        self.state = ExecutionState::Halted;
    }

    /// A subscriber whose queue is full misses the event; dropped receivers
    /// are forgotten.
    fn publish(&self, event: TargetEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !matches!(tx.try_send(event.clone()), Err(TrySendError::Disconnected(_))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_watch_fires_once() {
        let mut watch = HaltWatch::new();
        let events = watch.subscribe();
        watch.running();
        watch.arm();
        assert_eq!(watch.state(), ExecutionState::Running);
        assert!(watch.fire());
        assert!(!watch.fire());
        watch.halted(HaltReason::Breakpoint);
        assert_eq!(events.try_recv().unwrap(), TargetEvent::Running);
        assert_eq!(events.try_recv().unwrap(), TargetEvent::Halted(HaltReason::Breakpoint));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_every_subscriber_sees_each_event() {
        let mut watch = HaltWatch::new();
        let first = watch.subscribe();
        let second = watch.subscribe();
        watch.running();
        watch.halted(HaltReason::Generic);
        let expected = vec![TargetEvent::Running, TargetEvent::Halted(HaltReason::Generic)];
        assert_eq!(first.try_iter().collect::<Vec<_>>(), expected);
        assert_eq!(second.try_iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_late_subscriber_gets_no_history() {
        let mut watch = HaltWatch::new();
        watch.running();
        watch.halted(HaltReason::Breakpoint);
        let late = watch.subscribe();
        assert!(late.try_recv().is_err());
        watch.running();
        assert_eq!(late.try_iter().collect::<Vec<_>>(), vec![TargetEvent::Running]);
    }

    #[test]
    fn test_full_or_dropped_subscribers() {
        let mut watch = HaltWatch::new();
        let idle = watch.subscribe();
        let dropped = watch.subscribe();
        drop(dropped);
        for _ in 0..=EVENT_CAPACITY {
            watch.running();
        }
        assert_eq!(watch.subscribers.lock().unwrap().len(), 1);
        assert_eq!(idle.try_iter().count(), EVENT_CAPACITY);
        watch.halted(HaltReason::Generic);
        assert_eq!(idle.try_recv().unwrap(), TargetEvent::Halted(HaltReason::Generic));
    }

    #[test]
    fn test_violation_and_abort_leave_target_halted() {
        let mut watch = HaltWatch::new();
        watch.running();
        watch.arm();
        watch.violation("garbage".to_string());
        assert_eq!(watch.state(), ExecutionState::Halted);

        watch.running();
        watch.arm();
        watch.abort_run();
        assert!(!watch.is_armed());
        assert_eq!(watch.state(), ExecutionState::Halted);
    }

    #[test]
    fn test_target_kind_display() {
        assert_eq!(TargetKind::Blackmagic.to_string(), "blackmagic");
        assert_eq!(TargetKind::Corefile.to_string(), "corefile");
    }
}
