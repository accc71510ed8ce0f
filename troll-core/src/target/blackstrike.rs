//! Blackstrike target.
//!
//! The Blackstrike firmware runs a Forth interpreter on the probe. Commands
//! are sent as text lines; anything the host needs back is printed between
//! `<<<start>>>` and `<<<end>>>` markers so it can be told apart from the
//! interpreter's own chatter.

use super::{ExecutionState, HaltReason, HaltWatch, Target, TargetEvent, TargetKind};
use crate::config::{ProbeConfig, Timeouts};
use crate::diagnostics::Diagnostics;
use crate::error::{Result, TargetError};
use crate::flash::{FlashProgress, FlashReport};
use crate::memory::MemoryImage;
use crate::registers::{RegisterCache, RegisterSource};
use crate::transport::Transport;
use crossbeam_channel::Receiver;
use std::time::{Duration, Instant};

const START: &[u8] = b"<<<start>>>";
const END: &[u8] = b"<<<end>>>";
const QUERY_START: &str = ".( <<<start>>>)";
const QUERY_END: &str = ".( <<<end>>>)";
const TIMED_OUT: &[u8] = b"query timed out";
const INTERRUPT: u8 = 0x03;

/// Reply to [`Blackstrike::interrogate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    /// Text printed between the markers, or a placeholder on timeout.
    pub data: Vec<u8>,
    pub is_ok: bool,
}

impl QueryResponse {
    fn timed_out() -> Self {
        Self { data: TIMED_OUT.to_vec(), is_ok: false }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Bytes between the markers of a complete reply.
fn between_markers(reply: &[u8]) -> Result<&[u8]> {
    match (find(reply, START), find(reply, END)) {
        (Some(start), Some(end)) if start + START.len() <= end => Ok(&reply[start + START.len()..end]),
        _ => Err(TargetError::protocol(format!(
            "reply markers out of order: {:?}",
            String::from_utf8_lossy(reply)
        ))),
    }
}

fn first_hex_token(text: &[u8], what: &str) -> Result<u32> {
    let text = String::from_utf8_lossy(text);
    let token = text
        .split_whitespace()
        .next()
        .ok_or_else(|| TargetError::protocol(format!("empty {what} reply")))?;
    u32::from_str_radix(token, 16)
        .map_err(|_| TargetError::protocol(format!("bad {what} value {token:?}")))
}

/// Line-level access to the probe's interpreter.
struct ReplLink {
    transport: Box<dyn Transport>,
    timeouts: Timeouts,
    diagnostics: Diagnostics,
}

impl ReplLink {
    fn send_line(&mut self, line: &str) -> Result<()> {
        self.diagnostics.trace(format_args!("sending: {line}"));
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.transport.write(&data)
    }

    /// Accumulate input until the end marker shows up. `None` when the
    /// probe stays silent for `timeout`.
    fn collect_reply(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut reply = Vec::new();
        while find(&reply, END).is_none() {
            if self.transport.bytes_available()? > 0 {
                reply.extend(self.transport.read_all()?);
            } else if !self.transport.wait_for_ready_read(timeout)? {
                return Ok(None);
            }
        }
        self.diagnostics.trace(format_args!("received: {}", String::from_utf8_lossy(&reply)));
        Ok(Some(reply))
    }

    /// Like [`Self::collect_reply`], but running out of time is an error.
    fn expect_reply(&mut self, waiting_for: &'static str) -> Result<Vec<u8>> {
        let timeout = self.timeouts.short_reply();
        let mut reply = self
            .collect_reply(timeout)?
            .ok_or(TargetError::Timeout { waiting_for, timeout })?;
        for byte in &mut reply {
            if *byte == b'\n' || *byte == b'\r' {
                *byte = b' ';
            }
        }
        Ok(between_markers(&reply)?.to_vec())
    }

    fn interrogate(&mut self, query: &str) -> Result<QueryResponse> {
        match (query.find(QUERY_START), query.find(QUERY_END)) {
            (Some(start), Some(end)) if start < end => {}
            _ => return Err(TargetError::InvalidQuery(query.to_string())),
        }
        let started = Instant::now();
        self.send_line(query)?;
        let Some(reply) = self.collect_reply(self.timeouts.interrogate())? else {
            self.diagnostics.warn(format_args!("query timed out: {query}"));
            return Ok(QueryResponse::timed_out());
        };
        let data = between_markers(&reply)?.to_vec();
        self.diagnostics.debug(format_args!("target query took {} milliseconds", started.elapsed().as_millis()));
        Ok(QueryResponse { data, is_ok: true })
    }

    /// Query on a path where running out of time is fatal.
    fn query(&mut self, query: &str, waiting_for: &'static str) -> Result<Vec<u8>> {
        let response = self.interrogate(query)?;
        if !response.is_ok {
            return Err(TargetError::Timeout { waiting_for, timeout: self.timeouts.interrogate() });
        }
        Ok(response.data)
    }
}

impl RegisterSource for ReplLink {
    fn fetch_registers(&mut self) -> Result<Vec<u32>> {
        let started = Instant::now();
        self.send_line("swdp-scan drop gdb-attach drop")?;
        self.send_line(".( <<<start>>>)cr ?regs .( <<<end>>>)cr")?;
        let text = self.expect_reply("register dump")?;
        let registers = String::from_utf8_lossy(&text)
            .split_whitespace()
            .map(|token| {
                u32::from_str_radix(token, 16)
                    .map_err(|_| TargetError::protocol(format!("bad register value {token:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        self.diagnostics.debug(format_args!(
            "target register read took {} milliseconds",
            started.elapsed().as_millis()
        ));
        Ok(registers)
    }
}

/// A probe running the Blackstrike Forth firmware.
pub struct Blackstrike {
    link: ReplLink,
    registers: RegisterCache,
    halt: HaltWatch,
}

impl std::fmt::Debug for Blackstrike {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Blackstrike({:?})", self.halt.state())
    }
}

impl Blackstrike {
    pub fn new(transport: Box<dyn Transport>, config: &ProbeConfig, diagnostics: Diagnostics) -> Self {
        Self {
            link: ReplLink { transport, timeouts: config.timeouts, diagnostics },
            registers: RegisterCache::new(),
            halt: HaltWatch::new(),
        }
    }

    #[cfg(feature = "hardware")]
    pub fn open(port_name: &str, config: &ProbeConfig, diagnostics: Diagnostics) -> Result<Self> {
        let transport = crate::transport::SerialTransport::open(port_name, 115_200, &config.timeouts, &diagnostics)?;
        Ok(Self::new(Box::new(transport), config, diagnostics))
    }

    /// Run a Forth query and return what it printed between the markers.
    ///
    /// `query` must print `.( <<<start>>>)` before `.( <<<end>>>)`. A probe
    /// that stays silent yields a response with `is_ok` cleared rather than
    /// an error.
    pub fn interrogate(&mut self, query: &str) -> Result<QueryResponse> {
        self.link.interrogate(query)
    }

    /// Fetch the complete register set, bypassing the cache.
    pub fn read_all_registers(&mut self) -> Result<Vec<u32>> {
        let registers = self.link.fetch_registers()?;
        self.registers.store(registers.clone());
        Ok(registers)
    }

    /// Step one instruction and wait for it. Returns the halt reason code.
    pub fn single_step(&mut self) -> Result<u32> {
        let started = Instant::now();
        self.registers.invalidate();
        self.link.send_line("base @ >r step hex .( <<<start>>>) u. .( <<<end>>>) r> base ! cr")?;
        let text = self.link.expect_reply("single step")?;
        let reason = first_hex_token(&text, "halt reason")?;
        self.link.diagnostics.debug(format_args!(
            "target single-stepping took {} milliseconds",
            started.elapsed().as_millis()
        ));
        Ok(reason)
    }

    /// The firmware's run state code.
    pub fn halt_reason(&mut self) -> Result<u32> {
        let data = self.link.query("?target-run-state .( <<<start>>>). .( <<<end>>>)", "target run state")?;
        let text = String::from_utf8_lossy(&data).into_owned();
        let reason = text.trim().parse::<u32>().map_err(|_| TargetError::BadStateReply(text.clone()))?;
        self.link.diagnostics.info(format_args!("target halt reason: {reason}"));
        Ok(reason)
    }

    fn start_running(&mut self, command: &str) -> Result<()> {
        self.registers.invalidate();
        if let Err(e) = self.link.send_line(command) {
            self.halt.abort_run();
            return Err(e);
        }
        self.halt.running();
        self.halt.arm();
        Ok(())
    }

    /// Read the halt notification, giving a partial line a moment to finish.
    fn read_notification(&mut self) -> Result<String> {
        let mut text = Vec::new();
        while !text.contains(&b'\n') {
            if self.link.transport.bytes_available()? > 0 {
                text.extend(self.link.transport.read_all()?);
            } else if !self.link.transport.wait_for_ready_read(self.link.timeouts.short_reply())? {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&text).into_owned())
    }
}

impl Target for Blackstrike {
    fn kind(&self) -> TargetKind {
        TargetKind::Blackstrike
    }

    fn read_bytes(&mut self, address: u32, count: usize, allow_failure: bool) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let query = format!(" ${address:x} ${count:x}  .( <<<start>>>) target-dump .( <<<end>>>) cr ");
        // A silent interpreter is an error even when the read may fail.
        let data = self.link.query(&query, "memory dump")?;
        if data.len() != count {
            if allow_failure {
                return Ok(None);
            }
            return Err(TargetError::protocol(format!(
                "memory dump returned {} bytes, expected {count}",
                data.len()
            )));
        }
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.link.diagnostics.debug(format_args!("usb xfer speed: {:.0} bytes/second", count as f64 / elapsed));
        }
        Ok(Some(data))
    }

    fn read_word(&mut self, address: u32) -> Result<u32> {
        let query = format!("${address:x} base @ >r hex .( <<<start>>>) t@ u. .( <<<end>>>) r> base ! cr");
        let data = self.link.query(&query, "memory word")?;
        first_hex_token(&data, "memory word")
    }

    fn read_raw_register(&mut self, register: u32) -> Result<u32> {
        self.registers.get(register, &mut self.link)
    }

    fn request_single_step(&mut self) -> Result<()> {
        self.start_running("step")
    }

    fn resume(&mut self) -> Result<()> {
        self.start_running("target-resume")
    }

    fn request_halt(&mut self) -> Result<()> {
        self.link.transport.write(&[INTERRUPT])
    }

    fn reset(&mut self) -> Result<()> {
        self.registers.invalidate();
        let data = self.link.query("target-reset .( <<<start>>>).( <<<end>>>)", "target reset")?;
        if !data.is_empty() {
            return Err(TargetError::protocol(format!(
                "target reset printed {:?}",
                String::from_utf8_lossy(&data)
            )));
        }
        Ok(())
    }

    fn breakpoint_set(&mut self, _address: u32, _length: u32) -> Result<bool> {
        Err(TargetError::Unsupported("breakpoint_set"))
    }

    fn breakpoint_clear(&mut self, _address: u32, _length: u32) -> Result<bool> {
        Err(TargetError::Unsupported("breakpoint_clear"))
    }

    fn memory_map(&mut self) -> Result<String> {
        Err(TargetError::Unsupported("memory_map"))
    }

    fn sync_flash(&mut self, _image: &MemoryImage, _progress: &mut FlashProgress) -> Result<FlashReport> {
        Err(TargetError::Unsupported("sync_flash"))
    }

    fn poll_halt(&mut self) -> Result<Option<HaltReason>> {
        if !self.halt.is_armed() || self.link.transport.bytes_available()? == 0 {
            return Ok(None);
        }
        self.halt.fire();
        let text = self.read_notification()?;
        self.link.diagnostics.debug(format_args!("halt notification: {}", text.trim_end()));
        let reason = if text.contains("target-halted-breakpoint") {
            HaltReason::Breakpoint
        } else if text.contains("target-halted") {
            HaltReason::Generic
        } else {
            let text = format!("unexpected halt notification {text:?}");
            self.halt.violation(text.clone());
            return Err(TargetError::Protocol(text));
        };
        self.halt.halted(reason);
        Ok(Some(reason))
    }

    fn execution_state(&self) -> ExecutionState {
        self.halt.state()
    }

    fn events(&self) -> Receiver<TargetEvent> {
        self.halt.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockHandle, MockTransport};

    fn probe<F>(mut reply: F) -> (Blackstrike, MockHandle)
    where
        F: FnMut(&str) -> Option<&'static str> + Send + 'static,
    {
        let transport = MockTransport::with_responder(move |data| {
            let line = String::from_utf8_lossy(data);
            reply(line.trim_end()).map(|text| text.as_bytes().to_vec()).unwrap_or_default()
        });
        let handle = transport.handle();
        let target = Blackstrike::new(Box::new(transport), &ProbeConfig::default(), Diagnostics::silent());
        (target, handle)
    }

    #[test]
    fn test_interrogate_returns_text_between_markers() {
        let (mut target, handle) = probe(|line| {
            (line == ".( <<<start>>>) 2 2 + . .( <<<end>>>) cr").then_some(" ok <<<start>>>4<<<end>>>\n")
        });
        let response = target.interrogate(".( <<<start>>>) 2 2 + . .( <<<end>>>) cr").unwrap();
        assert_eq!(response, QueryResponse { data: b"4".to_vec(), is_ok: true });
        assert_eq!(handle.written(), b".( <<<start>>>) 2 2 + . .( <<<end>>>) cr\n");
    }

    #[test]
    fn test_interrogate_times_out_softly() {
        let (mut target, _handle) = probe(|_| None);
        let response = target.interrogate(".( <<<start>>>) 2 2 + . .( <<<end>>>)").unwrap();
        assert!(!response.is_ok);
        assert_eq!(response.text(), "query timed out");
    }

    #[test]
    fn test_interrogate_rejects_misordered_query() {
        let (mut target, handle) = probe(|_| None);
        let err = target.interrogate(".( <<<end>>>) 1 . .( <<<start>>>)").unwrap_err();
        assert!(matches!(err, TargetError::InvalidQuery(_)));
        assert!(target.interrogate("1 .").is_err());
        assert!(handle.writes().is_empty());
    }

    #[test]
    fn test_registers_are_parsed_and_cached() {
        let (mut target, handle) = probe(|line| {
            line.contains("?regs").then_some("<<<start>>>\n20000400 8000131\n0 1f\n<<<end>>>\n")
        });
        assert_eq!(target.read_raw_register(1).unwrap(), 0x0800_0131);
        assert_eq!(target.read_raw_register(3).unwrap(), 0x1f);
        assert_eq!(target.read_all_registers().unwrap(), vec![0x2000_0400, 0x0800_0131, 0, 0x1f]);
        let scans = handle.writes().iter().filter(|w| w.starts_with(b"swdp-scan")).count();
        assert_eq!(scans, 2);
    }

    #[test]
    fn test_bad_register_token_is_fatal() {
        let (mut target, _handle) = probe(|line| line.contains("?regs").then_some("<<<start>>>12 zz<<<end>>>"));
        assert!(matches!(target.read_raw_register(0).unwrap_err(), TargetError::Protocol(_)));
    }

    #[test]
    fn test_register_dump_timeout_is_fatal() {
        let (mut target, _handle) = probe(|_| None);
        let err = target.read_raw_register(0).unwrap_err();
        assert!(matches!(err, TargetError::Timeout { waiting_for: "register dump", .. }));
    }

    #[test]
    fn test_read_bytes_and_word() {
        let (mut target, _handle) = probe(|line| {
            if line.contains("target-dump") {
                Some("<<<start>>>abcd<<<end>>>")
            } else if line.contains("t@") {
                Some("<<<start>>>2000a000 <<<end>>>")
            } else {
                None
            }
        });
        assert_eq!(target.read_bytes(0x2000_0000, 4, false).unwrap(), Some(b"abcd".to_vec()));
        assert_eq!(target.read_bytes(0x2000_0000, 8, true).unwrap(), None);
        assert_eq!(target.read_word(0x0800_0000).unwrap(), 0x2000_a000);
    }

    #[test]
    fn test_silent_dump_fails_even_when_allowed() {
        let (mut target, _handle) = probe(|_| None);
        let err = target.read_bytes(0x2000_0000, 4, true).unwrap_err();
        assert!(matches!(err, TargetError::Timeout { waiting_for: "memory dump", .. }));
    }

    #[test]
    fn test_reset_requires_silence() {
        let (mut target, _handle) = probe(|_| Some("<<<start>>><<<end>>>"));
        target.reset().unwrap();
        let (mut target, _handle) = probe(|_| Some("<<<start>>>error<<<end>>>"));
        assert!(matches!(target.reset().unwrap_err(), TargetError::Protocol(_)));
    }

    #[test]
    fn test_halt_reason_is_decimal() {
        let (mut target, _handle) = probe(|_| Some("<<<start>>>3 <<<end>>>"));
        assert_eq!(target.halt_reason().unwrap(), 3);
        let (mut target, _handle) = probe(|_| Some("<<<start>>>?target-run-state ?<<<end>>>"));
        let err = target.halt_reason().unwrap_err();
        assert!(matches!(err, TargetError::BadStateReply(text) if text.contains('?')));
    }

    #[test]
    fn test_single_step_returns_hex_reason() {
        let (mut target, _handle) = probe(|line| line.contains("step hex").then_some("<<<start>>>1f <<<end>>>\n"));
        assert_eq!(target.single_step().unwrap(), 0x1f);
    }

    #[test]
    fn test_resume_then_breakpoint_notification() {
        let (mut target, handle) = probe(|_| None);
        let events = target.events();
        target.resume().unwrap();
        assert_eq!(handle.written(), b"target-resume\n");
        assert_eq!(target.poll_halt().unwrap(), None);

        handle.push_input(b"target-halted-breakpoint\n");
        assert_eq!(target.poll_halt().unwrap(), Some(HaltReason::Breakpoint));
        assert_eq!(events.try_recv().unwrap(), TargetEvent::Running);
        assert_eq!(events.try_recv().unwrap(), TargetEvent::Halted(HaltReason::Breakpoint));

        target.request_single_step().unwrap();
        handle.push_input(b"target-halted\n");
        assert_eq!(target.poll_halt().unwrap(), Some(HaltReason::Generic));
    }

    #[test]
    fn test_unknown_notification_is_a_violation() {
        let (mut target, handle) = probe(|_| None);
        let events = target.events();
        target.request_single_step().unwrap();
        handle.push_input(b"stack underflow\n");
        assert!(target.poll_halt().unwrap_err().is_desync());
        assert_eq!(events.try_recv().unwrap(), TargetEvent::Running);
        assert!(matches!(events.try_recv().unwrap(), TargetEvent::ProtocolViolation(_)));
    }

    #[test]
    fn test_unsupported_operations() {
        let (mut target, _handle) = probe(|_| None);
        assert!(matches!(target.breakpoint_set(0, 2), Err(TargetError::Unsupported(_))));
        assert!(matches!(target.memory_map(), Err(TargetError::Unsupported(_))));
        let err = target.sync_flash(&MemoryImage::new(), &mut FlashProgress::empty()).unwrap_err();
        assert!(matches!(err, TargetError::Unsupported("sync_flash")));
    }
}
