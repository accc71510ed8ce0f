use super::Transport;
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

#[derive(Default)]
struct MockState {
    input: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    dtr: bool,
    responder: Option<Responder>,
}

/// In-memory transport driven by a responder closure.
///
/// Every `write` is recorded and passed to the responder; whatever it returns
/// becomes readable. Waits never sleep: an empty input counts as a timeout.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

/// Inspection handle that stays usable after the transport is moved into a
/// client.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let transport = Self::new();
        lock(&transport.state).responder = Some(Box::new(responder));
        transport
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle { state: self.state.clone() }
    }
}

impl MockHandle {
    /// Make `data` readable, as if the device sent it unprompted.
    pub fn push_input(&self, data: &[u8]) {
        lock(&self.state).input.extend(data.iter().copied());
    }

    /// Every write so far, one entry per call.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    /// Every write so far, concatenated.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).writes.concat()
    }

    pub fn clear_writes(&self) {
        lock(&self.state).writes.clear();
    }

    pub fn pending_input(&self) -> usize {
        lock(&self.state).input.len()
    }

    pub fn dtr(&self) -> bool {
        lock(&self.state).dtr
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        state.writes.push(data.to_vec());
        if let Some(responder) = state.responder.as_mut() {
            let reply = responder(data);
            state.input.extend(reply);
        }
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(lock(&self.state).input.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut state = lock(&self.state);
        let n = buf.len().min(state.input.len());
        for (dst, src) in buf.iter_mut().zip(state.input.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn wait_for_ready_read(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(!lock(&self.state).input.is_empty())
    }

    fn set_data_terminal_ready(&mut self, level: bool) -> Result<()> {
        lock(&self.state).dtr = level;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_responder_feeds_input() {
        let mut transport = MockTransport::with_responder(|data| {
            if data == b"ping" {
                b"pong".to_vec()
            } else {
                Vec::new()
            }
        });
        let handle = transport.handle();
        transport.write(b"ping").unwrap();
        assert_eq!(transport.read_all().unwrap(), b"pong");
        transport.write(b"other").unwrap();
        assert_eq!(transport.bytes_available().unwrap(), 0);
        assert_eq!(handle.writes(), vec![b"ping".to_vec(), b"other".to_vec()]);
    }

    #[test]
    fn test_read_byte_times_out_without_input() {
        let mut transport = MockTransport::new();
        assert_eq!(transport.read_byte(Duration::from_secs(5)).unwrap(), None);
        transport.handle().push_input(b"+");
        assert_eq!(transport.read_byte(Duration::from_secs(5)).unwrap(), Some(b'+'));
    }
}
