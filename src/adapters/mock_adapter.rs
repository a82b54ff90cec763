//! Scripted adapter for tests and dry runs.
//!
//! Every call is recorded. Queries (commands ending in `?`) are answered from
//! a response table; unscripted queries fail on the following `read`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use super::Adapter;

/// One recorded adapter call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// `write` with the command text.
    Write(String),
    /// `write_raw` with the bytes sent.
    WriteRaw(Vec<u8>),
    /// `read`.
    Read,
}

#[derive(Default)]
struct MockState {
    calls: Vec<MockCall>,
    responses: HashMap<String, VecDeque<String>>,
    pending: VecDeque<Result<String, String>>,
    fail_next: Option<String>,
}

impl MockState {
    fn lookup(&mut self, query: &str) -> Option<String> {
        let key = if self.responses.contains_key(query) {
            query.to_string()
        } else {
            self.responses
                .keys()
                .filter(|k| query.starts_with(k.as_str()))
                .max_by_key(|k| k.len())?
                .clone()
        };
        let queue = self.responses.get_mut(&key)?;
        // The last scripted response stays in place.
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

/// In-memory adapter. Clones share state, so a test can keep a handle while
/// the driver owns another.
#[derive(Clone)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Creates an adapter answering the common status queries with an idle,
    /// error-free instrument.
    pub fn new() -> Self {
        let adapter = Self {
            state: Arc::new(Mutex::new(MockState::default())),
        };
        adapter
            .respond("*IDN?", "TEKTRONIX,AWG70002B,B010294,FV:7.1.0170.0")
            .respond("*OPC?", "1")
            .respond("AWGControl:RSTATe?", "2")
            .respond("SYSTem:ERRor:CODE?", "0")
            .respond("SYST:ERR?", "0,\"No error\"")
            .respond("INSTrument:MODE?", "AWG")
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers queries starting with `query` with `response` from now on.
    pub fn respond(&self, query: &str, response: &str) -> Self {
        self.respond_sequence(query, [response])
    }

    /// Answers successive matching queries with `responses` in order; the
    /// last one repeats.
    pub fn respond_sequence<'a>(
        &self,
        query: &str,
        responses: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let queue: VecDeque<String> = responses.into_iter().map(str::to_string).collect();
        self.lock().responses.insert(query.to_string(), queue);
        self.clone()
    }

    /// Makes the next `write` or `write_raw` fail with `message`.
    pub fn fail_next(&self, message: &str) {
        self.lock().fail_next = Some(message.to_string());
    }

    /// All recorded calls.
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    /// Text commands written, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::Write(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    /// Raw blocks written, in order.
    pub fn raw_writes(&self) -> Vec<Vec<u8>> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                MockCall::WriteRaw(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// True if nothing was written.
    pub fn is_untouched(&self) -> bool {
        !self
            .lock()
            .calls
            .iter()
            .any(|c| matches!(c, MockCall::Write(_) | MockCall::WriteRaw(_)))
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn write(&mut self, command: &str) -> Result<usize> {
        let mut state = self.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(anyhow!(message));
        }
        state.calls.push(MockCall::Write(command.to_string()));
        let query = command.trim();
        if query.ends_with('?') {
            let response = state
                .lookup(query)
                .ok_or_else(|| format!("no scripted response for '{query}'"));
            state.pending.push_back(response);
        }
        Ok(command.len() + 1)
    }

    async fn write_raw(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut state = self.lock();
        if let Some(message) = state.fail_next.take() {
            return Err(anyhow!(message));
        }
        state.calls.push(MockCall::WriteRaw(bytes.to_vec()));
        Ok(bytes.len())
    }

    async fn read(&mut self) -> Result<String> {
        let mut state = self.lock();
        state.calls.push(MockCall::Read);
        match state.pending.pop_front() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("read with no pending response")),
        }
    }

    fn info(&self) -> String {
        "MockAdapter".to_string()
    }
}
