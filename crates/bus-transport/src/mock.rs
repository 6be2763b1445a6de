//! Scripted in-memory bus for exercising pollers without hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::debug;

use crate::{BusTransport, TransportError};

/// What the simulated inverter does after receiving an enquiry.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer immediately with these bytes.
    Frame(Vec<u8>),
    /// Answer after a delay. A delay at or beyond the receive timeout is a timeout.
    Delayed(Duration, Vec<u8>),
    /// Stay silent until the receive timeout expires.
    Silent,
    /// Fail the exchange with an I/O error.
    Fail(String),
}

#[derive(Debug, Default)]
struct MockState {
    queued: HashMap<u8, VecDeque<MockReply>>,
    defaults: HashMap<u8, MockReply>,
    sent: Vec<Vec<u8>>,
    overheard: VecDeque<Vec<u8>>,
    pending: Option<u8>,
    overlapping_sends: usize,
}

/// Cloneable handle to a scripted bus. All clones share one script and one log.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a one-shot reply for the next enquiry to `address`.
    pub fn push_reply(&self, address: u8, reply: MockReply) {
        self.state().queued.entry(address).or_default().push_back(reply);
    }

    /// Reply used once the queue for `address` is empty.
    pub fn set_default(&self, address: u8, reply: MockReply) {
        self.state().defaults.insert(address, reply);
    }

    /// Queues traffic between another master and its inverters. It is
    /// delivered to `receive` calls made without an enquiry of our own.
    pub fn push_overheard(&self, frame: Vec<u8>) {
        self.state().overheard.push_back(frame);
    }

    /// Every frame written so far, in order.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state().sent.clone()
    }

    /// Addresses of the enquiries written so far, in order.
    pub fn polled_addresses(&self) -> Vec<u8> {
        self.state()
            .sent
            .iter()
            .filter_map(|frame| frame.get(2).copied())
            .collect()
    }

    /// Number of sends issued while a previous exchange was still open.
    pub fn overlapping_sends(&self) -> usize {
        self.state().overlapping_sends
    }

    fn next_reply(&self) -> Option<(u8, MockReply)> {
        let mut state = self.state();
        let address = state.pending.take()?;
        let reply = state
            .queued
            .get_mut(&address)
            .and_then(VecDeque::pop_front)
            .or_else(|| state.defaults.get(&address).cloned())
            .unwrap_or(MockReply::Silent);
        Some((address, reply))
    }
}

#[async_trait]
impl BusTransport for MockTransport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.pending.is_some() {
            state.overlapping_sends += 1;
        }
        state.pending = frame.get(2).copied();
        state.sent.push(frame.to_vec());
        Ok(())
    }

    async fn receive(&mut self, wait: Duration) -> Result<Vec<u8>, TransportError> {
        let timed_out = TransportError::Timeout {
            timeout_ms: wait.as_millis() as u64,
            received: 0,
        };

        let Some((address, reply)) = self.next_reply() else {
            let overheard = self.state().overheard.pop_front();
            if let Some(frame) = overheard {
                return Ok(frame);
            }
            sleep(wait).await;
            return Err(timed_out);
        };
        debug!(address, ?reply, "mock bus reply");

        match reply {
            MockReply::Frame(bytes) => Ok(bytes),
            MockReply::Delayed(delay, bytes) if delay < wait => {
                sleep(delay).await;
                Ok(bytes)
            }
            MockReply::Delayed(..) | MockReply::Silent => {
                sleep(wait).await;
                Err(timed_out)
            }
            MockReply::Fail(message) => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                message,
            ))),
        }
    }
}
