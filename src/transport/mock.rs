//! In-memory transport that records what the engine sends, for tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{OutgoingMessage, Transport, TransportError};

#[derive(Default)]
struct MockBrokerState {
    recorded: Vec<String>,
    subscriptions: Vec<String>,
    sync_requests: usize,
    closed: bool,
}

/// Records every publish and subscription as a text line:
///
/// ```text
/// driver -> /devices/wbrules/meta/name: [Rule Engine Settings] (QoS 1, retained)
/// Subscribe -- driver: /devices/+/meta/name
/// ```
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<MockBrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockBrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every following call fail with [`TransportError::Closed`].
    pub fn close(&self) {
        self.state().closed = true;
    }

    /// Removes and returns everything recorded so far.
    pub fn take_recorded(&self) -> Vec<String> {
        std::mem::take(&mut self.state().recorded)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state().subscriptions.clone()
    }

    pub fn sync_requests(&self) -> usize {
        self.state().sync_requests
    }

    /// Asserts that exactly `expected` was recorded, in order, and clears it.
    #[track_caller]
    pub fn verify(&self, expected: &[&str]) {
        let recorded = self.take_recorded();
        assert_eq!(recorded, expected, "recorded transport traffic differs");
    }

    /// Asserts that exactly `expected` was recorded, in any order, and clears it.
    #[track_caller]
    pub fn verify_unordered(&self, expected: &[&str]) {
        let mut recorded = self.take_recorded();
        let mut expected = expected.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        recorded.sort();
        expected.sort();
        assert_eq!(recorded, expected, "recorded transport traffic differs");
    }

    #[track_caller]
    pub fn verify_empty(&self) {
        self.verify(&[]);
    }

    fn record(&self, line: String) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.closed {
            return Err(TransportError::Closed);
        }
        log::trace!("{}", line);
        state.recorded.push(line);
        Ok(())
    }
}

impl Transport for MockBroker {
    fn publish(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        let retained = if message.retain { ", retained" } else { "" };
        self.record(format!(
            "driver -> {}: [{}] (QoS {}{})",
            message.topic, message.payload, message.qos as u8, retained
        ))
    }

    fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(format!("Subscribe -- driver: {}", topic))?;
        self.state().subscriptions.push(topic.to_string());
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.record(format!("Unsubscribe -- driver: {}", topic))?;
        self.state().subscriptions.retain(|t| t != topic);
        Ok(())
    }

    fn request_sync(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.sync_requests += 1;
        Ok(())
    }
}
