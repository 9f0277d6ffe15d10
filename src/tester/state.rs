//! Per-endpoint test state
//!
//! Each running test owns exactly one [`TestStatus`] (the writing side of a
//! `watch` channel). The scheduler keeps the receiving side and only ever
//! reads snapshots for progress reporting.

use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::types::TestStage;

/// Snapshot of one in-flight endpoint test
#[derive(Debug, Clone)]
pub struct EndpointTestState {
    pub stage: TestStage,

    /// Attempt number within the current stage (1-based, 0 before the first)
    pub attempt: u32,

    /// Backing off between attempts
    pub is_waiting: bool,

    /// End of the current backoff window
    pub wait_until: Option<Instant>,

    /// Last `Retry-After` hint received from the server
    pub last_retry_after_ms: Option<u64>,

    pub failure_reason: Option<String>,
}

impl Default for EndpointTestState {
    fn default() -> Self {
        Self {
            stage: TestStage::Idle,
            attempt: 0,
            is_waiting: false,
            wait_until: None,
            last_retry_after_ms: None,
            failure_reason: None,
        }
    }
}

impl EndpointTestState {
    /// Time left in the current backoff window
    pub fn remaining_wait(&self) -> Option<Duration> {
        self.wait_until
            .filter(|_| self.is_waiting)
            .map(|until| until.saturating_duration_since(Instant::now()))
    }
}

/// Writer handle for a test's state
pub struct TestStatus {
    tx: watch::Sender<EndpointTestState>,
}

impl TestStatus {
    /// Create a status handle and the receiver used for snapshots
    pub fn new() -> (Self, watch::Receiver<EndpointTestState>) {
        let (tx, rx) = watch::channel(EndpointTestState::default());
        (Self { tx }, rx)
    }

    /// Status nobody observes
    #[cfg(test)]
    pub fn detached() -> Self {
        Self::new().0
    }

    pub fn enter_stage(&self, stage: TestStage) {
        self.tx.send_modify(|state| {
            state.stage = stage;
            state.attempt = 0;
            state.is_waiting = false;
            state.wait_until = None;
        });
    }

    pub fn set_attempt(&self, attempt: u32) {
        self.tx.send_modify(|state| state.attempt = attempt);
    }

    pub fn begin_wait(&self, delay: Duration, retry_after_ms: Option<u64>) {
        self.tx.send_modify(|state| {
            state.is_waiting = true;
            state.wait_until = Some(Instant::now() + delay);
            if retry_after_ms.is_some() {
                state.last_retry_after_ms = retry_after_ms;
            }
        });
    }

    pub fn end_wait(&self) {
        self.tx.send_modify(|state| {
            state.is_waiting = false;
            state.wait_until = None;
        });
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_modify(|state| {
            state.stage = TestStage::Failed;
            state.is_waiting = false;
            state.failure_reason = Some(reason);
        });
    }

    pub fn finish(&self) {
        self.tx.send_modify(|state| {
            state.stage = TestStage::Finished;
            state.is_waiting = false;
        });
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> EndpointTestState {
        self.tx.borrow().clone()
    }
}
