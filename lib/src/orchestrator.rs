//! The update orchestrator: a five-state one-way FSM that lets the service
//! side (driving the standby rebuild) and the client side (driving the
//! reboot) rendezvous on each phase boundary without either one polling the
//! other. See spec.md §4.H.
//!
//! `START -> S0 -> S1 -> S2 -> END`. Each transition is a one-shot latch:
//! firing it twice is a protocol violation (a bug in the caller, not a
//! recoverable runtime condition), and waiting on a state that can no
//! longer be reached (because the FSM already moved past it, or failed) is
//! reported rather than hanging forever.

use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{OtaError, Result};

/// One phase of the update orchestrator's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrchestratorState {
    /// The orchestrator has been constructed but no phase has started.
    Start,
    /// Manifest fetched and verified; standby rebuild about to begin.
    S0FetchComplete,
    /// Standby rebuild finished; boot-control finalization about to begin.
    S1RebuildComplete,
    /// Boot-control finalized; reboot about to be requested.
    S2FinalizeComplete,
    /// The client has rebooted (or the FSM was torn down after failure).
    End,
}

impl OrchestratorState {
    fn index(self) -> usize {
        match self {
            Self::Start => 0,
            Self::S0FetchComplete => 1,
            Self::S1RebuildComplete => 2,
            Self::S2FinalizeComplete => 3,
            Self::End => 4,
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            Self::Start => Some(Self::S0FetchComplete),
            Self::S0FetchComplete => Some(Self::S1RebuildComplete),
            Self::S1RebuildComplete => Some(Self::S2FinalizeComplete),
            Self::S2FinalizeComplete => Some(Self::End),
            Self::End => None,
        }
    }
}

/// Coordinates one update attempt's phase transitions between a service
/// task (the rebuild/finalize driver) and a client task (the one waiting to
/// request a reboot).
#[derive(Debug)]
pub struct Orchestrator {
    current: Mutex<OrchestratorState>,
    notify: Notify,
    failed: Mutex<Option<String>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// Build a fresh orchestrator at `START`.
    pub fn new() -> Self {
        Self {
            current: Mutex::new(OrchestratorState::Start),
            notify: Notify::new(),
            failed: Mutex::new(None),
        }
    }

    /// Advance to the state immediately following `from`. This is the
    /// one-shot latch: `proceed` must be called with the FSM's actual
    /// current state, in order; calling it out of order or twice for the
    /// same state is a protocol violation.
    pub fn proceed(&self, from: OrchestratorState) -> Result<()> {
        let next = from.next().ok_or_else(|| {
            OtaError::FsmProtocol(format!("cannot proceed from terminal state {from:?}"))
        })?;
        let mut current = self.current.lock().unwrap();
        if *current != from {
            return Err(OtaError::FsmProtocol(format!(
                "expected to proceed from {from:?} but orchestrator is at {:?}",
                *current
            )));
        }
        *current = next;
        drop(current);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Abort the update attempt, recording `reason` and waking every waiter
    /// so `wait_on` calls fail fast instead of hanging until a timeout.
    pub fn fail(&self, reason: impl Into<String>) {
        *self.failed.lock().unwrap() = Some(reason.into());
        self.notify.notify_waiters();
    }

    /// The current state.
    pub fn current(&self) -> OrchestratorState {
        *self.current.lock().unwrap()
    }

    /// Wait until the FSM reaches at least `target`, or until `fail` is
    /// called, or until `timeout` elapses.
    pub async fn wait_on(&self, target: OrchestratorState, timeout: std::time::Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.wait_on_forever(target))
            .await
            .map_err(|_| OtaError::FsmTimeout(format!("{target:?}")))?
    }

    async fn wait_on_forever(&self, target: OrchestratorState) -> Result<()> {
        loop {
            if let Some(reason) = self.failed.lock().unwrap().clone() {
                return Err(OtaError::FsmProtocol(format!("update aborted: {reason}")));
            }
            if self.current().index() >= target.index() {
                return Ok(());
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn proceeds_in_order() {
        let fsm = Orchestrator::new();
        fsm.proceed(OrchestratorState::Start).unwrap();
        assert_eq!(fsm.current(), OrchestratorState::S0FetchComplete);
        fsm.proceed(OrchestratorState::S0FetchComplete).unwrap();
        assert_eq!(fsm.current(), OrchestratorState::S1RebuildComplete);
    }

    #[tokio::test]
    async fn double_proceed_is_a_protocol_violation() {
        let fsm = Orchestrator::new();
        fsm.proceed(OrchestratorState::Start).unwrap();
        assert!(fsm.proceed(OrchestratorState::Start).is_err());
    }

    #[tokio::test]
    async fn waiter_wakes_when_target_reached() {
        let fsm = std::sync::Arc::new(Orchestrator::new());
        let waiter = {
            let fsm = fsm.clone();
            tokio::spawn(async move { fsm.wait_on(OrchestratorState::S1RebuildComplete, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        fsm.proceed(OrchestratorState::Start).unwrap();
        fsm.proceed(OrchestratorState::S0FetchComplete).unwrap();
        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn fail_wakes_waiters_with_error() {
        let fsm = std::sync::Arc::new(Orchestrator::new());
        let waiter = {
            let fsm = fsm.clone();
            tokio::spawn(async move { fsm.wait_on(OrchestratorState::End, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        fsm.fail("rebuild failed");
        assert!(waiter.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn wait_on_times_out() {
        let fsm = Orchestrator::new();
        let result = fsm.wait_on(OrchestratorState::End, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(OtaError::FsmTimeout(_))));
    }
}
