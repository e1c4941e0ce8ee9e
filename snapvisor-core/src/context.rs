// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Operation context: a deadline plus a cancellation signal.
//!
//! Every blocking call made by the orchestrator runs through [`OpContext::run`],
//! which races the call against the deadline and the cancel signal. A call that
//! loses the race is dropped; callers rely on RAII guards (slot leases, staged
//! snapshots, hypervisor processes) to roll back whatever it had started.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{OrchResult, OrchestratorError};

/// Deadline and cancellation signal threaded through lifecycle operations.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    budget: Option<Duration>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Handle used to cancel every operation running under a context.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation. Operations observe it at their next blocking call.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl OpContext {
    /// A context with no deadline that is never cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            budget: Some(timeout),
            cancel: None,
        }
    }

    /// Attach a cancel signal, returning the handle that triggers it.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx })
    }

    /// Whether cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the context is already cancelled or expired.
    pub fn check(&self, operation: &'static str) -> OrchResult<()> {
        if self.is_cancelled() {
            return Err(OrchestratorError::Cancelled { operation });
        }
        if self.remaining() == Some(Duration::ZERO) {
            return Err(self.timeout_error(operation));
        }
        Ok(())
    }

    /// Run `fut` unless the deadline passes or cancellation is signalled first.
    pub async fn run<T, E, F>(&self, operation: &'static str, fut: F) -> OrchResult<T>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<OrchestratorError>,
    {
        self.check(operation)?;

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = fut => result.map_err(Into::into),
            _ = expired => Err(self.timeout_error(operation)),
            _ = self.cancelled() => Err(OrchestratorError::Cancelled { operation }),
        }
    }

    async fn cancelled(&self) {
        let Some(rx) = &self.cancel else {
            return std::future::pending().await;
        };

        let mut rx = rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without cancelling.
                return std::future::pending().await;
            }
        }
    }

    fn timeout_error(&self, operation: &'static str) -> OrchestratorError {
        OrchestratorError::Timeout {
            operation,
            timeout_ms: self.budget.map(|b| b.as_millis() as u64).unwrap_or(0),
        }
    }
}
