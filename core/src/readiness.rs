//! Readiness gate shared by the publisher's connect and the subscriber's start.
//!
//! The first caller claims the `NotStarted → Starting` transition and runs the
//! connection attempt; every other caller waits on the same watch channel and
//! observes the same `Ready` or `Failed` result. A failed attempt stays failed.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::{BusError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    NotStarted,
    Starting,
    Ready,
    Failed(String),
}

impl ReadinessState {
    fn is_settled(&self) -> bool {
        matches!(self, ReadinessState::Ready | ReadinessState::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct Readiness {
    name: &'static str,
    tx: Arc<watch::Sender<ReadinessState>>,
}

impl Readiness {
    pub fn new(name: &'static str) -> Self {
        let (tx, _rx) = watch::channel(ReadinessState::NotStarted);
        Self {
            name,
            tx: Arc::new(tx),
        }
    }

    pub fn state(&self) -> ReadinessState {
        self.tx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow() == ReadinessState::Ready
    }

    /// Runs `init` once across all callers and returns its result to
    /// everyone. Callers arriving while the attempt is in flight wait for it.
    ///
    /// If the claiming caller is dropped mid-attempt the gate goes back to
    /// `NotStarted` and the next caller (waiting or new) runs its own `init`.
    pub async fn ensure<F, Fut>(&self, init: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut rx = self.tx.subscribe();
        loop {
            let claimed = self.tx.send_if_modified(|state| {
                if *state == ReadinessState::NotStarted {
                    *state = ReadinessState::Starting;
                    true
                } else {
                    false
                }
            });
            if claimed {
                return self.attempt(init).await;
            }

            let state = rx
                .wait_for(|state| *state != ReadinessState::Starting)
                .await
                .map_err(|_| BusError::Closed)?
                .clone();
            match state {
                ReadinessState::Ready => return Ok(()),
                ReadinessState::Failed(reason) => return Err(BusError::Connect(reason)),
                // Abandoned; try to claim it
                ReadinessState::NotStarted | ReadinessState::Starting => continue,
            }
        }
    }

    async fn attempt<F, Fut>(&self, init: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        debug!(target: "readiness", gate = self.name, "Starting");
        let guard = AbandonGuard { tx: &self.tx };
        let res = init().await;
        std::mem::forget(guard);

        match res {
            Ok(()) => {
                self.tx.send_replace(ReadinessState::Ready);
                debug!(target: "readiness", gate = self.name, "Ready");
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    BusError::Connect(reason) => reason,
                    other => other.to_string(),
                };
                self.tx.send_replace(ReadinessState::Failed(reason.clone()));
                debug!(target: "readiness", gate = self.name, reason = %reason, "Failed");
                Err(BusError::Connect(reason))
            }
        }
    }

    /// Waits until the gate settles. Does not start anything by itself, so an
    /// abandoned attempt keeps this waiting until another caller runs `ensure`.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let settled = rx
            .wait_for(ReadinessState::is_settled)
            .await
            .map_err(|_| BusError::Closed)?
            .clone();
        match settled {
            ReadinessState::Failed(reason) => Err(BusError::Connect(reason)),
            _ => Ok(()),
        }
    }

    /// Moves the gate to `Failed("closed")` so later callers fail fast.
    pub fn mark_closed(&self) {
        self.tx
            .send_replace(ReadinessState::Failed(format!("{} closed", self.name)));
    }
}

// Hands the gate back to `NotStarted` if the claiming future is dropped
// mid-attempt, so one cancelled caller never decides the outcome for others.
struct AbandonGuard<'a> {
    tx: &'a watch::Sender<ReadinessState>,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        self.tx.send_replace(ReadinessState::NotStarted);
    }
}
