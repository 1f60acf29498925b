//! Bounded pool of folder-scan units.
//!
//! Each assignment runs as its own tokio task, but at most `concurrency` of
//! them do real work at once: the rest wait for a [`Semaphore`] permit. Units
//! never share mutable state with the coordinator. They receive control
//! [`Signal`]s through a `watch` channel and hand back exactly one
//! [`UnitReport`] through an `mpsc` channel, tagged with the [`AssignmentId`]
//! they were given.
//!
//! Cancellation only preempts units still waiting for a permit. A unit that
//! has started runs until it returns, so it is never torn down halfway
//! through persisting its result; it is expected to give up at its next
//! [`UnitContext::checkpoint`] or [`UnitContext::stopped`] instead.

use crate::error::{ErrorKind, Result};
use derive_more::Display;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Identifies one assignment: the folder plus a per-pool sequence number, so
/// that two assignments of the same folder can never be confused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display("{folder}#{seq}")]
pub struct AssignmentId {
    folder: String,
    seq: u64,
}
impl AssignmentId {
    pub fn folder(&self) -> &str {
        &self.folder
    }
}

/// Instruction broadcast to every active unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Signal {
    Run,
    Pause,
    Stop,
}

/// How a unit ended.
#[derive(Debug)]
pub enum UnitOutcome<T> {
    Finished(T),
    Cancelled,
    Panicked,
}

#[derive(Debug)]
pub struct UnitReport<T> {
    pub id: AssignmentId,
    pub outcome: UnitOutcome<T>,
}

/// Handed to each unit so it can cooperate with pause and stop requests.
pub struct UnitContext {
    id: AssignmentId,
    signals: watch::Receiver<Signal>,
    cancel: CancellationToken,
}
impl UnitContext {
    pub fn id(&self) -> &AssignmentId {
        &self.id
    }

    /// Suspension point between units of work.
    ///
    /// Returns immediately while running, waits while paused, and fails with
    /// [`ErrorKind::Stopped`] once a stop is requested.
    pub async fn checkpoint(&mut self) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                exn::bail!(ErrorKind::Stopped);
            }
            match *self.signals.borrow_and_update() {
                Signal::Run => return Ok(()),
                Signal::Stop => exn::bail!(ErrorKind::Stopped),
                Signal::Pause => {},
            }
            tokio::select! {
                changed = self.signals.changed() => {
                    if changed.is_err() {
                        exn::bail!(ErrorKind::Stopped);
                    }
                },
                () = self.cancel.cancelled() => exn::bail!(ErrorKind::Stopped),
            }
        }
    }

    /// Resolves once a stop is requested. Meant to be raced against work
    /// that has no suspension point of its own, like a slow listing.
    pub async fn stopped(&mut self) {
        loop {
            if self.cancel.is_cancelled() || *self.signals.borrow_and_update() == Signal::Stop {
                return;
            }
            tokio::select! {
                changed = self.signals.changed() => {
                    if changed.is_err() {
                        return;
                    }
                },
                () = self.cancel.cancelled() => return,
            }
        }
    }
}

pub struct WorkerPool<T> {
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    signals: watch::Sender<Signal>,
    results_tx: mpsc::UnboundedSender<UnitReport<T>>,
    results_rx: mpsc::UnboundedReceiver<UnitReport<T>>,
    units: HashMap<AssignmentId, JoinHandle<()>>,
    seq: u64,
}
impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(concurrency: usize) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let (signals, _) = watch::channel(Signal::Run);
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            cancel: CancellationToken::new(),
            signals,
            results_tx,
            results_rx,
            units: HashMap::new(),
            seq: 0,
        }
    }

    /// Start a unit for `folder`. The work begins once a permit is free.
    pub fn assign<F, Fut>(&mut self, folder: impl Into<String>, work: F) -> AssignmentId
    where
        F: FnOnce(UnitContext) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.seq += 1;
        let id = AssignmentId {
            folder: folder.into(),
            seq: self.seq,
        };
        let ctx = UnitContext {
            id: id.clone(),
            signals: self.signals.subscribe(),
            cancel: self.cancel.child_token(),
        };
        let permits = self.permits.clone();
        let cancel = ctx.cancel.clone();
        let results = self.results_tx.clone();
        let report_id = id.clone();
        let handle = tokio::spawn(async move {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            let outcome = match permit {
                Some(_permit) => match AssertUnwindSafe(work(ctx)).catch_unwind().await {
                    Ok(value) => UnitOutcome::Finished(value),
                    Err(_) => UnitOutcome::Panicked,
                },
                None => UnitOutcome::Cancelled,
            };
            // The receiver only goes away with the pool itself.
            let _ = results.send(UnitReport { id: report_id, outcome });
        });
        tracing::trace!(unit = %id, "Assigned unit");
        self.units.insert(id.clone(), handle);
        id
    }

    /// Number of units that have not reported back yet.
    pub fn outstanding(&self) -> usize {
        self.units.len()
    }

    /// Send a signal to every active unit.
    pub fn broadcast(&self, signal: Signal) {
        tracing::debug!(%signal, units = self.units.len(), "Broadcasting signal");
        self.signals.send_replace(signal);
    }

    /// Wait for the next unit to report. Returns `None` once nothing is outstanding.
    pub async fn next(&mut self) -> Option<UnitReport<T>> {
        while !self.units.is_empty() {
            let report = self.results_rx.recv().await?;
            if self.units.remove(&report.id).is_some() {
                return Some(report);
            }
            tracing::debug!(unit = %report.id, "Dropping report from an unknown unit");
        }
        None
    }

    /// Stop every outstanding unit and wait for its task to end.
    ///
    /// Units get `grace` to reach a suspension point; any still running after
    /// that are aborted. Returns the reports of units that ended on their
    /// own, including any that were already waiting to be collected.
    pub async fn cancel_all(&mut self, grace: Duration) -> Vec<UnitReport<T>> {
        self.signals.send_replace(Signal::Stop);
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        let mut units = std::mem::take(&mut self.units);
        for (id, handle) in &mut units {
            if tokio::time::timeout_at(deadline, &mut *handle).await.is_ok() {
                continue;
            }
            tracing::warn!(unit = %id, "Unit ignored the stop request, aborting");
            handle.abort();
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                tracing::warn!(unit = %id, error = %e, "Unit ended abnormally during cancellation");
            }
        }
        let mut reports = Vec::new();
        while let Ok(report) = self.results_rx.try_recv() {
            if units.contains_key(&report.id) {
                reports.push(report);
            }
        }
        // A fresh token so the pool can be reused.
        self.cancel = CancellationToken::new();
        self.signals.send_replace(Signal::Run);
        reports
    }
}
impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        for handle in self.units.values() {
            handle.abort();
        }
    }
}
