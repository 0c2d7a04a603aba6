//! Bounded-parallelism apply engine

use policy_sync_core::{ApplyOutcome, ApplyTotals};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use crate::{ApplyError, ApplyErrors, SyncError};

/// Default cap on simultaneous outstanding remote calls
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// One independent unit of work
pub type ApplyUnit = Pin<Box<dyn Future<Output = Result<ApplyOutcome, ApplyError>> + Send + 'static>>;

/// Counters and failures of one apply run
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub totals: ApplyTotals,
    pub errors: Vec<ApplyError>,
}

impl ApplyReport {
    pub fn into_result(self) -> Result<ApplyTotals, SyncError> {
        if self.errors.is_empty() {
            Ok(self.totals)
        } else {
            Err(SyncError::Apply {
                totals: self.totals,
                errors: ApplyErrors(self.errors),
            })
        }
    }
}

/// Runs units with at most `max_workers` in flight.
///
/// Outcomes are handed to a single collector task which owns the counters;
/// the run is only complete once the collector has drained every outcome.
pub struct ApplyEngine {
    max_workers: usize,
}

impl ApplyEngine {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    /// Run every unit to completion. A failing unit never cancels its
    /// siblings; each failure is reported in the returned errors.
    pub async fn run<I, F>(&self, units: I) -> ApplyReport
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<ApplyOutcome, ApplyError>> + Send + 'static,
    {
        let units: Vec<F> = units.into_iter().collect();
        let expected = units.len();

        // Capacity 1: each producer hands off one outcome at a time.
        let (tx, mut rx) = mpsc::channel::<ApplyOutcome>(1);

        let collector = tokio::spawn(async move {
            let mut totals = ApplyTotals::default();
            while let Some(outcome) = rx.recv().await {
                totals.record(outcome);
                tracing::info!(
                    "Applied {} of {} policies: {} successful, {} failures",
                    totals.total(),
                    expected,
                    totals.successful(),
                    totals.failed
                );
            }
            totals
        });

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();

        for unit in units {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let tx = tx.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let result = unit.await;
                let outcome = match &result {
                    Ok(outcome) => *outcome,
                    Err(_) => ApplyOutcome::Failed,
                };
                // The collector only stops once every sender is dropped.
                let _ = tx.send(outcome).await;
                result
            });
        }
        drop(tx);

        let mut errors = Vec::new();
        let mut panicked = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::error!("{}", err);
                    errors.push(err);
                }
                Err(join_err) => {
                    tracing::error!("Apply unit panicked: {}", join_err);
                    panicked += 1;
                    errors.push(ApplyError::Panicked(join_err.to_string()));
                }
            }
        }

        let mut totals = match collector.await {
            Ok(totals) => totals,
            Err(join_err) => {
                tracing::error!("Outcome collector stopped: {}", join_err);
                ApplyTotals::default()
            }
        };
        totals.failed += panicked;

        ApplyReport { totals, errors }
    }
}

impl Default for ApplyEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}
