//! Client-side metric buffer
//!
//! Collectors `put` observations as they happen; the reporter `pull`s
//! everything accumulated since the last report. Values are merged with the
//! same rule the aggregator applies, so a counter incremented three times
//! between reports is sent once with the summed delta.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tally_shared::aggregate::{self, MergeError};
use tally_shared::Metric;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("metric buffer is closed")]
    Closed,

    #[error(transparent)]
    Merge(#[from] MergeError),
}

#[derive(Debug, Default)]
struct Inner {
    metrics: HashMap<String, Metric>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct MetricBuffer {
    inner: Mutex<Inner>,
    ready: Notify,
}

impl MetricBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge `batch` into the buffer.
    ///
    /// Elements are applied in order; the first merge error stops the batch
    /// and is returned, with the elements before it kept.
    pub fn put(&self, batch: Vec<Metric>) -> Result<(), BufferError> {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(BufferError::Closed);
            }
            aggregate::apply_batch(&mut inner.metrics, batch)
        };

        if !outcome.applied.is_empty() {
            self.ready.notify_waiters();
        }
        match outcome.error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Wait for buffered data, then take all of it.
    ///
    /// After [`close`](Self::close) any remaining data is still handed out;
    /// once the buffer is closed and empty this returns [`BufferError::Closed`].
    pub async fn pull(&self) -> Result<Vec<Metric>, BufferError> {
        loop {
            // Register before checking so a put or close between the check
            // and the await still wakes us.
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if !inner.metrics.is_empty() {
                    let drained = std::mem::take(&mut inner.metrics);
                    return Ok(drained.into_values().collect());
                }
                if inner.closed {
                    return Err(BufferError::Closed);
                }
            }

            notified.await;
        }
    }

    /// Stop accepting writes and wake every blocked `pull`. Idempotent.
    pub fn close(&self) {
        let newly_closed = {
            let mut inner = self.lock();
            !std::mem::replace(&mut inner.closed, true)
        };
        if newly_closed {
            tracing::debug!("Metric buffer closed");
        }
        self.ready.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Distinct ids waiting to be pulled.
    pub fn len(&self) -> usize {
        self.lock().metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
