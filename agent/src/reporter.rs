//! Periodic reporting of buffered metrics

use crate::buffer::{BufferError, MetricBuffer};
use crate::config::Config;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tally_shared::Metric;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delivers a batch to the aggregator. Transport, encoding and retries are the
/// implementor's business.
#[async_trait]
pub trait MetricSender: Send + Sync {
    async fn send(&self, batch: Vec<Metric>) -> anyhow::Result<()>;
}

#[async_trait]
impl<S: MetricSender + ?Sized> MetricSender for Arc<S> {
    async fn send(&self, batch: Vec<Metric>) -> anyhow::Result<()> {
        (**self).send(batch).await
    }
}

pub struct Reporter<S> {
    buffer: Arc<MetricBuffer>,
    sender: S,
    report_interval: Duration,
}

impl<S: MetricSender> Reporter<S> {
    pub fn new(buffer: Arc<MetricBuffer>, sender: S, report_interval: Duration) -> Self {
        Self {
            buffer,
            sender,
            report_interval,
        }
    }

    pub fn from_config(
        config: &Config,
        buffer: Arc<MetricBuffer>,
        sender: S,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self::new(buffer, sender, config.report_interval()))
    }

    /// Report until `cancel` fires, then close the buffer and send whatever
    /// is left in one final batch.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Reporting metrics every {:?}", self.report_interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let pulled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                pulled = self.buffer.pull() => pulled,
            };

            match pulled {
                Ok(batch) => self.deliver(batch).await,
                Err(BufferError::Closed) => {
                    debug!("Metric buffer closed externally, stopping reporter");
                    return;
                }
                Err(e) => warn!("Failed to pull metrics: {}", e),
            }
        }

        self.buffer.close();
        match self.buffer.pull().await {
            Ok(batch) => {
                info!("Sending final batch of {} metrics", batch.len());
                self.deliver(batch).await;
            }
            Err(BufferError::Closed) => debug!("No metrics left to report"),
            Err(e) => warn!("Failed to pull final metrics: {}", e),
        }
    }

    async fn deliver(&self, batch: Vec<Metric>) {
        let count = batch.len();
        match self.sender.send(batch).await {
            Ok(()) => debug!("Reported {} metrics", count),
            Err(e) => warn!("Dropping {} metrics after failed send: {:#}", count, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::timeout;

    #[derive(Default)]
    struct RecordingSender {
        batches: Mutex<Vec<Vec<Metric>>>,
    }

    #[async_trait]
    impl MetricSender for RecordingSender {
        async fn send(&self, batch: Vec<Metric>) -> anyhow::Result<()> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    struct FailingSender {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl MetricSender for FailingSender {
        async fn send(&self, _batch: Vec<Metric>) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            anyhow::bail!("connection refused")
        }
    }

    #[tokio::test]
    async fn test_final_send_on_cancel() {
        let buffer = Arc::new(MetricBuffer::new());
        let sender = Arc::new(RecordingSender::default());
        let reporter = Reporter::new(buffer.clone(), sender.clone(), Duration::from_secs(3600));

        // Consume the immediate first tick with a pull that has something to take.
        buffer.put(vec![Metric::counter("PollCount", 1)]).unwrap();

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { reporter.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        buffer.put(vec![Metric::counter("PollCount", 4)]).unwrap();
        cancel.cancel();
        timeout(Duration::from_secs(5), task)
            .await
            .expect("reporter should stop after cancel")
            .unwrap();

        let batches = sender.batches.lock().unwrap().clone();
        assert_eq!(
            batches,
            vec![
                vec![Metric::counter("PollCount", 1)],
                vec![Metric::counter("PollCount", 4)],
            ]
        );
        assert!(buffer.is_closed());
    }

    #[tokio::test]
    async fn test_failed_send_drops_batch_and_continues() {
        let buffer = Arc::new(MetricBuffer::new());
        let sender = Arc::new(FailingSender {
            attempts: AtomicUsize::new(0),
        });
        let reporter = Reporter::new(buffer.clone(), sender.clone(), Duration::from_millis(10));

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { reporter.run(cancel).await })
        };

        buffer.put(vec![Metric::gauge("Alloc", 1.0)]).unwrap();
        for _ in 0..100 {
            if sender.attempts.load(Ordering::Relaxed) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sender.attempts.load(Ordering::Relaxed), 1);
        assert!(buffer.is_empty());

        cancel.cancel();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        // Nothing was pending at shutdown, so no extra attempt.
        assert_eq!(sender.attempts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_from_config_rejects_zero_interval() {
        let config = Config {
            report_interval_secs: Some(0),
        };
        let result = Reporter::from_config(
            &config,
            Arc::new(MetricBuffer::new()),
            Arc::new(RecordingSender::default()),
        );
        assert!(result.is_err());
    }
}
