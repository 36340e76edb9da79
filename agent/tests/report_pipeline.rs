use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_agent::{BufferError, MetricBuffer, MetricSender, Reporter};
use tally_shared::aggregate;
use tally_shared::Metric;
use tokio_util::sync::CancellationToken;

/// Stands in for the aggregator: merges every batch it receives.
#[derive(Default)]
struct MergingSink {
    metrics: Mutex<HashMap<String, Metric>>,
    batches: Mutex<usize>,
}

#[async_trait]
impl MetricSender for MergingSink {
    async fn send(&self, batch: Vec<Metric>) -> anyhow::Result<()> {
        let mut metrics = self.metrics.lock().unwrap();
        aggregate::apply_batch(&mut *metrics, batch).into_result()?;
        *self.batches.lock().unwrap() += 1;
        Ok(())
    }
}

#[tokio::test]
async fn test_collectors_to_sink_loses_nothing_across_shutdown() {
    let buffer = Arc::new(MetricBuffer::new());
    let sink = Arc::new(MergingSink::default());
    let reporter = Reporter::new(buffer.clone(), sink.clone(), Duration::from_millis(20));

    let cancel = CancellationToken::new();
    let reporter_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { reporter.run(cancel).await })
    };

    let collectors: Vec<_> = (0..4)
        .map(|n| {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    buffer
                        .put(vec![
                            Metric::counter("PollCount", 1),
                            Metric::gauge(format!("worker{}", n), i as f64),
                        ])
                        .unwrap();
                    if i % 10 == 0 {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                }
            })
        })
        .collect();
    for collector in collectors {
        collector.await.unwrap();
    }

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), reporter_task)
        .await
        .expect("reporter should finish its final send")
        .unwrap();

    let metrics = sink.metrics.lock().unwrap();
    assert_eq!(metrics["PollCount"], Metric::counter("PollCount", 200));
    for n in 0..4 {
        let id = format!("worker{}", n);
        assert_eq!(metrics[&id], Metric::gauge(id.clone(), 49.0));
    }
    assert!(*sink.batches.lock().unwrap() >= 1);

    assert!(matches!(
        buffer.put(vec![Metric::counter("late", 1)]),
        Err(BufferError::Closed)
    ));
}
