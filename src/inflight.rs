//! Outstanding-work counter shared by a queue's producers and workers.

use std::sync::Arc;

use tokio::sync::watch;

/// Counts items accepted by a pipeline but not yet fully processed.
#[derive(Clone)]
pub(crate) struct InFlight {
    tx: Arc<watch::Sender<usize>>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn begin(&self) {
        self.tx.send_modify(|n| *n += 1);
    }

    pub(crate) fn finish(&self) {
        self.tx.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub(crate) fn count(&self) -> usize {
        *self.tx.borrow()
    }

    /// Resolve once the count reaches zero.
    pub(crate) async fn idle(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_idle_waits_for_finish() {
        let inflight = InFlight::new();
        inflight.begin();
        inflight.begin();
        assert_eq!(inflight.count(), 2);

        let worker = inflight.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            worker.finish();
            worker.finish();
        });

        tokio::time::timeout(Duration::from_secs(2), inflight.idle())
            .await
            .unwrap();
        assert_eq!(inflight.count(), 0);
    }

    #[tokio::test]
    async fn test_idle_returns_immediately_when_empty() {
        let inflight = InFlight::new();
        tokio::time::timeout(Duration::from_millis(100), inflight.idle())
            .await
            .unwrap();
    }
}
