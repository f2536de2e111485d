use chrono::{NaiveDateTime, TimeDelta};
use sekou_source::SourceStore;
use tracing::{debug, warn};

/// Gate for scheduled passes: was anything replicated recently?
pub struct ChangeDetector<'a> {
    source: &'a dyn SourceStore,
    window: TimeDelta,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(source: &'a dyn SourceStore, window: TimeDelta) -> Self {
        Self { source, window }
    }

    /// `now_local` is wall-clock time in the source's business timezone.
    /// A failed heartbeat query counts as "no changes".
    pub async fn should_sync(&self, now_local: NaiveDateTime) -> bool {
        let since = now_local - self.window;
        match self.source.heartbeat_count(since).await {
            Ok(count) => {
                debug!(%since, count, "replication heartbeat checked");
                count > 0
            }
            Err(err) => {
                warn!(%since, error = %err, "heartbeat query failed; treating as no changes");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use sekou_source::memory::MemorySourceStore;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn recent_heartbeat_opens_gate() {
        let source = MemorySourceStore::new();
        source.add_heartbeat(noon() - TimeDelta::minutes(5), 3).await;
        let detector = ChangeDetector::new(&source, TimeDelta::minutes(20));
        assert!(detector.should_sync(noon()).await);
    }

    #[tokio::test]
    async fn stale_or_zero_heartbeats_keep_gate_closed() {
        let source = MemorySourceStore::new();
        source.add_heartbeat(noon() - TimeDelta::minutes(45), 3).await;
        source.add_heartbeat(noon() - TimeDelta::minutes(1), 0).await;
        let detector = ChangeDetector::new(&source, TimeDelta::minutes(20));
        assert!(!detector.should_sync(noon()).await);
    }

    #[tokio::test]
    async fn query_failure_keeps_gate_closed() {
        let source = MemorySourceStore::new();
        source.add_heartbeat(noon(), 1).await;
        source.fail_queries().await;
        let detector = ChangeDetector::new(&source, TimeDelta::minutes(20));
        assert!(!detector.should_sync(noon()).await);
    }
}
