use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeDelta, Utc};
use sekou_core::{CompositeKey, SyncScope};
use sekou_remote::{AppClient, HttpClientConfig, RecordStore, RemoteError};
use sekou_source::{ConnectError, PgSourceConnector, SourceConnector, SourceStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, Instrument};
use uuid::Uuid;

pub mod config;
pub mod detector;
pub mod extract;
pub mod logging;
pub mod mapper;
pub mod membership;
pub mod reconcile;
pub mod reverse;
pub mod upsert;

pub use config::{AppCredentials, ConfigError, Secret, SyncConfig};
pub use logging::{init_logging, LogFormat};
pub use reverse::ReverseSummary;
pub use upsert::{BatchReport, FailedRecord};

use detector::ChangeDetector;
use extract::RecordExtractor;
use membership::MembershipResolver;
use reverse::{ReverseMapper, ReverseSync};
use upsert::UpsertExecutor;

pub const CRATE_NAME: &str = "sekou-sync";

#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("pass exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),
    #[error("remote store unavailable: {0}")]
    Remote(#[from] RemoteError),
    #[error("reverse sync is not configured")]
    ReverseDisabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub run_id: Uuid,
    pub scope: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub skipped: bool,
    pub extracted: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: Vec<FailedRecord>,
}

impl PassSummary {
    /// Rows that reached the remote store.
    pub fn synced(&self) -> usize {
        self.created + self.updated
    }
}

/// The remote apps a pass talks to.
#[derive(Clone)]
pub struct RemoteStores {
    pub schedule: Arc<dyn RecordStore>,
    pub roster: Arc<dyn RecordStore>,
    pub reverse: Option<Arc<dyn RecordStore>>,
}

#[derive(Debug, Clone, Copy)]
pub struct PassSettings {
    pub utc_offset: FixedOffset,
    pub heartbeat_window: TimeDelta,
    pub pass_timeout: Duration,
}

impl Default for PassSettings {
    fn default() -> Self {
        Self {
            utc_offset: FixedOffset::east_opt(9 * 3600).unwrap_or_else(|| Utc.fix()),
            heartbeat_window: TimeDelta::minutes(20),
            pass_timeout: Duration::from_secs(900),
        }
    }
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Owns everything a pass needs. Passes run one at a time; each gets its
/// own source pool, closed when the pass ends however it ends.
pub struct SyncService {
    connector: Arc<dyn SourceConnector>,
    remotes: RemoteStores,
    settings: PassSettings,
    clock: Clock,
    pass_lock: Mutex<()>,
}

impl SyncService {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        remotes: RemoteStores,
        settings: PassSettings,
    ) -> Self {
        Self {
            connector,
            remotes,
            settings,
            clock: Arc::new(Utc::now),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Production wiring: Postgres source plus one REST client per app.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let connector = PgSourceConnector::new(&config.db, config.tables.clone())
            .context("building source connection options")?;
        let http = HttpClientConfig {
            timeout: config.http_timeout,
            ..HttpClientConfig::default()
        };
        let client = |app: &AppCredentials| -> Result<Arc<dyn RecordStore>> {
            let app_client = AppClient::new(
                config.remote_base_url.clone(),
                app.app_id.clone(),
                app.api_token.expose(),
                &http,
            )
            .with_context(|| format!("building client for app {}", app.app_id))?;
            Ok(Arc::new(app_client))
        };

        let remotes = RemoteStores {
            schedule: client(&config.schedule_app)?,
            roster: client(&config.roster_app)?,
            reverse: config.reverse_app.as_ref().map(client).transpose()?,
        };
        let settings = PassSettings {
            utc_offset: config.utc_offset,
            heartbeat_window: config.heartbeat_window,
            pass_timeout: config.pass_timeout,
        };
        Ok(Self::new(Arc::new(connector), remotes, settings))
    }

    pub fn reverse_enabled(&self) -> bool {
        self.remotes.reverse.is_some()
    }

    /// Wall-clock time in the business timezone.
    pub fn local_now(&self) -> NaiveDateTime {
        (self.clock)()
            .with_timezone(&self.settings.utc_offset)
            .naive_local()
    }

    pub fn today(&self) -> NaiveDate {
        self.local_now().date()
    }

    /// Scheduled pass over today's rows, skipped when replication is idle.
    pub async fn run_today(&self) -> Result<PassSummary, PassError> {
        self.forward_pass(SyncScope::Today(self.today()), true).await
    }

    /// Resync one (project, round) regardless of replication activity.
    pub async fn run_single(&self, key: CompositeKey) -> Result<PassSummary, PassError> {
        self.forward_pass(SyncScope::Single(key), false).await
    }

    /// Resync every pair modified on the local days `from..=to`.
    pub async fn run_range(&self, from: NaiveDate, to: NaiveDate) -> Result<PassSummary, PassError> {
        self.forward_pass(SyncScope::days(from, to), false).await
    }

    pub async fn run_reverse(&self) -> Result<ReverseSummary, PassError> {
        let remote = self.remotes.reverse.clone().ok_or(PassError::ReverseDisabled)?;
        let run_id = Uuid::new_v4();
        let mapper = ReverseMapper::new(self.settings.utc_offset);
        self.with_source(|source| async move {
            ReverseSync::new(remote.as_ref(), source.as_ref(), mapper)
                .run()
                .await
                .map_err(PassError::from)
        })
        .instrument(logging::pass_span(run_id, "reverse"))
        .await
    }

    async fn forward_pass(&self, scope: SyncScope, gated: bool) -> Result<PassSummary, PassError> {
        let run_id = Uuid::new_v4();
        let label = scope.label();
        let span = logging::pass_span(run_id, &label);
        let result = self
            .with_source(|source| async move {
                Ok(self.forward_body(source.as_ref(), run_id, scope, gated).await)
            })
            .instrument(span.clone())
            .await;

        span.in_scope(|| match &result {
            Ok(summary) if summary.skipped => info!("pass skipped"),
            Ok(summary) => info!(
                extracted = summary.extracted,
                created = summary.created,
                updated = summary.updated,
                failed = summary.failed.len(),
                "pass finished"
            ),
            Err(err) => error!(error = %err, "pass aborted"),
        });
        result
    }

    async fn forward_body(
        &self,
        source: &dyn SourceStore,
        run_id: Uuid,
        scope: SyncScope,
        gated: bool,
    ) -> PassSummary {
        let mut summary = PassSummary {
            run_id,
            scope: scope.label(),
            started_at: (self.clock)(),
            finished_at: (self.clock)(),
            skipped: false,
            extracted: 0,
            created: 0,
            updated: 0,
            failed: Vec::new(),
        };

        if gated {
            let detector = ChangeDetector::new(source, self.settings.heartbeat_window);
            if !detector.should_sync(self.local_now()).await {
                summary.skipped = true;
                summary.finished_at = (self.clock)();
                return summary;
            }
        }

        let records = RecordExtractor::new(source).extract(&scope).await;
        summary.extracted = records.len();
        if !records.is_empty() {
            let members = MembershipResolver::load(self.remotes.roster.as_ref()).await;
            let report = UpsertExecutor::new(self.remotes.schedule.as_ref(), source, &members)
                .upsert_batch(&records)
                .await;
            summary.created = report.created;
            summary.updated = report.updated;
            summary.failed = report.failed;
        }
        summary.finished_at = (self.clock)();
        summary
    }

    /// Serialise, connect a fresh pool, run `body` under the deadline, close.
    async fn with_source<T, F, Fut>(&self, body: F) -> Result<T, PassError>
    where
        F: FnOnce(Arc<dyn SourceStore>) -> Fut,
        Fut: Future<Output = Result<T, PassError>>,
    {
        let _guard = self.pass_lock.lock().await;
        let source = self.connector.connect().await?;
        let outcome = tokio::time::timeout(self.settings.pass_timeout, body(source.clone())).await;
        source.close().await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(PassError::DeadlineExceeded(self.settings.pass_timeout)),
        }
    }
}

/// Cron-driven trigger for today's pass, when enabled.
pub async fn maybe_build_scheduler(
    service: Arc<SyncService>,
    enabled: bool,
    cron: &str,
) -> Result<Option<JobScheduler>> {
    if !enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            if let Err(err) = service.run_today().await {
                error!(error = %err, "scheduled pass failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sekou_remote::memory::MemoryRecordStore;
    use sekou_source::memory::{MemorySourceConnector, MemorySourceStore};

    fn service(connector: MemorySourceConnector) -> SyncService {
        let remotes = RemoteStores {
            schedule: Arc::new(MemoryRecordStore::new()),
            roster: Arc::new(MemoryRecordStore::new()),
            reverse: None,
        };
        SyncService::new(Arc::new(connector), remotes, PassSettings::default())
    }

    #[tokio::test]
    async fn connect_failure_aborts_pass() {
        let err = service(MemorySourceConnector::refusing())
            .run_today()
            .await
            .unwrap_err();
        assert!(matches!(err, PassError::Connect(_)));
    }

    #[tokio::test]
    async fn reverse_without_app_is_disabled() {
        let svc = service(MemorySourceConnector::default());
        assert!(!svc.reverse_enabled());
        assert!(matches!(
            svc.run_reverse().await.unwrap_err(),
            PassError::ReverseDisabled
        ));
    }

    #[tokio::test]
    async fn today_follows_configured_offset() {
        let store = Arc::new(MemorySourceStore::new());
        let svc = service(MemorySourceConnector::new(store)).with_clock(Arc::new(|| {
            "2024-04-30T16:30:00Z".parse::<DateTime<Utc>>().unwrap()
        }));
        assert_eq!(svc.today(), NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
    }

    #[tokio::test]
    async fn pool_is_closed_after_skipped_pass() {
        let store = Arc::new(MemorySourceStore::new());
        let svc = service(MemorySourceConnector::new(store.clone()));
        let summary = svc.run_today().await.unwrap();
        assert!(summary.skipped);
        assert_eq!(store.close_count().await, 1);
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let svc = Arc::new(service(MemorySourceConnector::default()));
        let sched = maybe_build_scheduler(svc, false, "*/15 * * * *")
            .await
            .unwrap();
        assert!(sched.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn default_cron_builds_enabled_scheduler() {
        let svc = Arc::new(service(MemorySourceConnector::default()));
        let sched = maybe_build_scheduler(svc, true, config::DEFAULT_SYNC_CRON)
            .await
            .unwrap();
        assert!(sched.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn five_field_cron_is_rejected() {
        let svc = Arc::new(service(MemorySourceConnector::default()));
        assert!(maybe_build_scheduler(svc, true, "*/15 * * * *").await.is_err());
    }
}
