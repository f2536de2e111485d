use sekou_core::{SourceProjectRecord, UpsertOutcome};
use sekou_remote::{RecordStore, RemoteError};
use sekou_source::SourceStore;
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};

use crate::mapper::map_to_remote_fields;
use crate::membership::MembershipResolver;
use crate::reconcile::KeyReconciler;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRecord {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub created: usize,
    pub updated: usize,
    pub failed: Vec<FailedRecord>,
}

impl BatchReport {
    pub fn record(&mut self, key: String, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Failed(reason) => self.failed.push(FailedRecord { key, reason }),
        }
    }
}

/// Writes one source row to the remote store as a create or an update.
pub struct UpsertExecutor<'a> {
    remote: &'a dyn RecordStore,
    source: &'a dyn SourceStore,
    members: &'a MembershipResolver,
}

impl<'a> UpsertExecutor<'a> {
    pub fn new(
        remote: &'a dyn RecordStore,
        source: &'a dyn SourceStore,
        members: &'a MembershipResolver,
    ) -> Self {
        Self {
            remote,
            source,
            members,
        }
    }

    /// Never fails: remote errors are logged and reported as `Failed`.
    pub async fn upsert(&self, record: &SourceProjectRecord) -> UpsertOutcome {
        match self.try_upsert(record).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    key = %record.key(),
                    status = ?err.status(),
                    body = err.body().unwrap_or_default(),
                    error = %err,
                    "upsert failed"
                );
                UpsertOutcome::Failed(err.to_string())
            }
        }
    }

    async fn try_upsert(&self, record: &SourceProjectRecord) -> Result<UpsertOutcome, RemoteError> {
        let key = record.key();
        let members = self.members.resolve_members(self.source, key).await;
        let payload = map_to_remote_fields(record).to_payload(key, &members);

        match KeyReconciler::new(self.remote).find_existing(key).await? {
            Some(handle) => {
                self.remote.update(&handle, &payload).await?;
                info!(record_id = %handle.id, members = members.len(), "remote record updated");
                Ok(UpsertOutcome::Updated)
            }
            None => {
                let handle = self.remote.insert(&payload).await?;
                info!(record_id = %handle.id, members = members.len(), "remote record created");
                Ok(UpsertOutcome::Created)
            }
        }
    }

    /// Sequential, one failure never stops the rest of the batch.
    pub async fn upsert_batch(&self, records: &[SourceProjectRecord]) -> BatchReport {
        let mut report = BatchReport::default();
        for record in records {
            let key = record.key().to_string();
            let outcome = self
                .upsert(record)
                .instrument(info_span!("upsert", key = %key))
                .await;
            report.record(key, outcome);
        }
        report
    }
}
