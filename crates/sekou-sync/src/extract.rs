use std::collections::HashSet;

use sekou_core::{SourceProjectRecord, SyncScope};
use sekou_source::SourceStore;
use tracing::{error, info};

pub struct RecordExtractor<'a> {
    source: &'a dyn SourceStore,
}

impl<'a> RecordExtractor<'a> {
    pub fn new(source: &'a dyn SourceStore) -> Self {
        Self { source }
    }

    /// Rows in scope, at most one per composite key. A failed query yields
    /// nothing but is logged apart from a genuinely empty result.
    pub async fn extract(&self, scope: &SyncScope) -> Vec<SourceProjectRecord> {
        let rows = match self.source.fetch_records(scope).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(scope = %scope.label(), error = %err, "extraction query failed");
                return Vec::new();
            }
        };

        let mut seen = HashSet::new();
        let records: Vec<SourceProjectRecord> = rows
            .into_iter()
            .filter(|record| seen.insert(record.key()))
            .collect();

        if records.is_empty() {
            info!(scope = %scope.label(), "no source rows in scope");
        } else {
            info!(scope = %scope.label(), count = records.len(), "source rows extracted");
        }
        records
    }
}
