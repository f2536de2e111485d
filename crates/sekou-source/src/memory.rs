//! In-memory [`SourceStore`] mirroring the Postgres filters, for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use sekou_core::{
    CompositeKey, CrewAssignment, ReverseDetailRow, ReverseHeaderRow, SourceProjectRecord,
    SyncScope, PLACEHOLDER_PROJECT_FLOOR,
};
use tokio::sync::Mutex;

use crate::{ConnectError, QueryError, SourceConnector, SourceStore};

#[derive(Debug, Default)]
struct SourceState {
    rows: Vec<(SourceProjectRecord, NaiveDateTime)>,
    heartbeats: Vec<(NaiveDateTime, i64)>,
    crews: HashMap<CompositeKey, Vec<CrewAssignment>>,
    headers: BTreeMap<i64, ReverseHeaderRow>,
    details: BTreeMap<i64, ReverseDetailRow>,
    failing_details: HashSet<i64>,
    fail_queries: bool,
    queries: usize,
    closes: usize,
}

#[derive(Debug, Default)]
pub struct MemorySourceStore {
    state: Mutex<SourceState>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source row last modified at `modified_at`.
    pub async fn insert_row(&self, record: SourceProjectRecord, modified_at: NaiveDateTime) {
        self.state.lock().await.rows.push((record, modified_at));
    }

    /// Replace an existing row for the same key, keeping its position.
    pub async fn replace_row(&self, record: SourceProjectRecord, modified_at: NaiveDateTime) {
        let mut state = self.state.lock().await;
        let key = record.key();
        match state.rows.iter_mut().find(|(r, _)| r.key() == key) {
            Some(slot) => *slot = (record, modified_at),
            None => state.rows.push((record, modified_at)),
        }
    }

    pub async fn add_heartbeat(&self, at: NaiveDateTime, change_count: i64) {
        self.state.lock().await.heartbeats.push((at, change_count));
    }

    pub async fn set_crew(&self, key: CompositeKey, crew: Vec<CrewAssignment>) {
        self.state.lock().await.crews.insert(key, crew);
    }

    /// Make every read and merge fail.
    pub async fn fail_queries(&self) {
        self.state.lock().await.fail_queries = true;
    }

    pub async fn fail_detail(&self, ndidx: i64) {
        self.state.lock().await.failing_details.insert(ndidx);
    }

    pub async fn headers(&self) -> Vec<ReverseHeaderRow> {
        self.state.lock().await.headers.values().cloned().collect()
    }

    pub async fn details(&self) -> Vec<ReverseDetailRow> {
        self.state.lock().await.details.values().cloned().collect()
    }

    /// Reads issued so far (heartbeat, extract and crew queries).
    pub async fn query_count(&self) -> usize {
        self.state.lock().await.queries
    }

    pub async fn close_count(&self) -> usize {
        self.state.lock().await.closes
    }

    fn unavailable() -> QueryError {
        QueryError::Unavailable("injected query failure".into())
    }
}

fn calendar_day(raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw?.trim();
    NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d").ok()
}

fn sync_eligible(record: &SourceProjectRecord) -> bool {
    record.project_id < PLACEHOLDER_PROJECT_FLOOR
        && record
            .scheduled_date
            .as_deref()
            .is_some_and(|d| !d.trim().is_empty())
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn heartbeat_count(&self, since: NaiveDateTime) -> Result<i64, QueryError> {
        let mut state = self.state.lock().await;
        state.queries += 1;
        if state.fail_queries {
            return Err(Self::unavailable());
        }
        Ok(state
            .heartbeats
            .iter()
            .filter(|(at, count)| *count > 0 && *at >= since)
            .count() as i64)
    }

    async fn fetch_records(
        &self,
        scope: &SyncScope,
    ) -> Result<Vec<SourceProjectRecord>, QueryError> {
        let mut state = self.state.lock().await;
        state.queries += 1;
        if state.fail_queries {
            return Err(Self::unavailable());
        }

        let mut out: Vec<SourceProjectRecord> = state
            .rows
            .iter()
            .filter(|(record, _)| sync_eligible(record))
            .filter(|(record, modified_at)| match scope {
                SyncScope::Today(day) => {
                    calendar_day(record.scheduled_date.as_deref()) == Some(*day)
                }
                SyncScope::Single(key) => record.key() == *key,
                SyncScope::Range { from, to } => modified_at >= from && modified_at < to,
            })
            .map(|(record, _)| record.clone())
            .collect();

        out.sort_by(|a, b| {
            b.project_id
                .cmp(&a.project_id)
                .then(a.round_no.cmp(&b.round_no))
        });
        out.dedup_by_key(|r| r.key());
        Ok(out)
    }

    async fn crew_assignments(
        &self,
        key: CompositeKey,
    ) -> Result<Vec<CrewAssignment>, QueryError> {
        let mut state = self.state.lock().await;
        state.queries += 1;
        if state.fail_queries {
            return Err(Self::unavailable());
        }
        Ok(state.crews.get(&key).cloned().unwrap_or_default())
    }

    async fn merge_header(&self, row: &ReverseHeaderRow) -> Result<(), QueryError> {
        let mut state = self.state.lock().await;
        if state.fail_queries {
            return Err(Self::unavailable());
        }
        state.headers.insert(row.npidx, row.clone());
        Ok(())
    }

    async fn merge_detail(&self, row: &ReverseDetailRow) -> Result<(), QueryError> {
        let mut state = self.state.lock().await;
        if state.fail_queries || state.failing_details.contains(&row.ndidx) {
            return Err(Self::unavailable());
        }
        state.details.insert(row.ndidx, row.clone());
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().await.closes += 1;
    }
}

/// Hands out the same in-memory store on every connect.
#[derive(Debug, Default)]
pub struct MemorySourceConnector {
    store: Arc<MemorySourceStore>,
    refuse: bool,
}

impl MemorySourceConnector {
    pub fn new(store: Arc<MemorySourceStore>) -> Self {
        Self {
            store,
            refuse: false,
        }
    }

    /// A connector whose every connect attempt fails.
    pub fn refusing() -> Self {
        Self {
            store: Arc::default(),
            refuse: true,
        }
    }
}

#[async_trait]
impl SourceConnector for MemorySourceConnector {
    async fn connect(&self) -> Result<Arc<dyn SourceStore>, ConnectError> {
        if self.refuse {
            return Err(ConnectError::Unavailable("connection refused".into()));
        }
        Ok(self.store.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn scheduled(project_id: i64, round_no: i32, date: &str) -> SourceProjectRecord {
        SourceProjectRecord {
            scheduled_date: Some(date.to_string()),
            ..SourceProjectRecord::new(project_id, round_no)
        }
    }

    #[tokio::test]
    async fn filters_placeholders_and_unscheduled_rows() {
        let store = MemorySourceStore::new();
        store.insert_row(scheduled(10, 1, "2024-05-01"), at(1)).await;
        store.insert_row(scheduled(900_000_001, 1, "2024-05-01"), at(1)).await;
        store.insert_row(SourceProjectRecord::new(11, 1), at(1)).await;
        store.insert_row(scheduled(12, 1, "2024-05-01 00:00:00"), at(1)).await;

        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let rows = store.fetch_records(&SyncScope::Today(day)).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.project_id).collect();
        assert_eq!(ids, vec![12, 10]);
    }

    #[tokio::test]
    async fn range_is_half_open_on_modification_time() {
        let store = MemorySourceStore::new();
        store.insert_row(scheduled(1, 1, "2024-05-01"), at(1)).await;
        store.insert_row(scheduled(2, 1, "2024-05-01"), at(7)).await;
        store.insert_row(scheduled(3, 1, "2024-05-01"), at(8)).await;

        let scope = SyncScope::Range {
            from: at(1),
            to: at(8),
        };
        let rows = store.fetch_records(&scope).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].project_id, 2);
    }

    #[tokio::test]
    async fn refusing_connector_fails_to_connect() {
        let connector = MemorySourceConnector::refusing();
        assert!(connector.connect().await.is_err());
    }
}
