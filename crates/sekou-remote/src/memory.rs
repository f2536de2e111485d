//! In-memory [`RecordStore`] understanding equality queries, with failure
//! injection for exercising partial-failure paths.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use sekou_core::{field_codes, RemoteRecordHandle};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{RecordPayload, RecordStore, RemoteError, RemoteField, RemoteRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    List(String),
    Get(String),
    Insert(u64),
    Update(u64),
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<u64, RemoteRecord>,
    next_id: u64,
    failing_keys: HashSet<String>,
    fail_reads: bool,
    calls: Vec<StoreCall>,
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record directly, bypassing failure injection and call logging.
    pub async fn seed(&self, payload: &RecordPayload) -> u64 {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.records.insert(id, record_from_payload(id, payload));
        id
    }

    /// Reject inserts and updates whose `KEY` field equals `key`.
    pub async fn fail_writes_for_key(&self, key: &str) {
        self.state.lock().await.failing_keys.insert(key.to_string());
    }

    /// Make every `list`/`get` fail with a 503.
    pub async fn fail_reads(&self) {
        self.state.lock().await.fail_reads = true;
    }

    pub async fn records(&self) -> Vec<RemoteRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    pub async fn records_with_key(&self, key: &str) -> Vec<RemoteRecord> {
        self.state
            .lock()
            .await
            .records
            .values()
            .filter(|r| r.text(field_codes::KEY).as_deref() == Some(key))
            .cloned()
            .collect()
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.calls.clone()
    }

    async fn matching(&self, query: &str, call: StoreCall) -> Result<Vec<RemoteRecord>, RemoteError> {
        let mut state = self.state.lock().await;
        state.calls.push(call);
        if state.fail_reads {
            return Err(RemoteError::Status {
                status: 503,
                body: "store unavailable".into(),
            });
        }
        let clauses = parse_equalities(query)?;
        Ok(state
            .records
            .values()
            .filter(|record| {
                clauses
                    .iter()
                    .all(|(code, want)| record.text(code).unwrap_or_default() == *want)
            })
            .cloned()
            .collect())
    }

    fn check_writable(state: &MemoryState, payload: &RecordPayload) -> Result<(), RemoteError> {
        let key = payload.get(field_codes::KEY).and_then(Value::as_str);
        match key {
            Some(key) if state.failing_keys.contains(key) => Err(RemoteError::Status {
                status: 400,
                body: format!("{{\"message\":\"rejected record {key}\"}}"),
            }),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn list(&self, query: &str) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.matching(query, StoreCall::List(query.to_string())).await
    }

    async fn get(&self, query: &str) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.matching(query, StoreCall::Get(query.to_string())).await
    }

    async fn insert(&self, record: &RecordPayload) -> Result<RemoteRecordHandle, RemoteError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.calls.push(StoreCall::Insert(id));
        Self::check_writable(&state, record)?;
        state.records.insert(id, record_from_payload(id, record));
        Ok(RemoteRecordHandle { id: id.to_string() })
    }

    async fn update(
        &self,
        handle: &RemoteRecordHandle,
        record: &RecordPayload,
    ) -> Result<(), RemoteError> {
        let id: u64 = handle.id.parse().map_err(|_| RemoteError::Status {
            status: 400,
            body: format!("invalid record id {}", handle.id),
        })?;
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::Update(id));
        Self::check_writable(&state, record)?;
        let existing = state.records.get_mut(&id).ok_or_else(|| RemoteError::Status {
            status: 404,
            body: format!("record {id} not found"),
        })?;
        for (code, value) in record.iter() {
            existing.fields.insert(
                code.to_string(),
                RemoteField {
                    kind: None,
                    value: value.clone(),
                },
            );
        }
        Ok(())
    }
}

fn record_from_payload(id: u64, payload: &RecordPayload) -> RemoteRecord {
    let mut fields: BTreeMap<String, RemoteField> = payload
        .iter()
        .map(|(code, value)| {
            (
                code.to_string(),
                RemoteField {
                    kind: None,
                    value: value.clone(),
                },
            )
        })
        .collect();
    fields.insert(
        field_codes::RECORD_ID.to_string(),
        RemoteField {
            kind: Some("__ID__".into()),
            value: Value::String(id.to_string()),
        },
    );
    RemoteRecord { fields }
}

/// Parse `code = "value" and code = "value"`; an empty query matches everything.
fn parse_equalities(query: &str) -> Result<Vec<(String, String)>, RemoteError> {
    let unsupported = || RemoteError::Status {
        status: 400,
        body: format!("unsupported query: {query}"),
    };
    let mut clauses = Vec::new();
    let mut rest = query.trim();

    while !rest.is_empty() {
        let (code, after) = rest.split_once(" = ").ok_or_else(unsupported)?;
        let mut chars = after.char_indices();
        if chars.next().map(|(_, c)| c) != Some('"') {
            return Err(unsupported());
        }

        let mut value = String::new();
        let mut end = None;
        let mut escaped = false;
        for (idx, ch) in chars {
            if escaped {
                value.push(ch);
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                end = Some(idx + ch.len_utf8());
                break;
            } else {
                value.push(ch);
            }
        }
        let end = end.ok_or_else(unsupported)?;
        clauses.push((code.trim().to_string(), value));

        rest = after[end..].trim_start();
        if rest.is_empty() {
            break;
        }
        rest = rest.strip_prefix("and ").ok_or_else(unsupported)?.trim_start();
    }

    Ok(clauses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equals_query;

    fn payload(key: &str, project: &str) -> RecordPayload {
        let mut p = RecordPayload::new();
        p.set(field_codes::KEY, key);
        p.set(field_codes::PROJECT_NO, project);
        p
    }

    #[test]
    fn parses_escaped_equalities() {
        let query = equals_query(&[("a", r#"x "y" and z"#), ("b", "1")]);
        let clauses = parse_equalities(&query).unwrap();
        assert_eq!(
            clauses,
            vec![
                ("a".to_string(), r#"x "y" and z"#.to_string()),
                ("b".to_string(), "1".to_string())
            ]
        );
        assert!(parse_equalities("").unwrap().is_empty());
        assert!(parse_equalities("a > 1").is_err());
    }

    #[tokio::test]
    async fn insert_then_query_by_equality() {
        let store = MemoryRecordStore::new();
        store.insert(&payload("1_1", "1")).await.unwrap();
        store.insert(&payload("2_1", "2")).await.unwrap();

        let hits = store
            .get(&equals_query(&[(field_codes::PROJECT_NO, "2")]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text(field_codes::KEY).as_deref(), Some("2_1"));
        assert_eq!(store.list("").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_merges_fields_into_existing_record() {
        let store = MemoryRecordStore::new();
        let handle = store.insert(&payload("1_1", "1")).await.unwrap();
        let mut change = RecordPayload::new();
        change.set(field_codes::KEY, "1_1");
        change.set(field_codes::WORK_DATE, "2024-05-02");
        store.update(&handle, &change).await.unwrap();

        let records = store.records_with_key("1_1").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].text(field_codes::PROJECT_NO).as_deref(), Some("1"));
        assert_eq!(records[0].text(field_codes::WORK_DATE).as_deref(), Some("2024-05-02"));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_status_errors() {
        let store = MemoryRecordStore::new();
        store.fail_writes_for_key("9_9").await;
        let err = store.insert(&payload("9_9", "9")).await.unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert!(store.records().await.is_empty());

        store.fail_reads().await;
        assert_eq!(store.list("").await.unwrap_err().status(), Some(503));
    }
}
