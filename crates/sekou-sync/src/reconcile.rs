use sekou_core::{field_codes, CompositeKey, RemoteRecordHandle};
use sekou_remote::{equals_query, RecordStore, RemoteError, RemoteRecord};
use tracing::warn;

/// Finds the remote record already holding a composite key.
pub struct KeyReconciler<'a> {
    store: &'a dyn RecordStore,
}

impl<'a> KeyReconciler<'a> {
    pub fn new(store: &'a dyn RecordStore) -> Self {
        Self { store }
    }

    pub fn lookup_query(key: CompositeKey) -> String {
        equals_query(&[
            (field_codes::PROJECT_NO, &key.project_id.to_string()),
            (field_codes::ROUND_NO, &key.round_no.to_string()),
        ])
    }

    /// Lowest record id wins when more than one record carries the key.
    pub async fn find_existing(
        &self,
        key: CompositeKey,
    ) -> Result<Option<RemoteRecordHandle>, RemoteError> {
        let matches = self.store.get(&Self::lookup_query(key)).await?;
        if matches.len() > 1 {
            let ids: Vec<&str> = matches.iter().filter_map(RemoteRecord::id).collect();
            warn!(key = %key, ?ids, "duplicate remote records for key; updating the oldest");
        }

        Ok(matches
            .iter()
            .filter_map(|record| {
                let id = record.id()?;
                Some((id.parse::<u64>().unwrap_or(u64::MAX), id))
            })
            .min()
            .map(|(_, id)| RemoteRecordHandle { id: id.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sekou_remote::memory::MemoryRecordStore;
    use sekou_remote::RecordPayload;

    fn keyed(project: &str, round: &str) -> RecordPayload {
        let mut payload = RecordPayload::new();
        payload.set(field_codes::PROJECT_NO, project);
        payload.set(field_codes::ROUND_NO, round);
        payload
    }

    #[test]
    fn query_matches_both_key_parts() {
        assert_eq!(
            KeyReconciler::lookup_query(CompositeKey::new(123, 1)),
            r#"企画No = "123" and KIKAKU_SEKO_RECORD_NO = "1""#
        );
    }

    #[tokio::test]
    async fn absent_key_returns_none() {
        let store = MemoryRecordStore::new();
        store.seed(&keyed("123", "2")).await;
        let found = KeyReconciler::new(&store)
            .find_existing(CompositeKey::new(123, 1))
            .await
            .unwrap();
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn duplicates_resolve_to_lowest_id() {
        let store = MemoryRecordStore::new();
        store.seed(&keyed("9", "9")).await;
        let first = store.seed(&keyed("123", "1")).await;
        store.seed(&keyed("123", "1")).await;

        let found = KeyReconciler::new(&store)
            .find_existing(CompositeKey::new(123, 1))
            .await
            .unwrap();
        assert_eq!(
            found,
            Some(RemoteRecordHandle {
                id: first.to_string()
            })
        );
    }

    #[tokio::test]
    async fn read_failure_propagates() {
        let store = MemoryRecordStore::new();
        store.fail_reads().await;
        let err = KeyReconciler::new(&store)
            .find_existing(CompositeKey::new(1, 1))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(503));
    }
}
