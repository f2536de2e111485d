use std::collections::HashMap;

use sekou_core::{field_codes, CompositeKey, MemberRef, RosterEntry};
use sekou_remote::{RecordStore, RemoteError, RemoteRecord};
use sekou_source::SourceStore;
use tracing::{debug, warn};

/// Employee code to remote user id, loaded once per pass.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    by_code: HashMap<String, String>,
}

impl Roster {
    /// First entry wins when a code appears twice.
    pub fn from_entries(entries: impl IntoIterator<Item = RosterEntry>) -> Self {
        let mut by_code = HashMap::new();
        for entry in entries {
            by_code
                .entry(entry.employee_code)
                .or_insert(entry.user_id);
        }
        Self { by_code }
    }

    pub fn from_records(records: &[RemoteRecord]) -> Self {
        Self::from_entries(records.iter().filter_map(roster_entry))
    }

    pub async fn fetch(store: &dyn RecordStore) -> Result<Self, RemoteError> {
        let records = store.list("").await?;
        Ok(Self::from_records(&records))
    }

    pub fn user_for(&self, employee_code: &str) -> Option<&str> {
        self.by_code.get(employee_code).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }
}

fn roster_entry(record: &RemoteRecord) -> Option<RosterEntry> {
    Some(RosterEntry {
        user_id: record.text(field_codes::ROSTER_USER_ID)?,
        employee_name: record
            .text(field_codes::ROSTER_EMPLOYEE_NAME)
            .unwrap_or_default(),
        employee_code: record.text(field_codes::ROSTER_EMPLOYEE_CODE)?,
    })
}

/// Resolves the crew of a (project, round) into remote member references.
#[derive(Debug, Clone, Default)]
pub struct MembershipResolver {
    roster: Option<Roster>,
}

impl MembershipResolver {
    pub fn new(roster: Option<Roster>) -> Self {
        Self { roster }
    }

    /// Fetch the roster; an unreachable roster leaves every crew empty.
    pub async fn load(roster_store: &dyn RecordStore) -> Self {
        match Roster::fetch(roster_store).await {
            Ok(roster) => {
                debug!(entries = roster.len(), "roster loaded");
                Self::new(Some(roster))
            }
            Err(err) => {
                warn!(
                    error = %err,
                    status = ?err.status(),
                    "roster fetch failed; member lists will be empty this pass"
                );
                Self::new(None)
            }
        }
    }

    pub fn roster_available(&self) -> bool {
        self.roster.is_some()
    }

    /// Leader first; unmapped codes pass through unchanged.
    pub async fn resolve_members(
        &self,
        source: &dyn SourceStore,
        key: CompositeKey,
    ) -> Vec<MemberRef> {
        let Some(roster) = &self.roster else {
            return Vec::new();
        };

        let crew = match source.crew_assignments(key).await {
            Ok(crew) => crew,
            Err(err) => {
                warn!(key = %key, error = %err, "crew lookup failed; sending no members");
                return Vec::new();
            }
        };

        crew.into_iter()
            .map(|assignment| {
                let code = match roster.user_for(&assignment.employee_code) {
                    Some(user_id) => user_id.to_string(),
                    None => {
                        debug!(
                            key = %key,
                            employee_code = %assignment.employee_code,
                            "employee not in roster; passing code through"
                        );
                        assignment.employee_code
                    }
                };
                MemberRef { code }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sekou_core::CrewAssignment;
    use sekou_remote::memory::MemoryRecordStore;
    use sekou_remote::RecordPayload;
    use sekou_source::memory::MemorySourceStore;

    fn roster_row(user: &str, code: &str) -> RecordPayload {
        let mut payload = RecordPayload::new();
        payload.set(field_codes::ROSTER_USER_ID, user);
        payload.set(field_codes::ROSTER_EMPLOYEE_NAME, "");
        payload.set(field_codes::ROSTER_EMPLOYEE_CODE, code);
        payload
    }

    fn crew(codes: &[&str]) -> Vec<CrewAssignment> {
        codes
            .iter()
            .map(|c| CrewAssignment {
                employee_code: c.to_string(),
                employee_name: None,
            })
            .collect()
    }

    #[test]
    fn duplicate_codes_keep_first_entry() {
        let roster = Roster::from_entries([
            RosterEntry {
                user_id: "first".into(),
                employee_name: "A".into(),
                employee_code: "E1".into(),
            },
            RosterEntry {
                user_id: "second".into(),
                employee_name: "B".into(),
                employee_code: "E1".into(),
            },
        ]);
        assert_eq!(roster.user_for("E1"), Some("first"));
        assert_eq!(roster.len(), 1);
    }

    #[tokio::test]
    async fn maps_known_codes_and_passes_unknown_through() {
        let roster_store = MemoryRecordStore::new();
        roster_store.seed(&roster_row("tanaka", "E001")).await;
        let source = MemorySourceStore::new();
        let key = CompositeKey::new(123, 1);
        source.set_crew(key, crew(&["E001", "E999"])).await;

        let resolver = MembershipResolver::load(&roster_store).await;
        let members = resolver.resolve_members(&source, key).await;
        assert_eq!(
            members,
            vec![
                MemberRef {
                    code: "tanaka".into()
                },
                MemberRef {
                    code: "E999".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_roster_yields_empty_members() {
        let roster_store = MemoryRecordStore::new();
        roster_store.fail_reads().await;
        let source = MemorySourceStore::new();
        let key = CompositeKey::new(1, 1);
        source.set_crew(key, crew(&["E001"])).await;

        let resolver = MembershipResolver::load(&roster_store).await;
        assert!(!resolver.roster_available());
        assert!(resolver.resolve_members(&source, key).await.is_empty());
    }

    #[tokio::test]
    async fn crew_query_failure_yields_empty_members() {
        let source = MemorySourceStore::new();
        source.fail_queries().await;
        let resolver = MembershipResolver::new(Some(Roster::default()));
        let members = resolver
            .resolve_members(&source, CompositeKey::new(1, 1))
            .await;
        assert!(members.is_empty());
    }
}
