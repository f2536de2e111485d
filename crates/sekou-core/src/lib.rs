//! Core domain model shared by the forward and reverse sync flows.

use std::fmt;

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "sekou-core";

/// Project numbers at or above this value belong to test/placeholder projects.
pub const PLACEHOLDER_PROJECT_FLOOR: i64 = 900_000_000;

/// Project reference used on daily-report rows for internal/other work.
pub const NON_PROJECT_SENTINEL: &str = "内作・その他";

/// Fixed-width key persisted in place of [`NON_PROJECT_SENTINEL`].
pub const NON_PROJECT_PLACEHOLDER: &str = "000000000";

/// Field codes of the remote schedule, roster and daily-report apps.
pub mod field_codes {
    pub const RECORD_ID: &str = "$id";

    pub const PROJECT_NO: &str = "企画No";
    pub const SITE: &str = "設置場所";
    pub const PREFECTURE: &str = "都道府県";
    pub const CITY: &str = "市区群";
    pub const PANEL_CONFIG: &str = "面数";
    pub const START_PLANNED_DATE: &str = "着工予定日";
    pub const SCHEDULED_DATE: &str = "工事予定日";
    pub const WORK_DATE: &str = "工事日";
    pub const COMPLETION_DATE: &str = "完了日";
    pub const SALES_REP: &str = "営業名";
    pub const CATEGORY: &str = "企画区分";
    pub const CONTENT: &str = "内容";
    pub const LATITUDE: &str = "緯度";
    pub const LONGITUDE: &str = "経度";
    pub const BOARD_BOTTOM: &str = "板下";
    pub const PILLAR_COUNT: &str = "柱本数";
    pub const PILLAR_SIZE: &str = "柱サイズ";
    pub const TATAMI: &str = "畳数";
    pub const GROUND_LEVEL: &str = "GL";
    pub const ROUND_NO: &str = "KIKAKU_SEKO_RECORD_NO";
    pub const KEY: &str = "KEY";
    pub const MEMBERS: &str = "メンバー";
    pub const MEMBER_COUNT: &str = "人数";

    pub const ROSTER_USER_ID: &str = "ユーザーID";
    pub const ROSTER_EMPLOYEE_NAME: &str = "社員名";
    pub const ROSTER_EMPLOYEE_CODE: &str = "社員CD";

    pub const REPORT_WORK_DATE: &str = "実施日";
    pub const REPORT_MEMBER_CODE: &str = "社員CD";
    pub const REPORT_APPROVER: &str = "承認者CD";
    pub const REPORT_APPROVED_AT: &str = "承認日";
    pub const REPORT_DECIDER: &str = "決裁者CD";
    pub const REPORT_DECIDED_AT: &str = "決裁日";
    pub const REPORT_COEFFICIENT: &str = "係数";
    pub const REPORT_WORK_ITEM: &str = "作業No";
    pub const REPORT_QUANTITY: &str = "数値";
    pub const REPORT_DEPTH: &str = "深さ";
    pub const REPORT_DIAMETER: &str = "径";
    pub const REPORT_PARTIAL_REWRITE: &str = "部分書換";
    pub const REPORT_OPTION: &str = "オプション";
    pub const REPORT_NOTES: &str = "備考";
    pub const REPORT_CREATED_AT: &str = "作成日時";
    pub const REPORT_UPDATED_AT: &str = "更新日時";
}

/// Reconciliation identity shared by a source row and its remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey {
    pub project_id: i64,
    pub round_no: i32,
}

impl CompositeKey {
    pub fn new(project_id: i64, round_no: i32) -> Self {
        Self {
            project_id,
            round_no,
        }
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.project_id, self.round_no)
    }
}

/// `{projectId}_{roundNo}`, the value stored in the remote `KEY` field.
pub fn map_key(project_id: i64, round_no: i32) -> String {
    CompositeKey::new(project_id, round_no).to_string()
}

/// One (project, construction round) row from the source of record.
///
/// Everything except the key is carried as the database rendered it, so the
/// field mapper decides how to coerce missing or malformed values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceProjectRecord {
    pub project_id: i64,
    pub round_no: i32,
    pub category: Option<String>,
    pub content: Option<String>,
    pub sales_rep: Option<String>,
    pub prefecture: Option<String>,
    pub city: Option<String>,
    pub site: Option<String>,
    pub coordinates: Option<String>,
    pub panel_config: Option<String>,
    pub size_label: Option<String>,
    pub area: Option<String>,
    pub tatami: Option<String>,
    pub board_bottom: Option<String>,
    pub ground_level: Option<String>,
    pub pillar_diameter: Option<String>,
    pub pillar_count: Option<String>,
    pub scheduled_date: Option<String>,
    pub start_planned_date: Option<String>,
    pub work_date: Option<String>,
    pub completion_date: Option<String>,
}

impl SourceProjectRecord {
    pub fn new(project_id: i64, round_no: i32) -> Self {
        Self {
            project_id,
            round_no,
            ..Self::default()
        }
    }

    pub fn key(&self) -> CompositeKey {
        CompositeKey::new(self.project_id, self.round_no)
    }
}

/// Which slice of the source of record a pass works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncScope {
    /// Rows scheduled for the given local calendar day.
    Today(NaiveDate),
    /// Exactly one (project, round) pair.
    Single(CompositeKey),
    /// Rows whose project was modified in `[from, to)`.
    Range {
        from: NaiveDateTime,
        to: NaiveDateTime,
    },
}

impl SyncScope {
    /// Range covering whole local days `from..=to`.
    pub fn days(from: NaiveDate, to: NaiveDate) -> Self {
        let end = to.checked_add_days(Days::new(1)).unwrap_or(to);
        Self::Range {
            from: from.and_time(NaiveTime::MIN),
            to: end.and_time(NaiveTime::MIN),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::Today(day) => format!("today:{day}"),
            Self::Single(key) => format!("single:{key}"),
            Self::Range { from, to } => format!("range:{from}..{to}"),
        }
    }
}

/// Entry of the remote member list, serialized as `{"code": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRef {
    pub code: String,
}

/// Roster row translating an internal employee code to a remote user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub user_id: String,
    pub employee_name: String,
    pub employee_code: String,
}

/// Crew assignment of one employee to a (project, round).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrewAssignment {
    pub employee_code: String,
    pub employee_name: Option<String>,
}

/// Identifier of an existing remote record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecordHandle {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Failed(String),
}

/// Header row of the reverse-sync target, keyed by the remote record id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReverseHeaderRow {
    pub npidx: i64,
    pub work_date: Option<NaiveDateTime>,
    pub member_code: Option<String>,
    pub approver_code: Option<String>,
    pub approved_at: Option<NaiveDateTime>,
    pub decider_code: Option<String>,
    pub decided_at: Option<NaiveDateTime>,
}

/// Detail row of the reverse-sync target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReverseDetailRow {
    pub ndidx: i64,
    pub npidx: i64,
    pub project_ref: Option<String>,
    pub round_no: Option<i32>,
    pub coefficient: Option<i32>,
    pub work_item: Option<i32>,
    pub quantity: Option<f64>,
    pub depth: Option<f64>,
    pub diameter: Option<f64>,
    pub partial_rewrite: Option<i32>,
    pub option_flag: Option<i32>,
    pub notes: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Replace the internal/other sentinel with the fixed-width placeholder key.
pub fn normalize_project_ref(raw: Option<&str>) -> Option<String> {
    match raw.map(str::trim) {
        None | Some("") => None,
        Some(NON_PROJECT_SENTINEL) => Some(NON_PROJECT_PLACEHOLDER.to_string()),
        Some(other) => Some(other.to_string()),
    }
}
