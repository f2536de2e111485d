//! Projection of a source row onto the remote schedule schema.
//!
//! Every coercion here is total: malformed input degrades to an empty string
//! or `None`, never to an error.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use sekou_core::{field_codes, CompositeKey, MemberRef, SourceProjectRecord};
use sekou_remote::RecordPayload;
use serde::Serialize;
use serde_json::Value;

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9]+(?:\.[0-9]+)?").expect("number pattern is valid"));

/// Remote field values for one (project, round).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteFieldSet {
    pub project_no: String,
    pub site: String,
    pub prefecture: String,
    pub city: String,
    pub panel_config: String,
    pub sales_rep: String,
    pub category: String,
    pub content: String,
    pub start_planned_date: Option<NaiveDate>,
    pub scheduled_date: Option<NaiveDate>,
    pub work_date: Option<NaiveDate>,
    pub completion_date: Option<NaiveDate>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub board_bottom: Option<f64>,
    pub pillar_count: Option<f64>,
    pub pillar_size: Option<f64>,
    pub tatami: Option<f64>,
    pub ground_level: Option<f64>,
    pub round_no: String,
}

pub fn safe_string(raw: Option<&str>) -> String {
    raw.unwrap_or_default().to_string()
}

/// Finite number or `None`; blanks and non-numeric text are `None`, not zero.
pub fn safe_number(raw: Option<&str>) -> Option<f64> {
    let trimmed = raw?.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Calendar date as written, ignoring any time-of-day or offset suffix.
pub fn safe_date(raw: Option<&str>) -> Option<NaiveDate> {
    let trimmed = raw?.trim();
    let head = trimmed.get(..10)?;
    let rest = &trimmed[10..];
    if !(rest.is_empty() || rest.starts_with(' ') || rest.starts_with('T')) {
        return None;
    }
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%Y/%m/%d"))
        .ok()
}

/// `"lat,lng"` into its parts; anything but exactly two components is `(None, None)`.
pub fn split_coordinates(raw: Option<&str>) -> (Option<f64>, Option<f64>) {
    let Some(raw) = raw else {
        return (None, None);
    };
    let parts: Vec<&str> = raw.split(',').collect();
    match parts.as_slice() {
        [lat, lng] => (safe_number(Some(lat)), safe_number(Some(lng))),
        _ => (None, None),
    }
}

/// First integer or decimal embedded in free text, e.g. `"φ139.8mm"` -> 139.8.
pub fn first_number(raw: Option<&str>) -> Option<f64> {
    let found = NUMBER_RE.find(raw?)?;
    found.as_str().parse().ok()
}

pub fn map_to_remote_fields(record: &SourceProjectRecord) -> RemoteFieldSet {
    let (latitude, longitude) = split_coordinates(record.coordinates.as_deref());

    RemoteFieldSet {
        project_no: record.project_id.to_string(),
        site: safe_string(record.site.as_deref()),
        prefecture: safe_string(record.prefecture.as_deref()),
        city: safe_string(record.city.as_deref()),
        panel_config: safe_string(record.panel_config.as_deref()),
        sales_rep: safe_string(record.sales_rep.as_deref()),
        category: safe_string(record.category.as_deref()),
        content: safe_string(record.content.as_deref()),
        start_planned_date: safe_date(record.start_planned_date.as_deref()),
        scheduled_date: safe_date(record.scheduled_date.as_deref()),
        work_date: safe_date(record.work_date.as_deref()),
        completion_date: safe_date(record.completion_date.as_deref()),
        latitude,
        longitude,
        board_bottom: safe_number(record.board_bottom.as_deref()),
        pillar_count: safe_number(record.pillar_count.as_deref()),
        pillar_size: first_number(record.pillar_diameter.as_deref()),
        tatami: safe_number(record.tatami.as_deref()),
        ground_level: safe_number(record.ground_level.as_deref()),
        round_no: record.round_no.to_string(),
    }
}

fn date_value(date: Option<NaiveDate>) -> Value {
    date.map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
        .unwrap_or(Value::Null)
}

fn number_value(number: Option<f64>) -> Value {
    number.map(Value::from).unwrap_or(Value::Null)
}

impl RemoteFieldSet {
    /// Write payload carrying every mapped field plus key and crew.
    pub fn to_payload(&self, key: CompositeKey, members: &[MemberRef]) -> RecordPayload {
        let mut payload = RecordPayload::new();
        payload.set(field_codes::PROJECT_NO, self.project_no.as_str());
        payload.set(field_codes::SITE, self.site.as_str());
        payload.set(field_codes::PREFECTURE, self.prefecture.as_str());
        payload.set(field_codes::CITY, self.city.as_str());
        payload.set(field_codes::PANEL_CONFIG, self.panel_config.as_str());
        payload.set(field_codes::SALES_REP, self.sales_rep.as_str());
        payload.set(field_codes::CATEGORY, self.category.as_str());
        payload.set(field_codes::CONTENT, self.content.as_str());
        payload.set(field_codes::START_PLANNED_DATE, date_value(self.start_planned_date));
        payload.set(field_codes::SCHEDULED_DATE, date_value(self.scheduled_date));
        payload.set(field_codes::WORK_DATE, date_value(self.work_date));
        payload.set(field_codes::COMPLETION_DATE, date_value(self.completion_date));
        payload.set(field_codes::LATITUDE, number_value(self.latitude));
        payload.set(field_codes::LONGITUDE, number_value(self.longitude));
        payload.set(field_codes::BOARD_BOTTOM, number_value(self.board_bottom));
        payload.set(field_codes::PILLAR_COUNT, number_value(self.pillar_count));
        payload.set(field_codes::PILLAR_SIZE, number_value(self.pillar_size));
        payload.set(field_codes::TATAMI, number_value(self.tatami));
        payload.set(field_codes::GROUND_LEVEL, number_value(self.ground_level));
        payload.set(field_codes::ROUND_NO, self.round_no.as_str());
        payload.set(field_codes::KEY, key.to_string());
        payload.set(
            field_codes::MEMBERS,
            serde_json::to_value(members).unwrap_or(Value::Array(Vec::new())),
        );
        payload.set(field_codes::MEMBER_COUNT, members.len());
        payload
    }
}
