//! Daily reports flowing back from the remote store into the header and
//! detail tables.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sekou_core::{field_codes, normalize_project_ref, ReverseDetailRow, ReverseHeaderRow};
use sekou_remote::{RecordStore, RemoteError, RemoteRecord};
use sekou_source::SourceStore;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReverseSummary {
    pub listed: usize,
    pub headers: usize,
    pub details: usize,
    pub failures: Vec<String>,
}

/// Maps remote daily-report records onto relational rows.
#[derive(Debug, Clone, Copy)]
pub struct ReverseMapper {
    offset: FixedOffset,
}

impl ReverseMapper {
    /// Remote datetimes are rendered in `offset` for the header's naive columns.
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    fn local_datetime(&self, raw: Option<String>) -> Option<NaiveDateTime> {
        let raw = raw?;
        if let Ok(at) = DateTime::parse_from_rfc3339(&raw) {
            return Some(at.with_timezone(&self.offset).naive_local());
        }
        if let Ok(at) = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S") {
            return Some(at);
        }
        NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .ok()
            .map(|day| day.and_time(NaiveTime::MIN))
    }

    pub fn header_row(&self, record: &RemoteRecord) -> Option<ReverseHeaderRow> {
        Some(ReverseHeaderRow {
            npidx: record_index(record)?,
            work_date: self.local_datetime(record.text(field_codes::REPORT_WORK_DATE)),
            member_code: record.text(field_codes::REPORT_MEMBER_CODE),
            approver_code: record.text(field_codes::REPORT_APPROVER),
            approved_at: self.local_datetime(record.text(field_codes::REPORT_APPROVED_AT)),
            decider_code: record.text(field_codes::REPORT_DECIDER),
            decided_at: self.local_datetime(record.text(field_codes::REPORT_DECIDED_AT)),
        })
    }

    pub fn detail_row(&self, record: &RemoteRecord) -> Option<ReverseDetailRow> {
        let index = record_index(record)?;
        Some(ReverseDetailRow {
            ndidx: index,
            npidx: index,
            project_ref: normalize_project_ref(record.text(field_codes::PROJECT_NO).as_deref()),
            round_no: int_field(record, field_codes::ROUND_NO),
            coefficient: int_field(record, field_codes::REPORT_COEFFICIENT),
            work_item: int_field(record, field_codes::REPORT_WORK_ITEM),
            quantity: float_field(record, field_codes::REPORT_QUANTITY),
            depth: float_field(record, field_codes::REPORT_DEPTH),
            diameter: float_field(record, field_codes::REPORT_DIAMETER),
            partial_rewrite: flag_field(record, field_codes::REPORT_PARTIAL_REWRITE),
            option_flag: flag_field(record, field_codes::REPORT_OPTION),
            notes: record.text(field_codes::REPORT_NOTES),
            started_at: utc_field(record, field_codes::REPORT_CREATED_AT),
            finished_at: utc_field(record, field_codes::REPORT_UPDATED_AT),
        })
    }
}

fn record_index(record: &RemoteRecord) -> Option<i64> {
    record.id()?.trim().parse().ok()
}

fn float_field(record: &RemoteRecord, code: &str) -> Option<f64> {
    record
        .text(code)?
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
}

/// Integers, tolerating a `"3.0"` rendering of a whole number.
fn int_field(record: &RemoteRecord, code: &str) -> Option<i32> {
    let text = record.text(code)?;
    if let Ok(n) = text.parse::<i32>() {
        return Some(n);
    }
    let n = text.parse::<f64>().ok()?;
    (n.fract() == 0.0 && n >= f64::from(i32::MIN) && n <= f64::from(i32::MAX)).then(|| n as i32)
}

/// Checkbox arrays are 1 when anything is ticked; scalars parse as integers.
fn flag_field(record: &RemoteRecord, code: &str) -> Option<i32> {
    match record.value(code)? {
        Value::Array(items) => Some(i32::from(!items.is_empty())),
        _ => int_field(record, code),
    }
}

fn utc_field(record: &RemoteRecord, code: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&record.text(code)?)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

pub struct ReverseSync<'a> {
    remote: &'a dyn RecordStore,
    source: &'a dyn SourceStore,
    mapper: ReverseMapper,
}

impl<'a> ReverseSync<'a> {
    pub fn new(
        remote: &'a dyn RecordStore,
        source: &'a dyn SourceStore,
        mapper: ReverseMapper,
    ) -> Self {
        Self {
            remote,
            source,
            mapper,
        }
    }

    /// Header before detail for every record. A failed header skips its
    /// detail; a failed detail leaves the committed header in place.
    pub async fn run(&self) -> Result<ReverseSummary, RemoteError> {
        let records = self.remote.list("").await?;
        let mut summary = ReverseSummary {
            listed: records.len(),
            ..ReverseSummary::default()
        };

        for record in &records {
            let (Some(header), Some(detail)) =
                (self.mapper.header_row(record), self.mapper.detail_row(record))
            else {
                warn!(id = ?record.id(), "report record without numeric id skipped");
                summary
                    .failures
                    .push(format!("record {:?}: missing id", record.id()));
                continue;
            };

            if let Err(err) = self.source.merge_header(&header).await {
                warn!(npidx = header.npidx, error = %err, "header merge failed");
                summary
                    .failures
                    .push(format!("header {}: {err}", header.npidx));
                continue;
            }
            summary.headers += 1;

            match self.source.merge_detail(&detail).await {
                Ok(()) => {
                    summary.details += 1;
                    debug!(ndidx = detail.ndidx, "report merged");
                }
                Err(err) => {
                    warn!(ndidx = detail.ndidx, error = %err, "detail merge failed; header kept");
                    summary
                        .failures
                        .push(format!("detail {}: {err}", detail.ndidx));
                }
            }
        }

        info!(
            listed = summary.listed,
            headers = summary.headers,
            details = summary.details,
            failures = summary.failures.len(),
            "reverse sync finished"
        );
        Ok(summary)
    }
}
