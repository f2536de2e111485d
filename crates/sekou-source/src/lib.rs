//! Source-of-record access over sqlx/Postgres.
//!
//! Every caller-supplied value is a bound parameter. The only text spliced
//! into SQL are the reverse-sync table names, which must pass
//! [`TableName::parse`] first.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sekou_core::{
    CompositeKey, CrewAssignment, ReverseDetailRow, ReverseHeaderRow, SourceProjectRecord,
    SyncScope, PLACEHOLDER_PROJECT_FLOOR,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod memory;

pub const CRATE_NAME: &str = "sekou-source";

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query failed: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connecting to source database: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
#[error("invalid table name {0:?}")]
pub struct InvalidTableName(pub String);

/// A validated, optionally schema-qualified SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn parse(raw: &str) -> Result<Self, InvalidTableName> {
        let raw = raw.trim();
        let segments: Vec<&str> = raw.split('.').collect();
        let valid_segment = |s: &str| {
            let mut chars = s.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        if segments.len() > 2 || !segments.iter().all(|s| valid_segment(s)) {
            return Err(InvalidTableName(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Targets of the reverse (remote to source) flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseTables {
    pub header: TableName,
    pub detail: TableName,
}

/// Operations the sync needs from the source of record. Failures come back
/// typed so callers can tell "no rows" apart from "query failed".
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Heartbeat rows with a positive change counter stamped at or after `since`.
    async fn heartbeat_count(&self, since: NaiveDateTime) -> Result<i64, QueryError>;

    async fn fetch_records(&self, scope: &SyncScope)
        -> Result<Vec<SourceProjectRecord>, QueryError>;

    async fn crew_assignments(&self, key: CompositeKey)
        -> Result<Vec<CrewAssignment>, QueryError>;

    async fn merge_header(&self, row: &ReverseHeaderRow) -> Result<(), QueryError>;

    async fn merge_detail(&self, row: &ReverseDetailRow) -> Result<(), QueryError>;

    /// Release the underlying connections.
    async fn close(&self);
}

/// Opens a fresh [`SourceStore`] for each pass.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn SourceStore>, ConnectError>;
}

/// Connection settings; `url` wins over the individual parts when set.
#[derive(Clone, Default)]
pub struct DbSettings {
    pub url: Option<String>,
    pub user: String,
    pub password: String,
    pub database: String,
    pub instance_connection_name: Option<String>,
    pub host: String,
    pub port: u16,
}

impl fmt::Debug for DbSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbSettings")
            .field("url", &self.url.as_ref().map(|_| "[REDACTED]"))
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("instance_connection_name", &self.instance_connection_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl DbSettings {
    pub fn connect_options(&self) -> Result<PgConnectOptions, ConnectError> {
        if let Some(url) = &self.url {
            return Ok(PgConnectOptions::from_str(url)?);
        }
        let options = PgConnectOptions::new()
            .username(&self.user)
            .password(&self.password)
            .database(&self.database);
        Ok(match &self.instance_connection_name {
            Some(instance) => options.socket(format!("/cloudsql/{instance}")),
            None => options.host(&self.host).port(self.port),
        })
    }
}

pub struct PgSourceConnector {
    options: PgConnectOptions,
    tables: ReverseTables,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PgSourceConnector {
    pub fn new(settings: &DbSettings, tables: ReverseTables) -> Result<Self, ConnectError> {
        Ok(Self {
            options: settings.connect_options()?,
            tables,
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
        })
    }
}

#[async_trait]
impl SourceConnector for PgSourceConnector {
    async fn connect(&self) -> Result<Arc<dyn SourceStore>, ConnectError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(self.options.clone())
            .await?;
        info!("connected to source database");
        Ok(Arc::new(PgSourceStore::new(pool, self.tables.clone())))
    }
}

pub struct PgSourceStore {
    pool: PgPool,
    tables: ReverseTables,
}

impl PgSourceStore {
    pub fn new(pool: PgPool, tables: ReverseTables) -> Self {
        Self { pool, tables }
    }
}

const HEARTBEAT_SQL: &str = r#"
    SELECT COUNT(*) AS cnt
      FROM s_replicaday AS s
     WHERE s.reccnt > 0
       AND s.replicaday >= $1
"#;

const EXTRACT_SELECT_SQL: &str = r#"
    SELECT DISTINCT ON (k.kikaku_no, sr.kikaku_seko_record_no)
           k.kikaku_no::bigint                                  AS project_id,
           sr.kikaku_seko_record_no::int                        AS round_no,
           si.select_item_nm::text                              AS category,
           k.design_naiyo::text                                 AS content,
           es.syain_nm::text                                    AS sales_rep,
           td.todohuken_nm::text                                AS prefecture,
           k.sikugun::text                                      AS city,
           k.setti_basyo::text                                  AS site,
           k.baitai_zahyo::text                                 AS coordinates,
           k.baitai_kosei::text                                 AS panel_config,
           panels.size_label                                    AS size_label,
           panels.area::text                                    AS area,
           panels.tatami::text                                  AS tatami,
           ka.kanban_banshita::text                             AS board_bottom,
           (ka.kanban_banshita + ka.kanban_size_height)::text   AS ground_level,
           COALESCE(si3.select_item_nm, '')::text               AS pillar_diameter,
           COALESCE(sr.hashira_honsu, 0)::text                  AS pillar_count,
           ks.sekou_yotei_ymd::text                             AS scheduled_date,
           ks.chakou_yotei_ymd::text                            AS start_planned_date,
           sr.seko_record_ymd::text                             AS work_date,
           ks.sekou_kanryo_ymd::text                            AS completion_date
      FROM tkikaku AS k
      JOIN tkikakusekou AS ks ON ks.kikaku_no = k.kikaku_no
      JOIN tkikakusekorecord AS sr ON sr.kikaku_no = k.kikaku_no
      LEFT JOIN tkikakukanban AS ka ON ka.kikaku_no = k.kikaku_no AND ka.kikaku_kanban_no = 1
      LEFT JOIN mbaitai AS ba ON ba.baitai_cd = k.baitai_cd
      LEFT JOIN m0002_select_item AS si ON si.select_item_cd = k.kikaku_kbn AND si.si_parent_cd = 42
      LEFT JOIN m0007_todohuken AS td ON td.todohuken_cd = k.todohuken_cd
      LEFT JOIN msyain AS es ON es.syain_cd = k.eigyo_tanto_cd
      LEFT JOIN m0002_select_item AS si3 ON si3.select_item_cd = sr.hashira_size AND si3.si_parent_cd = 61
      LEFT JOIN LATERAL (
            SELECT string_agg(DISTINCT round(bm.keiyaku_size_height)::text || 'x' || round(bm.keiyaku_size_width)::text, ' ') AS size_label,
                   round(sum(COALESCE(bm.keiyaku_size_height, 0) / 1000.0 * COALESCE(bm.keiyaku_size_width, 0) / 1000.0)::numeric, 2) AS area,
                   round((sum(COALESCE(bm.keiyaku_size_height, 0) / 1000.0 * COALESCE(bm.keiyaku_size_width, 0) / 1000.0) / 1.62)::numeric, 2) AS tatami
              FROM mbaitaimen AS bm
             WHERE bm.baitai_cd = ba.baitai_cd
               AND bm.men_cd BETWEEN 1 AND 6
      ) AS panels ON TRUE
     WHERE k.kikaku_no < $1
       AND ks.sekou_yotei_ymd IS NOT NULL
       AND sr.kikaku_seko_record_no IS NOT NULL
"#;

const EXTRACT_ORDER_SQL: &str = "ORDER BY k.kikaku_no DESC, sr.kikaku_seko_record_no";

const CREW_SQL: &str = r#"
    SELECT srm.seko_member_cd::text AS employee_code,
           ss.syain_nm::text        AS employee_name
      FROM tkikakusekorecordmember AS srm
      LEFT JOIN msyain AS ss ON ss.syain_cd = srm.seko_member_cd
     WHERE srm.kikaku_no = $1
       AND srm.kikaku_seko_record_no = $2
     ORDER BY srm.leader_flg DESC NULLS LAST, srm.seko_member_cd
"#;

#[derive(Debug, sqlx::FromRow)]
struct SourceRow {
    project_id: i64,
    round_no: i32,
    category: Option<String>,
    content: Option<String>,
    sales_rep: Option<String>,
    prefecture: Option<String>,
    city: Option<String>,
    site: Option<String>,
    coordinates: Option<String>,
    panel_config: Option<String>,
    size_label: Option<String>,
    area: Option<String>,
    tatami: Option<String>,
    board_bottom: Option<String>,
    ground_level: Option<String>,
    pillar_diameter: Option<String>,
    pillar_count: Option<String>,
    scheduled_date: Option<String>,
    start_planned_date: Option<String>,
    work_date: Option<String>,
    completion_date: Option<String>,
}

impl From<SourceRow> for SourceProjectRecord {
    fn from(row: SourceRow) -> Self {
        Self {
            project_id: row.project_id,
            round_no: row.round_no,
            category: row.category,
            content: row.content,
            sales_rep: row.sales_rep,
            prefecture: row.prefecture,
            city: row.city,
            site: row.site,
            coordinates: row.coordinates,
            panel_config: row.panel_config,
            size_label: row.size_label,
            area: row.area,
            tatami: row.tatami,
            board_bottom: row.board_bottom,
            ground_level: row.ground_level,
            pillar_diameter: row.pillar_diameter,
            pillar_count: row.pillar_count,
            scheduled_date: row.scheduled_date,
            start_planned_date: row.start_planned_date,
            work_date: row.work_date,
            completion_date: row.completion_date,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CrewRow {
    employee_code: Option<String>,
    employee_name: Option<String>,
}

fn extract_sql(scope: &SyncScope) -> String {
    let clause = match scope {
        SyncScope::Today(_) => "AND ks.sekou_yotei_ymd::date = $2",
        SyncScope::Single(_) => "AND k.kikaku_no = $2 AND sr.kikaku_seko_record_no = $3",
        SyncScope::Range { .. } => "AND k.upd_date >= $2 AND k.upd_date < $3",
    };
    format!("{EXTRACT_SELECT_SQL}       {clause}\n     {EXTRACT_ORDER_SQL}")
}

fn merge_header_sql(table: &TableName) -> String {
    format!(
        r#"
    MERGE INTO {table} AS target
    USING (VALUES ($1::bigint, $2::timestamp, $3::text, $4::text, $5::timestamp, $6::text, $7::timestamp))
          AS source (npidx, koujibi, member, shoninnsha, shouninbi, kessaisha, kessaibi)
       ON target.npidx = source.npidx
     WHEN MATCHED THEN
          UPDATE SET koujibi = source.koujibi,
                     member = source.member,
                     shoninnsha = source.shoninnsha,
                     shouninbi = source.shouninbi,
                     kessaisha = source.kessaisha,
                     kessaibi = source.kessaibi
     WHEN NOT MATCHED THEN
          INSERT (npidx, koujibi, member, shoninnsha, shouninbi, kessaisha, kessaibi)
          VALUES (source.npidx, source.koujibi, source.member, source.shoninnsha,
                  source.shouninbi, source.kessaisha, source.kessaibi)
"#
    )
}

fn merge_detail_sql(table: &TableName) -> String {
    format!(
        r#"
    MERGE INTO {table} AS target
    USING (VALUES ($1::bigint, $2::bigint, $3::text, $4::int, $5::int, $6::int, $7::float8,
                   $8::float8, $9::float8, $10::int, $11::int, $12::text, $13::timestamptz, $14::timestamptz))
          AS source (ndidx, npidx, kikaku_no, kikaku_seko_record_no, keisu, naiyo, quant,
                     depth, diam, bubun, hsakusei, biko, starttime, finishtime)
       ON target.ndidx = source.ndidx
     WHEN MATCHED THEN
          UPDATE SET kikaku_no = source.kikaku_no,
                     kikaku_seko_record_no = source.kikaku_seko_record_no,
                     keisu = source.keisu,
                     naiyo = source.naiyo,
                     quant = source.quant,
                     depth = source.depth,
                     diam = source.diam,
                     bubun = source.bubun,
                     hsakusei = source.hsakusei,
                     biko = source.biko,
                     starttime = source.starttime,
                     finishtime = source.finishtime
     WHEN NOT MATCHED THEN
          INSERT (ndidx, npidx, kikaku_no, kikaku_seko_record_no, keisu, naiyo, quant,
                  depth, diam, bubun, hsakusei, biko, starttime, finishtime)
          VALUES (source.ndidx, source.npidx, source.kikaku_no, source.kikaku_seko_record_no,
                  source.keisu, source.naiyo, source.quant, source.depth, source.diam,
                  source.bubun, source.hsakusei, source.biko, source.starttime, source.finishtime)
"#
    )
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn heartbeat_count(&self, since: NaiveDateTime) -> Result<i64, QueryError> {
        let count: i64 = sqlx::query_scalar(HEARTBEAT_SQL)
            .bind(since)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn fetch_records(
        &self,
        scope: &SyncScope,
    ) -> Result<Vec<SourceProjectRecord>, QueryError> {
        let sql = extract_sql(scope);
        let query = sqlx::query_as::<_, SourceRow>(&sql).bind(PLACEHOLDER_PROJECT_FLOOR);
        let query = match scope {
            SyncScope::Today(day) => query.bind(*day),
            SyncScope::Single(key) => query.bind(key.project_id).bind(key.round_no),
            SyncScope::Range { from, to } => query.bind(*from).bind(*to),
        };
        let rows = query.fetch_all(&self.pool).await?;
        debug!(scope = %scope.label(), rows = rows.len(), "fetched source rows");
        Ok(rows.into_iter().map(SourceProjectRecord::from).collect())
    }

    async fn crew_assignments(
        &self,
        key: CompositeKey,
    ) -> Result<Vec<CrewAssignment>, QueryError> {
        let rows = sqlx::query_as::<_, CrewRow>(CREW_SQL)
            .bind(key.project_id)
            .bind(key.round_no)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                row.employee_code.map(|code| CrewAssignment {
                    employee_code: code.trim().to_string(),
                    employee_name: row.employee_name,
                })
            })
            .collect())
    }

    async fn merge_header(&self, row: &ReverseHeaderRow) -> Result<(), QueryError> {
        sqlx::query(&merge_header_sql(&self.tables.header))
            .bind(row.npidx)
            .bind(row.work_date)
            .bind(row.member_code.as_deref())
            .bind(row.approver_code.as_deref())
            .bind(row.approved_at)
            .bind(row.decider_code.as_deref())
            .bind(row.decided_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn merge_detail(&self, row: &ReverseDetailRow) -> Result<(), QueryError> {
        sqlx::query(&merge_detail_sql(&self.tables.detail))
            .bind(row.ndidx)
            .bind(row.npidx)
            .bind(row.project_ref.as_deref())
            .bind(row.round_no)
            .bind(row.coefficient)
            .bind(row.work_item)
            .bind(row.quantity)
            .bind(row.depth)
            .bind(row.diameter)
            .bind(row.partial_rewrite)
            .bind(row.option_flag)
            .bind(row.notes.as_deref())
            .bind(row.started_at)
            .bind(row.finished_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        if self.pool.is_closed() {
            warn!("source pool already closed");
            return;
        }
        self.pool.close().await;
        info!("closed source database pool");
    }
}
