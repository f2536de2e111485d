use std::fmt;
use std::time::Duration;

use chrono::{FixedOffset, TimeDelta};
use sekou_remote::AppClient;
use sekou_source::{DbSettings, ReverseTables, TableName};
use thiserror::Error;

use crate::logging::LogFormat;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// A string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCredentials {
    pub app_id: String,
    pub api_token: Secret,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db: DbSettings,
    pub tables: ReverseTables,
    pub remote_base_url: String,
    pub schedule_app: AppCredentials,
    pub roster_app: AppCredentials,
    pub reverse_app: Option<AppCredentials>,
    pub secret_pass: Option<Secret>,
    pub utc_offset: FixedOffset,
    pub heartbeat_window: TimeDelta,
    pub pass_timeout: Duration,
    pub http_timeout: Duration,
    pub port: u16,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub log_format: LogFormat,
}

const DEFAULT_ROSTER_APP_ID: &str = "39";
/// Six fields, seconds first.
pub const DEFAULT_SYNC_CRON: &str = "0 */15 * * * *";

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let require = |var: &'static str| get(var).ok_or(ConfigError::Missing(var));

        let url = get("DATABASE_URL");
        let db = if url.is_some() {
            DbSettings {
                url,
                ..DbSettings::default()
            }
        } else {
            DbSettings {
                url: None,
                user: require("DB_USER")?,
                password: require("DB_PASSWORD")?,
                database: require("DB_NAME")?,
                instance_connection_name: get("INSTANCE_CONNECTION_NAME"),
                host: get("DB_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
                port: parse_or("DB_PORT", get("DB_PORT"), 5432)?,
            }
        };

        let tables = ReverseTables {
            header: table_name("SQL_TABLE_BASE", get("SQL_TABLE_BASE"), "nippou_base")?,
            detail: table_name("SQL_TABLE_DETAIL", get("SQL_TABLE_DETAIL"), "nippou_detail")?,
        };

        let schedule_app = AppCredentials {
            app_id: require("REMOTE_APP_ID")?,
            api_token: Secret::new(require("REMOTE_API_TOKEN")?),
        };
        let roster_app = AppCredentials {
            app_id: get("ROSTER_APP_ID").unwrap_or_else(|| DEFAULT_ROSTER_APP_ID.to_string()),
            api_token: Secret::new(require("ROSTER_API_TOKEN")?),
        };
        let reverse_app = match (get("REVERSE_APP_ID"), get("REVERSE_API_TOKEN")) {
            (Some(app_id), Some(token)) => Some(AppCredentials {
                app_id,
                api_token: Secret::new(token),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("REVERSE_API_TOKEN")),
            (None, Some(_)) => return Err(ConfigError::Missing("REVERSE_APP_ID")),
        };

        let offset_hours: i32 = parse_or("SYNC_UTC_OFFSET_HOURS", get("SYNC_UTC_OFFSET_HOURS"), 9)?;
        let utc_offset = offset_hours
            .checked_mul(3600)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| ConfigError::Invalid {
                var: "SYNC_UTC_OFFSET_HOURS",
                reason: format!("{offset_hours} is outside -23..=23"),
            })?;

        let window_minutes: u32 =
            parse_or("HEARTBEAT_WINDOW_MINUTES", get("HEARTBEAT_WINDOW_MINUTES"), 20)?;
        let log_format = match get("LOG_FORMAT") {
            None => LogFormat::default(),
            Some(raw) => LogFormat::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                var: "LOG_FORMAT",
                reason: format!("expected json or pretty, got {raw:?}"),
            })?,
        };

        Ok(Self {
            db,
            tables,
            remote_base_url: AppClient::base_url_for_domain(&require("REMOTE_DOMAIN")?),
            schedule_app,
            roster_app,
            reverse_app,
            secret_pass: get("APP_SECRET_PASS").map(Secret::new),
            utc_offset,
            heartbeat_window: TimeDelta::minutes(i64::from(window_minutes)),
            pass_timeout: Duration::from_secs(parse_or(
                "PASS_TIMEOUT_SECS",
                get("PASS_TIMEOUT_SECS"),
                900,
            )?),
            http_timeout: Duration::from_secs(parse_or(
                "HTTP_TIMEOUT_SECS",
                get("HTTP_TIMEOUT_SECS"),
                30,
            )?),
            port: parse_or("PORT", get("PORT"), 8080)?,
            scheduler_enabled: get("SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: get("SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            log_format,
        })
    }
}

fn parse_or<T>(var: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::Invalid {
            var,
            reason: err.to_string(),
        }),
    }
}

fn table_name(
    var: &'static str,
    raw: Option<String>,
    default: &str,
) -> Result<TableName, ConfigError> {
    TableName::parse(raw.as_deref().unwrap_or(default)).map_err(|err| ConfigError::Invalid {
        var,
        reason: err.to_string(),
    })
}
