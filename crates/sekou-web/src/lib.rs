//! Axum surface for triggering and manually steering sync passes.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Form, Json, Router,
};
use chrono::NaiveDate;
use sekou_core::CompositeKey;
use sekou_sync::{maybe_build_scheduler, PassError, PassSummary, SyncConfig, SyncService};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub mod session;

use session::{cleared_cookie, session_cookie, token_from_headers, SessionStore, SESSION_TTL};

pub const CRATE_NAME: &str = "sekou-web";

pub struct AppState {
    pub service: Arc<SyncService>,
    pub sessions: SessionStore,
}

impl AppState {
    pub fn new(service: Arc<SyncService>, passphrase: Option<&str>) -> Self {
        Self {
            service,
            sessions: SessionStore::new(passphrase),
        }
    }
}

#[derive(Template)]
#[template(path = "login.html")]
struct LoginTemplate {
    error: Option<String>,
}

#[derive(Template)]
#[template(path = "console.html")]
struct ConsoleTemplate {
    today: String,
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    password: String,
}

#[derive(Debug, Deserialize)]
struct PatchParams {
    #[serde(rename = "projectNo")]
    project_no: Option<String>,
    #[serde(rename = "sekoRecordNo")]
    seko_record_no: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RecoverParams {
    #[serde(rename = "fromDate")]
    from_date: Option<String>,
    #[serde(rename = "toDate")]
    to_date: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(sync_today_handler))
        .route("/healthz", get(healthz_handler))
        .route("/login", get(login_page_handler).post(login_handler))
        .route("/console", get(console_handler))
        .route("/patch", get(patch_handler))
        .route("/recover", get(recover_handler))
        .route("/reverse", get(reverse_handler))
        .with_state(Arc::new(state))
}

/// Bind the configured port and serve until Ctrl-C, with the optional cron trigger.
pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let service = Arc::new(SyncService::from_config(&config)?);
    let scheduler =
        maybe_build_scheduler(service.clone(), config.scheduler_enabled, &config.sync_cron).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %config.sync_cron, "scheduler started");
    }

    let passphrase = config.secret_pass.as_ref().map(|s| s.expose());
    if passphrase.is_none() {
        warn!("APP_SECRET_PASS not set; manual resync pages are locked");
    }
    let state = AppState::new(service, passphrase);
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn sync_today_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.run_today().await {
        Ok(summary) if summary.skipped => {
            (StatusCode::OK, "skipped: no recent changes").into_response()
        }
        Ok(summary) => (StatusCode::OK, describe(&summary)).into_response(),
        Err(err) => pass_error(err),
    }
}

async fn login_page_handler() -> Response {
    render_html(LoginTemplate { error: None })
}

async fn login_handler(State(state): State<Arc<AppState>>, Form(form): Form<LoginForm>) -> Response {
    match state.sessions.login(&form.password) {
        Some(token) => (
            [(header::SET_COOKIE, session_cookie(&token, SESSION_TTL))],
            Redirect::to("/console"),
        )
            .into_response(),
        None => {
            let message = if state.sessions.login_enabled() {
                "Incorrect passphrase."
            } else {
                "Login is disabled on this deployment."
            };
            render_html(LoginTemplate {
                error: Some(message.to_string()),
            })
        }
    }
}

async fn console_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let authorised = token_from_headers(&headers).is_some_and(|t| state.sessions.check(&t));
    if !authorised {
        return Redirect::to("/login").into_response();
    }
    render_html(ConsoleTemplate {
        today: state.service.today().format("%Y-%m-%d").to_string(),
    })
}

/// Spend the session token; `None` means the caller must log in again.
fn consume_session(state: &AppState, headers: &HeaderMap) -> Option<()> {
    let token = token_from_headers(headers)?;
    state.sessions.consume(&token).then_some(())
}

fn with_cleared_session(response: Response) -> Response {
    ([(header::SET_COOKIE, cleared_cookie())], response).into_response()
}

async fn patch_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<PatchParams>,
) -> Response {
    if consume_session(&state, &headers).is_none() {
        return Redirect::to("/login").into_response();
    }

    let project = params.project_no.as_deref().map(str::trim).and_then(|v| v.parse::<i64>().ok());
    let round = params
        .seko_record_no
        .as_deref()
        .map(str::trim)
        .and_then(|v| v.parse::<i32>().ok());
    let (Some(project_id), Some(round_no)) = (project, round) else {
        return with_cleared_session(bad_request("projectNo and sekoRecordNo must be integers"));
    };

    let key = CompositeKey::new(project_id, round_no);
    let response = match state.service.run_single(key).await {
        Ok(summary) if summary.extracted == 0 => (
            StatusCode::NOT_FOUND,
            format!("no schedulable source record for {key}"),
        )
            .into_response(),
        Ok(summary) if !summary.failed.is_empty() => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{key} failed: {}", summary.failed[0].reason),
        )
            .into_response(),
        Ok(summary) => {
            let verb = if summary.created > 0 { "created" } else { "updated" };
            (StatusCode::OK, format!("{key} {verb}")).into_response()
        }
        Err(err) => pass_error(err),
    };
    with_cleared_session(response)
}

async fn recover_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<RecoverParams>,
) -> Response {
    if consume_session(&state, &headers).is_none() {
        return Redirect::to("/login").into_response();
    }

    let parse = |raw: Option<&str>| {
        raw.and_then(|v| NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").ok())
    };
    let (Some(from), Some(to)) = (
        parse(params.from_date.as_deref()),
        parse(params.to_date.as_deref()),
    ) else {
        return with_cleared_session(bad_request("fromDate and toDate must be YYYY-MM-DD"));
    };
    if from > to {
        return with_cleared_session(bad_request("fromDate must not be after toDate"));
    }

    let response = match state.service.run_range(from, to).await {
        Ok(summary) if summary.extracted == 0 => (
            StatusCode::NOT_FOUND,
            format!("no source records modified between {from} and {to}"),
        )
            .into_response(),
        Ok(summary) => (
            StatusCode::OK,
            format!(
                "recovered {} records ({} created, {} updated, {} failed)",
                summary.extracted,
                summary.created,
                summary.updated,
                summary.failed.len()
            ),
        )
            .into_response(),
        Err(err) => pass_error(err),
    };
    with_cleared_session(response)
}

async fn reverse_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.service.run_reverse().await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => pass_error(err),
    }
}

fn describe(summary: &PassSummary) -> String {
    format!(
        "synced {} of {} records ({} created, {} updated, {} failed)",
        summary.synced(),
        summary.extracted,
        summary.created,
        summary.updated,
        summary.failed.len()
    )
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, message.to_string()).into_response()
}

fn pass_error(err: PassError) -> Response {
    match err {
        PassError::ReverseDisabled => {
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string()).into_response()
        }
        other => server_error(other.into()),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{DateTime, Utc};
    use http_body_util::BodyExt;
    use sekou_core::SourceProjectRecord;
    use sekou_remote::memory::MemoryRecordStore;
    use sekou_source::memory::{MemorySourceConnector, MemorySourceStore};
    use sekou_sync::{PassSettings, RemoteStores};
    use tower::ServiceExt;

    const PASS: &str = "open-sesame";

    struct Fixture {
        source: Arc<MemorySourceStore>,
        schedule: Arc<MemoryRecordStore>,
        router: Router,
    }

    fn fixture_with(reverse: Option<Arc<MemoryRecordStore>>) -> Fixture {
        let source = Arc::new(MemorySourceStore::new());
        let schedule = Arc::new(MemoryRecordStore::new());
        let remotes = RemoteStores {
            schedule: schedule.clone(),
            roster: Arc::new(MemoryRecordStore::new()),
            reverse: reverse.map(|r| r as Arc<dyn sekou_remote::RecordStore>),
        };
        let service = SyncService::new(
            Arc::new(MemorySourceConnector::new(source.clone())),
            remotes,
            PassSettings::default(),
        )
        .with_clock(Arc::new(|| {
            "2024-05-01T03:00:00Z".parse::<DateTime<Utc>>().unwrap()
        }));
        Fixture {
            source,
            schedule,
            router: app(AppState::new(Arc::new(service), Some(PASS))),
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn get_with_cookie(uri: &str, cookie: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::COOKIE, cookie)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    /// Log in and return the `authenticated=...` cookie pair.
    async fn login(router: &Router) -> String {
        let resp = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(format!("password={PASS}")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(resp.headers()[header::LOCATION], "/console");
        let set_cookie = resp.headers()[header::SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("SameSite=Lax"));
        set_cookie.split(';').next().unwrap().to_string()
    }

    fn scheduled(project_id: i64, round_no: i32) -> SourceProjectRecord {
        SourceProjectRecord {
            scheduled_date: Some("2024-05-01".into()),
            ..SourceProjectRecord::new(project_id, round_no)
        }
    }

    fn modified_on(day: u32) -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn healthz_answers() {
        let resp = fixture().router.oneshot(get("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "ok");
    }

    #[tokio::test]
    async fn trigger_reports_skip_when_replication_idle() {
        let fx = fixture();
        let resp = fx.router.oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.starts_with("skipped"));
        assert!(fx.schedule.calls().await.is_empty());
    }

    #[tokio::test]
    async fn trigger_syncs_todays_rows() {
        let fx = fixture();
        let noon = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(11, 55, 0)
            .unwrap();
        fx.source.add_heartbeat(noon, 2).await;
        fx.source.insert_row(scheduled(123, 1), noon).await;

        let resp = fx.router.oneshot(get("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("1 created"));
        assert_eq!(fx.schedule.records_with_key("123_1").await.len(), 1);
    }

    #[tokio::test]
    async fn login_page_renders_and_rejects_wrong_passphrase() {
        let fx = fixture();
        let page = fx.router.clone().oneshot(get("/login")).await.unwrap();
        assert_eq!(page.status(), StatusCode::OK);
        assert!(body_text(page).await.contains("name=\"password\""));

        let resp = fx
            .router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("password=nope"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(header::SET_COOKIE).is_none());
        assert!(body_text(resp).await.contains("Incorrect passphrase"));
    }

    #[tokio::test]
    async fn gated_pages_redirect_without_session() {
        let fx = fixture();
        for uri in [
            "/console",
            "/patch?projectNo=1&sekoRecordNo=1",
            "/recover?fromDate=2024-01-01&toDate=2024-01-02",
        ] {
            let resp = fx.router.clone().oneshot(get(uri)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::SEE_OTHER, "{uri}");
            assert_eq!(resp.headers()[header::LOCATION], "/login");
        }

        let forged = fx
            .router
            .oneshot(get_with_cookie("/console", "authenticated=true"))
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::SEE_OTHER);
    }

    #[tokio::test]
    async fn console_is_viewable_without_spending_session() {
        let fx = fixture();
        let cookie = login(&fx.router).await;
        for _ in 0..2 {
            let resp = fx
                .router
                .clone()
                .oneshot(get_with_cookie("/console", &cookie))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert!(body_text(resp).await.contains("value=\"2024-05-01\""));
        }
    }

    #[tokio::test]
    async fn patch_creates_record_and_spends_session() {
        let fx = fixture();
        fx.source.insert_row(scheduled(123, 1), modified_on(1)).await;
        let cookie = login(&fx.router).await;
        let uri = "/patch?projectNo=123&sekoRecordNo=1";

        let resp = fx
            .router
            .clone()
            .oneshot(get_with_cookie(uri, &cookie))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .contains("Max-Age=0"));
        assert_eq!(body_text(resp).await, "123_1 created");

        let replay = fx
            .router
            .oneshot(get_with_cookie(uri, &cookie))
            .await
            .unwrap();
        assert_eq!(replay.status(), StatusCode::SEE_OTHER);
        assert_eq!(fx.schedule.records_with_key("123_1").await.len(), 1);
    }

    #[tokio::test]
    async fn patch_validates_parameters_and_reports_missing_rows() {
        let fx = fixture();

        let cookie = login(&fx.router).await;
        let bad = fx
            .router
            .clone()
            .oneshot(get_with_cookie("/patch?projectNo=abc&sekoRecordNo=1", &cookie))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

        let cookie = login(&fx.router).await;
        let missing = fx
            .router
            .oneshot(get_with_cookie("/patch?projectNo=5&sekoRecordNo=1", &cookie))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn recover_returns_distinct_pair_count() {
        let fx = fixture();
        fx.source.insert_row(scheduled(1, 1), modified_on(1)).await;
        fx.source.insert_row(scheduled(1, 2), modified_on(4)).await;
        fx.source.insert_row(scheduled(2, 1), modified_on(7)).await;
        fx.source.insert_row(scheduled(3, 1), modified_on(9)).await;

        let cookie = login(&fx.router).await;
        let resp = fx
            .router
            .oneshot(get_with_cookie(
                "/recover?fromDate=2024-01-01&toDate=2024-01-07",
                &cookie,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.starts_with("recovered 3 records"));
        assert_eq!(fx.schedule.records().await.len(), 3);
    }

    #[tokio::test]
    async fn recover_rejects_bad_or_inverted_dates() {
        let fx = fixture();
        for uri in [
            "/recover?fromDate=2024-13-01&toDate=2024-01-07",
            "/recover?fromDate=2024-01-08&toDate=2024-01-07",
            "/recover?toDate=2024-01-07",
        ] {
            let cookie = login(&fx.router).await;
            let resp = fx
                .router
                .clone()
                .oneshot(get_with_cookie(uri, &cookie))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
        }

        let cookie = login(&fx.router).await;
        let empty = fx
            .router
            .oneshot(get_with_cookie(
                "/recover?fromDate=2023-01-01&toDate=2023-01-02",
                &cookie,
            ))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reverse_is_unavailable_until_configured() {
        let resp = fixture().router.oneshot(get("/reverse")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let fx = fixture_with(Some(Arc::new(MemoryRecordStore::new())));
        let resp = fx.router.oneshot(get("/reverse")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("\"listed\":0"));
    }
}
