//! JSON triage API: targets, observations and on-demand sweeps.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use kiwatch_core::{Observation, ObservationUpdate, RawExtract, Target};
use kiwatch_storage::{Store, StorageError};
use kiwatch_sync::{
    canonical_url, PipelineError, RegistryError, SweepError, SweepOptions, SweepScheduler,
    SweepStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kiwatch-web";

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1_000;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: SweepScheduler,
}

impl AppState {
    pub fn new(scheduler: SweepScheduler) -> Self {
        Self { scheduler }
    }

    fn store(&self) -> &Store {
        self.scheduler.store()
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// The page could not be fetched or extracted.
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, detail),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, detail),
            ApiError::Conflict(detail) => (StatusCode::CONFLICT, detail),
            ApiError::BadGateway(detail) => {
                warn!(%detail, "upstream page failed");
                (StatusCode::BAD_GATEWAY, detail)
            }
            ApiError::Internal(detail) => {
                error!(%detail, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, detail)
            }
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StorageError::UniqueViolation(_) => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::InvalidUrl { .. } => ApiError::BadRequest(err.to_string()),
            RegistryError::Storage(inner) => inner.into(),
            RegistryError::Vanished(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Fetch(_)
            | PipelineError::Normalize(_)
            | PipelineError::Timeout { .. } => ApiError::BadGateway(err.to_string()),
            PipelineError::Storage(inner) => inner.into(),
            PipelineError::Cancelled => ApiError::Conflict(err.to_string()),
        }
    }
}

impl From<SweepError> for ApiError {
    fn from(err: SweepError) -> Self {
        match err {
            SweepError::Busy => ApiError::Conflict(err.to_string()),
            SweepError::Storage(inner) => inner.into(),
            SweepError::Target { source, .. } => source.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize, Default)]
struct Pagination {
    skip: Option<i64>,
    limit: Option<i64>,
}

impl Pagination {
    fn bounds(&self) -> (i64, i64) {
        (
            self.skip.unwrap_or(0).max(0),
            self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        )
    }
}

#[derive(Debug, Deserialize)]
struct NewTarget {
    url: String,
}

#[derive(Debug, Deserialize)]
struct LatestQuery {
    url: String,
}

#[derive(Debug, Deserialize, Default)]
struct SweepQuery {
    deep_scrape: Option<bool>,
}

impl SweepQuery {
    fn options(&self, scheduler: &SweepScheduler) -> SweepOptions {
        SweepOptions {
            deep_scrape: self
                .deep_scrape
                .unwrap_or(scheduler.default_options().deep_scrape),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExtractRequest {
    url: String,
    #[serde(default)]
    deep_scrape: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepAccepted {
    pub run_id: Uuid,
    pub deep_scrape: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/targets", get(list_targets_handler).post(create_target_handler))
        .route("/targets/{id}", get(target_handler))
        .route("/targets/{id}/observations", get(target_observations_handler))
        .route("/targets/{id}/sweep", post(sweep_target_handler))
        .route("/observations", get(list_observations_handler))
        .route("/observations/flagged", get(flagged_observations_handler))
        .route(
            "/observations/{id}",
            get(observation_handler).put(update_observation_handler),
        )
        .route("/latest", get(latest_handler))
        .route("/sweeps", post(trigger_sweep_handler))
        .route("/sweeps/status", get(sweep_status_handler))
        .route("/extract", post(extract_handler))
        .with_state(Arc::new(state))
}

/// Serve the API on `0.0.0.0:port` until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "triage api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn create_target_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewTarget>,
) -> ApiResult<Target> {
    Ok(Json(state.scheduler.register(&body.url).await?))
}

async fn list_targets_handler(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> ApiResult<Vec<Target>> {
    let (skip, limit) = page.bounds();
    Ok(Json(state.store().list_targets(skip, limit).await?))
}

async fn target_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Target> {
    Ok(Json(state.store().target(id).await?))
}

async fn target_observations_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(page): Query<Pagination>,
) -> ApiResult<Vec<Observation>> {
    let store = state.store();
    store.target(id).await?;
    let (skip, limit) = page.bounds();
    let observations = store
        .observations_for_target(id, skip as usize, limit as usize)
        .await?;
    Ok(Json(observations))
}

async fn list_observations_handler(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> ApiResult<Vec<Observation>> {
    let (skip, limit) = page.bounds();
    Ok(Json(state.store().list_observations(skip, limit).await?))
}

async fn flagged_observations_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<Observation>> {
    Ok(Json(state.store().flagged_observations().await?))
}

async fn observation_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> ApiResult<Observation> {
    Ok(Json(state.store().observation(id).await?))
}

async fn update_observation_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(update): Json<ObservationUpdate>,
) -> ApiResult<Observation> {
    Ok(Json(state.store().update_observation(id, &update).await?))
}

async fn latest_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LatestQuery>,
) -> ApiResult<Observation> {
    let url = canonical_url(&query.url)?;
    state
        .store()
        .latest_observation_for_url(&url)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no observations for {url}")))
}

async fn trigger_sweep_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SweepQuery>,
) -> Result<(StatusCode, Json<SweepAccepted>), ApiError> {
    let options = query.options(&state.scheduler);
    let run_id = state.scheduler.trigger(options)?;
    info!(%run_id, deep_scrape = options.deep_scrape, "sweep triggered over api");
    Ok((
        StatusCode::ACCEPTED,
        Json(SweepAccepted {
            run_id,
            deep_scrape: options.deep_scrape,
        }),
    ))
}

async fn sweep_status_handler(State(state): State<Arc<AppState>>) -> Json<SweepStatus> {
    Json(state.scheduler.status())
}

/// Detect pass for one target; responds with the observations it created.
async fn sweep_target_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<SweepQuery>,
) -> ApiResult<Vec<Observation>> {
    let options = query.options(&state.scheduler);
    let created = state.scheduler.sweep_target(id, options).await?;
    info!(target_id = id, new = created.len(), "target swept over api");
    Ok(Json(created))
}

async fn extract_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExtractRequest>,
) -> ApiResult<RawExtract> {
    let url = canonical_url(&body.url)?;
    let options = SweepQuery {
        deep_scrape: body.deep_scrape,
    }
    .options(&state.scheduler);
    Ok(Json(state.scheduler.preview(&url, options).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use kiwatch_adapters::StaticExtractor;
    use kiwatch_core::{Classification, RawExtract, RawRow};
    use kiwatch_sync::{LogNotifier, SweepSettings, UrlIdentityCache};
    use tower::ServiceExt;

    const STATUS_URL: &str = "https://example.com/status";

    fn row(summary: &str, last_updated: &str) -> RawRow {
        RawRow::from([
            ("Summary".to_string(), summary.to_string()),
            ("Status".to_string(), "Active".to_string()),
            ("Last updated".to_string(), last_updated.to_string()),
        ])
    }

    fn page(rows: Vec<RawRow>) -> RawExtract {
        RawExtract::new("Known issues", rows)
    }

    async fn state_with(extractor: StaticExtractor) -> (AppState, Arc<StaticExtractor>) {
        let store = Store::open_in_memory().await.unwrap();
        let identity = Arc::new(UrlIdentityCache::load(store.clone()).await.unwrap());
        let extractor = Arc::new(extractor);
        let scheduler = SweepScheduler::new(
            store,
            identity,
            extractor.clone(),
            Arc::new(LogNotifier),
            SweepSettings::default(),
        );
        (AppState::new(scheduler), extractor)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn sweep_and_wait(state: &AppState) {
        let mut status = state.scheduler.subscribe();
        let run_id = state.scheduler.trigger(SweepOptions::default()).unwrap();
        status
            .wait_for(|s| s.last_summary.as_ref().map(|x| x.run_id) == Some(run_id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn registering_a_target_is_idempotent() {
        let (state, _) = state_with(StaticExtractor::new()).await;
        let app = app(state);

        let body = json!({ "url": STATUS_URL });
        let (status, first) = send(&app, "POST", "/targets", Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (_, second) = send(&app, "POST", "/targets", Some(body)).await;
        assert_eq!(first["id"], second["id"]);

        let (status, list) = send(&app, "GET", "/targets", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (status, target) = send(&app, "GET", &format!("/targets/{}", first["id"]), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(target["url"], STATUS_URL);
        assert!(target["last_swept_at"].is_null());
    }

    #[tokio::test]
    async fn bad_url_and_missing_rows_map_to_client_errors() {
        let (state, _) = state_with(StaticExtractor::new()).await;
        let app = app(state);

        let (status, body) = send(&app, "POST", "/targets", Some(json!({ "url": "nope" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("invalid target url"));

        let (status, _) = send(&app, "GET", "/targets/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "GET", "/targets/42/observations", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "GET", "/observations/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let alert = json!({ "alert": true });
        let (status, _) = send(&app, "PUT", "/observations/42", Some(alert)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, "GET", &format!("/latest?url={STATUS_URL}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn swept_observations_can_be_triaged() {
        let (state, extractor) = state_with(StaticExtractor::new()).await;
        let target = state.scheduler.register(STATUS_URL).await.unwrap();
        extractor
            .set_page(STATUS_URL, page(vec![row("Printer bug", "2024-01-01")]))
            .await;
        sweep_and_wait(&state).await;
        let app = app(state);

        let (status, latest) = send(&app, "GET", &format!("/latest?url={STATUS_URL}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(latest["payload"]["known_issues"]["row"]["Summary"], "Printer bug");
        assert!(latest["classification"].is_null());
        assert_eq!(latest["alert"], false);
        let id = latest["id"].as_i64().unwrap();

        let (status, updated) = send(
            &app,
            "PUT",
            &format!("/observations/{id}"),
            Some(json!({ "classification": "Critical", "comment": "escalate", "alert": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["classification"], Classification::Critical.as_str());
        assert_eq!(updated["comment"], "escalate");

        let uri = format!("/observations/{id}");
        let (_, partial) = send(&app, "PUT", &uri, Some(json!({ "comment": "watching" }))).await;
        assert_eq!(partial["classification"], "Critical");
        assert_eq!(partial["comment"], "watching");
        assert_eq!(partial["alert"], true);

        let (_, flagged) = send(&app, "GET", "/observations/flagged", None).await;
        assert_eq!(flagged.as_array().unwrap().len(), 1);
        let (_, all) = send(&app, "GET", "/observations?limit=10", None).await;
        assert_eq!(all.as_array().unwrap().len(), 1);
        let (_, reread) = send(&app, "GET", &format!("/targets/{}", target.id), None).await;
        assert!(!reread["last_swept_at"].is_null());
    }

    #[tokio::test]
    async fn target_observations_are_newest_date_first() {
        let (state, extractor) = state_with(StaticExtractor::new()).await;
        let target = state.scheduler.register(STATUS_URL).await.unwrap();
        extractor
            .set_page(
                STATUS_URL,
                RawExtract::new(
                    "Known issues",
                    vec![
                        row("Old", "2023-05-01"),
                        row("Undated", "see notes"),
                        row("New", "2024-02-01 10:00 PT"),
                    ],
                ),
            )
            .await;
        let run = state
            .scheduler
            .run_sweep(SweepOptions { deep_scrape: true })
            .await
            .unwrap();
        assert_eq!(run.new_observations, 3);
        let app = app(state);

        let uri = format!("/targets/{}/observations", target.id);
        let (_, listed) = send(&app, "GET", &uri, None).await;
        let summaries: Vec<&str> = listed
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["payload"]["known_issues"]["row"]["Summary"].as_str().unwrap())
            .collect();
        assert_eq!(summaries, vec!["New", "Old", "Undated"]);

        let uri = format!("/targets/{}/observations?skip=1&limit=1", target.id);
        let (_, paged) = send(&app, "GET", &uri, None).await;
        assert_eq!(paged.as_array().unwrap().len(), 1);
        assert_eq!(paged[0]["payload"]["known_issues"]["row"]["Summary"], "Old");
    }

    #[tokio::test]
    async fn sweep_trigger_reports_busy_while_running() {
        let (state, extractor) =
            state_with(StaticExtractor::new().with_delay(Duration::from_millis(300))).await;
        state.scheduler.register(STATUS_URL).await.unwrap();
        extractor
            .set_page(STATUS_URL, page(vec![row("Printer bug", "2024-01-01")]))
            .await;
        let mut status = state.scheduler.subscribe();
        let app = app(state);

        let (code, accepted) = send(&app, "POST", "/sweeps?deep_scrape=true", None).await;
        assert_eq!(code, StatusCode::ACCEPTED);
        assert_eq!(accepted["deep_scrape"], true);
        let (code, body) = send(&app, "POST", "/sweeps", None).await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["detail"], "a sweep is already running");

        status
            .wait_for(|s| matches!(s.phase, kiwatch_sync::SweepPhase::Sweeping { .. }))
            .await
            .unwrap();
        let (_, running) = send(&app, "GET", "/sweeps/status", None).await;
        assert_eq!(running["phase"]["state"], "sweeping");

        status
            .wait_for(|s| s.last_summary.is_some())
            .await
            .unwrap();
        let (_, idle) = send(&app, "GET", "/sweeps/status", None).await;
        assert_eq!(idle["phase"]["state"], "idle");
        assert_eq!(idle["last_summary"]["new_observations"], 1);
        assert_eq!(idle["last_summary"]["run_id"], accepted["run_id"]);
    }

    #[tokio::test]
    async fn single_target_sweep_returns_only_new_observations() {
        let (state, extractor) = state_with(StaticExtractor::new()).await;
        let target = state.scheduler.register(STATUS_URL).await.unwrap();
        extractor
            .set_page(
                STATUS_URL,
                page(vec![row("Printer bug", "2024-01-01"), row("VPN drops", "2023-12-01")]),
            )
            .await;
        let app = app(state);
        let uri = format!("/targets/{}/sweep", target.id);

        let (code, created) = send(&app, "POST", &format!("{uri}?deep_scrape=true"), None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(created.as_array().unwrap().len(), 2);
        assert_eq!(created[0]["target_id"], target.id);
        assert!(created[0]["classification"].is_null());

        let (code, again) = send(&app, "POST", &format!("{uri}?deep_scrape=true"), None).await;
        assert_eq!(code, StatusCode::OK);
        assert!(again.as_array().unwrap().is_empty());

        let (code, _) = send(&app, "POST", "/targets/42/sweep", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);

        extractor.set_failure(STATUS_URL, "connection reset").await;
        let (code, body) = send(&app, "POST", &uri, None).await;
        assert_eq!(code, StatusCode::BAD_GATEWAY);
        assert!(body["detail"].as_str().unwrap().contains("connection reset"));
    }

    #[tokio::test]
    async fn extract_previews_a_page_without_storing_it() {
        let (state, extractor) = state_with(StaticExtractor::new()).await;
        extractor
            .set_page(
                STATUS_URL,
                page(vec![row("Printer bug", "2024-01-01"), row("VPN drops", "2023-12-01")]),
            )
            .await;
        let store = state.scheduler.store().clone();
        let app = app(state);

        let shallow = json!({ "url": STATUS_URL });
        let (code, shallow) = send(&app, "POST", "/extract", Some(shallow)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(shallow["header"], "Known issues");
        assert_eq!(shallow["rows"].as_array().unwrap().len(), 1);
        assert_eq!(shallow["rows"][0]["Summary"], "Printer bug");

        let deep = json!({ "url": STATUS_URL, "deep_scrape": true });
        let (_, deep) = send(&app, "POST", "/extract", Some(deep)).await;
        assert_eq!(deep["rows"].as_array().unwrap().len(), 2);
        assert!(store.all_targets().await.unwrap().is_empty());

        let (code, _) = send(&app, "POST", "/extract", Some(json!({ "url": "nope" }))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        let missing = json!({ "url": "https://example.com/missing" });
        let (code, _) = send(&app, "POST", "/extract", Some(missing)).await;
        assert_eq!(code, StatusCode::BAD_GATEWAY);
    }
}
