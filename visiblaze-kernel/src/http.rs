/**
 * API REST VISIBLAZE - Surface HTTP du kernel
 *
 * RÔLE :
 * Exposer le chemin de lecture consommé par le dashboard et le chemin
 * d'écriture utilisé par les agents. Les handlers sont sans état : tout
 * le métier vit dans validate/reconcile/store.
 *
 * ROUTES :
 * - GET  /health                     -> "ok" (toujours accessible)
 * - GET  /system/health              -> uptime + compteurs ingest
 * - GET  /hosts?filter=&limit=&offset=  -> { hosts: [HostView] }
 * - GET  /hosts/{id}                 -> { host: HostView } (forme unique)
 * - GET  /apps?hostId=               -> { packages: [...] }
 * - GET  /cis-results?hostId=        -> { cis_results: [...] }
 * - POST /ingest                     -> rapport agent (IngestPayload)
 *
 * SÉCURITÉ : header x-api-key obligatoire partout sauf /health,
 * validé en middleware avant tout traitement métier.
 *
 * ERREURS : JSON structuré { error: { code, ... } }, le client n'a
 * jamais à parser un message libre.
 */

use crate::config::KernelConfig;
use crate::models::{ChangeSet, CisResult, HostRecord, IngestPayload, Package};
use crate::reconcile::ReconcileError;
use crate::store::{IngestError, Store, StoreError};
use crate::validate::{validate, ValidationError};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use time::{format_description::well_known::Rfc3339, Duration, OffsetDateTime};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub cfg: KernelConfig,
    pub started: Instant,
}

/// Vue API d'un hôte : faits + horodatages RFC3339 + staleness calculée
/// contre le seuil configuré.
#[derive(Debug, Serialize)]
pub struct HostView {
    pub host_id: String,
    pub hostname: String,
    pub os_id: String,
    pub os_version: String,
    pub kernel: String,
    pub ip_addresses: Vec<String>,
    pub agent_version: String,
    pub first_seen: String,
    pub last_seen: String,
    pub stale: bool,
    pub stale_for_seconds: i64,
}

fn to_view(record: &HostRecord, stale_after_seconds: i64) -> HostView {
    let now = OffsetDateTime::now_utc();
    let age = now - record.host.last_seen;
    let facts = &record.host.facts;
    HostView {
        host_id: facts.host_id.clone(),
        hostname: facts.hostname.clone(),
        os_id: facts.os_id.clone(),
        os_version: facts.os_version.clone(),
        kernel: facts.kernel.clone(),
        ip_addresses: facts.ip_addresses.clone(),
        agent_version: facts.agent_version.clone(),
        first_seen: record.host.first_seen.format(&Rfc3339).unwrap_or_default(),
        last_seen: record.host.last_seen.format(&Rfc3339).unwrap_or_default(),
        stale: age > Duration::seconds(stale_after_seconds),
        stale_for_seconds: age.whole_seconds().max(0),
    }
}

/// Taxonomie d'erreurs rendue au client. Chaque variante porte un code
/// machine et les identifiants nécessaires à un message précis.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Stale(#[from] ReconcileError),
    #[error("concurrent ingest for host {host_id}, retry with backoff")]
    Conflict { host_id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Reconcile(e) => Self::Stale(e),
            IngestError::Store(StoreError::Conflict { host_id }) => Self::Conflict { host_id },
            IngestError::Store(e @ StoreError::Unavailable { .. }) => Self::Unavailable(e.to_string()),
            IngestError::Store(e) => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Validation(e) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"code": e.code(), "field": e.field(), "message": e.to_string()}),
            ),
            Self::Stale(e) => (
                StatusCode::CONFLICT,
                serde_json::json!({"code": "stale_report", "message": e.to_string()}),
            ),
            Self::Conflict { host_id } => (
                StatusCode::CONFLICT,
                serde_json::json!({"code": "conflict_retry", "host_id": host_id, "message": self.to_string()}),
            ),
            Self::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({"code": "unavailable", "message": msg}),
            ),
            Self::NotFound { resource, id } => (
                StatusCode::NOT_FOUND,
                serde_json::json!({"code": "not_found", "resource": resource, "id": id}),
            ),
            Self::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"code": "internal", "message": msg}),
            ),
        };
        (status, Json(serde_json::json!({ "error": body }))).into_response()
    }
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("VISIBLAZE_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        warn!("[http] VISIBLAZE_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/hosts", get(get_hosts))
        .route("/hosts/{id}", get(get_host))
        .route("/apps", get(get_apps))
        .route("/cis-results", get(get_cis_results))
        .route("/ingest", post(post_ingest))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub filter: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct HostIdParams {
    #[serde(rename = "hostId")]
    pub host_id: String,
}

#[derive(Debug, Serialize)]
pub struct HostsResponse {
    pub hosts: Vec<HostView>,
}

#[derive(Debug, Serialize)]
pub struct HostResponse {
    pub host: HostView,
}

#[derive(Debug, Serialize)]
pub struct PackagesResponse {
    pub packages: Vec<Package>,
}

#[derive(Debug, Serialize)]
pub struct CisResultsResponse {
    pub cis_results: Vec<CisResult>,
}

#[derive(Debug, Serialize)]
pub struct ChangeSummary {
    pub packages_added: usize,
    pub packages_removed: usize,
    pub packages_changed: usize,
    pub cis_transitions: usize,
    pub cis_unchanged: usize,
}

impl From<&ChangeSet> for ChangeSummary {
    fn from(c: &ChangeSet) -> Self {
        Self {
            packages_added: c.packages_added.len(),
            packages_removed: c.packages_removed.len(),
            packages_changed: c.packages_changed.len(),
            cis_transitions: c.cis_transitions.len(),
            cis_unchanged: c.cis_unchanged,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub status: &'static str,
    pub host_id: String,
    /// false = doublon idempotent, déjà appliqué
    pub applied: bool,
    pub changes: ChangeSummary,
}

#[derive(Debug, Serialize)]
pub struct SystemHealth {
    pub uptime_seconds: u64,
    pub hosts_tracked: usize,
    pub ingests_applied: u64,
    pub ingests_noop: u64,
}

// GET /hosts (liste, filtre substring + pagination)
pub async fn get_hosts(
    State(app): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<HostsResponse> {
    let records = app.store.list_hosts(params.filter.as_deref());
    let offset = params.offset.unwrap_or(0);
    let limit = params.limit.unwrap_or(app.cfg.list_limit);
    let hosts = records
        .iter()
        .skip(offset)
        .take(limit)
        .map(|r| to_view(r, app.cfg.stale_after_seconds))
        .collect();
    Json(HostsResponse { hosts })
}

// GET /hosts/{id} (détail, forme normalisée unique { host: ... })
pub async fn get_host(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<HostResponse>, ApiError> {
    let record = app
        .store
        .get_host(&id)
        .ok_or(ApiError::NotFound { resource: "host", id: id.clone() })?;
    Ok(Json(HostResponse { host: to_view(&record, app.cfg.stale_after_seconds) }))
}

// GET /apps?hostId= (404 si hôte inconnu, liste vide sinon)
pub async fn get_apps(
    State(app): State<AppState>,
    Query(params): Query<HostIdParams>,
) -> Result<Json<PackagesResponse>, ApiError> {
    let packages = app
        .store
        .get_packages(&params.host_id)
        .ok_or(ApiError::NotFound { resource: "host", id: params.host_id })?;
    Ok(Json(PackagesResponse { packages }))
}

// GET /cis-results?hostId=
pub async fn get_cis_results(
    State(app): State<AppState>,
    Query(params): Query<HostIdParams>,
) -> Result<Json<CisResultsResponse>, ApiError> {
    let cis_results = app
        .store
        .get_cis_results(&params.host_id)
        .ok_or(ApiError::NotFound { resource: "host", id: params.host_id })?;
    Ok(Json(CisResultsResponse { cis_results }))
}

// POST /ingest (chemin d'écriture agent)
pub async fn post_ingest(
    State(app): State<AppState>,
    Json(payload): Json<IngestPayload>,
) -> Result<Json<IngestResponse>, ApiError> {
    let validated = validate(payload)?;
    // receive_time kernel fait autorité, jamais l'horloge agent
    let receive_time = OffsetDateTime::now_utc();
    let outcome = app.store.ingest(validated, receive_time).await?;
    Ok(Json(IngestResponse {
        status: "ok",
        host_id: outcome.host_id,
        applied: outcome.applied,
        changes: ChangeSummary::from(&outcome.changes),
    }))
}

// GET /system/health (état infrastructure)
pub async fn get_system_health(State(app): State<AppState>) -> Json<SystemHealth> {
    let stats = app.store.stats();
    Json(SystemHealth {
        uptime_seconds: app.started.elapsed().as_secs(),
        hosts_tracked: stats.hosts_tracked,
        ingests_applied: stats.ingests_applied,
        ingests_noop: stats.ingests_noop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use uuid::Uuid;

    fn test_state() -> AppState {
        let cfg = KernelConfig {
            data_dir: std::env::temp_dir()
                .join(format!("visiblaze-test-{}", Uuid::new_v4()))
                .to_string_lossy()
                .into_owned(),
            ..KernelConfig::default()
        };
        let store = Store::open(StoreConfig {
            data_dir: cfg.data_dir.clone().into(),
            cis_history_limit: cfg.cis_history_limit,
            retry_attempts: cfg.write_retry.attempts,
            retry_backoff_ms: cfg.write_retry.backoff_ms,
        })
        .unwrap();
        AppState { store: Arc::new(store), cfg, started: Instant::now() }
    }

    fn sample_payload() -> IngestPayload {
        serde_json::from_value(serde_json::json!({
            "host": {
                "host_id": "h1",
                "hostname": "web01",
                "os_id": "ubuntu",
                "os_version": "22.04",
                "kernel": "6.8.0-45-generic",
                "ip_addresses": ["10.0.0.5"],
                "agent_version": "0.1.0"
            },
            "packages": [
                {"name": "nginx", "version": "1.24", "arch": "amd64", "manager": "apt", "source": "nginx"}
            ],
            "cis_results": [
                {"check_id": "CIS-1.1", "title": "Ensure password quality", "status": "pass",
                 "evidence": {"minlen": 14}, "ts": "2026-08-30T10:00:00Z"}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_ingest_then_queries() {
        let state = test_state();

        let resp = post_ingest(State(state.clone()), Json(sample_payload())).await.unwrap();
        assert_eq!(resp.0.status, "ok");
        assert!(resp.0.applied);
        assert_eq!(resp.0.changes.packages_added, 1);
        assert_eq!(resp.0.changes.cis_transitions, 1);

        let detail = get_host(State(state.clone()), Path("h1".into())).await.unwrap();
        assert_eq!(detail.0.host.hostname, "web01");
        assert!(!detail.0.host.stale);

        let apps = get_apps(State(state.clone()), Query(HostIdParams { host_id: "h1".into() }))
            .await
            .unwrap();
        assert_eq!(apps.0.packages.len(), 1);
        assert_eq!(apps.0.packages[0].name, "nginx");

        let cis = get_cis_results(State(state.clone()), Query(HostIdParams { host_id: "h1".into() }))
            .await
            .unwrap();
        assert_eq!(cis.0.cis_results.len(), 1);
        assert_eq!(cis.0.cis_results[0].check_id, "CIS-1.1");
        assert_eq!(cis.0.cis_results[0].status.as_str(), "pass");
        // evidence traverse le kernel sans être interprétée
        assert_eq!(cis.0.cis_results[0].evidence["minlen"], 14);
    }

    #[tokio::test]
    async fn test_list_hosts_with_filter_and_pagination() {
        let state = test_state();
        post_ingest(State(state.clone()), Json(sample_payload())).await.unwrap();

        let mut p2 = sample_payload();
        p2.host.host_id = "h2".into();
        p2.host.hostname = "db01".into();
        post_ingest(State(state.clone()), Json(p2)).await.unwrap();

        let all = get_hosts(
            State(state.clone()),
            Query(ListParams { filter: None, limit: None, offset: None }),
        )
        .await;
        assert_eq!(all.0.hosts.len(), 2);

        let filtered = get_hosts(
            State(state.clone()),
            Query(ListParams { filter: Some("WEB".into()), limit: None, offset: None }),
        )
        .await;
        assert_eq!(filtered.0.hosts.len(), 1);
        assert_eq!(filtered.0.hosts[0].host_id, "h1");

        let paged = get_hosts(
            State(state.clone()),
            Query(ListParams { filter: None, limit: Some(1), offset: Some(1) }),
        )
        .await;
        assert_eq!(paged.0.hosts.len(), 1);
        assert_eq!(paged.0.hosts[0].host_id, "h2");
    }

    #[tokio::test]
    async fn test_unknown_host_returns_not_found() {
        let state = test_state();
        let err = get_host(State(state.clone()), Path("ghost".into())).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound { .. }));
        let err = get_apps(State(state.clone()), Query(HostIdParams { host_id: "ghost".into() }))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_payload_returns_validation_error() {
        let state = test_state();
        let mut payload = sample_payload();
        payload.cis_results[0].status = "warning".into();
        let err = post_ingest(State(state.clone()), Json(payload)).await.unwrap_err();
        match err {
            ApiError::Validation(e) => assert_eq!(e.code(), "unknown_status"),
            other => panic!("expected validation error, got {other:?}"),
        }
        // rien ne doit avoir été appliqué
        assert!(state.store.get_host("h1").is_none());
    }

    #[tokio::test]
    async fn test_reingest_same_payload_yields_no_transitions() {
        let state = test_state();
        post_ingest(State(state.clone()), Json(sample_payload())).await.unwrap();
        // receive_time avance entre les deux appels, donc le rapport est
        // re-appliqué (last_seen avance) mais sans aucune transition
        let resp = post_ingest(State(state.clone()), Json(sample_payload())).await.unwrap();
        assert!(resp.0.applied);
        assert_eq!(resp.0.changes.packages_added, 0);
        assert_eq!(resp.0.changes.cis_transitions, 0);
        assert_eq!(resp.0.changes.cis_unchanged, 1);
    }

    #[tokio::test]
    async fn test_system_health_counts() {
        let state = test_state();
        post_ingest(State(state.clone()), Json(sample_payload())).await.unwrap();
        let health = get_system_health(State(state.clone())).await;
        assert_eq!(health.0.hosts_tracked, 1);
        assert_eq!(health.0.ingests_applied, 1);
    }
}
