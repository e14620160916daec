use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use view_ledger_api::{
    parse_timestamp, CategoryDirectory, HttpCategoryDirectory, MigrateResult, UncheckedDirectory,
    ViewRequest, ViewsApi, ViewsError, API_CONTRACT_VERSION,
};
use view_ledger_core::{SystemClock, ViewComposite};
use view_ledger_store_sqlite::SchemaStatus;

mod config;

use config::{Args, ServiceConfig};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

type ServiceApi = ViewsApi<SystemClock, Box<dyn CategoryDirectory + Send + Sync>>;

#[derive(Clone)]
struct ServiceState {
    api: Arc<ServiceApi>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    kind: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ListQuery {
    name: Option<String>,
}

impl ListQuery {
    /// A blank `?name=` lists every view.
    fn name_filter(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RevisionAtQuery {
    created_at: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

impl ServiceError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            kind,
            error: message.into(),
            status,
        }
    }
}

impl From<ViewsError> for ServiceError {
    fn from(err: ViewsError) -> Self {
        match &err {
            ViewsError::Validation(_) => Self::new(StatusCode::BAD_REQUEST, "validation", err.to_string()),
            ViewsError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", err.to_string()),
            ViewsError::Internal(_) => {
                error!(error = %err, "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Run a blocking API call off the async runtime and wrap the result.
async fn run_blocking<T, F>(
    state: &ServiceState,
    op: F,
) -> Result<Json<ServiceEnvelope<T>>, ServiceError>
where
    T: Serialize + Send + 'static,
    F: FnOnce(&ServiceApi) -> Result<T, ViewsError> + Send + 'static,
{
    let api = Arc::clone(&state.api);
    let outcome = tokio::task::spawn_blocking(move || op(&api)).await.map_err(|err| {
        ServiceError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("blocking task failed: {err}"),
        )
    })?;
    Ok(Json(envelope(outcome?)))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/views", post(view_create).get(view_list))
        .route("/v1/views/:key", get(view_get).put(view_update).delete(view_delete))
        .route("/v1/views/:key/revisions", get(view_history))
        .route("/v1/views/:key/revisions/at", get(view_revision_at))
        .with_state(state)
}

fn directory_for(config: &ServiceConfig) -> Box<dyn CategoryDirectory + Send + Sync> {
    match &config.categories_url {
        Some(url) => Box::new(HttpCategoryDirectory::new(url.clone())),
        None => Box::new(UncheckedDirectory),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServiceConfig::from_args(Args::parse())?;
    let api = ViewsApi::with_parts(config.db.clone(), SystemClock, directory_for(&config));
    let state = ServiceState { api: Arc::new(api) };

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    info!(
        bind = %config.bind,
        db = %config.db.display(),
        categories_checked = config.categories_url.is_some(),
        "view ledger service listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    run_blocking(&state, ServiceApi::schema_status).await
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    run_blocking(&state, move |api| api.migrate(request.dry_run)).await
}

async fn view_create(
    State(state): State<ServiceState>,
    Json(request): Json<ViewRequest>,
) -> Result<Json<ServiceEnvelope<ViewComposite>>, ServiceError> {
    run_blocking(&state, move |api| api.create(&request)).await
}

async fn view_list(
    State(state): State<ServiceState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ServiceEnvelope<Vec<ViewComposite>>>, ServiceError> {
    run_blocking(&state, move |api| api.list(query.name_filter())).await
}

async fn view_get(
    State(state): State<ServiceState>,
    Path(key): Path<String>,
) -> Result<Json<ServiceEnvelope<ViewComposite>>, ServiceError> {
    run_blocking(&state, move |api| api.get(&key)).await
}

async fn view_update(
    State(state): State<ServiceState>,
    Path(key): Path<String>,
    Json(request): Json<ViewRequest>,
) -> Result<Json<ServiceEnvelope<ViewComposite>>, ServiceError> {
    run_blocking(&state, move |api| api.update(&key, &request)).await
}

async fn view_delete(
    State(state): State<ServiceState>,
    Path(key): Path<String>,
) -> Result<Json<ServiceEnvelope<ViewComposite>>, ServiceError> {
    run_blocking(&state, move |api| api.delete(&key)).await
}

async fn view_history(
    State(state): State<ServiceState>,
    Path(key): Path<String>,
) -> Result<Json<ServiceEnvelope<Vec<ViewComposite>>>, ServiceError> {
    run_blocking(&state, move |api| api.history(&key)).await
}

async fn view_revision_at(
    State(state): State<ServiceState>,
    Path(key): Path<String>,
    Query(query): Query<RevisionAtQuery>,
) -> Result<Json<ServiceEnvelope<ViewComposite>>, ServiceError> {
    let created_at = parse_timestamp(&query.created_at)?;
    run_blocking(&state, move |api| api.revision_at(&key, created_at)).await
}
