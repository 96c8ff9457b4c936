//! HTTP trigger surface for dataset management, ingestion and realtime lookups.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::dataset::{DatasetParams, TaskKind, DEFAULT_TIME_END, DEFAULT_TIME_START};
use crate::error::IngestError;
use crate::pipeline::IngestionOrchestrator;
use crate::registry::{DatasetRecord, RegistryError};
use crate::remote::RemoteError;
use crate::status::IngestionStatus;

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRequest {
    pub name: String,
    pub task_kind: String,
    #[serde(default)]
    pub description: String,
    pub features: Vec<String>,
    #[serde(default)]
    pub target: Option<String>,
    pub start_date: String,
    pub end_date: String,
    #[serde(default)]
    pub time_start: Option<String>,
    #[serde(default)]
    pub time_end: Option<String>,
}

impl DatasetRequest {
    pub fn into_params(self) -> Result<DatasetParams, IngestError> {
        Ok(DatasetParams {
            name: self.name,
            task_kind: TaskKind::parse(&self.task_kind)?,
            description: self.description,
            features: self.features,
            target: self.target.filter(|target| !target.trim().is_empty()),
            start_date: self.start_date,
            end_date: self.end_date,
            time_start: self
                .time_start
                .unwrap_or_else(|| DEFAULT_TIME_START.to_string()),
            time_end: self.time_end.unwrap_or_else(|| DEFAULT_TIME_END.to_string()),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    error_kind: &'static str,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct RealtimeBody {
    point_id: String,
    value: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub task_kind: Option<String>,
}

#[derive(Clone)]
struct IngestAppState {
    orchestrator: Arc<IngestionOrchestrator>,
}

pub fn ingest_router(orchestrator: Arc<IngestionOrchestrator>) -> Router {
    Router::new()
        .route("/datasets", post(create_dataset).get(list_datasets))
        .route("/datasets/{name}", get(get_dataset).delete(delete_dataset))
        .route("/datasets/{name}/ingest", post(trigger_ingest))
        .route("/points/{point_id}/realtime", get(get_realtime))
        .with_state(IngestAppState { orchestrator })
}

async fn create_dataset(
    State(state): State<IngestAppState>,
    Json(request): Json<DatasetRequest>,
) -> Response {
    let params = match request.into_params() {
        Ok(params) => params,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.kind(), err.to_string()),
    };
    if let Err(err) = params.resolve() {
        return error_response(StatusCode::BAD_REQUEST, err.kind(), err.to_string());
    }
    if let Err(err) = state.orchestrator.store().table_path(&params.name) {
        return error_response(StatusCode::BAD_REQUEST, "invalid_dataset_name", err.to_string());
    }

    let record = match state.orchestrator.registry().create(&params) {
        Ok(record) => record,
        Err(RegistryError::AlreadyExists(name)) => {
            return error_response(
                StatusCode::CONFLICT,
                "dataset_exists",
                format!("dataset {name} already exists"),
            )
        }
        Err(err) => return internal_error(err.into()),
    };

    info!(
        component = "ingest_server",
        event = "dataset.created",
        dataset = %record.params.name
    );
    spawn_run(&state, record.params.name.clone());
    (StatusCode::ACCEPTED, Json(record)).into_response()
}

async fn list_datasets(
    State(state): State<IngestAppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let registry = state.orchestrator.registry();
    let listed = match query.task_kind.as_deref() {
        None => registry.list(),
        Some(raw) => match TaskKind::parse(raw) {
            Ok(task_kind) => registry.list_by_task_kind(task_kind),
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, err.kind(), err.to_string())
            }
        },
    };
    match listed {
        Ok(records) => Json(records).into_response(),
        Err(err) => internal_error(err.into()),
    }
}

async fn get_dataset(State(state): State<IngestAppState>, Path(name): Path<String>) -> Response {
    match load_or_404(&state, &name) {
        Ok(record) => Json(record).into_response(),
        Err(response) => response,
    }
}

async fn delete_dataset(
    State(state): State<IngestAppState>,
    Path(name): Path<String>,
) -> Response {
    let orchestrator = Arc::clone(&state.orchestrator);
    let target = name.clone();
    let joined = tokio::task::spawn_blocking(move || orchestrator.delete_dataset(&target)).await;

    match joined {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(err @ IngestError::DatasetNotFound(_))) => {
            error_response(StatusCode::NOT_FOUND, err.kind(), err.to_string())
        }
        Ok(Err(err @ IngestError::RunInProgress(_))) => {
            error_response(StatusCode::CONFLICT, err.kind(), err.to_string())
        }
        Ok(Err(err)) => internal_error(err),
        Err(join_err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            join_err.to_string(),
        ),
    }
}

async fn trigger_ingest(
    State(state): State<IngestAppState>,
    Path(name): Path<String>,
) -> Response {
    let record = match load_or_404(&state, &name) {
        Ok(record) => record,
        Err(response) => return response,
    };
    if record.status == IngestionStatus::Running {
        let err = IngestError::RunInProgress(name);
        return error_response(StatusCode::CONFLICT, err.kind(), err.to_string());
    }

    spawn_run(&state, name);
    (StatusCode::ACCEPTED, Json(record)).into_response()
}

async fn get_realtime(
    State(state): State<IngestAppState>,
    Path(point_id): Path<String>,
) -> Response {
    let orchestrator = Arc::clone(&state.orchestrator);
    let lookup_id = point_id.clone();
    let joined =
        tokio::task::spawn_blocking(move || orchestrator.client().fetch_realtime(&lookup_id))
            .await;

    match joined {
        Ok(Ok(value)) => Json(RealtimeBody { point_id, value }).into_response(),
        Ok(Err(RemoteError::EmptyPointId)) => error_response(
            StatusCode::BAD_REQUEST,
            RemoteError::EmptyPointId.kind(),
            RemoteError::EmptyPointId.to_string(),
        ),
        Ok(Err(err)) => error_response(StatusCode::BAD_GATEWAY, err.kind(), err.to_string()),
        Err(join_err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            join_err.to_string(),
        ),
    }
}

fn spawn_run(state: &IngestAppState, name: String) {
    let orchestrator = Arc::clone(&state.orchestrator);
    info!(
        component = "ingest_server",
        event = "ingest.scheduled",
        dataset = %name
    );
    tokio::task::spawn_blocking(move || {
        // outcome is persisted and logged by the orchestrator
        let _ = orchestrator.run(&name);
    });
}

fn load_or_404(state: &IngestAppState, name: &str) -> Result<DatasetRecord, Response> {
    match state.orchestrator.registry().load(name) {
        Ok(Some(record)) => Ok(record),
        Ok(None) => {
            let err = IngestError::DatasetNotFound(name.to_string());
            Err(error_response(StatusCode::NOT_FOUND, err.kind(), err.to_string()))
        }
        Err(err) => Err(internal_error(err.into())),
    }
}

fn internal_error(err: IngestError) -> Response {
    error!(
        component = "ingest_server",
        event = "http.internal_error",
        error_kind = err.kind(),
        error = %err
    );
    error_response(StatusCode::INTERNAL_SERVER_ERROR, err.kind(), err.to_string())
}

fn error_response(status: StatusCode, error_kind: &'static str, message: String) -> Response {
    (status, Json(ErrorBody { error_kind, message })).into_response()
}
