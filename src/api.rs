// src/api.rs

//! HTTP API surface.
//!
//! JSON over HTTP, authenticated by a configured list of bearer tokens
//! (TLS is terminated in front of the server). Handlers never touch target
//! history: submissions create fresh records directly in the store, and
//! every mutation of existing targets goes through the durable command
//! pipe for the engine to apply on its next tick.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{info, warn};

use crate::backend::BackendRegistry;
use crate::config::ServerSection;
use crate::engine::{append_command, run_query, validate_submission, Command};
use crate::errors::{GridflowError, Result};
use crate::filter::parse_filter;
use crate::protocol::{
    ErrorBody, IdsRequest, OkResponse, QueryRequest, QueryResponse, SubmitRequest,
    SubmitResponse, TargetSummary,
};
use crate::store::Store;
use crate::target::BuildProcess;

#[derive(Clone)]
pub struct ApiState {
    store: Store,
    registry: BackendRegistry,
    tokens: Arc<Vec<String>>,
    commands_log: PathBuf,
}

/// Bind and serve until the process stops.
pub async fn serve(server: &ServerSection, store: Store, registry: BackendRegistry) -> Result<()> {
    if server.auth_tokens.is_empty() {
        return Err(GridflowError::ConfigError(
            "refusing to serve the API without any configured auth tokens".to_string(),
        ));
    }

    let state = ApiState {
        commands_log: store.commands_log_path(),
        store,
        registry,
        tokens: Arc::new(server.auth_tokens.clone()),
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server.port)).await?;
    info!(port = server.port, "API server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/submit", post(submit))
        .route("/api/query", post(query))
        .route("/api/target/:id", get(get_target))
        .route("/api/target/:id/artifact/:name", get(get_artifact))
        .route("/api/kill", post(kill))
        .route("/api/restart", post(restart))
        .route("/api/activate", post(activate))
        .with_state(state)
}

fn authorized(state: &ApiState, headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let Some(token) = value.strip_prefix("Bearer ") else {
        return false;
    };
    state.tokens.iter().any(|t| t == token)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: "invalid or missing bearer token".to_string(),
        }),
    )
        .into_response()
}

fn bad_request(error: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(ErrorBody { error })).into_response()
}

fn not_found(error: String) -> Response {
    (StatusCode::NOT_FOUND, Json(ErrorBody { error })).into_response()
}

fn internal(error: impl std::fmt::Display) -> Response {
    warn!(%error, "API request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
        .into_response()
}

async fn submit(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<SubmitRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    let mut targets = Vec::with_capacity(request.targets.len());
    let mut to_activate = Vec::new();
    for spec in request.targets {
        let active = spec.active;
        match spec.into_target(&state.registry) {
            Ok(target) => {
                if active {
                    to_activate.push(target.id.clone());
                }
                targets.push(target);
            }
            Err(error) => return bad_request(error),
        }
    }

    match validate_submission(&state.store, &targets).await {
        Ok(()) => {}
        Err(e @ (GridflowError::ConfigError(_)
        | GridflowError::DependencyCycle(_)
        | GridflowError::TargetNotFound(_))) => return bad_request(e.to_string()),
        Err(e) => return internal(e),
    }

    let mut ids = Vec::with_capacity(targets.len());
    for target in &targets {
        if let Err(e) = state.store.create(target).await {
            return internal(e);
        }
        ids.push(target.id.clone());
    }
    for id in to_activate {
        if let Err(e) = append_command(&state.commands_log, &Command::Activate(id)).await {
            return internal(e);
        }
    }

    (StatusCode::OK, Json(SubmitResponse { ids })).into_response()
}

async fn query(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }

    // Filter syntax errors go back verbatim, location included.
    let filter = match parse_filter(&request.filter) {
        Ok(filter) => filter,
        Err(e) => return bad_request(e.to_string()),
    };

    match run_query(&state.store, &filter, chrono::Utc::now()).await {
        Ok(matching) => {
            let summaries = matching.iter().map(TargetSummary::of).collect();
            (StatusCode::OK, Json(QueryResponse { summaries })).into_response()
        }
        Err(e) => internal(e),
    }
}

async fn get_target(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    match state.store.maybe_get(&id).await {
        Ok(Some(target)) => (StatusCode::OK, Json(target)).into_response(),
        Ok(None) => not_found(format!("no such target: {id}")),
        Err(e) => internal(e),
    }
}

async fn get_artifact(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((id, name)): Path<(String, String)>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    let target = match state.store.maybe_get(&id).await {
        Ok(Some(target)) => target,
        Ok(None) => return not_found(format!("no such target: {id}")),
        Err(e) => return internal(e),
    };

    let (backend_name, rp) = match &target.build_process {
        BuildProcess::LongRunning {
            backend,
            run_parameters,
        } => (backend, run_parameters),
        BuildProcess::NoOperation => {
            return bad_request("target has no build process to query".to_string())
        }
    };
    let Some(backend) = state.registry.get(backend_name) else {
        return bad_request(format!("no such backend: {backend_name}"));
    };

    match backend.query(rp, &target.host, &name).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(error) => bad_request(error),
    }
}

async fn kill(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<IdsRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    enqueue_for_each(&state, request.ids, Command::Kill).await
}

async fn restart(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<IdsRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    enqueue_for_each(&state, request.ids, Command::Restart).await
}

async fn activate(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<IdsRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return unauthorized();
    }
    enqueue_for_each(&state, request.ids, Command::Activate).await
}

async fn enqueue_for_each(
    state: &ApiState,
    ids: Vec<String>,
    make: fn(String) -> Command,
) -> Response {
    for id in ids {
        if let Err(e) = append_command(&state.commands_log, &make(id)).await {
            return internal(e);
        }
    }
    (StatusCode::OK, Json(OkResponse { ok: true })).into_response()
}
