//! HTTP surface of the engine.
use axum::{
    extract::{Json, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use para_schemas::{Adjustment, Category, LearningKnowledge, MetricName, NoteId};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::engine::ClassificationEngine;
use crate::error::EngineError;

type ApiResult<T> = Result<T, (StatusCode, String)>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ClassificationEngine>,
}

pub fn router(engine: Arc<ClassificationEngine>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/classify", post(classify))
        .route("/corrections", post(submit_correction))
        .route("/notes/:note_id/history", get(note_history))
        // Learning
        .route("/snapshot", get(latest_snapshot).post(compute_snapshot))
        .route("/trend/:metric", get(metric_trend))
        .route("/progress", get(progress))
        .route("/suggestions", get(suggestions))
        .route("/performance", get(category_performance))
        .route("/factors", get(factor_analysis))
        .route("/knowledge", get(export_knowledge).post(import_knowledge))
        // Tuning
        .route("/weights", get(current_weights))
        .route("/tuning/proposals", get(tuning_proposals))
        .route("/tuning/apply", post(apply_tuning))
        .route("/export", get(export_feedback))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

fn api_error(err: EngineError) -> (StatusCode, String) {
    let status = match &err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Input(_) => StatusCode::BAD_REQUEST,
        EngineError::CollaboratorUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }
    (status, err.to_string())
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "para-engine",
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "weights_version": state.engine.weights_version(),
    }))
}

#[derive(Debug, Deserialize)]
struct ClassifyRequest {
    note_id: Option<String>,
    path: Option<PathBuf>,
    text: Option<String>,
}

async fn classify(
    State(state): State<AppState>,
    Json(req): Json<ClassifyRequest>,
) -> ApiResult<impl IntoResponse> {
    let note_id = match (&req.note_id, &req.path) {
        (Some(id), _) => NoteId::new(id.clone()),
        (None, Some(path)) => NoteId::from_path(path),
        (None, None) => {
            return Err((StatusCode::BAD_REQUEST, "note_id or path is required".to_string()))
        }
    };

    let decision = match req.text {
        Some(text) => {
            let metadata = para_schemas::NoteMetadata {
                path: req.path.clone(),
                modified: None,
                size_bytes: Some(text.len() as u64),
            };
            state.engine.classify_text(&note_id, &text, &metadata).await
        }
        None => state.engine.classify_note(&note_id).await,
    }
    .map_err(api_error)?;

    let needs_review = decision.requires_review(state.engine.current_weights().confidence_threshold());
    Ok(Json(serde_json::json!({
        "decision": decision,
        "needs_review": needs_review,
    })))
}

#[derive(Debug, Deserialize)]
struct CorrectionRequest {
    note_id: String,
    category: Category,
    reason: Option<String>,
}

async fn submit_correction(
    State(state): State<AppState>,
    Json(req): Json<CorrectionRequest>,
) -> ApiResult<impl IntoResponse> {
    let correction = state
        .engine
        .submit_correction(&NoteId::new(req.note_id), req.category, req.reason)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(correction)))
}

async fn note_history(
    State(state): State<AppState>,
    Path(note_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let entries = state
        .engine
        .history(&NoteId::new(note_id))
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "entries": entries })))
}

async fn latest_snapshot(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    match state.engine.latest_snapshot().await.map_err(api_error)? {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err((StatusCode::NOT_FOUND, "no snapshot recorded yet".to_string())),
    }
}

async fn compute_snapshot(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let snapshot = state.engine.get_snapshot().await.map_err(api_error)?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize, Default)]
struct DaysQuery {
    days: Option<u32>,
}

async fn metric_trend(
    State(state): State<AppState>,
    Path(metric): Path<String>,
    query: Option<Query<DaysQuery>>,
) -> ApiResult<impl IntoResponse> {
    let metric: MetricName = metric
        .parse()
        .map_err(|e: para_schemas::ParseMetricError| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let days = query.and_then(|q| q.0.days);
    let points = state.engine.get_trend(metric, days).await.map_err(api_error)?;
    Ok(Json(serde_json::json!({ "metric": metric, "points": points })))
}

async fn progress(
    State(state): State<AppState>,
    query: Option<Query<DaysQuery>>,
) -> ApiResult<impl IntoResponse> {
    let days = query.and_then(|q| q.0.days).unwrap_or(30);
    let progress = state.engine.progress(days).await.map_err(api_error)?;
    Ok(Json(progress))
}

async fn suggestions(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let suggestions = state.engine.suggest_improvements().await.map_err(api_error)?;
    Ok(Json(serde_json::json!({ "suggestions": suggestions })))
}

async fn category_performance(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let categories = state.engine.category_performance().await.map_err(api_error)?;
    Ok(Json(serde_json::json!({ "categories": categories })))
}

async fn factor_analysis(
    State(state): State<AppState>,
    query: Option<Query<DaysQuery>>,
) -> ApiResult<impl IntoResponse> {
    let days = query.and_then(|q| q.0.days).unwrap_or(30);
    let factors = state.engine.factor_analysis(Some(days)).await.map_err(api_error)?;
    Ok(Json(serde_json::json!({ "period_days": days, "factors": factors })))
}

async fn export_knowledge(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let knowledge = state.engine.export_learning_knowledge().await.map_err(api_error)?;
    Ok(Json(knowledge))
}

#[derive(Debug, Deserialize)]
struct ImportRequest {
    knowledge: LearningKnowledge,
    #[serde(default)]
    confirm: bool,
}

async fn import_knowledge(
    State(state): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> ApiResult<impl IntoResponse> {
    if !req.confirm {
        return Err((
            StatusCode::BAD_REQUEST,
            "knowledge is only imported with \"confirm\": true".to_string(),
        ));
    }

    let imported = state
        .engine
        .import_learning_knowledge(req.knowledge)
        .await
        .map_err(api_error)?;
    Ok(Json(imported))
}

async fn current_weights(State(state): State<AppState>) -> impl IntoResponse {
    let table = state.engine.current_weights();
    Json(serde_json::json!({
        "version": state.engine.weights_version(),
        "table": table.as_ref(),
    }))
}

async fn tuning_proposals(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let adjustments = state.engine.propose_adjustments().await.map_err(api_error)?;
    Ok(Json(serde_json::json!({ "adjustments": adjustments })))
}

#[derive(Debug, Deserialize)]
struct ApplyRequest {
    adjustments: Vec<Adjustment>,
    #[serde(default)]
    confirm: bool,
}

async fn apply_tuning(
    State(state): State<AppState>,
    Json(req): Json<ApplyRequest>,
) -> ApiResult<impl IntoResponse> {
    if !req.confirm {
        return Err((
            StatusCode::BAD_REQUEST,
            "adjustments are only applied with \"confirm\": true".to_string(),
        ));
    }

    info!("Applying {} confirmed adjustments", req.adjustments.len());
    let table = state
        .engine
        .apply_adjustments(req.adjustments)
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({
        "version": state.engine.weights_version(),
        "table": table,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct ExportQuery {
    #[serde(default)]
    include_uncorrected: bool,
}

async fn export_feedback(
    State(state): State<AppState>,
    query: Option<Query<ExportQuery>>,
) -> ApiResult<impl IntoResponse> {
    let include_uncorrected = query.map(|q| q.0.include_uncorrected).unwrap_or(false);
    let engine = state.engine.clone();

    let body = tokio::task::spawn_blocking(move || {
        let mut buf = Vec::new();
        engine
            .export_feedback_dataset(&mut buf, include_uncorrected)
            .map(|_| buf)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(api_error)?;

    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body))
}
