use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};
use tracing::info;

use crate::api::params::{actor_from_headers, parse_id, ArchiveRequest, FilterParams, ListParams, VerifyChainParams};
use crate::api::AppState;
use crate::audit::entry::AuditEvent;
use crate::error::AuditResult;

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "audit-ledger",
        "timestamp": chrono::Utc::now()
    }))
}

pub async fn stats(State(state): State<AppState>) -> AuditResult<Json<Value>> {
    let stats = state.ledger.stats.get_stats().await?;
    Ok(Json(serde_json::to_value(stats)?))
}

pub async fn verify_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AuditResult<Json<Value>> {
    let id = parse_id("id", &id)?;
    let result = state.ledger.verifier.verify_one(id).await?;
    Ok(Json(serde_json::to_value(result)?))
}

pub async fn verify_chain(
    State(state): State<AppState>,
    Query(params): Query<VerifyChainParams>,
) -> AuditResult<Json<Value>> {
    let (start_id, end_id) = params.bounds()?;
    let result = state.ledger.verifier.verify_range(start_id, end_id).await?;
    Ok(Json(serde_json::to_value(result)?))
}

pub async fn metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AuditResult<Json<Value>> {
    let id = parse_id("id", &id)?;
    let metadata = state.ledger.query.metadata_for(id).await?;
    Ok(Json(serde_json::to_value(metadata)?))
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> AuditResult<Json<Value>> {
    let (page, limit) = params.paging()?;
    let filter = params.filter.to_filter()?;
    let page = state.ledger.query.list(page, limit, &filter).await?;
    Ok(Json(serde_json::to_value(page)?))
}

/// Download a verifiable snapshot. The export itself is recorded in the ledger.
pub async fn export(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<FilterParams>,
) -> AuditResult<Response> {
    let filter = params.to_filter()?;
    let actor = actor_from_headers(&headers);
    let snapshot = state.ledger.export.export(&filter, &actor).await?;

    let disposition = format!("attachment; filename=\"{}\"", snapshot.file_name());
    Ok((
        [(header::CONTENT_DISPOSITION, disposition)],
        Json(serde_json::to_value(snapshot)?),
    )
        .into_response())
}

pub async fn append_event(
    State(state): State<AppState>,
    Json(event): Json<AuditEvent>,
) -> AuditResult<(StatusCode, Json<Value>)> {
    let entry = state.ledger.writer.append(event).await?;
    Ok((StatusCode::CREATED, Json(serde_json::to_value(entry)?)))
}

pub async fn archive(
    State(state): State<AppState>,
    Json(request): Json<ArchiveRequest>,
) -> AuditResult<Json<Value>> {
    let now = state.ledger.writer.clock().now();
    let cutoff = request.cutoff(state.config.archive.retention_days, now)?;
    let moved = state.ledger.partitioner.archive_all_up_to(cutoff).await?;

    info!(partitions = moved.len(), ?cutoff, "Archive run finished");
    Ok(Json(json!({
        "cutoff": cutoff,
        "partitions": moved,
    })))
}
