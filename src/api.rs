//! Public observer read API.
//!
//! Unauthenticated by design: anyone can replicate and verify the chain.
//! Errors are problem-details JSON. All limits apply identically to every
//! caller.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::anchor::{MerkleAnchor, ProofOutcome};
use crate::canonical::CANONICAL_VERSION;
use crate::config::ApiConfig;
use crate::crypto::{GENESIS_ANCHOR, HASH_ALG_NAME, SIG_ALG_NAME, SIG_ALG_VERSION, SignerHandle};
use crate::error::StoreError;
use crate::export::{self, ExportFormat};
use crate::store::{EventStore, verify_events};

pub struct ApiState {
    pub store: Arc<EventStore>,
    pub anchor: Arc<MerkleAnchor>,
    /// Signs export attestations.
    pub authority: SignerHandle,
    pub cfg: ApiConfig,
}

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::InvalidRange { from, to } => {
                Self::BadRequest(format!("invalid sequence range {from}..={to}"))
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<crate::error::StorageError> for ApiError {
    fn from(e: crate::error::StorageError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, title, detail) = match self {
            Self::NotFound(detail) => (StatusCode::NOT_FOUND, "Not Found", detail),
            Self::BadRequest(detail) => (StatusCode::BAD_REQUEST, "Bad Request", detail),
            Self::Internal(detail) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Error", detail)
            }
        };
        let body = json!({
            "type": "about:blank",
            "title": title,
            "status": status.as_u16(),
            "detail": detail,
        });
        (status, axum::Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub as_of_sequence: Option<u64>,
    pub include_proof: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
    pub start_sequence: Option<u64>,
    pub end_sequence: Option<u64>,
    pub event_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AttestationQuery {
    pub start_sequence: u64,
    pub end_sequence: u64,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/observer/events", get(list_events))
        .route("/v1/observer/events/sequence/:sequence", get(event_by_sequence))
        .route(
            "/v1/observer/events/sequence/:sequence/merkle-proof",
            get(merkle_proof),
        )
        .route("/v1/observer/events/:event_id", get(event_by_id))
        .route("/v1/observer/checkpoints", get(list_checkpoints))
        .route("/v1/observer/verification-spec", get(verification_spec))
        .route("/v1/observer/export", get(export_events))
        .route("/v1/observer/export/attestation", get(export_attestation))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<ApiState>, bind: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "observer read API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn list_events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<EventsQuery>,
) -> Result<axum::Json<Value>, ApiError> {
    let head = state.store.head();
    let as_of = query.as_of_sequence.map(|s| s.min(head));
    let ceiling = as_of.unwrap_or(head);
    let limit = query
        .limit
        .unwrap_or(100)
        .min(state.cfg.page_limit_max)
        .max(1);
    let offset = query.offset.unwrap_or(0);

    let from = offset + 1;
    let events = if from > ceiling {
        Vec::new()
    } else {
        state.store.range(from, ceiling, limit as usize)?
    };
    let returned = events.len() as u64;

    let mut wire = Vec::with_capacity(events.len());
    for event in &events {
        wire.push(serde_json::to_value(event.to_wire()?).expect("wire event serializes"));
    }

    // Hash-chain proof over the constrained range; signature verification
    // is the observer toolkit's job, with the published keys.
    let proof = match (as_of, query.include_proof.unwrap_or(false)) {
        (Some(as_of), true) if as_of >= 1 => {
            let all = state.store.range(1, as_of, usize::MAX)?;
            let report = verify_events(&all, 1, as_of, None, None);
            Some(json!({
                "as_of_sequence": as_of,
                "head_content_hash": all.last().map(|e| e.content_hash.clone()),
                "chain_verified": report.valid,
            }))
        }
        _ => None,
    };

    Ok(axum::Json(json!({
        "events": wire,
        "pagination": {
            "limit": limit,
            "offset": offset,
            "total": ceiling,
            "has_more": offset + returned < ceiling,
        },
        "historical_query": as_of.is_some(),
        "proof": proof,
    })))
}

async fn event_by_id(
    State(state): State<Arc<ApiState>>,
    Path(event_id): Path<String>,
) -> Result<axum::Json<Value>, ApiError> {
    let record = state.store.read_by_event_id(&event_id)?;
    Ok(axum::Json(
        serde_json::to_value(record.to_wire()?).expect("wire event serializes"),
    ))
}

async fn event_by_sequence(
    State(state): State<Arc<ApiState>>,
    Path(sequence): Path<u64>,
) -> Result<axum::Json<Value>, ApiError> {
    let record = state.store.read_by_sequence(sequence)?;
    Ok(axum::Json(
        serde_json::to_value(record.to_wire()?).expect("wire event serializes"),
    ))
}

async fn merkle_proof(
    State(state): State<Arc<ApiState>>,
    Path(sequence): Path<u64>,
) -> Result<axum::Json<Value>, ApiError> {
    match state.anchor.inclusion_proof(&state.store, sequence)? {
        ProofOutcome::Proof(proof) => Ok(axum::Json(
            serde_json::to_value(proof).expect("proof serializes"),
        )),
        ProofOutcome::Pending => Err(ApiError::NotFound(format!(
            "sequence {sequence} is in the unanchored tail"
        ))),
    }
}

async fn list_checkpoints(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PageQuery>,
) -> Result<axum::Json<Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(10)
        .min(state.cfg.page_limit_max)
        .max(1);
    let offset = query.offset.unwrap_or(0);
    let checkpoints = state.anchor.list(limit as usize, offset as usize)?;
    let total = state.anchor.count();

    Ok(axum::Json(json!({
        "checkpoints": checkpoints.iter().map(|cp| cp.to_wire()).collect::<Vec<_>>(),
        "pagination": {
            "limit": limit,
            "offset": offset,
            "total": total,
            "has_more": (offset + (checkpoints.len() as u64) < total),
        },
    })))
}

/// The exact rules an external verifier needs to recompute hashes and
/// check signatures.
async fn verification_spec(State(_state): State<Arc<ApiState>>) -> axum::Json<Value> {
    axum::Json(json!({
        "hash_algorithm": HASH_ALG_NAME,
        "hash_algorithm_version": CANONICAL_VERSION,
        "signature_algorithm": SIG_ALG_NAME,
        "sig_alg_version": SIG_ALG_VERSION,
        "genesis_anchor": GENESIS_ANCHOR,
        "canonical_encoding": {
            "version": CANONICAL_VERSION,
            "form": "UTF-8 JSON, object keys sorted lexicographically, separators ',' and ':', no insignificant whitespace, minimal string escaping, numbers in shortest round-trip form",
            "content_fields": [
                "agent_id", "authority_timestamp", "event_id", "event_type",
                "hash_algorithm_version", "local_timestamp", "payload",
                "sequence", "witness_id",
            ],
            "signable": "canonical JSON of {agent_id, content_hash, prev_hash}; prev_hash binds the signature to chain position",
        },
        "signature_encoding": "base64 in transport, raw 64 bytes at rest",
    }))
}

async fn export_events(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let format = ExportFormat::parse(query.format.as_deref().unwrap_or("jsonl"))
        .ok_or_else(|| ApiError::BadRequest("format must be jsonl or csv".into()))?;
    let start = query.start_sequence.unwrap_or(1);
    let end = query.end_sequence.unwrap_or_else(|| state.store.head());
    if start == 0 || end < start {
        return Err(ApiError::BadRequest(format!(
            "invalid export range {start}..={end}"
        )));
    }

    let body = match format {
        ExportFormat::Jsonl => {
            export::export_jsonl(&state.store, start, end, query.event_type.as_deref())?
        }
        ExportFormat::Csv => {
            export::export_csv(&state.store, start, end, query.event_type.as_deref())?
        }
    };
    Ok(([(header::CONTENT_TYPE, format.content_type())], body).into_response())
}

async fn export_attestation(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AttestationQuery>,
) -> Result<axum::Json<Value>, ApiError> {
    if query.start_sequence == 0 || query.end_sequence < query.start_sequence {
        return Err(ApiError::BadRequest(format!(
            "invalid attestation range {}..={}",
            query.start_sequence, query.end_sequence
        )));
    }
    let attestation = export::build_attestation(
        &state.store,
        query.start_sequence,
        query.end_sequence,
        &state.authority,
    )?;
    Ok(axum::Json(
        serde_json::to_value(attestation).expect("attestation serializes"),
    ))
}
