//! HTTP surface: the Edit API, admin routes and the ingest hook.
//!
//! ```text
//! /api/v1/*          x-user-id identifies the caller
//! /admin/v1/*        bearer admin token (loopback only when unset)
//! /internal/v1/*     bearer admin token, used by the extraction worker
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use folio_store::{
    AccessRecord, AuditAction, AuditEntry, AuditFilter, DocumentRecord, EditReason, EditSession,
    RevisionRef, SessionOutcome, SizeMetrics,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

use crate::archival::{ArchiveStatus, ContentSource};
use crate::error::EditError;
use crate::gate::{CallerMeta, Revocation};
use crate::server::USER_ID_HEADER;
use crate::services::Services;
use crate::session::RecoveryOffer;

/// Largest accepted request body.
const BODY_LIMIT: usize = 8 * 1024 * 1024;

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub admin_token: Option<String>,
}

pub fn build_app(state: AppState, request_timeout: Duration) -> Router {
    let edit_routes = Router::new()
        .route("/save", post(save))
        .route("/session/start", post(start_session))
        .route("/session/heartbeat", post(heartbeat))
        .route("/session/end", post(end_session))
        .route("/documents/{id}/latest", get(latest))
        .route("/documents/{id}/revisions", get(revisions))
        .route("/documents/{id}/export", post(export))
        .with_state(state.clone());

    let admin_routes = Router::new()
        .route("/access/revoke", post(revoke))
        .route("/access/restore", post(restore))
        .route("/access/grant", post(grant))
        .route("/audit", get(audit))
        .route("/sessions/{id}/close", post(close_session))
        .with_state(state.clone())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    let ingest_routes = Router::new()
        .route("/documents", post(register_document))
        .route("/documents/{id}/extracted", post(extracted))
        .with_state(state.clone())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_admin_token,
        ));

    Router::new()
        .route("/livez", get(livez))
        .nest("/api/v1", edit_routes)
        .nest("/admin/v1", admin_routes)
        .nest("/internal/v1", ingest_routes)
        .layer(axum::extract::DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
}

async fn livez() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

// ============================================================================
// Auth and caller extraction
// ============================================================================

/// Check a request against an optional bearer token.
///
/// - Token configured: requires `Authorization: Bearer <token>` (compared by SHA-256 digest)
/// - No token: only loopback callers are accepted
pub fn is_authorized(token: &Option<String>, addr: &SocketAddr, headers: &HeaderMap) -> bool {
    match token {
        Some(expected) => headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|provided| {
                let a = Sha256::digest(provided.as_bytes());
                let b = Sha256::digest(expected.as_bytes());
                a == b
            }),
        None => addr.ip().is_loopback(),
    }
}

pub async fn require_admin_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if is_authorized(&state.admin_token, &addr, request.headers()) {
        next.run(request).await
    } else {
        log::warn!("Rejected admin request from {addr}");
        StatusCode::UNAUTHORIZED.into_response()
    }
}

fn caller_id(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
}

/// The authenticated caller, from `x-user-id`.
#[derive(Debug, Clone, Copy)]
pub struct CallerIdentity(pub Uuid);

impl<S: Send + Sync> FromRequestParts<S> for CallerIdentity {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        caller_id(&parts.headers).map(CallerIdentity).ok_or_else(|| {
            error_response(StatusCode::UNAUTHORIZED, "missing or invalid x-user-id", None)
        })
    }
}

impl<S: Send + Sync> FromRequestParts<S> for CallerMeta {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let ip = ConnectInfo::<SocketAddr>::from_request_parts(parts, state)
            .await
            .ok()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let agent = parts
            .headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(CallerMeta { ip, agent })
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

fn error_response(status: StatusCode, error: impl Into<String>, reason: Option<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
            reason,
        }),
    )
        .into_response()
}

impl IntoResponse for EditError {
    fn into_response(self) -> Response {
        let status = match &self {
            EditError::Validation(_) => StatusCode::BAD_REQUEST,
            EditError::NotFound(_) => StatusCode::NOT_FOUND,
            EditError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            EditError::Conflict(_) => StatusCode::CONFLICT,
            EditError::Storage(e) => {
                log::error!("Storage failure serving request: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let reason = match &self {
            EditError::AccessDenied { reason } => Some(reason.clone()),
            _ => None,
        };
        error_response(status, self.to_string(), reason)
    }
}

// ============================================================================
// Edit API
// ============================================================================

/// Load `session_id` and check it belongs to `user_id` on `doc_id`.
fn owned_session(
    services: &Services,
    user_id: Uuid,
    doc_id: Uuid,
    session_id: Uuid,
) -> Result<EditSession, EditError> {
    let session = services
        .store
        .session(session_id)?
        .ok_or_else(|| EditError::NotFound(format!("session {session_id}")))?;
    if session.user_id != user_id {
        return Err(EditError::denied("session belongs to another user"));
    }
    if session.doc_id != doc_id {
        return Err(EditError::Validation(format!(
            "session {session_id} is not on document {doc_id}"
        )));
    }
    if !session.is_open() {
        return Err(EditError::Validation(format!("session {session_id} has ended")));
    }
    Ok(session)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub document_id: Uuid,
    pub session_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub reason: Option<EditReason>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    pub revision_id: Uuid,
    pub revision_number: u64,
    /// False when the edit extended the current revision in place
    pub created: bool,
}

/// POST /api/v1/save
async fn save(
    State(state): State<AppState>,
    CallerIdentity(user_id): CallerIdentity,
    caller: CallerMeta,
    Json(req): Json<SaveRequest>,
) -> Result<Json<SaveResponse>, EditError> {
    let reason = req.reason.unwrap_or(EditReason::Autosave);
    if matches!(reason, EditReason::Upload | EditReason::Export) {
        return Err(EditError::Validation(format!(
            "reason '{}' is not accepted on save",
            reason.as_str()
        )));
    }
    let services = &state.services;
    owned_session(services, user_id, req.document_id, req.session_id)?;
    services
        .gate
        .require(user_id, req.document_id, AuditAction::Edit, &caller)?;

    let outcome = services.engine.record_edit(
        req.document_id,
        req.session_id,
        user_id,
        &req.content,
        reason,
    )?;
    Ok(Json(SaveResponse {
        revision_id: outcome.revision.id,
        revision_number: outcome.revision.number,
        created: outcome.created,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub document_id: Uuid,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    /// Unsaved content from the client's local storage
    #[serde(default)]
    pub recovery: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_id: Uuid,
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryOffer>,
}

/// POST /api/v1/session/start
async fn start_session(
    State(state): State<AppState>,
    CallerIdentity(user_id): CallerIdentity,
    caller: CallerMeta,
    Json(req): Json<StartRequest>,
) -> Result<Json<StartResponse>, EditError> {
    let services = &state.services;
    services
        .gate
        .require(user_id, req.document_id, AuditAction::Edit, &caller)?;
    let started = services.tracker.start_session(
        req.document_id,
        user_id,
        req.session_id,
        req.recovery,
    )?;
    Ok(Json(StartResponse {
        session_id: started.token,
        created: started.created,
        recovery: started.recovery,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub session_id: Uuid,
}

/// POST /api/v1/session/heartbeat
async fn heartbeat(
    State(state): State<AppState>,
    CallerIdentity(user_id): CallerIdentity,
    Json(req): Json<HeartbeatRequest>,
) -> Result<StatusCode, EditError> {
    state.services.tracker.heartbeat(req.session_id, user_id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndRequest {
    pub session_id: Uuid,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub outcome: Option<SessionOutcome>,
}

/// POST /api/v1/session/end
///
/// Accepts any content type so page-unload beacons work. Once the body
/// parses the answer is always 202; failures are logged.
async fn end_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    caller: CallerMeta,
    body: Bytes,
) -> Response {
    let req: EndRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, format!("invalid body: {e}"), None)
        }
    };
    let outcome = req.outcome.unwrap_or(SessionOutcome::Completed);
    if let Err(e) = state
        .services
        .tracker
        .end_session(req.session_id, caller_id(&headers), req.content, outcome, &caller)
        .await
    {
        log::warn!("End of session {} failed: {e}", req.session_id);
    }
    StatusCode::ACCEPTED.into_response()
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestResponse {
    pub content: String,
    pub revision_number: u64,
    pub source: ContentSource,
}

/// GET /api/v1/documents/{id}/latest
async fn latest(
    State(state): State<AppState>,
    CallerIdentity(user_id): CallerIdentity,
    caller: CallerMeta,
    Path(doc_id): Path<Uuid>,
) -> Result<Json<LatestResponse>, EditError> {
    let services = &state.services;
    services
        .gate
        .require(user_id, doc_id, AuditAction::Read, &caller)?;
    let current = services.store.current_revision(doc_id)?;
    let (content, source) = services.archiver.read_content(&current)?;
    Ok(Json(LatestResponse {
        content,
        revision_number: current.number,
        source,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionSummary {
    pub id: Uuid,
    pub number: u64,
    pub reason: EditReason,
    pub editor_id: Uuid,
    pub created_at: u64,
    pub updated_at: u64,
    pub metrics: SizeMetrics,
    pub is_current: bool,
    pub is_archived: bool,
}

/// GET /api/v1/documents/{id}/revisions
async fn revisions(
    State(state): State<AppState>,
    CallerIdentity(user_id): CallerIdentity,
    caller: CallerMeta,
    Path(doc_id): Path<Uuid>,
) -> Result<Json<Vec<RevisionSummary>>, EditError> {
    let services = &state.services;
    services
        .gate
        .require(user_id, doc_id, AuditAction::Read, &caller)?;
    let list = services
        .store
        .list_revisions(doc_id)?
        .into_iter()
        .map(|rev| RevisionSummary {
            id: rev.id,
            number: rev.number,
            reason: rev.reason,
            editor_id: rev.editor_id,
            created_at: rev.created_at,
            updated_at: rev.updated_at,
            metrics: rev.metrics,
            is_current: rev.is_current,
            is_archived: rev.is_archived,
        })
        .collect();
    Ok(Json(list))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub session_id: Uuid,
    pub content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResponse {
    pub revision_number: u64,
    pub archived: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_pointer: Option<String>,
}

/// POST /api/v1/documents/{id}/export
async fn export(
    State(state): State<AppState>,
    CallerIdentity(user_id): CallerIdentity,
    caller: CallerMeta,
    Path(doc_id): Path<Uuid>,
    Json(req): Json<ExportRequest>,
) -> Result<Json<ExportResponse>, EditError> {
    let services = &state.services;
    owned_session(services, user_id, doc_id, req.session_id)?;
    services
        .gate
        .require(user_id, doc_id, AuditAction::Edit, &caller)?;
    let outcome = services
        .engine
        .export(doc_id, req.session_id, user_id, &req.content)?;

    let number = outcome.revision.number;
    let archived = services
        .archiver
        .archive_within(doc_id, number, services.end_session_budget)
        .await;
    let (archived, archive_pointer) = match archived {
        Ok(ArchiveStatus::Archived { pointer }) => (true, Some(pointer)),
        Ok(ArchiveStatus::AlreadyArchived) => (true, None),
        Ok(ArchiveStatus::NothingToArchive) | Err(_) => (false, None),
    };
    Ok(Json(ExportResponse {
        revision_number: number,
        archived,
        archive_pointer,
    }))
}

// ============================================================================
// Admin API
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub resource_id: Option<Uuid>,
    pub reason: String,
    /// Epoch milliseconds; makes the revocation temporary
    #[serde(default)]
    pub expires_at: Option<u64>,
}

/// POST /admin/v1/access/revoke
async fn revoke(
    State(state): State<AppState>,
    CallerIdentity(admin_id): CallerIdentity,
    caller: CallerMeta,
    Json(req): Json<RevokeRequest>,
) -> Result<Json<AccessRecord>, EditError> {
    let record = state.services.gate.revoke(
        Revocation {
            admin_id,
            user_id: req.user_id,
            resource_id: req.resource_id,
            reason: req.reason,
            expires_at: req.expires_at,
        },
        &caller,
    )?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub user_id: Uuid,
    #[serde(default)]
    pub resource_id: Option<Uuid>,
    pub reason: String,
}

/// POST /admin/v1/access/restore
async fn restore(
    State(state): State<AppState>,
    CallerIdentity(admin_id): CallerIdentity,
    caller: CallerMeta,
    Json(req): Json<RestoreRequest>,
) -> Result<Json<AccessRecord>, EditError> {
    let record = state.services.gate.restore(
        admin_id,
        req.user_id,
        req.resource_id,
        &req.reason,
        &caller,
    )?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRequest {
    pub user_id: Uuid,
    pub resource_id: Uuid,
}

/// POST /admin/v1/access/grant
async fn grant(
    State(state): State<AppState>,
    CallerIdentity(admin_id): CallerIdentity,
    caller: CallerMeta,
    Json(req): Json<GrantRequest>,
) -> Result<Json<AccessRecord>, EditError> {
    let record = state
        .services
        .gate
        .grant(admin_id, req.user_id, req.resource_id, &caller)?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditQuery {
    pub subject_id: Option<Uuid>,
    pub resource_id: Option<Uuid>,
    pub limit: Option<usize>,
}

/// GET /admin/v1/audit
async fn audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditEntry>>, EditError> {
    let filter = AuditFilter {
        subject_id: query.subject_id,
        resource_id: query.resource_id,
        limit: query.limit.unwrap_or(100),
    };
    Ok(Json(state.services.store.audit_entries(&filter)?))
}

#[derive(Debug, Deserialize)]
pub struct CloseRequest {
    pub reason: String,
}

/// POST /admin/v1/sessions/{id}/close
async fn close_session(
    State(state): State<AppState>,
    CallerIdentity(admin_id): CallerIdentity,
    caller: CallerMeta,
    Path(token): Path<Uuid>,
    Json(req): Json<CloseRequest>,
) -> Result<Json<EditSession>, EditError> {
    let session = state
        .services
        .tracker
        .force_close(token, admin_id, &req.reason, &caller)?;
    Ok(Json(session))
}

// ============================================================================
// Ingest
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub document_id: Option<Uuid>,
    pub owner_id: Uuid,
    #[serde(default)]
    pub title: String,
}

/// POST /internal/v1/documents
async fn register_document(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<DocumentRecord>), EditError> {
    let doc_id = req.document_id.unwrap_or_else(Uuid::new_v4);
    let record = state
        .services
        .store
        .register_document(doc_id, req.owner_id, req.title)?;
    log::info!("Registered document {doc_id} for {}", req.owner_id);
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedRequest {
    pub content: String,
    /// Defaults to the document owner
    #[serde(default)]
    pub editor_id: Option<Uuid>,
}

/// POST /internal/v1/documents/{id}/extracted
async fn extracted(
    State(state): State<AppState>,
    Path(doc_id): Path<Uuid>,
    Json(req): Json<ExtractedRequest>,
) -> Result<(StatusCode, Json<RevisionRef>), EditError> {
    let store = &state.services.store;
    let doc = store
        .document(doc_id)?
        .ok_or_else(|| EditError::NotFound(format!("document {doc_id}")))?;
    let editor = req.editor_id.unwrap_or(doc.owner_id);
    let rev = store.ingest_initial_revision(doc_id, editor, &req.content)?;
    log::info!("Revision 0 of {doc_id} ingested");
    Ok((StatusCode::CREATED, Json(rev)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_authorized_with_token() {
        let token = Some("secret".to_string());
        let remote: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert!(!is_authorized(&token, &remote, &headers));

        headers.insert("authorization", "Bearer wrong".parse().unwrap());
        assert!(!is_authorized(&token, &remote, &headers));

        headers.insert("authorization", "Bearer secret".parse().unwrap());
        assert!(is_authorized(&token, &remote, &headers));
    }

    #[test]
    fn test_is_authorized_loopback_fallback() {
        let headers = HeaderMap::new();
        let local: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let remote: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        assert!(is_authorized(&None, &local, &headers));
        assert!(!is_authorized(&None, &remote, &headers));
    }

    #[test]
    fn test_caller_id_header() {
        let user = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        assert_eq!(caller_id(&headers), None);
        headers.insert(USER_ID_HEADER, user.to_string().parse().unwrap());
        assert_eq!(caller_id(&headers), Some(user));
        headers.insert(USER_ID_HEADER, "not-a-uuid".parse().unwrap());
        assert_eq!(caller_id(&headers), None);
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (EditError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (EditError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (EditError::denied("user revoked"), StatusCode::FORBIDDEN),
            (EditError::Conflict("x".into()), StatusCode::CONFLICT),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn test_save_request_reason_defaults() {
        let req: SaveRequest = serde_json::from_str(&format!(
            r#"{{"documentId":"{}","sessionId":"{}","content":"x"}}"#,
            Uuid::nil(),
            Uuid::nil()
        ))
        .unwrap();
        assert!(req.reason.is_none());

        let req: SaveRequest = serde_json::from_str(&format!(
            r#"{{"documentId":"{}","sessionId":"{}","content":"x","reason":"manual"}}"#,
            Uuid::nil(),
            Uuid::nil()
        ))
        .unwrap();
        assert_eq!(req.reason, Some(EditReason::Manual));
    }
}
