//! HTTP-level tests for the edit, admin and ingest routes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use folio_live::api::{build_app, AppState};
use folio_live::config::Config;
use folio_live::services::Services;
use folio_store::{DocumentStore, FsArchive, ManualClock, ParentDocumentResolver, StoreConfig};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

const ADMIN_TOKEN: &str = "admin-secret";

struct Harness {
    _dir: TempDir,
    app: Router,
    services: Arc<Services>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = Arc::new(
        DocumentStore::open_with(
            StoreConfig::for_testing(dir.path().join("db")),
            clock.clone(),
            Arc::new(ParentDocumentResolver),
        )
        .unwrap(),
    );
    let archive = Arc::new(FsArchive::open(dir.path().join("archive")).unwrap());
    let services = Arc::new(Services::assemble(store, archive, &Config::default()));
    let state = AppState {
        services: services.clone(),
        admin_token: Some(ADMIN_TOKEN.to_string()),
    };
    let remote: SocketAddr = "10.1.2.3:55000".parse().unwrap();
    let app = build_app(state, Duration::from_secs(5)).layer(MockConnectInfo(remote));
    Harness {
        _dir: dir,
        app,
        services,
        clock,
    }
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    user: Option<Uuid>,
    admin: bool,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user.to_string());
    }
    if admin {
        builder = builder.header("authorization", format!("Bearer {ADMIN_TOKEN}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Register a document through the ingest hook and load revision 0.
async fn ingest(h: &Harness, owner: Uuid, content: &str) -> Uuid {
    let (status, doc) = send(
        &h.app,
        "POST",
        "/internal/v1/documents",
        None,
        true,
        Some(json!({ "ownerId": owner, "title": "Report" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let doc_id: Uuid = serde_json::from_value(doc["docId"].clone()).unwrap();

    let (status, rev) = send(
        &h.app,
        "POST",
        &format!("/internal/v1/documents/{doc_id}/extracted"),
        None,
        true,
        Some(json!({ "content": content })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(rev["number"], 0);
    doc_id
}

async fn start(h: &Harness, doc: Uuid, user: Uuid) -> Uuid {
    let (status, body) = send(
        &h.app,
        "POST",
        "/api/v1/session/start",
        Some(user),
        false,
        Some(json!({ "documentId": doc })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    serde_json::from_value(body["sessionId"].clone()).unwrap()
}

async fn save(h: &Harness, doc: Uuid, session: Uuid, user: Uuid, content: &str) -> (StatusCode, Value) {
    send(
        &h.app,
        "POST",
        "/api/v1/save",
        Some(user),
        false,
        Some(json!({ "documentId": doc, "sessionId": session, "content": content })),
    )
    .await
}

#[tokio::test]
async fn test_ingest_requires_admin_token() {
    let h = harness();
    let (status, _) = send(
        &h.app,
        "POST",
        "/internal/v1/documents",
        None,
        false,
        Some(json!({ "ownerId": Uuid::new_v4() })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_save_extends_then_snapshots() {
    let h = harness();
    let owner = Uuid::new_v4();
    let doc = ingest(&h, owner, "extracted text").await;
    let session = start(&h, doc, owner).await;

    let (status, first) = save(&h, doc, session, owner, "draft 1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["revisionNumber"], 1);
    assert_eq!(first["created"], true);

    h.clock.advance_secs(10);
    let (_, second) = save(&h, doc, session, owner, "draft 2").await;
    assert_eq!(second["revisionNumber"], 1);
    assert_eq!(second["created"], false);

    h.clock.advance_secs(6 * 60);
    let (_, third) = save(&h, doc, session, owner, "draft 3").await;
    assert_eq!(third["revisionNumber"], 2);
    assert_eq!(third["created"], true);

    let (status, latest) = send(
        &h.app,
        "GET",
        &format!("/api/v1/documents/{doc}/latest"),
        Some(owner),
        false,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(latest["content"], "draft 3");
    assert_eq!(latest["revisionNumber"], 2);
    assert_eq!(latest["source"], "primary");

    let (_, list) = send(
        &h.app,
        "GET",
        &format!("/api/v1/documents/{doc}/revisions"),
        Some(owner),
        false,
        None,
    )
    .await;
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 3);
    assert_eq!(list.iter().filter(|r| r["isCurrent"] == true).count(), 1);
    assert!(list.iter().all(|r| r.get("content").is_none()));
}

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let h = harness();
    let owner = Uuid::new_v4();
    let doc = ingest(&h, owner, "x").await;
    let (status, _) = send(
        &h.app,
        "GET",
        &format!("/api/v1/documents/{doc}/latest"),
        None,
        false,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_save_rejects_reserved_reasons() {
    let h = harness();
    let owner = Uuid::new_v4();
    let doc = ingest(&h, owner, "x").await;
    let session = start(&h, doc, owner).await;
    for reason in ["upload", "export"] {
        let (status, _) = send(
            &h.app,
            "POST",
            "/api/v1/save",
            Some(owner),
            false,
            Some(json!({
                "documentId": doc,
                "sessionId": session,
                "content": "y",
                "reason": reason,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{reason}");
    }
}

#[tokio::test]
async fn test_foreign_session_is_forbidden() {
    let h = harness();
    let owner = Uuid::new_v4();
    let doc = ingest(&h, owner, "x").await;
    let session = start(&h, doc, owner).await;
    let (status, _) = save(&h, doc, session, Uuid::new_v4(), "stolen").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_revocation_blocks_save_and_restore_reopens() {
    let h = harness();
    let owner = Uuid::new_v4();
    let admin = Uuid::new_v4();
    let doc = ingest(&h, owner, "x").await;
    let session = start(&h, doc, owner).await;

    let (status, record) = send(
        &h.app,
        "POST",
        "/admin/v1/access/revoke",
        Some(admin),
        true,
        Some(json!({ "userId": owner, "reason": "policy violation" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["granted"], false);

    let (status, body) = save(&h, doc, session, owner, "after revoke").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "user revoked");

    let (status, _) = send(
        &h.app,
        "POST",
        "/admin/v1/access/restore",
        Some(admin),
        true,
        Some(json!({ "userId": owner, "reason": "appeal accepted" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = save(&h, doc, session, owner, "after restore").await;
    assert_eq!(status, StatusCode::OK);

    let (status, entries) = send(
        &h.app,
        "GET",
        &format!("/admin/v1/audit?subjectId={owner}&limit=50"),
        Some(admin),
        true,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<&str> = entries
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["action"].as_str())
        .collect();
    assert!(actions.contains(&"revoke"));
    assert!(actions.contains(&"restore"));
    assert!(entries
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["callerIp"] == "10.1.2.3"));
}

#[tokio::test]
async fn test_admin_routes_require_token() {
    let h = harness();
    let (status, _) = send(
        &h.app,
        "POST",
        "/admin/v1/access/revoke",
        Some(Uuid::new_v4()),
        false,
        Some(json!({ "userId": Uuid::new_v4(), "reason": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_shared_document_is_readable_after_grant() {
    let h = harness();
    let owner = Uuid::new_v4();
    let reader = Uuid::new_v4();
    let doc = ingest(&h, owner, "shared text").await;
    let uri = format!("/api/v1/documents/{doc}/latest");

    let (status, _) = send(&h.app, "GET", &uri, Some(reader), false, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &h.app,
        "POST",
        "/admin/v1/access/grant",
        Some(owner),
        true,
        Some(json!({ "userId": reader, "resourceId": doc })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&h.app, "GET", &uri, Some(reader), false, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"], "shared text");
}

#[tokio::test]
async fn test_end_session_accepts_beacon_and_archives() {
    let h = harness();
    let owner = Uuid::new_v4();
    let doc = ingest(&h, owner, "x").await;
    let session = start(&h, doc, owner).await;

    // Beacons arrive as text/plain without identity headers
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/session/end")
        .header("content-type", "text/plain")
        .body(Body::from(
            json!({ "sessionId": session, "content": "final words" }).to_string(),
        ))
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let ended = h.services.store.session(session).unwrap().unwrap();
    assert!(!ended.is_open());
    let last = ended.last_revision.unwrap();
    let rev = h.services.store.revision(doc, last).unwrap().unwrap();
    assert_eq!(rev.content, "final words");
    assert!(rev.is_archived);

    // Ending again is still accepted
    let (status, _) = send(
        &h.app,
        "POST",
        "/api/v1/session/end",
        None,
        false,
        Some(json!({ "sessionId": session })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_end_session_after_revocation_drops_content() {
    let h = harness();
    let owner = Uuid::new_v4();
    let doc = ingest(&h, owner, "before").await;
    let session = start(&h, doc, owner).await;

    let (status, _) = send(
        &h.app,
        "POST",
        "/admin/v1/access/revoke",
        Some(Uuid::new_v4()),
        true,
        Some(json!({ "userId": owner, "reason": "policy violation" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &h.app,
        "POST",
        "/api/v1/session/end",
        None,
        false,
        Some(json!({ "sessionId": session, "content": "after revoke" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let ended = h.services.store.session(session).unwrap().unwrap();
    assert!(!ended.is_open());
    assert!(ended.last_revision.is_none());
    let current = h.services.store.current_revision(doc).unwrap();
    assert_eq!(current.number, 0);
    assert_eq!(current.content, "before");
}

#[tokio::test]
async fn test_export_creates_archived_revision() {
    let h = harness();
    let owner = Uuid::new_v4();
    let doc = ingest(&h, owner, "x").await;
    let session = start(&h, doc, owner).await;
    save(&h, doc, session, owner, "draft").await;

    let (status, body) = send(
        &h.app,
        "POST",
        &format!("/api/v1/documents/{doc}/export"),
        Some(owner),
        false,
        Some(json!({ "sessionId": session, "content": "exported" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["revisionNumber"], 2);
    assert_eq!(body["archived"], true);
    assert!(body["archivePointer"].is_string());
}

#[tokio::test]
async fn test_heartbeat_and_admin_close() {
    let h = harness();
    let owner = Uuid::new_v4();
    let admin = Uuid::new_v4();
    let doc = ingest(&h, owner, "x").await;
    let session = start(&h, doc, owner).await;

    let (status, _) = send(
        &h.app,
        "POST",
        "/api/v1/session/heartbeat",
        Some(owner),
        false,
        Some(json!({ "sessionId": session })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, closed) = send(
        &h.app,
        "POST",
        &format!("/admin/v1/sessions/{session}/close"),
        Some(admin),
        true,
        Some(json!({ "reason": "stuck" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(closed["outcome"], "abandoned");

    let (status, _) = save(&h, doc, session, owner, "too late").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
