//! REST surface driven through the router

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use flagkit_core::{FlagDefinition, FlagRegistry, FlagScope, FlagTexts, PermissionTable};
use flagkit_server::{auth::USER_HEADER, create_router, AppState};

const ADMIN: u64 = 1;

fn state() -> Arc<AppState> {
    state_with(FlagRegistry::new())
}

fn state_with(mut registry: FlagRegistry) -> Arc<AppState> {
    registry
        .register(FlagDefinition::new("bookmark", "Bookmarks", "node"))
        .unwrap();
    registry
        .register(
            FlagDefinition::new("featured", "Featured", "node")
                .with_scope(FlagScope::Global)
                .with_texts(FlagTexts {
                    unflag_denied_text: "Already featured".to_string(),
                    ..FlagTexts::default()
                }),
        )
        .unwrap();
    registry
        .register(FlagDefinition::new("pin", "Pinned", "node").with_bundles(["article"]))
        .unwrap();

    let mut permissions = PermissionTable::new();
    for permission in ["flag bookmark", "unflag bookmark", "flag featured", "flag pin"] {
        permissions.grant_authenticated(permission).unwrap();
    }
    permissions.grant_user(ADMIN, "administer flaggings").unwrap();

    Arc::new(AppState::in_memory(registry, Arc::new(permissions)))
}

async fn send(app: &Router, method: Method, uri: &str, user: Option<u64>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_HEADER, user.to_string());
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
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn target(flag: &str, id: &str, action: &str) -> String {
    format!("/flags/{}/targets/node/{}/{}", flag, id, action)
}

#[tokio::test]
async fn test_health() {
    let app = create_router(state());
    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_personal_bookmark_flow() {
    let app = create_router(state());

    let (status, body) = send(&app, Method::POST, &target("bookmark", "42", "flag"), Some(7), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["flagging"]["created_by"], 7);

    // Second flag by the same user is a no-op.
    let (status, body) = send(&app, Method::POST, &target("bookmark", "42", "flag"), Some(7), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    send(&app, Method::POST, &target("bookmark", "42", "flag"), Some(8), None).await;
    let (_, body) = send(&app, Method::GET, &target("bookmark", "42", "count"), None, None).await;
    assert_eq!(body["count"], 2);

    let (status, _) = send(&app, Method::DELETE, &target("bookmark", "42", "flag"), Some(7), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app, Method::GET, &target("bookmark", "42", "status"), Some(7), None).await;
    assert_eq!(body["flagged"], false);
    assert_eq!(body["can_flag"], true);
    assert_eq!(body["count"], 1);
    assert_eq!(body["action"]["kind"], "link");
    assert_eq!(body["action"]["action"], "flag");

    let (_, body) = send(&app, Method::GET, &target("bookmark", "42", "status"), Some(8), None).await;
    assert_eq!(body["flagged"], true);
    assert_eq!(body["action"]["action"], "unflag");
}

#[tokio::test]
async fn test_flag_with_fields() {
    let app = create_router(state());
    let (status, body) = send(
        &app,
        Method::POST,
        &target("bookmark", "3", "flag"),
        Some(7),
        Some(json!({ "fields": { "note": "read later" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["flagging"]["fields"]["note"], "read later");
}

#[tokio::test]
async fn test_global_flag_denied_text() {
    let app = create_router(state());
    send(&app, Method::POST, &target("featured", "5", "flag"), Some(7), None).await;

    let (_, body) = send(&app, Method::GET, &target("featured", "5", "status"), Some(9), None).await;
    assert_eq!(body["flagged"], true);
    assert_eq!(body["can_unflag"], false);
    assert_eq!(body["action"]["kind"], "denied");
    assert_eq!(body["action"]["text"], "Already featured");

    let (status, _) = send(&app, Method::DELETE, &target("featured", "5", "flag"), Some(9), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Administrators may always unflag.
    let (status, _) = send(&app, Method::DELETE, &target("featured", "5", "flag"), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, body) = send(&app, Method::GET, &target("featured", "5", "count"), None, None).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_anonymous_cannot_flag() {
    let app = create_router(state());
    let (status, _) = send(&app, Method::POST, &target("bookmark", "1", "flag"), None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, body) = send(&app, Method::GET, &target("bookmark", "1", "status"), None, None).await;
    assert_eq!(body["action"]["kind"], "hidden");
}

#[tokio::test]
async fn test_error_statuses() {
    let app = create_router(state());

    let (status, body) = send(&app, Method::POST, &target("nope", "1", "flag"), Some(7), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["retryable"], false);

    let (status, _) = send(
        &app,
        Method::POST,
        "/flags/bookmark/targets/user/1/flag",
        Some(7),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Method::GET, "/flaggings/not-a-uuid", Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method(Method::POST)
        .uri(target("bookmark", "1", "flag"))
        .header(USER_HEADER, "alice")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_flagging_admin_routes() {
    let app = create_router(state());
    let (_, first) = send(&app, Method::POST, &target("bookmark", "42", "flag"), Some(7), None).await;
    send(&app, Method::POST, &target("bookmark", "42", "flag"), Some(8), None).await;
    send(&app, Method::POST, &target("bookmark", "42", "flag"), Some(9), None).await;
    let id = first["flagging"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(&app, Method::GET, &target("bookmark", "42", "flaggings"), Some(7), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, rows) = send(&app, Method::GET, &target("bookmark", "42", "flaggings"), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rows.as_array().unwrap().len(), 3);

    // Owners may read and edit their own flagging, others may not.
    let (status, _) = send(&app, Method::GET, &format!("/flaggings/{}", id), Some(7), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, Method::GET, &format!("/flaggings/{}", id), Some(8), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        Method::PATCH,
        &format!("/flaggings/{}", id),
        Some(7),
        Some(json!({ "fields": { "note": "hi" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["fields"]["note"], "hi");

    let (status, _) = send(
        &app,
        Method::PATCH,
        &format!("/flaggings/{}", id),
        Some(7),
        Some(json!({ "target": { "entity_type": "node", "entity_id": "43" } })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let ids: Vec<Value> = rows
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].clone())
        .filter(|other| other.as_str() != Some(id.as_str()))
        .collect();
    assert_eq!(ids.len(), 2);
    let (status, outcome) = send(
        &app,
        Method::POST,
        "/flaggings/bulk-delete",
        Some(ADMIN),
        Some(json!({ "ids": ids })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["deleted"], 2);

    let (status, _) = send(&app, Method::DELETE, &format!("/flaggings/{}", id), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::DELETE, &format!("/flaggings/{}", id), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&app, Method::GET, &target("bookmark", "42", "count"), None, None).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_flag_definition_routes() {
    let app = create_router(state());

    let spam = json!({ "id": "spam", "label": "Spam", "entity_type": "comment" });
    let (status, _) = send(&app, Method::PUT, "/flags/spam", Some(7), Some(spam.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&app, Method::PUT, "/flags/other", Some(ADMIN), Some(spam.clone())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, body) = send(&app, Method::PUT, "/flags/spam", Some(ADMIN), Some(spam.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["link_type"], "reload");
    let (status, _) = send(&app, Method::PUT, "/flags/spam", Some(ADMIN), Some(spam)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, flags) = send(&app, Method::GET, "/flags", None, None).await;
    assert_eq!(flags.as_array().unwrap().len(), 4);

    send(&app, Method::POST, &target("bookmark", "1", "flag"), Some(7), None).await;
    let (status, body) = send(&app, Method::POST, "/flags/bookmark/rebuild", Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["counts"], 1);

    let (status, report) = send(&app, Method::DELETE, "/flags/bookmark", Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["removed"], 1);
    let (status, _) = send(&app, Method::GET, "/flags/bookmark", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_lifecycle_events() {
    let app = create_router(state());
    send(&app, Method::POST, &target("bookmark", "1", "flag"), Some(10), None).await;
    send(&app, Method::POST, &target("bookmark", "2", "flag"), Some(10), None).await;
    send(&app, Method::POST, &target("bookmark", "1", "flag"), Some(11), None).await;

    let (status, _) = send(&app, Method::POST, "/events/user-deleted/10", Some(7), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, report) = send(&app, Method::POST, "/events/user-deleted/10", Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["removed"], 2);

    let (status, report) = send(&app, Method::POST, "/events/entity-deleted/node/1", Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["removed"], 1);

    let (_, body) = send(&app, Method::GET, &target("bookmark", "1", "count"), None, None).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_bundle_limits() {
    let app = create_router(state());

    let uri = format!("{}?bundle=page", target("pin", "1", "flag"));
    let (status, body) = send(&app, Method::POST, &uri, Some(7), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["retryable"], false);

    let uri = format!("{}?bundle=page", target("pin", "1", "status"));
    let (_, body) = send(&app, Method::GET, &uri, Some(7), None).await;
    assert_eq!(body["can_flag"], false);
    assert_eq!(body["action"]["kind"], "hidden");

    let uri = format!("{}?bundle=article", target("pin", "1", "flag"));
    let (status, body) = send(&app, Method::POST, &uri, Some(7), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn test_flag_definitions_are_saved() {
    let dir = tempfile::tempdir().unwrap();
    let app = create_router(state_with(FlagRegistry::new().with_definitions_dir(dir.path())));

    let spam = json!({ "id": "spam", "label": "Spam", "entity_type": "comment", "bundles": ["forum"] });
    let (status, _) = send(&app, Method::PUT, "/flags/spam", Some(ADMIN), Some(spam)).await;
    assert_eq!(status, StatusCode::CREATED);

    // A restarted server reads the saved definition back.
    let mut reloaded = FlagRegistry::new();
    assert_eq!(reloaded.load_from_directory(dir.path()).unwrap(), 1);
    let saved = reloaded.get("spam").unwrap();
    assert_eq!(saved.label, "Spam");
    assert!(saved.bundles.contains("forum"));

    let (status, _) = send(&app, Method::DELETE, "/flags/spam", Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    let mut reloaded = FlagRegistry::new();
    assert_eq!(reloaded.load_from_directory(dir.path()).unwrap(), 0);
}
