//! Integration tests for HTTP API endpoints.

mod common;

use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode, header};
use common::TestServer;
use common::fixtures::{seeded_bytes, tree_hash_hex};
use serde_json::{Value, json};
use tower::ServiceExt;

/// Helper to make JSON requests.
async fn json_request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    auth_token: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = auth_token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }

    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };

    let request = builder.body(body).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let json: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };

    (status, json)
}

/// Helper for requests whose response body is raw bytes.
async fn raw_request(
    router: &axum::Router,
    request: Request<Body>,
) -> (StatusCode, axum::http::HeaderMap, Bytes) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

/// Upload `data` as part `part_no` of `upload_id` through the server.
async fn upload_part(
    server: &TestServer,
    token: &str,
    upload_id: &str,
    part_no: i32,
    data: Bytes,
    encrypted: bool,
) -> Value {
    let request = Request::builder()
        .method("POST")
        .uri(format!(
            "/api/uploads/{upload_id}?partNo={part_no}&fileName=data.bin&encrypted={encrypted}"
        ))
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", "application/octet-stream")
        .body(Body::from(data))
        .unwrap();
    let (status, _, body) = raw_request(&server.router, request).await;
    assert_eq!(status, StatusCode::CREATED, "{}", String::from_utf8_lossy(&body));
    serde_json::from_slice(&body).unwrap()
}

/// Upload `data` in one part and commit it as `name` at the root.
async fn upload_file(server: &TestServer, token: &str, name: &str, data: Bytes, encrypted: bool) -> Value {
    let upload_id = format!("upload-{name}");
    upload_part(server, token, &upload_id, 1, data, encrypted).await;
    let (status, file) = json_request(
        &server.router,
        "POST",
        "/api/files",
        Some(json!({
            "name": name,
            "type": "file",
            "mimeType": "application/octet-stream",
            "uploadId": upload_id,
        })),
        Some(token),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{file}");
    file
}

async fn stream(
    server: &TestServer,
    token: &str,
    method: &str,
    file_id: &str,
    range: Option<&str>,
) -> (StatusCode, axum::http::HeaderMap, Bytes) {
    let mut builder = Request::builder()
        .method(method)
        .uri(format!("/api/files/{file_id}/stream/data.bin"))
        .header("Authorization", format!("Bearer {token}"));
    if let Some(range) = range {
        builder = builder.header(header::RANGE, range);
    }
    raw_request(&server.router, builder.body(Body::empty()).unwrap()).await
}

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;
    let (status, body) = json_request(&server.router, "GET", "/api/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_protected_routes_require_a_session() {
    let server = TestServer::new().await;
    let (status, body) = json_request(&server.router, "GET", "/api/files", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) =
        json_request(&server.router, "GET", "/api/files", None, Some("not-a-token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_session_logout() {
    let server = TestServer::new().await;
    let (token, channel_id) = server.login(42).await;
    assert!(server.network.message_ids(channel_id).is_empty());

    let (status, session) =
        json_request(&server.router, "GET", "/api/auth/session", None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session["userId"], 42);
    assert_eq!(session["name"], "user42");

    let (status, _) =
        json_request(&server.router, "POST", "/api/auth/logout", None, Some(&token)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) =
        json_request(&server.router, "GET", "/api/auth/session", None, Some(&token)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn test_login_sets_session_cookie() {
    let server = TestServer::new().await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/auth/login")
        .header("Content-Type", "application/json")
        .body(Body::from(json!({ "session": "7:secret" }).to_string()))
        .unwrap();
    let (status, headers, _) = raw_request(&server.router, request).await;
    assert_eq!(status, StatusCode::OK);
    let cookie = headers
        .get(header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap();
    assert!(cookie.starts_with("access_token="));
    assert!(cookie.contains("HttpOnly"));
}

#[tokio::test]
async fn test_upload_commit_and_stream() {
    let server = TestServer::new().await;
    let (token, channel_id) = server.login(1).await;
    let data = seeded_bytes(7, 100_000);

    let file = upload_file(&server, &token, "data.bin", data.clone(), false).await;
    assert_eq!(file["size"], 100_000);
    assert_eq!(file["channelId"], channel_id);
    assert_eq!(file["hash"], tree_hash_hex(&data));
    assert_eq!(server.network.message_ids(channel_id).len(), 1);

    // Committing consumed the upload
    let (status, parts) =
        json_request(&server.router, "GET", "/api/uploads/upload-data.bin", None, Some(&token))
            .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(parts, json!([]));

    let id = file["id"].as_str().unwrap();
    let (status, headers, body) = stream(&server, &token, "GET", id, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_LENGTH], "100000");
    assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
    assert_eq!(body, data);
}

#[tokio::test]
async fn test_stream_ranges_and_head() {
    let server = TestServer::new().await;
    let (token, _) = server.login(1).await;
    let data = seeded_bytes(9, 4096);
    let file = upload_file(&server, &token, "data.bin", data.clone(), false).await;
    let id = file["id"].as_str().unwrap();

    let (status, headers, body) = stream(&server, &token, "GET", id, Some("bytes=100-199")).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(headers[header::CONTENT_RANGE], "bytes 100-199/4096");
    assert_eq!(body, data.slice(100..200));

    let (status, _, body) = stream(&server, &token, "GET", id, Some("bytes=-10")).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body, data.slice(4086..));

    let (status, headers, body) = stream(&server, &token, "HEAD", id, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_LENGTH], "4096");
    assert!(body.is_empty());

    let (status, headers, _) = stream(&server, &token, "GET", id, Some("bytes=5000-")).await;
    assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(headers[header::CONTENT_RANGE], "bytes */4096");

    let etag = headers_etag(&server, &token, id).await;
    let request = Request::builder()
        .uri(format!("/api/files/{id}/stream/data.bin"))
        .header("Authorization", format!("Bearer {token}"))
        .header(header::IF_NONE_MATCH, etag)
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = raw_request(&server.router, request).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
}

async fn headers_etag(server: &TestServer, token: &str, id: &str) -> String {
    let (_, headers, _) = stream(server, token, "HEAD", id, None).await;
    headers[header::ETAG].to_str().unwrap().to_string()
}

#[tokio::test]
async fn test_encrypted_upload_streams_plaintext() {
    let server = TestServer::new().await;
    let (token, channel_id) = server.login(1).await;
    let data = seeded_bytes(3, 70_000);

    let file = upload_file(&server, &token, "secret.bin", data.clone(), true).await;
    assert_eq!(file["encrypted"], true);
    assert_eq!(file["size"], 70_000);
    assert_eq!(file["hash"], tree_hash_hex(&data));
    assert_eq!(server.network.message_ids(channel_id).len(), 1);

    let id = file["id"].as_str().unwrap();
    let (status, _, body) = stream(&server, &token, "GET", id, Some("bytes=1000-1999")).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body, data.slice(1000..2000));
}

#[tokio::test]
async fn test_stream_accepts_session_hash_param() {
    let server = TestServer::new().await;
    let (token, _) = server.login(1).await;
    let data = seeded_bytes(1, 512);
    let file = upload_file(&server, &token, "data.bin", data.clone(), false).await;
    let (_, session) =
        json_request(&server.router, "GET", "/api/auth/session", None, Some(&token)).await;

    let request = Request::builder()
        .uri(format!(
            "/api/files/{}/stream/data.bin?hash={}",
            file["id"].as_str().unwrap(),
            session["hash"].as_str().unwrap()
        ))
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = raw_request(&server.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, data);
}

#[tokio::test]
async fn test_upload_part_rejects_bad_part_number() {
    let server = TestServer::new().await;
    let (token, _) = server.login(1).await;
    let request = Request::builder()
        .method("POST")
        .uri("/api/uploads/u1?partNo=0&fileName=a.bin")
        .header("Authorization", format!("Bearer {token}"))
        .body(Body::from("abc"))
        .unwrap();
    let (status, _, _) = raw_request(&server.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_mkdir_list_and_rename_collision() {
    let server = TestServer::new().await;
    let (token, _) = server.login(1).await;

    let (status, folder) = json_request(
        &server.router,
        "POST",
        "/api/files/directories",
        Some(json!({ "path": "/docs/2024" })),
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(folder["name"], "2024");
    assert_eq!(folder["type"], "folder");

    let a = upload_file(&server, &token, "a.txt", seeded_bytes(1, 10), false).await;
    let b = upload_file(&server, &token, "b.txt", seeded_bytes(2, 20), false).await;

    let (status, moved) = json_request(
        &server.router,
        "POST",
        "/api/files/move",
        Some(json!({
            "ids": [a["id"]],
            "destination": "/docs",
            "destinationName": "b.txt",
        })),
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(moved[0]["name"], "b.txt");

    let (status, listing) =
        json_request(&server.router, "GET", "/api/files?path=/docs", None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = listing["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["2024", "b.txt"]);
    assert_eq!(listing["meta"]["count"], 2);

    // The root b.txt is untouched; a second move onto it replaces it.
    let (status, _) = json_request(
        &server.router,
        "POST",
        "/api/files/move",
        Some(json!({ "ids": [moved[0]["id"]], "destination": "/" })),
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, root) = json_request(&server.router, "GET", "/api/files", None, Some(&token)).await;
    let files: Vec<&Value> = root["items"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|f| f["name"] == "b.txt")
        .collect();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["id"], a["id"]);
    assert_ne!(files[0]["id"], b["id"]);

    let (status, _) = json_request(
        &server.router,
        "GET",
        &format!("/api/files/{}", b["id"].as_str().unwrap()),
        None,
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_marks_files_for_cleanup() {
    let server = TestServer::new().await;
    let (token, _) = server.login(1).await;
    let file = upload_file(&server, &token, "gone.bin", seeded_bytes(4, 64), false).await;

    let (status, body) = json_request(
        &server.router,
        "POST",
        "/api/files/delete",
        Some(json!({ "ids": [file["id"]] })),
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let pending = server.metadata().pending_deletions(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, "gone.bin");
}

#[tokio::test]
async fn test_other_users_files_are_hidden() {
    let server = TestServer::new().await;
    let (owner, _) = server.login(1).await;
    let (other, _) = server.login(2).await;
    let file = upload_file(&server, &owner, "mine.bin", seeded_bytes(5, 32), false).await;
    let id = file["id"].as_str().unwrap();

    let (status, _) =
        json_request(&server.router, "GET", &format!("/api/files/{id}"), None, Some(&other)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = stream(&server, &other, "GET", id, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_share_flow() {
    let server = TestServer::new().await;
    let (token, _) = server.login(1).await;
    let data = seeded_bytes(11, 2048);
    let file = upload_file(&server, &token, "shared.bin", data.clone(), false).await;
    let file_id = file["id"].as_str().unwrap();

    let (status, share) = json_request(
        &server.router,
        "POST",
        &format!("/api/files/{file_id}/share"),
        Some(json!({ "password": "hunter2" })),
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(share["protected"], true);
    let share_id = share["id"].as_str().unwrap();

    let info_uri = format!("/api/shares/{share_id}");
    let (status, denied) = json_request(&server.router, "GET", &info_uri, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(denied["code"], "unauthorized");

    let request = Request::get(&info_uri)
        .header("X-Share-Password", "hunter2")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = raw_request(&server.router, request).await;
    assert_eq!(status, StatusCode::OK);
    let info: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(info["name"], "shared.bin");
    assert_eq!(info["protected"], true);

    let uri = format!("/api/shares/{share_id}/files/{file_id}/stream/shared.bin");
    let (status, _, _) =
        raw_request(&server.router, Request::get(&uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::get(&uri)
        .header("X-Share-Password", "hunter2")
        .header(header::RANGE, "bytes=0-99")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = raw_request(&server.router, request).await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body, data.slice(0..100));

    let (status, _) = json_request(
        &server.router,
        "DELETE",
        &format!("/api/files/{file_id}/share"),
        None,
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) =
        json_request(&server.router, "GET", &format!("/api/shares/{share_id}"), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_events_record_file_changes() {
    let server = TestServer::new().await;
    let (token, _) = server.login(1).await;
    upload_file(&server, &token, "one.bin", seeded_bytes(6, 16), false).await;
    let (status, _) = json_request(
        &server.router,
        "POST",
        "/api/files/directories",
        Some(json!({ "path": "/folder" })),
        Some(&token),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Flush queued event writes
    server.state.events.shutdown().await;

    let (status, events) =
        json_request(&server.router, "GET", "/api/events?limit=10", None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["source"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["folder", "one.bin"]);
    assert!(events.as_array().unwrap().iter().all(|e| e["type"] == "file_create"));
}

#[tokio::test]
async fn test_channels_and_stats() {
    let server = TestServer::new().await;
    let (token, channel_id) = server.login(1).await;
    upload_file(&server, &token, "clip.mp4", seeded_bytes(8, 300), false).await;

    let (status, channels) =
        json_request(&server.router, "GET", "/api/users/channels", None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(channels[0]["channelId"], channel_id);
    assert_eq!(channels[0]["selected"], true);

    let (status, stats) =
        json_request(&server.router, "GET", "/api/users/stats", None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    let total: i64 = stats
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["totalSize"].as_i64().unwrap())
        .sum();
    assert_eq!(total, 300);

    let (status, daily) =
        json_request(&server.router, "GET", "/api/uploads/stats?days=1", None, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(daily[0]["totalSize"], 300);
}

#[tokio::test]
async fn test_metrics_route_is_optional() {
    let server = TestServer::with_config(|c| c.server.metrics_enabled = false).await;
    let (status, _) = json_request(&server.router, "GET", "/metrics", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
