//! HTTP API integration tests.

use std::{sync::Arc, time::Duration};

use axum::{
    body::{Body, Bytes},
    http::{Method, Request, StatusCode},
    Router,
};
use hermes::{
    bus::{Event, EventBus},
    server::JournalServer,
    store::Store,
    PhotoResolver,
};
use futures::{Stream, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

struct Harness {
    _temp: TempDir,
    bus: Arc<EventBus>,
    app: Router,
}

async fn harness() -> Harness {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = Store::new(temp.path().join("hermes.db"))
        .await
        .expect("open store");
    store.init().await.expect("init schema");

    let bus = Arc::new(EventBus::new());
    let photos = PhotoResolver::new(Some("https://api.example.com".into()));
    let app = JournalServer::new(store, bus.clone(), photos).router();
    Harness {
        _temp: temp,
        bus,
        app,
    }
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    send(app, method, uri, body.map(|value| value.to_string())).await
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<String>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(raw) => {
            builder = builder.header("content-type", "application/json");
            Body::from(raw)
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).expect("request"))
        .await
        .expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

#[tokio::test]
async fn health() {
    let h = harness().await;
    let (status, body) = call(&h.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

/// Recording publishes on the bus and shows up in the journal view.
#[tokio::test]
async fn record_then_read_journal() {
    let h = harness().await;
    let mut rx = h.bus.subscribe();

    let (status, saved) = call(
        &h.app,
        Method::POST,
        "/users/u1/entries",
        Some(json!({
            "session_id": "s1",
            "message": "What is this?",
            "response": "The old port of Marseille.",
            "timestamp": "2024-05-01T09:00:00Z",
            "location_name": "Vieux-Port",
            "photo_url": "/uploads/port.jpg"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(saved["id"].is_string());

    match rx.recv().await.expect("event") {
        Event::EntryRecorded { user_id, entry } => {
            assert_eq!(user_id, "u1");
            assert_eq!(entry.message, "What is this?");
        }
        other => panic!("unexpected event {other:?}"),
    }

    call(
        &h.app,
        Method::POST,
        "/users/u1/entries",
        Some(json!({
            "session_id": "s1",
            "message": "And this?",
            "response": "Notre-Dame de la Garde.",
            "timestamp": "2024-05-03T15:00:00Z",
            "photo": "placeholder_image_url"
        })),
    )
    .await;

    let (status, days) = call(&h.app, Method::GET, "/users/u1/journal", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(days.as_array().expect("array").len(), 2);
    assert_eq!(days[0]["date"], "2024-05-03");
    assert_eq!(days[0]["images"], json!([]));
    assert_eq!(days[0]["diarySummary"], "Notre-Dame de la Garde.");
    assert_eq!(days[1]["date"], "2024-05-01");
    assert_eq!(days[1]["totalMessages"], 1);
    assert_eq!(days[1]["locations"], json!(["Vieux-Port"]));
    assert_eq!(days[1]["images"], json!(["https://api.example.com/uploads/port.jpg"]));
}

#[tokio::test]
async fn saved_digest_overrides_day() {
    let h = harness().await;
    call(
        &h.app,
        Method::POST,
        "/users/u1/entries",
        Some(json!({
            "message": "hi",
            "response": "hello",
            "timestamp": "2024-05-01T09:00:00Z",
            "photo_url": "/uploads/a.jpg"
        })),
    )
    .await;

    let (status, digest) = call(
        &h.app,
        Method::PUT,
        "/users/u1/journal/2024-05-01",
        Some(json!({
            "images": ["/uploads/b.jpg", "placeholder_image_url", "https://api.example.com/uploads/b.jpg"],
            "summary": "A windy day on the coast."
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(digest["images"], json!(["https://api.example.com/uploads/b.jpg"]));

    let (_, days) = call(&h.app, Method::GET, "/users/u1/journal", None).await;
    assert_eq!(days[0]["images"], json!(["https://api.example.com/uploads/b.jpg"]));
    assert_eq!(days[0]["diarySummary"], "A windy day on the coast.");

    let (status, _) = call(
        &h.app,
        Method::PUT,
        "/users/u1/journal/someday",
        Some(json!({ "summary": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn edits_entries() {
    let h = harness().await;
    let entry = json!({ "message": "t", "response": "b", "timestamp": "2024-05-01T09:00:00Z" });
    let (_, first) = call(&h.app, Method::POST, "/users/u1/entries", Some(entry.clone())).await;
    call(&h.app, Method::POST, "/users/u1/entries", Some(entry)).await;

    let id = first["id"].as_str().expect("id");
    let (status, edited) = call(
        &h.app,
        Method::PATCH,
        &format!("/users/u1/entries/{id}"),
        Some(json!({ "message": "Calanques hike" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["message"], "Calanques hike");
    assert_eq!(edited["response"], "b");

    let (status, body) = call(
        &h.app,
        Method::PATCH,
        "/users/u1/entries?timestamp=2024-05-01T09:00:00Z",
        Some(json!({ "response": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "error");

    let (status, _) = call(
        &h.app,
        Method::PATCH,
        "/users/u1/entries/missing",
        Some(json!({ "response": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&h.app, Method::PATCH, &format!("/users/u1/entries/{id}"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn aggregates_request_body() {
    let h = harness().await;
    let (status, days) = call(
        &h.app,
        Method::POST,
        "/journal/aggregate",
        Some(json!({
            "entries": {
                "2024-05-01": [
                    { "summary": "Saw the tower", "photoUrl": "/uploads/x.jpg" },
                    { "response": "It was great" }
                ],
                "2024-05-02": [
                    { "diary": "A", "timestamp": "2024-05-02T10:00:00" },
                    { "summary": "B", "timestamp": "broken" }
                ]
            },
            "bundles": {
                "2024-05-02": { "images": ["https://cdn.example.com/z.jpg"] }
            }
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(days[0]["date"], "2024-05-02");
    assert_eq!(days[0]["diarySummary"], "A");
    assert_eq!(days[0]["totalMessages"], 2);
    assert_eq!(days[0]["images"], json!(["https://cdn.example.com/z.jpg"]));
    assert_eq!(days[1]["diarySummary"], "Saw the tower\n\nIt was great");
    assert_eq!(days[1]["images"], json!(["https://api.example.com/uploads/x.jpg"]));
}

#[tokio::test]
async fn distance_sort_requires_origin() {
    let h = harness().await;
    let (status, _) = call(&h.app, Method::GET, "/users/u1/journal?sort=distance", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &h.app,
        Method::GET,
        "/users/u1/journal?sort=distance&lat=0&lng=0",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn filters_pins_by_radius_and_category() {
    let h = harness().await;
    let items = json!([
        { "id": "east", "title": "Café", "category": "food", "latitude": 0.0, "longitude": 0.1 },
        { "id": "far", "title": "Museum", "category": "museum", "latitude": 0.0, "longitude": 1.0 },
        { "id": "nowhere", "title": "Unknown", "category": "food", "latitude": null, "longitude": null }
    ]);

    let (status, kept) = call(
        &h.app,
        Method::POST,
        "/places/nearby",
        Some(json!({
            "items": items,
            "origin": { "latitude": 0.0, "longitude": 0.0 },
            "max_distance": 10.0,
            "unit": "miles",
            "order": "distance"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let kept = kept.as_array().expect("array");
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0]["id"], "east");
    assert_eq!(kept[0]["distance_label"], "6.9 mi");

    let (_, by_category) = call(
        &h.app,
        Method::POST,
        "/places/nearby",
        Some(json!({ "items": items, "categories": ["food"] })),
    )
    .await;
    let ids: Vec<&str> = by_category
        .as_array()
        .expect("array")
        .iter()
        .map(|p| p["id"].as_str().expect("id"))
        .collect();
    assert_eq!(ids, vec!["east", "nowhere"]);
}

#[tokio::test]
async fn filters_stored_entries_nearby() {
    let h = harness().await;
    for (message, lat, lng) in [("near", 0.0, 0.1), ("far", 0.0, 1.0)] {
        call(
            &h.app,
            Method::POST,
            "/users/u1/entries",
            Some(json!({ "message": message, "latitude": lat, "longitude": lng })),
        )
        .await;
    }
    call(&h.app, Method::POST, "/users/u1/entries", Some(json!({ "message": "unlocated" }))).await;

    let (status, kept) = call(
        &h.app,
        Method::GET,
        "/users/u1/entries/nearby?lat=0&lng=0&radius=20&unit=kilometers",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let kept = kept.as_array().expect("array");
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0]["message"], "near");
    assert_eq!(kept[0]["distance_label"], "11.1 km");
}

/// Extractor failures come back in the same JSON envelope as handler errors.
#[tokio::test]
async fn malformed_requests_use_error_envelope() {
    let h = harness().await;
    let cases = [
        (Method::GET, "/users/u1/journal?sort=bogus", None),
        (Method::GET, "/users/u1/entries/nearby?lat=north&lng=0", None),
        (Method::PATCH, "/users/u1/entries", Some(r#"{"response":"x"}"#.to_string())),
        (Method::POST, "/journal/aggregate", Some("{not json".to_string())),
    ];

    for (method, uri, body) in cases {
        let (status, body) = send(&h.app, method, uri, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["status"], "error", "{uri}");
        assert!(body["message"].is_string(), "{uri}");
    }
}

#[tokio::test]
async fn tolerates_numeric_ids_and_refuses_duplicates() {
    let h = harness().await;
    let entry = json!({ "id": 7, "message": "Pont du Gard", "response": "Roman aqueduct." });

    let (status, saved) = call(&h.app, Method::POST, "/users/u1/entries", Some(entry.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(saved["id"], "7");

    let (status, _) = call(&h.app, Method::POST, "/users/u2/entries", Some(entry.clone())).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = call(&h.app, Method::POST, "/users/u1/entries", Some(entry)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn summarizes_sessions_and_limits_listing() {
    let h = harness().await;
    for (message, ts) in [
        ("first", "2024-05-01T09:00:00Z"),
        ("second", "2024-05-01T10:00:00Z"),
        ("third", "2024-05-01T12:00:00Z"),
    ] {
        call(
            &h.app,
            Method::POST,
            "/users/u1/entries",
            Some(json!({ "session_id": "s1", "message": message, "timestamp": ts })),
        )
        .await;
    }

    let (status, info) = call(&h.app, Method::GET, "/users/u1/sessions/s1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        info,
        json!({
            "user_id": "u1",
            "session_id": "s1",
            "conversation_length": 3,
            "created_at": "2024-05-01T09:00:00Z",
            "last_activity": "2024-05-01T12:00:00Z"
        })
    );

    let (status, body) = call(&h.app, Method::GET, "/users/u1/sessions/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");

    let (_, latest) = call(&h.app, Method::GET, "/users/u1/entries?limit=2", None).await;
    let messages: Vec<&str> = latest
        .as_array()
        .expect("array")
        .iter()
        .map(|e| e["message"].as_str().expect("message"))
        .collect();
    assert_eq!(messages, vec!["second", "third"]);
}

/// Reads SSE frames until one carries data, and parses that data as JSON.
async fn next_event<S>(body: &mut S) -> Value
where
    S: Stream<Item = Result<Bytes, axum::Error>> + Unpin,
{
    let mut buffer = String::new();
    loop {
        if let Some(end) = buffer.find("\n\n") {
            let frame: String = buffer.drain(..end + 2).collect();
            let data: String = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect();
            if !data.is_empty() {
                return serde_json::from_str(&data).expect("json event");
            }
            continue;
        }
        let chunk = body.next().await.expect("stream open").expect("chunk");
        buffer.push_str(std::str::from_utf8(&chunk).expect("utf8"));
    }
}

#[tokio::test]
async fn streams_only_the_requested_users_events() {
    let h = harness().await;
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/events?user_id=u1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().expect("header"),
        "text/event-stream"
    );
    let mut events = Box::pin(response.into_body().into_data_stream());

    call(&h.app, Method::POST, "/users/u2/entries", Some(json!({ "message": "not mine" }))).await;
    call(&h.app, Method::POST, "/users/u1/entries", Some(json!({ "message": "mine" }))).await;

    let event = tokio::time::timeout(Duration::from_secs(5), next_event(&mut events))
        .await
        .expect("event in time");
    assert_eq!(event["type"], "EntryRecorded");
    assert_eq!(event["data"]["user_id"], "u1");
    assert_eq!(event["data"]["entry"]["message"], "mine");

    let nothing_else = tokio::time::timeout(Duration::from_millis(200), next_event(&mut events)).await;
    assert!(nothing_else.is_err());
}
