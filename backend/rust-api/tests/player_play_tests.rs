mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{activity, echo, exercise, play_activity, post_json, ScriptedSandbox, StaticCompiler};
use player_engine::models::Variables;
use player_engine::sandbox::SandboxError;

fn statements(script: &str, input: &Variables) -> Result<Variables, SandboxError> {
    Ok(echo(input, json!({ "statement": format!("statement of {}", script) })))
}

fn catalogue(mode: &str) -> StaticCompiler {
    StaticCompiler::new()
        .with("ex-a", exercise("a", json!({ "title": "First" })))
        .with("ex-b", exercise("b", json!({ "title": "Second" })))
        .with("ex-ruby", exercise("r", json!({ "sandbox": "ruby" })))
        .with(
            "act",
            activity(
                "unused",
                json!({
                    "title": "Chapter",
                    "settings": { "navigation": { "mode": mode } },
                    "exerciseGroups": {
                        "basics": { "name": "basics", "exercises": [
                            { "id": "e1", "resource": "ex-a" },
                            { "id": "e2", "resource": "ex-b" }
                        ] }
                    }
                }),
            ),
        )
}

fn session_id(value: &Value) -> String {
    value["sessionId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn manual_play_creates_the_navigation_and_builds_the_first_exercise() {
    let app = common::create_test_app(catalogue("manual"), ScriptedSandbox::new(statements));

    let (status, played) = play_activity(&app, "u1", "act").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(played["title"], "Chapter");
    assert_eq!(played["mode"], "manual");
    assert_eq!(played["navigation"]["started"], true);
    assert_eq!(played["navigation"]["terminated"], false);
    assert_eq!(played["hasNext"], true);
    assert_eq!(played["hasPrevious"], false);

    let entries = played["navigation"]["exercises"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["title"], "First");
    assert_eq!(entries[0]["state"], "STARTED");
    assert_eq!(entries[1]["state"], "NOT_STARTED");

    let exercises = played["exercises"].as_array().unwrap();
    assert_eq!(exercises.len(), 1);
    assert_eq!(exercises[0]["variables"]["statement"], "statement of a");
    assert_eq!(played["navigation"]["current"]["sessionId"], exercises[0]["sessionId"]);
    assert_eq!(app.sandbox.runs("a"), 1);
    assert_eq!(app.sandbox.runs("b"), 0);

    // Activity plus its two exercises, written once.
    assert_eq!(app.sessions.len().await, 3);

    let (status, replay) = play_activity(&app, "u1", "act").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session_id(&replay), session_id(&played));
    assert_eq!(app.sessions.len().await, 3);
    assert_eq!(app.sandbox.runs("a"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_first_plays_share_one_activity_session() {
    let app = common::create_test_app(catalogue("manual"), ScriptedSandbox::new(statements));

    let ((first_status, first), (second_status, second)) = tokio::join!(
        play_activity(&app, "u1", "act"),
        play_activity(&app, "u1", "act"),
    );
    assert_eq!(first_status, StatusCode::OK);
    assert_eq!(second_status, StatusCode::OK);
    assert_eq!(session_id(&first), session_id(&second));
    assert_eq!(app.sessions.len().await, 3);
}

#[tokio::test]
async fn each_learner_gets_their_own_activity_session() {
    let app = common::create_test_app(catalogue("manual"), ScriptedSandbox::new(statements));

    let (_, first) = play_activity(&app, "u1", "act").await;
    let (_, second) = play_activity(&app, "u2", "act").await;
    assert_ne!(session_id(&first), session_id(&second));
    assert_eq!(app.sessions.len().await, 6);

    let (status, _) = post_json(
        &app,
        "/player/play/activity",
        Some("u2"),
        json!({ "activitySessionId": session_id(&first) }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn manual_play_exercises_moves_the_current_entry() {
    let app = common::create_test_app(catalogue("manual"), ScriptedSandbox::new(statements));
    let (_, played) = play_activity(&app, "u1", "act").await;
    let activity_id = session_id(&played);
    let second = played["navigation"]["exercises"][1]["sessionId"].as_str().unwrap().to_string();

    let (status, body) = post_json(
        &app,
        "/player/play/exercises",
        Some("u1"),
        json!({ "activitySessionId": activity_id, "exerciseSessionIds": [second] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exercises"][0]["sessionId"], second.as_str());
    assert_eq!(body["exercises"][0]["variables"]["statement"], "statement of b");
    assert_eq!(body["navigation"]["current"]["sessionId"], second.as_str());
    assert_eq!(body["navigation"]["exercises"][1]["state"], "STARTED");
    assert_eq!(body["hasNext"], false);
    assert_eq!(body["hasPrevious"], true);

    let (status, body) = post_json(
        &app,
        "/player/play/exercises",
        Some("u1"),
        json!({ "activitySessionId": activity_id, "exerciseSessionIds": ["stranger"] }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = post_json(
        &app,
        "/player/play/exercises",
        Some("u1"),
        json!({ "activitySessionId": activity_id, "exerciseSessionIds": [] }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn composed_play_builds_every_exercise_without_starting_them() {
    let app = common::create_test_app(catalogue("composed"), ScriptedSandbox::new(statements));

    let (status, played) = play_activity(&app, "u1", "act").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(played["exercises"].as_array().unwrap().len(), 2);
    assert_eq!(app.sandbox.runs("a"), 1);
    assert_eq!(app.sandbox.runs("b"), 1);
    assert_eq!(played["navigation"]["exercises"][0]["state"], "NOT_STARTED");
    assert_eq!(played["hasNext"], false);
    assert_eq!(played["hasPrevious"], false);

    let (_, replay) = play_activity(&app, "u1", "act").await;
    assert_eq!(replay["exercises"].as_array().unwrap().len(), 2);
    assert_eq!(app.sandbox.runs("a"), 1);
    assert_eq!(app.sandbox.runs("b"), 1);
}

#[tokio::test]
async fn play_rejects_unknown_or_mistyped_resources() {
    let app = common::create_test_app(catalogue("manual"), ScriptedSandbox::new(statements));

    let (status, body) = play_activity(&app, "u1", "nothing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = play_activity(&app, "u1", "ex-a").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(&app, "/player/play/activity", Some("u1"), json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn learner_routes_require_a_valid_token() {
    let app = common::create_test_app(catalogue("manual"), ScriptedSandbox::new(statements));

    let (status, body) = post_json(&app, "/player/play/activity", None, json!({ "activityId": "act" })).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/player/preview")
                .header("content-type", "application/json")
                .header("authorization", "Bearer not-a-token")
                .body(Body::from(json!({ "resource": "ex-a" }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn exercise_without_a_matching_backend_is_a_configuration_error() {
    let app = common::create_test_app(catalogue("manual"), ScriptedSandbox::new(statements));

    let (status, body) = post_json(&app, "/player/preview", Some("u1"), json!({ "resource": "ex-ruby" })).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "CONFIGURATION_ERROR");
}

#[tokio::test]
async fn activity_preview_opens_its_navigation() {
    let app = common::create_test_app(catalogue("manual"), ScriptedSandbox::new(statements));

    let (status, body) = post_json(&app, "/player/preview", Some("u1"), json!({ "resource": "act" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "manual");
    assert_eq!(body["navigation"]["exercises"].as_array().unwrap().len(), 2);
    assert_eq!(body["exercises"][0]["variables"]["statement"], "statement of a");
}

#[tokio::test]
async fn health_reports_in_memory_storage() {
    let app = common::create_test_app(StaticCompiler::new(), ScriptedSandbox::new(statements));

    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["storage"], "memory");
    assert_eq!(json["dependencies"]["sessionStore"]["status"], "healthy");
}
