use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use player_engine::models::{SourceFile, Variables};
use player_engine::sandbox::{PythonSandbox, Sandbox, SandboxError, SandboxInput, ScriptSandbox};

const TIMEOUT: Duration = Duration::from_secs(5);

fn input(envid: Option<&str>) -> SandboxInput {
    let mut variables = Variables::new();
    variables.insert("seed".into(), json!(4));
    SandboxInput {
        variables,
        files: envid.is_none().then(|| {
            vec![SourceFile {
                path: "data.csv".into(),
                content: "a,b".into(),
            }]
        }),
        envid: envid.map(str::to_string),
    }
}

#[tokio::test]
async fn python_success_returns_result_and_environment() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/execute/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 0,
            "execution": [{ "exit_code": 0, "stdout": "", "stderr": "" }],
            "result": "{\"statement\": \"2+2?\", \"seed\": 4}",
            "environment": "env-42"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sandbox = PythonSandbox::new(&server.uri()).unwrap();
    let output = sandbox.run(input(None), "statement = '2+2?'", TIMEOUT).await.unwrap();

    assert_eq!(output.envid.as_deref(), Some("env-42"));
    assert_eq!(output.variables["statement"], "2+2?");
    assert_eq!(output.variables["seed"], 4);
}

#[tokio::test]
async fn python_reuses_the_previous_environment() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/execute/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 0,
            "result": { "grade": 100 },
            "environment": "env-7"
        })))
        .mount(&server)
        .await;

    let sandbox = PythonSandbox::new(&server.uri()).unwrap();
    sandbox.run(input(Some("env-7")), "grade = 100", TIMEOUT).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(body.contains("name=\"config\""));
    assert!(body.contains("\"environment\":\"env-7\""));
    assert!(body.contains("name=\"environment\"; filename=\"environment.tgz\""));
}

#[tokio::test]
async fn python_timeout_status_is_a_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/execute/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": -2 })))
        .mount(&server)
        .await;

    let sandbox = PythonSandbox::new(&server.uri()).unwrap();
    let err = sandbox.run(input(None), "while True: pass", TIMEOUT).await.unwrap_err();
    assert_eq!(err, SandboxError::Timeout(TIMEOUT));
}

#[tokio::test]
async fn python_failure_carries_the_script_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/execute/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 1,
            "execution": [{ "exit_code": 1, "stdout": "", "stderr": "NameError: name 'x' is not defined" }]
        })))
        .mount(&server)
        .await;

    let sandbox = PythonSandbox::new(&server.uri()).unwrap();
    match sandbox.run(input(None), "y = x", TIMEOUT).await {
        Err(SandboxError::Unknown(detail)) => assert!(detail.contains("NameError")),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn python_http_error_is_unknown() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/execute/"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let sandbox = PythonSandbox::new(&server.uri()).unwrap();
    match sandbox.run(input(None), "x = 1", TIMEOUT).await {
        Err(SandboxError::Unknown(detail)) => assert!(detail.contains("503")),
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn slow_executor_hits_the_client_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/execute/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "status": 0, "result": {} }))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let sandbox = PythonSandbox::new(&server.uri()).unwrap();
    let timeout = Duration::from_millis(50);
    let err = sandbox.run(input(None), "x = 1", timeout).await.unwrap_err();
    assert_eq!(err, SandboxError::Timeout(timeout));
}

#[tokio::test]
async fn script_backend_sends_files_only_without_environment() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .and(body_partial_json(json!({
            "script": "grade = 100",
            "envid": "env-3",
            "timeout_ms": 5000
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 0,
            "variables": { "grade": 100 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let sandbox = ScriptSandbox::new(&server.uri()).unwrap();
    let output = sandbox.run(input(Some("env-3")), "grade = 100", TIMEOUT).await.unwrap();

    // The executor kept the environment without naming it again.
    assert_eq!(output.envid.as_deref(), Some("env-3"));
    assert_eq!(output.variables["grade"], 100);

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body.get("files").is_none());
}

#[tokio::test]
async fn script_backend_maps_status_codes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .and(body_partial_json(json!({ "script": "loop()" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": -2 })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/run"))
        .and(body_partial_json(json!({ "script": "boom()" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 1,
            "error": "ReferenceError: boom is not defined"
        })))
        .mount(&server)
        .await;

    let sandbox = ScriptSandbox::new(&server.uri()).unwrap();
    assert_eq!(
        sandbox.run(input(None), "loop()", TIMEOUT).await.unwrap_err(),
        SandboxError::Timeout(TIMEOUT)
    );
    assert_eq!(
        sandbox.run(input(None), "boom()", TIMEOUT).await.unwrap_err(),
        SandboxError::Unknown("ReferenceError: boom is not defined".into())
    );
}
