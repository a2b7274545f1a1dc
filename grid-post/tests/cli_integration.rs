//! CLI integration tests for grid-post

use assert_cmd::Command;
use libpostgrid::{Database, PublishStatus};
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Helper to escape path for TOML on Windows
fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

struct TestEnv {
    _temp_dir: TempDir,
    config_path: String,
    db_path: String,
    integration_path: String,
    posts_path: String,
}

fn setup_test_env(mastodon_url: &str, posts: Value) -> TestEnv {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("postgrid.db");
    let integration_path = temp_dir.path().join("integration.json");
    let posts_path = temp_dir.path().join("posts.json");

    let config_content = format!(
        r#"
[database]
path = "{}"

[server]
frontend_url = "https://app.example.com"
jwt_secret = "test-secret"

[publishing]
max_attempts = 2
base_delay = "10ms"

[retry]
max_retries = 0
delay = "10ms"

[providers.mastodon]
client_id = "md-client"
client_secret = "md-secret"
instance = "{}"
"#,
        escape_path_for_toml(&db_path.to_string_lossy()),
        mastodon_url
    );
    fs::write(&config_path, config_content).unwrap();

    let integration = json!({
        "id": "int-1",
        "internalId": "109",
        "name": "Gargron",
        "providerIdentifier": "mastodon",
        "token": "md-access",
        "profile": "gargron"
    });
    fs::write(&integration_path, integration.to_string()).unwrap();
    fs::write(&posts_path, posts.to_string()).unwrap();

    TestEnv {
        config_path: config_path.to_string_lossy().to_string(),
        db_path: db_path.to_string_lossy().to_string(),
        integration_path: integration_path.to_string_lossy().to_string(),
        posts_path: posts_path.to_string_lossy().to_string(),
        _temp_dir: temp_dir,
    }
}

fn grid_post(env: &TestEnv) -> Command {
    let mut cmd = Command::cargo_bin("grid-post").unwrap();
    cmd.env("POSTGRID_CONFIG", &env.config_path)
        .arg("--integration")
        .arg(&env.integration_path);
    cmd
}

#[tokio::test(flavor = "multi_thread")]
async fn test_publishes_thread_and_records_outcome() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/statuses"))
        .and(header("authorization", "Bearer md-access"))
        .and(body_partial_json(json!({"status": "first"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "1", "url": "https://mastodon.example/@gargron/1"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/statuses"))
        .and(body_partial_json(json!({"status": "second", "in_reply_to_id": "1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "2", "url": "https://mastodon.example/@gargron/2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let env = setup_test_env(
        &server.uri(),
        json!([
            {"id": "a", "message": "first"},
            {"id": "b", "message": "second"}
        ]),
    );

    let output = grid_post(&env)
        .arg("--posts")
        .arg(&env.posts_path)
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let outcome: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(outcome["provider"], "mastodon");
    assert_eq!(outcome["attempts"], 1);
    assert_eq!(outcome["responses"][1]["postId"], "2");
    assert_eq!(
        outcome["responses"][1]["releaseURL"],
        "https://mastodon.example/@gargron/2"
    );

    let db = Database::new(&env.db_path).await.unwrap();
    let records = db
        .get_publish_records(outcome["jobId"].as_str().unwrap())
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == PublishStatus::Published));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reads_posts_from_stdin() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/statuses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "7", "url": "https://mastodon.example/@gargron/7"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let env = setup_test_env(&server.uri(), json!([]));
    grid_post(&env)
        .write_stdin(r#"[{"id": "a", "message": "from stdin"}]"#)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"postId\": \"7\""));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_token_exits_with_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/statuses"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "The access token is invalid"
        })))
        .mount(&server)
        .await;

    let env = setup_test_env(&server.uri(), json!([{"id": "a", "message": "hello"}]));
    grid_post(&env)
        .arg("--posts")
        .arg(&env.posts_path)
        .assert()
        .failure()
        .code(2);
}

#[test]
fn test_invalid_posts_json_is_invalid_input() {
    let env = setup_test_env("https://mastodon.example", json!({"not": "a list"}));

    grid_post(&env)
        .arg("--posts")
        .arg(&env.posts_path)
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Invalid posts JSON"));
}

#[test]
fn test_empty_post_list_is_invalid_input() {
    let env = setup_test_env("https://mastodon.example", json!([]));

    grid_post(&env)
        .arg("--posts")
        .arg(&env.posts_path)
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains("Nothing to publish"));
}

#[test]
fn test_missing_integration_file() {
    let env = setup_test_env("https://mastodon.example", json!([]));

    Command::cargo_bin("grid-post")
        .unwrap()
        .env("POSTGRID_CONFIG", &env.config_path)
        .args(["--integration", "/nonexistent/integration.json"])
        .assert()
        .failure()
        .code(3);
}
