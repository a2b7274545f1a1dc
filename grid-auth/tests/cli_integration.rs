//! CLI integration tests for grid-auth

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Helper to escape path for TOML on Windows
fn escape_path_for_toml(path: &str) -> String {
    path.replace('\\', "\\\\")
}

fn setup_test_env(mastodon_url: &str) -> (TempDir, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    let db_path = temp_dir.path().join("postgrid.db");

    let config_content = format!(
        r#"
[database]
path = "{}"

[server]
frontend_url = "https://app.example.com"

[providers.mastodon]
client_id = "md-client"
client_secret = "md-secret"
instance = "{}"

[providers.bluesky]

[providers.x]
enabled = false
"#,
        escape_path_for_toml(&db_path.to_string_lossy()),
        mastodon_url
    );
    fs::write(&config_path, config_content).unwrap();

    (temp_dir, config_path.to_string_lossy().to_string())
}

fn grid_auth(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("grid-auth").unwrap();
    cmd.env("POSTGRID_CONFIG", config_path);
    cmd
}

#[test]
fn test_providers_lists_enabled_only() {
    let (_temp_dir, config_path) = setup_test_env("https://mastodon.example");

    let output = grid_auth(&config_path).arg("providers").output().unwrap();
    assert!(output.status.success());

    let providers: Value = serde_json::from_slice(&output.stdout).unwrap();
    let identifiers: Vec<&str> = providers
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["identifier"].as_str().unwrap())
        .collect();
    assert_eq!(identifiers, vec!["bluesky", "mastodon"]);
    assert_eq!(providers[1]["maxConcurrentJob"], 5);
    assert_eq!(providers[1]["supportsRefresh"], false);
}

#[test]
fn test_url_targets_configured_instance() {
    let (_temp_dir, config_path) = setup_test_env("https://mastodon.example");

    grid_auth(&config_path)
        .args(["url", "mastodon"])
        .assert()
        .success()
        .stdout(predicate::str::contains("https://mastodon.example/oauth/authorize"))
        .stdout(predicate::str::contains("md-client"))
        .stdout(predicate::str::contains("\"state\""));
}

#[test]
fn test_unknown_provider_fails() {
    let (_temp_dir, config_path) = setup_test_env("https://mastodon.example");

    grid_auth(&config_path)
        .args(["url", "myspace"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Unknown provider: myspace"));
}

#[test]
fn test_empty_code_is_invalid_input() {
    let (_temp_dir, config_path) = setup_test_env("https://mastodon.example");

    grid_auth(&config_path)
        .args(["connect", "mastodon", "--code", " "])
        .assert()
        .failure()
        .code(3);
}

#[test]
fn test_invalid_config_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("invalid.toml");
    fs::write(&config_path, "invalid toml content [[[").unwrap();

    grid_auth(config_path.to_str().unwrap())
        .arg("providers")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_exchanges_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("code=the-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "md-access",
            "token_type": "Bearer",
            "scope": "write:statuses profile write:media"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/accounts/verify_credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "109",
            "display_name": "Gargron",
            "acct": "gargron",
            "avatar": "https://files.example/avatar.png"
        })))
        .mount(&server)
        .await;

    let (_temp_dir, config_path) = setup_test_env(&server.uri());
    let output = grid_auth(&config_path)
        .args(["connect", "mastodon", "--code", "the-code"])
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let details: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(details["id"], "109");
    assert_eq!(details["accessToken"], "md-access");
    assert_eq!(details["username"], "gargron");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_code_exits_with_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "invalid_grant"
        })))
        .mount(&server)
        .await;

    let (_temp_dir, config_path) = setup_test_env(&server.uri());
    grid_auth(&config_path)
        .args(["connect", "mastodon", "--code", "stale"])
        .assert()
        .failure()
        .code(2);
}
