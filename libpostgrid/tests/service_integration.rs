//! Integration tests for PostgridService
//!
//! Exercises the facade as a whole: SSO sign-in across products and
//! publishing against a mocked provider API.

use libpostgrid::error::{PostgridError, SsoError};
use libpostgrid::service::events::Event;
use libpostgrid::service::publishing::PublishJob;
use libpostgrid::sso::models::NewProduct;
use libpostgrid::sso::{sign_request, SsoRequest, SsoResponse};
use libpostgrid::{Config, Integration, PostDetails, PostgridService, PublishStatus};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn setup_service(mastodon_url: &str) -> (PostgridService, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("postgrid.db");

    let config = Config::from_toml(&format!(
        r#"
[database]
path = "{}"

[server]
frontend_url = "https://app.example.com"
jwt_secret = "integration-secret"

[publishing]
max_attempts = 2
base_delay = "5ms"

[retry]
max_retries = 0
delay = "5ms"

[providers.mastodon]
client_id = "md-client"
client_secret = "md-secret"
instance = "{}"
"#,
        db_path.to_string_lossy().replace('\\', "\\\\"),
        mastodon_url
    ))
    .unwrap();

    let service = PostgridService::from_config(config).await.unwrap();
    (service, temp_dir)
}

fn signed_request(
    api_key: &str,
    secret: &str,
    external_id: &str,
    email: &str,
    redirect_uri: Option<&str>,
) -> SsoRequest {
    let timestamp = chrono::Utc::now().timestamp();
    SsoRequest {
        api_key: api_key.to_string(),
        external_id: external_id.to_string(),
        email: email.to_string(),
        name: Some("Ada".to_string()),
        timestamp,
        signature: sign_request(secret, timestamp, external_id, email).unwrap(),
        redirect_uri: redirect_uri.map(str::to_string),
    }
}

fn mastodon_integration() -> Integration {
    Integration {
        id: "int-1".to_string(),
        internal_id: "109".to_string(),
        name: "Gargron".to_string(),
        provider_identifier: "mastodon".to_string(),
        token: "md-access".to_string(),
        profile: "gargron".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_same_person_across_products_shares_one_user() {
    let (service, _temp_dir) = setup_service("https://mastodon.example").await;
    let sso = service.sso();

    let acme = sso
        .platform
        .register_product(NewProduct {
            name: "Acme".to_string(),
            slug: "acme".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let globex = sso
        .platform
        .register_product(NewProduct {
            name: "Globex".to_string(),
            slug: "globex".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let first = sso
        .unified
        .authenticate(signed_request(
            &acme.api_key,
            &acme.signing_secret,
            "acme-42",
            "ada@example.com",
            None,
        ))
        .await
        .unwrap();
    let second = sso
        .unified
        .authenticate(signed_request(
            &globex.api_key,
            &globex.signing_secret,
            "gx-7",
            "Ada@Example.com",
            None,
        ))
        .await
        .unwrap();

    let (
        SsoResponse::Session { user_id: first_user, created: first_created, .. },
        SsoResponse::Session { user_id: second_user, created: second_created, token, .. },
    ) = (first, second)
    else {
        panic!("expected sessions");
    };
    assert_eq!(first_user, second_user);
    assert!(first_created);
    assert!(!second_created);

    let claims = sso.seamless.verify_session(&token).unwrap();
    assert_eq!(claims.product, globex.product.id);
    assert_eq!(claims.email, "ada@example.com");

    let mappings = sso.mapping.mappings_for_user(&first_user).await.unwrap();
    assert_eq!(mappings.len(), 2);
}

#[tokio::test]
async fn test_redirect_login_code_is_single_use() {
    let (service, _temp_dir) = setup_service("https://mastodon.example").await;
    let sso = service.sso();
    let credentials = sso
        .platform
        .register_product(NewProduct {
            name: "Acme".to_string(),
            slug: "acme".to_string(),
            redirect_uris: vec!["https://acme.example/sso/callback".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();

    let response = sso
        .unified
        .authenticate(signed_request(
            &credentials.api_key,
            &credentials.signing_secret,
            "u-1",
            "ada@example.com",
            Some("https://acme.example/sso/callback?next=/home"),
        ))
        .await
        .unwrap();
    let SsoResponse::Redirect { url } = response else {
        panic!("expected a redirect");
    };
    assert!(url.starts_with("https://acme.example/sso/callback?"));
    assert!(url.contains("next=%2Fhome") || url.contains("next=/home"));

    let code = url.split("code=").nth(1).unwrap().to_string();
    let session = sso.unified.exchange_code(&code).unwrap();
    assert!(sso.seamless.verify_session(&session.token).is_ok());

    let err = sso.unified.exchange_code(&code).unwrap_err();
    assert!(matches!(err, PostgridError::Sso(SsoError::CodeNotFound)));
}

#[tokio::test]
async fn test_rotated_credentials_invalidate_old_key() {
    let (service, _temp_dir) = setup_service("https://mastodon.example").await;
    let sso = service.sso();
    let original = sso
        .platform
        .register_product(NewProduct {
            name: "Acme".to_string(),
            slug: "acme".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    // Warm the API key cache before rotating
    sso.unified
        .authenticate(signed_request(
            &original.api_key,
            &original.signing_secret,
            "u-1",
            "ada@example.com",
            None,
        ))
        .await
        .unwrap();

    let rotated = sso
        .platform
        .rotate_credentials(&original.product.id)
        .await
        .unwrap();

    let err = sso
        .unified
        .authenticate(signed_request(
            &original.api_key,
            &original.signing_secret,
            "u-1",
            "ada@example.com",
            None,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, PostgridError::Sso(SsoError::ProductNotFound(_))));

    assert!(sso
        .unified
        .authenticate(signed_request(
            &rotated.api_key,
            &rotated.signing_secret,
            "u-1",
            "ada@example.com",
            None,
        ))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_publish_records_history_and_emits_events() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/statuses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "1", "url": "https://mastodon.example/@gargron/1"
        })))
        .mount(&server)
        .await;

    let (service, _temp_dir) = setup_service(&server.uri()).await;
    let mut events = service.subscribe();

    let job = PublishJob::new(
        mastodon_integration(),
        vec![PostDetails::new("p-1", "Hello from the grid")],
    );
    let job_id = job.job_id.clone();
    let outcome = service.publishing().publish(job).await.unwrap();
    assert_eq!(outcome.responses[0].post_id, "1");

    let records = service.database().get_publish_records(&job_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, PublishStatus::Published);
    assert_eq!(records[0].network_post_id.as_deref(), Some("1"));

    assert!(matches!(events.recv().await.unwrap(), Event::PublishStarted { .. }));
    match events.recv().await.unwrap() {
        Event::PublishCompleted { post_ids, .. } => assert_eq!(post_ids, vec!["1".to_string()]),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_rejected_token_requires_reconnect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/statuses"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "The access token is invalid"
        })))
        .mount(&server)
        .await;

    let (service, _temp_dir) = setup_service(&server.uri()).await;
    let mut events = service.subscribe();

    let job = PublishJob::new(mastodon_integration(), vec![PostDetails::new("p-1", "Hello")]);
    let job_id = job.job_id.clone();
    let err = service.publishing().publish(job).await.unwrap_err();
    assert_eq!(err.exit_code(), 2);

    let records = service.database().get_publish_records(&job_id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, PublishStatus::Failed);

    let mut saw_refresh_required = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::RefreshRequired { .. }) {
            saw_refresh_required = true;
        }
    }
    assert!(saw_refresh_required);
}
