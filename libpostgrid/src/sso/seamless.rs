//! Session tokens and single-use login codes

use reqwest::Url;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;

use super::models::{Product, SessionSubject, SessionToken};
use super::token::{SessionClaims, TokenSigner};
use crate::cache::TtlCache;
use crate::error::{Result, SsoError};
use crate::providers::http::make_id;

const LOGIN_CODE_LENGTH: usize = 48;

#[derive(Clone)]
pub struct SeamlessAuthService {
    signer: TokenSigner,
    session_ttl: Duration,
    codes: Arc<TtlCache<String, SessionSubject>>,
}

impl SeamlessAuthService {
    /// `codes` bounds how long and how many login codes stay redeemable
    pub fn new(
        secret: SecretString,
        session_ttl: Duration,
        codes: Arc<TtlCache<String, SessionSubject>>,
    ) -> Self {
        Self {
            signer: TokenSigner::new(secret),
            session_ttl,
            codes,
        }
    }

    pub fn issue_session(&self, subject: &SessionSubject) -> Result<SessionToken> {
        let now = chrono::Utc::now().timestamp();
        let expires_at = now + self.session_ttl.as_secs() as i64;
        let token = self.signer.sign(&SessionClaims {
            sub: subject.user_id.clone(),
            org: subject.organization_id.clone(),
            product: subject.product_id.clone(),
            email: subject.email.clone(),
            iat: now,
            exp: expires_at,
        })?;

        Ok(SessionToken { token, expires_at })
    }

    /// Check signature and expiry
    pub fn verify_session(&self, token: &str) -> Result<SessionClaims> {
        let claims: SessionClaims = self.signer.verify(token)?;
        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(SsoError::InvalidToken("token expired".to_string()).into());
        }
        Ok(claims)
    }

    /// Hold `subject` behind a short-lived code that can be redeemed once
    pub fn create_login_code(&self, subject: SessionSubject) -> String {
        let code = make_id(LOGIN_CODE_LENGTH);
        self.codes.insert(code.clone(), subject);
        code
    }

    pub fn redeem_login_code(&self, code: &str) -> Result<SessionToken> {
        let subject = self
            .codes
            .remove(&code.to_string())
            .ok_or(SsoError::CodeNotFound)?;
        self.issue_session(&subject)
    }

    /// `redirect_uri` with `code` appended, if the product allows that URI
    pub fn build_redirect(&self, product: &Product, redirect_uri: &str, code: &str) -> Result<String> {
        if !product.allows_redirect(redirect_uri) {
            return Err(SsoError::InvalidRedirect(redirect_uri.to_string()).into());
        }
        let mut url =
            Url::parse(redirect_uri).map_err(|_| SsoError::InvalidRedirect(redirect_uri.to_string()))?;
        url.query_pairs_mut().append_pair("code", code);
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::error::PostgridError;

    fn service(session_ttl: Duration) -> (SeamlessAuthService, ManualClock) {
        let clock = ManualClock::new();
        let codes = Arc::new(TtlCache::new(
            Duration::from_secs(120),
            100,
            Arc::new(clock.clone()),
        ));
        (
            SeamlessAuthService::new(SecretString::from("session-key".to_string()), session_ttl, codes),
            clock,
        )
    }

    fn subject() -> SessionSubject {
        SessionSubject {
            user_id: "user-1".to_string(),
            organization_id: "org-1".to_string(),
            product_id: "prod-1".to_string(),
            email: "ada@example.com".to_string(),
        }
    }

    fn product() -> Product {
        Product {
            id: "prod-1".to_string(),
            name: "Partner".to_string(),
            slug: "partner".to_string(),
            signing_secret: String::new(),
            redirect_uris: vec!["https://partner.example.com/sso".to_string()],
            health_url: None,
            active: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_session_round_trip() {
        let (service, _) = service(Duration::from_secs(3600));
        let session = service.issue_session(&subject()).unwrap();

        let claims = service.verify_session(&session.token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.org, "org-1");
        assert_eq!(claims.exp, session.expires_at);
    }

    #[test]
    fn test_expired_session_rejected() {
        let (service, _) = service(Duration::ZERO);
        let session = service.issue_session(&subject()).unwrap();
        assert!(matches!(
            service.verify_session(&session.token),
            Err(PostgridError::Sso(SsoError::InvalidToken(_)))
        ));
    }

    #[test]
    fn test_login_code_is_single_use() {
        let (service, _) = service(Duration::from_secs(3600));
        let code = service.create_login_code(subject());

        let session = service.redeem_login_code(&code).unwrap();
        assert_eq!(service.verify_session(&session.token).unwrap().sub, "user-1");
        assert!(matches!(
            service.redeem_login_code(&code),
            Err(PostgridError::Sso(SsoError::CodeNotFound))
        ));
    }

    #[test]
    fn test_login_code_expires() {
        let (service, clock) = service(Duration::from_secs(3600));
        let code = service.create_login_code(subject());
        clock.advance(Duration::from_secs(121));
        assert!(service.redeem_login_code(&code).is_err());
    }

    #[test]
    fn test_build_redirect() {
        let (service, _) = service(Duration::from_secs(3600));
        let url = service
            .build_redirect(&product(), "https://partner.example.com/sso?next=%2Fhome", "abc123")
            .unwrap();
        assert_eq!(url, "https://partner.example.com/sso?next=%2Fhome&code=abc123");

        assert!(matches!(
            service.build_redirect(&product(), "https://evil.example.com/sso", "abc123"),
            Err(PostgridError::Sso(SsoError::InvalidRedirect(_)))
        ));
    }
}
