use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use openssl::pkey::{PKey, Private};

use super::{sign_request, AuthError, RequestSigner};

/// A security token and the private key it was issued for.
pub struct SessionCredentials {
    pub token: String,
    pub key: PKey<Private>,
}

impl SessionCredentials {
    /// Expiry encoded in the token's JWT `exp` claim.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        token_expiry(&self.token)
    }
}

/// Supplies the session credentials to sign with, refreshing as needed.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn session(&self) -> Result<Arc<SessionCredentials>, AuthError>;
}

/// A token handed to the process from outside; never refreshed.
pub struct StaticTokenSource {
    creds: Arc<SessionCredentials>,
}

impl StaticTokenSource {
    pub fn new(creds: SessionCredentials) -> Self {
        Self { creds: Arc::new(creds) }
    }

    pub fn credentials(&self) -> &SessionCredentials {
        &self.creds
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn session(&self) -> Result<Arc<SessionCredentials>, AuthError> {
        Ok(Arc::clone(&self.creds))
    }
}

/// Signs with a security token (`keyId="ST$<token>"`).
pub struct SecurityTokenSigner<S> {
    source: S,
}

impl<S: TokenSource> SecurityTokenSigner<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<S: TokenSource> RequestSigner for SecurityTokenSigner<S> {
    async fn sign(&self, req: &mut reqwest::Request) -> Result<(), AuthError> {
        let session = self.source.session().await?;
        sign_request(req, &format!("ST${}", session.token), &session.key)
    }
}

/// Read the `exp` claim of a JWT without verifying it.
pub(crate) fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let raw = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    DateTime::from_timestamp(claims.get("exp")?.as_i64()?, 0)
}

#[cfg(test)]
mod tests {
    use openssl::rsa::Rsa;

    use super::*;

    fn fake_jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
        let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{},"sub":"ocid1.instance"}}"#, exp));
        format!("{}.{}.c2ln", header, claims)
    }

    #[test]
    fn test_token_expiry() {
        let token = fake_jwt(1_800_000_000);
        assert_eq!(token_expiry(&token).unwrap().timestamp(), 1_800_000_000);
        assert!(token_expiry("not-a-jwt").is_none());
        assert!(token_expiry("a.!!!.c").is_none());
    }

    #[tokio::test]
    async fn test_security_token_key_id() {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let signer = SecurityTokenSigner::new(StaticTokenSource::new(SessionCredentials {
            token: "abc.def.ghi".to_string(),
            key,
        }));
        let mut req = reqwest::Client::new().get("https://example.com/n/").build().unwrap();
        signer.sign(&mut req).await.unwrap();
        let auth = req.headers()[reqwest::header::AUTHORIZATION].to_str().unwrap();
        assert!(auth.contains("keyId=\"ST$abc.def.ghi\""));
    }
}
