//! Instance principal federation.
//!
//! The instance metadata service hands out a leaf certificate, its private
//! key and the intermediate chain. Those are exchanged at the auth service
//! for a short-lived security token bound to a freshly generated session key.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{sign_request, AuthError, SessionCredentials, TokenSource};

pub const METADATA_BASE_URL: &str = "http://169.254.169.254/opc/v2";

const TENANT_OU_PREFIX: &str = "opc-tenant:";
const SESSION_KEY_BITS: u32 = 2048;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct X509FederationRequest {
    certificate: String,
    public_key: String,
    intermediate_certificates: Vec<String>,
    purpose: &'static str,
}

#[derive(Deserialize)]
struct X509FederationResponse {
    token: String,
}

struct CachedSession {
    creds: Arc<SessionCredentials>,
    refresh_at: DateTime<Utc>,
}

/// Token source backed by the instance identity.
pub struct InstancePrincipalSource {
    http: reqwest::Client,
    metadata_base: String,
    region: Option<String>,
    federation_endpoint: Option<String>,
    cached: Mutex<Option<CachedSession>>,
}

impl InstancePrincipalSource {
    pub fn new(http: reqwest::Client, region: Option<String>) -> Self {
        Self {
            http,
            metadata_base: METADATA_BASE_URL.to_string(),
            region,
            federation_endpoint: None,
            cached: Mutex::new(None),
        }
    }

    /// Point the source at a different metadata service and auth endpoint.
    pub fn with_endpoints(
        http: reqwest::Client,
        metadata_base: impl Into<String>,
        federation_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            http,
            metadata_base: metadata_base.into(),
            region: None,
            federation_endpoint: Some(federation_endpoint.into()),
            cached: Mutex::new(None),
        }
    }

    async fn federation_url(&self) -> Result<String, AuthError> {
        if let Some(url) = &self.federation_endpoint {
            return Ok(url.clone());
        }
        let region = match &self.region {
            Some(r) => r.clone(),
            None => fetch_region(&self.http, &self.metadata_base).await?,
        };
        Ok(format!("https://auth.{}.oraclecloud.com/v1/x509", region))
    }

    async fn federate(&self) -> Result<SessionCredentials, AuthError> {
        let cert_pem = metadata_get(&self.http, &self.metadata_base, "identity/cert.pem").await?;
        let key_pem = metadata_get(&self.http, &self.metadata_base, "identity/key.pem").await?;
        let chain_pem =
            metadata_get(&self.http, &self.metadata_base, "identity/intermediate.pem").await?;

        let cert = X509::from_pem(cert_pem.as_bytes())
            .map_err(|e| AuthError::Certificate(e.to_string()))?;
        let intermediates = X509::stack_from_pem(chain_pem.as_bytes())
            .map_err(|e| AuthError::Certificate(e.to_string()))?;
        let instance_key = PKey::private_key_from_pem(key_pem.as_bytes()).map_err(AuthError::Key)?;

        let tenancy = tenancy_from_cert(&cert)?;
        let key_id = format!("{}/fed-x509/{}", tenancy, fingerprint(&cert)?);

        let session_key = Rsa::generate(SESSION_KEY_BITS)
            .and_then(PKey::from_rsa)
            .map_err(AuthError::Key)?;

        let der = |c: &X509| {
            c.to_der()
                .map(|d| B64.encode(d))
                .map_err(|e| AuthError::Certificate(e.to_string()))
        };
        let body = X509FederationRequest {
            certificate: der(&cert)?,
            public_key: B64.encode(session_key.public_key_to_der().map_err(AuthError::Key)?),
            intermediate_certificates: intermediates.iter().map(der).collect::<Result<_, _>>()?,
            purpose: "DEFAULT",
        };

        let url = self.federation_url().await?;
        debug!(url = %url, tenancy = %tenancy, "Requesting instance principal token");

        let mut req = self.http.post(&url).json(&body).build()?;
        sign_request(&mut req, &key_id, &instance_key)?;

        let resp = self.http.execute(req).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AuthError::Federation(format!("{}: {}", status, text)));
        }
        let out: X509FederationResponse = resp.json().await?;

        Ok(SessionCredentials { token: out.token, key: session_key })
    }
}

#[async_trait]
impl TokenSource for InstancePrincipalSource {
    async fn session(&self) -> Result<Arc<SessionCredentials>, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            if Utc::now() < c.refresh_at {
                return Ok(Arc::clone(&c.creds));
            }
        }

        let creds = Arc::new(self.federate().await?);
        let refresh_at = match creds.expires_at() {
            Some(exp) => exp - Duration::seconds(60),
            None => Utc::now() + Duration::minutes(15),
        };
        info!(refresh_at = %refresh_at, "Obtained instance principal session token");
        *cached = Some(CachedSession { creds: Arc::clone(&creds), refresh_at });
        Ok(creds)
    }
}

/// Canonical name of the region the instance runs in.
pub async fn fetch_region(
    http: &reqwest::Client,
    metadata_base: &str,
) -> Result<String, AuthError> {
    let region = metadata_get(http, metadata_base, "instance/canonicalRegionName").await?;
    Ok(region.trim().to_string())
}

async fn metadata_get(http: &reqwest::Client, base: &str, path: &str) -> Result<String, AuthError> {
    let url = format!("{}/{}", base.trim_end_matches('/'), path);
    let resp = http
        .get(&url)
        .header(reqwest::header::AUTHORIZATION, "Bearer Oracle")
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.text().await?)
}

/// Tenancy OCID carried in the `opc-tenant:` organizational unit.
fn tenancy_from_cert(cert: &X509) -> Result<String, AuthError> {
    cert.subject_name()
        .entries_by_nid(Nid::ORGANIZATIONALUNITNAME)
        .filter_map(|e| e.data().as_utf8().ok())
        .find_map(|ou| ou.strip_prefix(TENANT_OU_PREFIX).map(str::to_string))
        .ok_or_else(|| AuthError::Certificate("no tenancy in certificate subject".to_string()))
}

/// SHA-1 fingerprint of the certificate as colon separated upper hex.
fn fingerprint(cert: &X509) -> Result<String, AuthError> {
    let digest = cert
        .digest(MessageDigest::sha1())
        .map_err(|e| AuthError::Certificate(e.to_string()))?;
    let pairs: Vec<String> = digest.iter().map(|b| hex::encode_upper([*b])).collect();
    Ok(pairs.join(":"))
}
