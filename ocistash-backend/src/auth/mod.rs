//! Request authentication.
//!
//! Every request to the object store carries an HTTP signature. Which key
//! signs it depends on the [`Principal`]: a user's API key, a session token
//! federated from the instance identity, or a session token handed to a
//! workload.

mod instance;
mod signing;
mod token;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use openssl::pkey::{PKey, Private};

use crate::config::{
    redact, Config, ConfigError, FINGERPRINT_ENV_VAR, KEY_FILE_ENV_VAR, REGION_ENV_VAR,
    RPST_ENV_VAR, RP_PRIVATE_PEM_ENV_VAR, TENANCY_ENV_VAR, USER_ENV_VAR,
};

pub use instance::{fetch_region, InstancePrincipalSource, METADATA_BASE_URL};
pub use signing::{sign_request, signing_string, DATE_FORMAT};
pub use token::{SecurityTokenSigner, SessionCredentials, StaticTokenSource, TokenSource};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unable to read {what} {}: {source}", path.display())]
    ReadFile {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid private key: {0}")]
    Key(#[source] openssl::error::ErrorStack),

    #[error("signing failed: {0}")]
    Sign(#[source] openssl::error::ErrorStack),

    #[error("invalid certificate: {0}")]
    Certificate(String),

    #[error("request is missing header {0} required for signing")]
    MissingHeader(String),

    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),

    #[error("metadata service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("federation failed: {0}")]
    Federation(String),
}

/// Signs outgoing requests in place.
#[async_trait]
pub trait RequestSigner: Send + Sync {
    async fn sign(&self, req: &mut reqwest::Request) -> Result<(), AuthError>;
}

/// Identity used to authenticate, with the fields each kind requires.
#[derive(Debug, Clone)]
pub enum Principal {
    User(UserPrincipal),
    Instance(InstancePrincipal),
    Workload(WorkloadPrincipal),
}

impl Principal {
    /// Region the principal is bound to, if it knows one without asking
    /// the instance metadata service.
    pub fn region(&self) -> Option<&str> {
        match self {
            Principal::User(u) => Some(&u.region),
            Principal::Instance(i) => i.region.as_deref(),
            Principal::Workload(w) => Some(&w.region),
        }
    }

    /// Build the signing capability for this principal.
    pub fn signer(&self, http: &reqwest::Client) -> Result<Arc<dyn RequestSigner>, AuthError> {
        match self {
            Principal::User(u) => Ok(Arc::new(u.signer()?)),
            Principal::Instance(i) => Ok(Arc::new(SecurityTokenSigner::new(
                InstancePrincipalSource::new(http.clone(), i.region.clone()),
            ))),
            Principal::Workload(w) => Ok(Arc::new(SecurityTokenSigner::new(w.token_source()?))),
        }
    }
}

/// API signing key of an IAM user.
#[derive(Clone)]
pub struct UserPrincipal {
    pub tenancy: String,
    pub user: String,
    pub fingerprint: String,
    pub private_key_file: PathBuf,
    pub passphrase: Option<String>,
    pub region: String,
}

impl UserPrincipal {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let required = |value: &str, field: &'static str, env: &'static str| {
            if value.is_empty() {
                Err(ConfigError::MissingField { field, env })
            } else {
                Ok(value.to_string())
            }
        };

        let tenancy = required(&cfg.tenancy_id, "Tenancy ID", TENANCY_ENV_VAR)?;
        let user = required(&cfg.user_id, "User ID", USER_ENV_VAR)?;
        let fingerprint = required(&cfg.fingerprint, "Fingerprint", FINGERPRINT_ENV_VAR)?;
        let key_file = required(&cfg.private_key_file, "Private key file path", KEY_FILE_ENV_VAR)?;
        let region = required(&cfg.region, "Region", REGION_ENV_VAR)?;

        let private_key_file = PathBuf::from(key_file);
        std::fs::metadata(&private_key_file).map_err(|source| ConfigError::KeyFile {
            path: private_key_file.clone(),
            source,
        })?;

        Ok(Self {
            tenancy,
            user,
            fingerprint,
            private_key_file,
            passphrase: (!cfg.passphrase.is_empty()).then(|| cfg.passphrase.clone()),
            region,
        })
    }

    pub fn key_id(&self) -> String {
        format!("{}/{}/{}", self.tenancy, self.user, self.fingerprint)
    }

    fn signer(&self) -> Result<ApiKeySigner, AuthError> {
        let pem = read_file("private key file", &self.private_key_file)?;
        let key = load_private_key(&pem, self.passphrase.as_deref())?;
        Ok(ApiKeySigner { key_id: self.key_id(), key })
    }
}

impl fmt::Debug for UserPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPrincipal")
            .field("tenancy", &self.tenancy)
            .field("user", &self.user)
            .field("fingerprint", &self.fingerprint)
            .field("private_key_file", &self.private_key_file)
            .field("passphrase", &redact(self.passphrase.as_deref().unwrap_or("")))
            .field("region", &self.region)
            .finish()
    }
}

/// Identity of the compute instance; nothing has to be configured.
#[derive(Debug, Clone)]
pub struct InstancePrincipal {
    pub region: Option<String>,
}

impl InstancePrincipal {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            region: (!cfg.region.is_empty()).then(|| cfg.region.clone()),
        }
    }
}

/// Resource principal session token plus the key it was issued for.
#[derive(Clone)]
pub struct WorkloadPrincipal {
    /// Token value or path of a file holding it.
    pub session_token: String,
    /// PEM value or path of a file holding it.
    pub private_key: String,
    pub passphrase: Option<String>,
    pub region: String,
}

impl WorkloadPrincipal {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        if cfg.session_token.is_empty() {
            return Err(ConfigError::MissingField { field: "Session token", env: RPST_ENV_VAR });
        }
        if cfg.session_key.is_empty() {
            return Err(ConfigError::MissingField {
                field: "Session private key",
                env: RP_PRIVATE_PEM_ENV_VAR,
            });
        }
        if cfg.region.is_empty() {
            return Err(ConfigError::MissingField { field: "Region", env: REGION_ENV_VAR });
        }
        Ok(Self {
            session_token: cfg.session_token.clone(),
            private_key: cfg.session_key.clone(),
            passphrase: (!cfg.passphrase.is_empty()).then(|| cfg.passphrase.clone()),
            region: cfg.region.clone(),
        })
    }

    fn token_source(&self) -> Result<StaticTokenSource, AuthError> {
        let token = if Path::new(&self.session_token).is_file() {
            let raw = read_file("session token file", Path::new(&self.session_token))?;
            String::from_utf8_lossy(&raw).trim().to_string()
        } else {
            self.session_token.trim().to_string()
        };

        let pem = if self.private_key.trim_start().starts_with("-----BEGIN") {
            self.private_key.as_bytes().to_vec()
        } else {
            read_file("session key file", Path::new(&self.private_key))?
        };
        let key = load_private_key(&pem, self.passphrase.as_deref())?;

        Ok(StaticTokenSource::new(SessionCredentials { token, key }))
    }
}

impl fmt::Debug for WorkloadPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadPrincipal")
            .field("session_token", &redact(&self.session_token))
            .field("private_key", &redact(&self.private_key))
            .field("region", &self.region)
            .finish()
    }
}

/// Signs with a user's API key.
pub struct ApiKeySigner {
    key_id: String,
    key: PKey<Private>,
}

impl ApiKeySigner {
    pub fn new(key_id: impl Into<String>, key: PKey<Private>) -> Self {
        Self { key_id: key_id.into(), key }
    }
}

#[async_trait]
impl RequestSigner for ApiKeySigner {
    async fn sign(&self, req: &mut reqwest::Request) -> Result<(), AuthError> {
        sign_request(req, &self.key_id, &self.key)
    }
}

/// Parse a PEM private key, decrypting it when a passphrase is given.
pub fn load_private_key(pem: &[u8], passphrase: Option<&str>) -> Result<PKey<Private>, AuthError> {
    match passphrase {
        Some(p) => PKey::private_key_from_pem_passphrase(pem, p.as_bytes()),
        None => PKey::private_key_from_pem(pem),
    }
    .map_err(AuthError::Key)
}

fn read_file(what: &'static str, path: &Path) -> Result<Vec<u8>, AuthError> {
    std::fs::read(path).map_err(|source| AuthError::ReadFile {
        what,
        path: path.to_path_buf(),
        source,
    })
}
