//! Connection configuration for the OCI backend.
//!
//! A [`Config`] is filled from the connection string (`oci:bucket/prefix`),
//! an optional TOML file and extended options. [`resolve`] then overlays the
//! environment onto every field that is still empty and produces a
//! [`ResolvedConfig`] with a validated [`Principal`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use ocistash_common::layout::clean_path;

use crate::auth::{InstancePrincipal, Principal, UserPrincipal, WorkloadPrincipal};

pub const DEFAULT_CONNECTIONS: usize = 5;
pub const DEFAULT_PART_SIZE: usize = 128 * 1024 * 1024;
/// Smallest part the service accepts for anything but the final part.
pub const MIN_PART_SIZE: usize = 10 * 1024 * 1024;

pub const AUTH_ENV_VAR: &str = "OCI_CLI_AUTH";
pub const REGION_ENV_VAR: &str = "OCI_REGION";
pub const TENANCY_ENV_VAR: &str = "OCI_TENANCY";
pub const USER_ENV_VAR: &str = "OCI_USER";
pub const FINGERPRINT_ENV_VAR: &str = "OCI_FINGERPRINT";
pub const KEY_FILE_ENV_VAR: &str = "OCI_KEY_FILE";
pub const PASSPHRASE_ENV_VAR: &str = "OCI_PASSPHRASE";
pub const COMPARTMENT_ENV_VAR: &str = "OCI_COMPARTMENT_OCID";
pub const RPST_ENV_VAR: &str = "OCI_RESOURCE_PRINCIPAL_RPST";
pub const RP_PRIVATE_PEM_ENV_VAR: &str = "OCI_RESOURCE_PRINCIPAL_PRIVATE_PEM";
pub const RP_PASSPHRASE_ENV_VAR: &str = "OCI_RESOURCE_PRINCIPAL_PRIVATE_PEM_PASSPHRASE";
pub const RP_REGION_ENV_VAR: &str = "OCI_RESOURCE_PRINCIPAL_REGION";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("oci: invalid format: {0}")]
    InvalidFormat(String),

    #[error("unable to authenticate OCI object store: {field} (${env}) is empty")]
    MissingField { field: &'static str, env: &'static str },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("unable to read private key file {}: {source}", path.display())]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How requests are authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// API signing key of an IAM user.
    UserPrincipal,
    /// Identity of the compute instance the process runs on.
    InstancePrincipal,
    /// Resource principal session token handed to a workload.
    WorkloadPrincipal,
}

impl FromStr for AuthMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "api_key" | "user_principal" => Ok(AuthMode::UserPrincipal),
            "instance_principal" => Ok(AuthMode::InstancePrincipal),
            "resource_principal" | "workload_principal" => Ok(AuthMode::WorkloadPrincipal),
            other => Err(ConfigError::InvalidValue {
                key: AUTH_ENV_VAR.to_string(),
                reason: format!("unknown auth mode {:?}", other),
            }),
        }
    }
}

/// Partially filled connection settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    /// Object storage namespace; looked up from the service when empty.
    pub namespace: String,
    pub compartment_ocid: String,
    pub auth: Option<AuthMode>,
    pub tenancy_id: String,
    pub user_id: String,
    pub fingerprint: String,
    pub private_key_file: String,
    pub passphrase: String,
    /// Resource principal session token, inline or as a file path.
    pub session_token: String,
    /// Private key paired with the session token, inline PEM or a file path.
    pub session_key: String,
    /// Override of the object storage endpoint URL.
    pub endpoint: String,
    pub connections: usize,
    /// Key layout name; empty means auto-detect.
    pub layout: String,
    pub part_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            region: String::new(),
            namespace: String::new(),
            compartment_ocid: String::new(),
            auth: None,
            tenancy_id: String::new(),
            user_id: String::new(),
            fingerprint: String::new(),
            private_key_file: String::new(),
            passphrase: String::new(),
            session_token: String::new(),
            session_key: String::new(),
            endpoint: String::new(),
            connections: DEFAULT_CONNECTIONS,
            layout: String::new(),
            part_size: DEFAULT_PART_SIZE,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .field("namespace", &self.namespace)
            .field("compartment_ocid", &self.compartment_ocid)
            .field("auth", &self.auth)
            .field("tenancy_id", &self.tenancy_id)
            .field("user_id", &self.user_id)
            .field("fingerprint", &self.fingerprint)
            .field("private_key_file", &self.private_key_file)
            .field("passphrase", &redact(&self.passphrase))
            .field("session_token", &redact(&self.session_token))
            .field("session_key", &redact(&self.session_key))
            .field("endpoint", &self.endpoint)
            .field("connections", &self.connections)
            .field("layout", &self.layout)
            .field("part_size", &self.part_size)
            .finish()
    }
}

pub(crate) fn redact(s: &str) -> &'static str {
    if s.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

impl Config {
    /// Parse a connection string of the form `oci:bucket[/prefix...]`.
    ///
    /// The first path element is the bucket; the rest is cleaned and becomes
    /// the key prefix, `.` when absent.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let rest = s.strip_prefix("oci:").ok_or_else(|| {
            ConfigError::InvalidFormat(format!("{:?} does not start with \"oci:\"", s))
        })?;

        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ConfigError::InvalidFormat(format!("no bucket name in {:?}", s)));
        }

        let cleaned = clean_path(prefix);
        let prefix = cleaned.strip_prefix('/').unwrap_or(&cleaned);

        Ok(Self {
            bucket: bucket.to_string(),
            prefix: if prefix.is_empty() { ".".to_string() } else { prefix.to_string() },
            ..Default::default()
        })
    }

    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply an extended option given as `key=value` on the command line.
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue { key: key.to_string(), reason };
        match key {
            "connections" => {
                let n: usize = value.parse().map_err(|e| invalid(format!("{}", e)))?;
                if n == 0 {
                    return Err(invalid("must be greater than zero".to_string()));
                }
                self.connections = n;
            }
            "layout" => self.layout = value.to_string(),
            "part-size" => {
                let mib: usize = value.parse().map_err(|e| invalid(format!("{}", e)))?;
                self.part_size = mib
                    .checked_mul(1024 * 1024)
                    .ok_or_else(|| invalid(format!("{} MiB is too large", mib)))?;
            }
            "region" => self.region = value.to_string(),
            "namespace" => self.namespace = value.to_string(),
            "endpoint" => self.endpoint = value.to_string(),
            "compartment" => self.compartment_ocid = value.to_string(),
            _ => return Err(invalid("unknown option".to_string())),
        }
        Ok(())
    }
}

/// Read access to environment variables.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment.
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.is_empty()).cloned()
    }
}

/// Fully validated settings for one backend instance.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub bucket: String,
    pub prefix: String,
    /// Always set except for instance principals, which may discover it.
    pub region: Option<String>,
    pub namespace: Option<String>,
    pub compartment_ocid: String,
    pub endpoint: Option<String>,
    pub connections: usize,
    pub layout: String,
    pub part_size: usize,
    pub principal: Principal,
}

/// Overlay the environment onto `cfg` and validate the result.
///
/// Environment values only fill fields that are still empty, so explicit
/// configuration always wins. Variable names are looked up with `env_prefix`
/// prepended (e.g. `OCISTASH_TEST_OCI_REGION`).
pub fn resolve(
    mut cfg: Config,
    env: &dyn EnvSource,
    env_prefix: &str,
) -> Result<ResolvedConfig, ConfigError> {
    let get = |name: &str| env.var(&format!("{}{}", env_prefix, name));
    let fill = |field: &mut String, name: &str| {
        if field.is_empty() {
            if let Some(v) = get(name) {
                *field = v;
            }
        }
    };

    let auth = match cfg.auth {
        Some(mode) => mode,
        None => get(AUTH_ENV_VAR).unwrap_or_default().parse()?,
    };

    fill(&mut cfg.region, REGION_ENV_VAR);
    fill(&mut cfg.compartment_ocid, COMPARTMENT_ENV_VAR);

    if cfg.bucket.is_empty() {
        return Err(ConfigError::InvalidFormat("bucket name is empty".to_string()));
    }
    if cfg.connections == 0 {
        return Err(ConfigError::InvalidValue {
            key: "connections".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    if cfg.part_size < MIN_PART_SIZE {
        return Err(ConfigError::InvalidValue {
            key: "part-size".to_string(),
            reason: format!("must be at least {} bytes", MIN_PART_SIZE),
        });
    }

    let principal = match auth {
        AuthMode::UserPrincipal => {
            fill(&mut cfg.tenancy_id, TENANCY_ENV_VAR);
            fill(&mut cfg.user_id, USER_ENV_VAR);
            fill(&mut cfg.fingerprint, FINGERPRINT_ENV_VAR);
            fill(&mut cfg.private_key_file, KEY_FILE_ENV_VAR);
            fill(&mut cfg.passphrase, PASSPHRASE_ENV_VAR);
            Principal::User(UserPrincipal::from_config(&cfg)?)
        }
        AuthMode::InstancePrincipal => Principal::Instance(InstancePrincipal::from_config(&cfg)),
        AuthMode::WorkloadPrincipal => {
            if cfg.region.is_empty() {
                if let Some(r) = get(RP_REGION_ENV_VAR) {
                    cfg.region = r;
                }
            }
            fill(&mut cfg.session_token, RPST_ENV_VAR);
            fill(&mut cfg.session_key, RP_PRIVATE_PEM_ENV_VAR);
            fill(&mut cfg.passphrase, RP_PASSPHRASE_ENV_VAR);
            Principal::Workload(WorkloadPrincipal::from_config(&cfg)?)
        }
    };

    let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };

    Ok(ResolvedConfig {
        bucket: cfg.bucket,
        prefix: cfg.prefix,
        region: non_empty(cfg.region),
        namespace: non_empty(cfg.namespace),
        compartment_ocid: cfg.compartment_ocid,
        endpoint: non_empty(cfg.endpoint),
        connections: cfg.connections,
        layout: cfg.layout,
        part_size: cfg.part_size,
        principal,
    })
}
