//! Oracle Cloud Infrastructure Object Storage backend for ocistash
//! repositories.
//!
//! [`OciBackend`] implements the [`ocistash_common::Backend`] contract on top
//! of an [`ObjectStoreClient`]. Connection settings come from
//! [`config::resolve`], which also selects the authentication principal.

pub mod adapter;
pub mod auth;
pub mod bucket;
pub mod client;
pub mod config;
pub mod range;
mod upload;

pub use adapter::{OciBackend, RenameState};
pub use auth::{AuthError, Principal, RequestSigner};
pub use client::{ClientError, HttpClient, MemoryClient, MemoryFaults, ObjectStoreClient};
pub use config::{resolve, Config, ConfigError, EnvSource, ProcessEnv, ResolvedConfig};
pub use range::{get_range, ByteRange};
