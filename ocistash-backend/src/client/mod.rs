//! Object storage API surface used by the adapter.

mod http;
mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;

use ocistash_common::BackendError;

use crate::auth::AuthError;
use crate::range::ByteRange;

pub use http::HttpClient;
pub use memory::{MemoryClient, MemoryFaults};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {code}: {message}")]
    Status {
        status: StatusCode,
        code: String,
        message: String,
    },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("work request {id} ended in state {state}")]
    WorkRequest { id: String, state: String },
}

impl ClientError {
    pub fn status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Status { status, code: code.into(), message: message.into() }
    }

    pub fn not_found(what: &str) -> Self {
        Self::status(StatusCode::NOT_FOUND, "ObjectNotFound", format!("{} does not exist", what))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status, .. } if *status == StatusCode::NOT_FOUND)
    }

    /// Classify for the storage contract: 404 becomes `NotFound`, anything
    /// else is wrapped with the operation name.
    pub fn into_backend(self, op: &'static str, key: &str) -> BackendError {
        if self.is_not_found() {
            BackendError::NotFound(key.to_string())
        } else {
            BackendError::remote(op, self)
        }
    }
}

/// Bucket addressed within a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketRef {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub names: Vec<String>,
    /// Start value for the next page; `None` on the last page.
    pub next_start: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommitPart {
    pub part_num: u32,
    pub etag: String,
}

/// An in-progress multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartUpload {
    pub key: String,
    pub upload_id: String,
}

/// Server-side copy inside one region.
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub bucket: BucketRef,
    pub region: String,
    pub source: String,
    pub destination: String,
}

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    async fn get_namespace(&self) -> Result<String, ClientError>;

    async fn get_bucket(&self, bucket: &BucketRef) -> Result<(), ClientError>;

    /// Create a bucket without public access.
    async fn create_bucket(&self, bucket: &BucketRef, compartment: &str) -> Result<(), ClientError>;

    async fn head_object(&self, bucket: &BucketRef, key: &str) -> Result<ObjectMeta, ClientError>;

    async fn get_object(
        &self,
        bucket: &BucketRef,
        key: &str,
        range: Option<&ByteRange>,
    ) -> Result<Bytes, ClientError>;

    async fn put_object(&self, bucket: &BucketRef, key: &str, data: Bytes)
        -> Result<(), ClientError>;

    async fn create_multipart_upload(
        &self,
        bucket: &BucketRef,
        key: &str,
    ) -> Result<MultipartUpload, ClientError>;

    /// Upload one part; returns its ETag. Part numbers start at 1.
    async fn upload_part(
        &self,
        bucket: &BucketRef,
        upload: &MultipartUpload,
        part_num: u32,
        data: Bytes,
    ) -> Result<String, ClientError>;

    async fn commit_multipart_upload(
        &self,
        bucket: &BucketRef,
        upload: &MultipartUpload,
        parts: &[CommitPart],
    ) -> Result<(), ClientError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &BucketRef,
        upload: &MultipartUpload,
    ) -> Result<(), ClientError>;

    async fn delete_object(&self, bucket: &BucketRef, key: &str) -> Result<(), ClientError>;

    /// List object names starting with `prefix`, beginning at `start`.
    async fn list_objects(
        &self,
        bucket: &BucketRef,
        prefix: &str,
        start: Option<&str>,
    ) -> Result<ListPage, ClientError>;

    /// Copy an object and wait until the copy is visible.
    async fn copy_object(&self, req: &CopyRequest) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_backend_classifies_404() {
        let err = ClientError::not_found("data/ab").into_backend("Stat", "data/ab");
        assert!(err.is_not_exist());

        let err = ClientError::status(StatusCode::FORBIDDEN, "NotAuthorized", "denied")
            .into_backend("Stat", "data/ab");
        assert!(!err.is_not_exist());
        assert_eq!(err.to_string(), "Stat: HTTP 403 Forbidden: NotAuthorized: denied");
    }
}
