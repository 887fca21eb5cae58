//! Bucket precondition for repository creation.

use reqwest::StatusCode;
use tracing::{debug, info};

use ocistash_common::BackendError;

use crate::client::{BucketRef, ClientError, ObjectStoreClient};

/// Make sure `bucket` exists, creating it in `compartment` when the service
/// confirms it is missing. Any other failure of the check is returned
/// rather than taken to mean the bucket exists.
pub async fn ensure_bucket_exists(
    client: &dyn ObjectStoreClient,
    bucket: &BucketRef,
    compartment: &str,
) -> Result<(), BackendError> {
    match client.get_bucket(bucket).await {
        Ok(()) => {
            debug!(bucket = %bucket.name, "Bucket exists");
            Ok(())
        }
        Err(e) if e.is_not_found() => create_bucket(client, bucket, compartment).await,
        Err(e) => Err(BackendError::remote("GetBucket", e)),
    }
}

/// Create a private bucket. A bucket that already exists counts as created.
pub async fn create_bucket(
    client: &dyn ObjectStoreClient,
    bucket: &BucketRef,
    compartment: &str,
) -> Result<(), BackendError> {
    if compartment.is_empty() {
        return Err(BackendError::Config(format!(
            "bucket {} does not exist and no compartment OCID is configured to create it in",
            bucket.name
        )));
    }
    match client.create_bucket(bucket, compartment).await {
        Ok(()) => {
            info!(bucket = %bucket.name, namespace = %bucket.namespace, "Created bucket");
            Ok(())
        }
        Err(ClientError::Status { status, .. }) if status == StatusCode::CONFLICT => {
            debug!(bucket = %bucket.name, "Bucket was created concurrently");
            Ok(())
        }
        Err(e) => Err(BackendError::remote("CreateBucket", e)),
    }
}
