//! Writing a reader's contents to one object.
//!
//! Payloads up to the part size go out as a single PUT. Larger ones are
//! split into parts read sequentially from the reader; any failure aborts
//! the multipart upload so no partial parts are left behind.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ocistash_common::{BackendError, RewindReader};

use crate::adapter::cancellable;
use crate::client::{BucketRef, CommitPart, MultipartUpload, ObjectStoreClient};

pub(crate) async fn upload_object(
    client: &dyn ObjectStoreClient,
    bucket: &BucketRef,
    key: &str,
    rd: &mut dyn RewindReader,
    part_size: usize,
    cancel: &CancellationToken,
) -> Result<(), BackendError> {
    rd.rewind().await?;
    let length = rd.length();

    if length <= part_size as u64 {
        let data = rd.read_full(length as usize).await?;
        return cancellable(cancel, async {
            client
                .put_object(bucket, key, data)
                .await
                .map_err(|e| e.into_backend("client.PutObject", key))
        })
        .await;
    }

    let upload = client
        .create_multipart_upload(bucket, key)
        .await
        .map_err(|e| e.into_backend("client.CreateMultipartUpload", key))?;
    debug!(key = %key, upload_id = %upload.upload_id, length, "Started multipart upload");

    match upload_parts(client, bucket, &upload, rd, part_size, cancel).await {
        Ok(parts) => client
            .commit_multipart_upload(bucket, &upload, &parts)
            .await
            .map_err(|e| e.into_backend("client.CommitMultipartUpload", key)),
        Err(err) => {
            if let Err(e) = client.abort_multipart_upload(bucket, &upload).await {
                warn!(
                    key = %key,
                    upload_id = %upload.upload_id,
                    error = %e,
                    "Failed to abort multipart upload"
                );
            }
            Err(err)
        }
    }
}

async fn upload_parts(
    client: &dyn ObjectStoreClient,
    bucket: &BucketRef,
    upload: &MultipartUpload,
    rd: &mut dyn RewindReader,
    part_size: usize,
    cancel: &CancellationToken,
) -> Result<Vec<CommitPart>, BackendError> {
    let mut parts = Vec::new();
    let mut part_num = 1u32;
    loop {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        let data = rd.read_full(part_size).await?;
        if data.is_empty() {
            return Ok(parts);
        }
        // a dropped part upload is discarded by the abort that follows
        let etag = cancellable(cancel, async {
            client
                .upload_part(bucket, upload, part_num, data)
                .await
                .map_err(|e| e.into_backend("client.UploadPart", &upload.key))
        })
        .await?;
        parts.push(CommitPart { part_num, etag });
        part_num += 1;
    }
}

#[cfg(test)]
mod tests {
    use ocistash_common::ByteReader;

    use super::*;
    use crate::client::{MemoryClient, MemoryFaults};

    fn bucket() -> BucketRef {
        BucketRef { namespace: "testns".into(), name: "b".into() }
    }

    #[tokio::test]
    async fn test_small_payload_is_single_put() {
        let client = MemoryClient::default().with_bucket("b");
        let mut rd = ByteReader::new(vec![7u8; 100]);
        upload_object(&client, &bucket(), "k", &mut rd, 100, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(client.calls("put_object"), 1);
        assert_eq!(client.calls("create_multipart_upload"), 0);
        assert_eq!(client.object("b", "k").unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_large_payload_uses_ordered_parts() {
        let client = MemoryClient::default().with_bucket("b");
        let payload: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let mut rd = ByteReader::new(payload.clone());
        // a partially consumed reader is rewound first
        rd.read_chunk(17).await.unwrap();

        upload_object(&client, &bucket(), "k", &mut rd, 100, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(client.calls("upload_part"), 3);
        assert_eq!(client.calls("commit_multipart_upload"), 1);
        assert_eq!(client.object("b", "k").unwrap(), payload);
    }

    #[tokio::test]
    async fn test_cancel_during_part_aborts_upload() {
        let client = MemoryClient::default().with_bucket("b");
        let cancel = CancellationToken::new();
        client.set_faults(MemoryFaults {
            cancel_on_part: Some((2, cancel.clone())),
            ..Default::default()
        });
        let mut rd = ByteReader::new(vec![1u8; 300]);
        let err = upload_object(&client, &bucket(), "k", &mut rd, 100, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Cancelled));
        assert_eq!(client.calls("upload_part"), 2);
        assert_eq!(client.calls("abort_multipart_upload"), 1);
        assert_eq!(client.calls("commit_multipart_upload"), 0);
        assert!(client.object("b", "k").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_multipart_is_aborted() {
        let client = MemoryClient::default().with_bucket("b");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut rd = ByteReader::new(vec![1u8; 300]);
        let err = upload_object(&client, &bucket(), "k", &mut rd, 100, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Cancelled));
        assert_eq!(client.calls("abort_multipart_upload"), 1);
        assert!(client.object("b", "k").is_none());
    }
}
