//! Object storage REST client over reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{
    BucketRef, ClientError, CommitPart, CopyRequest, ListPage, MultipartUpload, ObjectMeta,
    ObjectStoreClient,
};
use crate::auth::RequestSigner;
use crate::range::ByteRange;

const CLIENT_REQUEST_ID: &str = "opc-client-request-id";
const WORK_REQUEST_ID: &str = "opc-work-request-id";
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Deserialize, Default)]
#[serde(default)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBucketDetails<'a> {
    name: &'a str,
    compartment_id: &'a str,
    public_access_type: &'static str,
    metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Serialize)]
struct CreateMultipartUploadDetails<'a> {
    object: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MultipartUploadResponse {
    upload_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitDetails<'a> {
    parts_to_commit: Vec<CommitPartDetails<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CommitPartDetails<'a> {
    part_num: u32,
    etag: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListObjectsResponse {
    #[serde(default)]
    objects: Vec<ObjectSummary>,
    next_start_with: Option<String>,
}

#[derive(Deserialize)]
struct ObjectSummary {
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CopyObjectDetails<'a> {
    source_object_name: &'a str,
    destination_region: &'a str,
    destination_namespace: &'a str,
    destination_bucket: &'a str,
    destination_object_name: &'a str,
}

#[derive(Deserialize)]
struct WorkRequest {
    status: String,
}

/// Signed HTTP client for the object storage REST API.
pub struct HttpClient {
    http: Client,
    endpoint: String,
    signer: Arc<dyn RequestSigner>,
    poll_interval: Duration,
}

impl HttpClient {
    /// Client for the public endpoint of `region`.
    pub fn new(http: Client, region: &str, signer: Arc<dyn RequestSigner>) -> Self {
        let endpoint = format!("https://objectstorage.{}.oraclecloud.com", region);
        Self::with_endpoint(http, endpoint, signer)
    }

    pub fn with_endpoint(
        http: Client,
        endpoint: impl Into<String>,
        signer: Arc<dyn RequestSigner>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            signer,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Initial delay between work request polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn bucket_url(&self, b: &BucketRef) -> String {
        format!(
            "{}/n/{}/b/{}",
            self.endpoint,
            urlencoding::encode(&b.namespace),
            urlencoding::encode(&b.name)
        )
    }

    fn object_url(&self, b: &BucketRef, key: &str) -> String {
        format!("{}/o/{}", self.bucket_url(b), urlencoding::encode(key))
    }

    fn upload_url(&self, b: &BucketRef, upload: &MultipartUpload) -> String {
        format!("{}/u/{}", self.bucket_url(b), urlencoding::encode(&upload.key))
    }

    /// Tag, sign and send a request. Non-2xx responses become
    /// [`ClientError::Status`].
    async fn send(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        let mut req = builder
            .header(CLIENT_REQUEST_ID, Uuid::new_v4().to_string())
            .build()?;
        self.signer.sign(&mut req).await?;
        debug!(method = %req.method(), url = %req.url(), "Object storage request");

        let resp = self.http.execute(req).await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        Err(status_error(resp).await)
    }

    async fn wait_for_work_request(&self, id: &str) -> Result<(), ClientError> {
        let url = format!("{}/workRequests/{}", self.endpoint, urlencoding::encode(id));
        let mut delay = self.poll_interval;
        loop {
            let wr: WorkRequest = self.send(self.http.get(&url)).await?.json().await?;
            match wr.status.as_str() {
                "COMPLETED" => return Ok(()),
                "FAILED" | "CANCELED" => {
                    return Err(ClientError::WorkRequest { id: id.to_string(), state: wr.status })
                }
                state => debug!(work_request = %id, state, "Waiting for copy to finish"),
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_INTERVAL);
        }
    }
}

async fn status_error(resp: Response) -> ClientError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&body) {
        Ok(e) if !e.code.is_empty() => ClientError::status(status, e.code, e.message),
        _ => ClientError::status(status, status.canonical_reason().unwrap_or("Unknown"), body),
    }
}

#[async_trait]
impl ObjectStoreClient for HttpClient {
    async fn get_namespace(&self) -> Result<String, ClientError> {
        let url = format!("{}/n/", self.endpoint);
        let ns: String = self.send(self.http.get(&url)).await?.json().await?;
        Ok(ns)
    }

    async fn get_bucket(&self, bucket: &BucketRef) -> Result<(), ClientError> {
        self.send(self.http.get(self.bucket_url(bucket))).await?;
        Ok(())
    }

    async fn create_bucket(
        &self,
        bucket: &BucketRef,
        compartment: &str,
    ) -> Result<(), ClientError> {
        let url = format!("{}/n/{}/b/", self.endpoint, urlencoding::encode(&bucket.namespace));
        let details = CreateBucketDetails {
            name: &bucket.name,
            compartment_id: compartment,
            public_access_type: "NoPublicAccess",
            metadata: serde_json::Map::new(),
        };
        self.send(self.http.post(&url).json(&details)).await?;
        Ok(())
    }

    async fn head_object(&self, bucket: &BucketRef, key: &str) -> Result<ObjectMeta, ClientError> {
        let resp = self.send(self.http.head(self.object_url(bucket, key))).await?;
        // the body of a HEAD response is empty, so the length is read from the header
        let size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| ClientError::Decode(format!("no content length for {}", key)))?;
        Ok(ObjectMeta { size })
    }

    async fn get_object(
        &self,
        bucket: &BucketRef,
        key: &str,
        range: Option<&ByteRange>,
    ) -> Result<Bytes, ClientError> {
        let mut builder = self.http.get(self.object_url(bucket, key));
        if let Some(r) = range {
            builder = builder.header(RANGE, r.to_string());
        }
        let resp = self.send(builder).await?;
        let status = resp.status();
        let body = resp.bytes().await?;
        match range {
            Some(r) if status == StatusCode::OK => {
                debug!(key = %key, range = %r, "Range ignored by server, slicing full object");
                let size = body.len();
                let (start, end) = r.resolve(size as u64).ok_or_else(|| {
                    let reason = format!("{} not satisfiable for {} of {} bytes", r, key, size);
                    ClientError::Decode(reason)
                })?;
                Ok(body.slice(start as usize..end as usize))
            }
            _ => Ok(body),
        }
    }

    async fn put_object(
        &self,
        bucket: &BucketRef,
        key: &str,
        data: Bytes,
    ) -> Result<(), ClientError> {
        let builder = self
            .http
            .put(self.object_url(bucket, key))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data);
        self.send(builder).await?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &BucketRef,
        key: &str,
    ) -> Result<MultipartUpload, ClientError> {
        let url = format!("{}/u", self.bucket_url(bucket));
        let resp: MultipartUploadResponse = self
            .send(self.http.post(&url).json(&CreateMultipartUploadDetails { object: key }))
            .await?
            .json()
            .await?;
        Ok(MultipartUpload { key: key.to_string(), upload_id: resp.upload_id })
    }

    async fn upload_part(
        &self,
        bucket: &BucketRef,
        upload: &MultipartUpload,
        part_num: u32,
        data: Bytes,
    ) -> Result<String, ClientError> {
        let part = part_num.to_string();
        let builder = self
            .http
            .put(self.upload_url(bucket, upload))
            .query(&[("uploadId", upload.upload_id.as_str()), ("uploadPartNum", part.as_str())])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data);
        let resp = self.send(builder).await?;
        resp.headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ClientError::Decode(format!("no ETag for part {} of {}", part_num, upload.key))
            })
    }

    async fn commit_multipart_upload(
        &self,
        bucket: &BucketRef,
        upload: &MultipartUpload,
        parts: &[CommitPart],
    ) -> Result<(), ClientError> {
        let details = CommitDetails {
            parts_to_commit: parts
                .iter()
                .map(|p| CommitPartDetails { part_num: p.part_num, etag: &p.etag })
                .collect(),
        };
        let builder = self
            .http
            .post(self.upload_url(bucket, upload))
            .query(&[("uploadId", upload.upload_id.as_str())])
            .json(&details);
        self.send(builder).await?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &BucketRef,
        upload: &MultipartUpload,
    ) -> Result<(), ClientError> {
        let builder = self
            .http
            .delete(self.upload_url(bucket, upload))
            .query(&[("uploadId", upload.upload_id.as_str())]);
        self.send(builder).await?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &BucketRef, key: &str) -> Result<(), ClientError> {
        self.send(self.http.delete(self.object_url(bucket, key))).await?;
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &BucketRef,
        prefix: &str,
        start: Option<&str>,
    ) -> Result<ListPage, ClientError> {
        let mut query = vec![("prefix", prefix), ("fields", "name")];
        if let Some(s) = start {
            query.push(("start", s));
        }
        let builder = self.http.get(format!("{}/o", self.bucket_url(bucket))).query(&query);
        let resp: ListObjectsResponse = self.send(builder).await?.json().await?;
        Ok(ListPage {
            names: resp.objects.into_iter().map(|o| o.name).collect(),
            next_start: resp.next_start_with.filter(|s| !s.is_empty()),
        })
    }

    async fn copy_object(&self, req: &CopyRequest) -> Result<(), ClientError> {
        let url = format!("{}/actions/copyObject", self.bucket_url(&req.bucket));
        let details = CopyObjectDetails {
            source_object_name: &req.source,
            destination_region: &req.region,
            destination_namespace: &req.bucket.namespace,
            destination_bucket: &req.bucket.name,
            destination_object_name: &req.destination,
        };
        let resp = self.send(self.http.post(&url).json(&details)).await?;
        let work_request = resp
            .headers()
            .get(WORK_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        match work_request {
            Some(id) => self.wait_for_work_request(&id).await,
            None => Ok(()),
        }
    }
}
