//! In-memory object store with fault injection, for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;

use super::{
    BucketRef, ClientError, CommitPart, CopyRequest, ListPage, MultipartUpload, ObjectMeta,
    ObjectStoreClient,
};
use crate::range::ByteRange;

/// Failures to inject into a [`MemoryClient`].
#[derive(Debug, Clone, Default)]
pub struct MemoryFaults {
    /// Drop this many bytes from the end of every stored object while still
    /// reporting success.
    pub truncate_puts: usize,
    pub fail_deletes: bool,
    pub fail_heads: bool,
    pub fail_copies: bool,
    /// Status `get_bucket` answers with instead of looking at the bucket.
    pub bucket_status: Option<StatusCode>,
    /// Cancel the token while this part number is being uploaded.
    pub cancel_on_part: Option<(u32, CancellationToken)>,
}

#[derive(Default)]
struct Upload {
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
struct State {
    buckets: BTreeMap<String, BTreeMap<String, Bytes>>,
    compartments: HashMap<String, String>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
    faults: MemoryFaults,
    calls: HashMap<&'static str, usize>,
}

impl State {
    fn record(&mut self, op: &'static str) {
        *self.calls.entry(op).or_default() += 1;
    }

    fn bucket(&mut self, b: &BucketRef) -> Result<&mut BTreeMap<String, Bytes>, ClientError> {
        self.buckets.get_mut(&b.name).ok_or_else(|| {
            ClientError::status(StatusCode::NOT_FOUND, "BucketNotFound", b.name.clone())
        })
    }
}

pub struct MemoryClient {
    namespace: String,
    page_size: usize,
    state: Mutex<State>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new("testns")
    }
}

impl MemoryClient {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            page_size: 1000,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_bucket(self, name: &str) -> Self {
        self.lock().buckets.entry(name.to_string()).or_default();
        self
    }

    /// Number of names returned per listing page.
    pub fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = n.max(1);
        self
    }

    pub fn set_faults(&self, faults: MemoryFaults) {
        self.lock().faults = faults;
    }

    /// How often the named operation (e.g. `"head_object"`) was called.
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock().buckets.get(bucket)?.get(key).cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.lock().buckets.contains_key(bucket)
    }

    /// Compartment a bucket was created in through `create_bucket`.
    pub fn compartment_of(&self, bucket: &str) -> Option<String> {
        self.lock().compartments.get(bucket).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(
        state: &mut State,
        bucket: &BucketRef,
        key: &str,
        data: Bytes,
    ) -> Result<(), ClientError> {
        let keep = data.len().saturating_sub(state.faults.truncate_puts);
        state.bucket(bucket)?.insert(key.to_string(), data.slice(..keep));
        Ok(())
    }
}

fn injected(op: &str) -> ClientError {
    ClientError::status(
        StatusCode::INTERNAL_SERVER_ERROR,
        "InternalError",
        format!("injected {} failure", op),
    )
}

#[async_trait]
impl ObjectStoreClient for MemoryClient {
    async fn get_namespace(&self) -> Result<String, ClientError> {
        self.lock().record("get_namespace");
        Ok(self.namespace.clone())
    }

    async fn get_bucket(&self, bucket: &BucketRef) -> Result<(), ClientError> {
        let mut st = self.lock();
        st.record("get_bucket");
        if let Some(status) = st.faults.bucket_status {
            return Err(ClientError::status(status, "Injected", "injected bucket status"));
        }
        st.bucket(bucket).map(|_| ())
    }

    async fn create_bucket(
        &self,
        bucket: &BucketRef,
        compartment: &str,
    ) -> Result<(), ClientError> {
        let mut st = self.lock();
        st.record("create_bucket");
        if st.buckets.contains_key(&bucket.name) {
            let name = bucket.name.clone();
            return Err(ClientError::status(StatusCode::CONFLICT, "BucketAlreadyExists", name));
        }
        st.buckets.insert(bucket.name.clone(), BTreeMap::new());
        st.compartments.insert(bucket.name.clone(), compartment.to_string());
        Ok(())
    }

    async fn head_object(&self, bucket: &BucketRef, key: &str) -> Result<ObjectMeta, ClientError> {
        let mut st = self.lock();
        st.record("head_object");
        if st.faults.fail_heads {
            return Err(injected("head"));
        }
        let data = st.bucket(bucket)?.get(key).ok_or_else(|| ClientError::not_found(key))?;
        Ok(ObjectMeta { size: data.len() as u64 })
    }

    async fn get_object(
        &self,
        bucket: &BucketRef,
        key: &str,
        range: Option<&ByteRange>,
    ) -> Result<Bytes, ClientError> {
        let mut st = self.lock();
        st.record("get_object");
        let data = st.bucket(bucket)?.get(key).cloned().ok_or_else(|| ClientError::not_found(key))?;
        match range {
            None => Ok(data),
            Some(r) => match r.resolve(data.len() as u64) {
                Some((start, end)) => Ok(data.slice(start as usize..end as usize)),
                None => Err(ClientError::status(
                    StatusCode::RANGE_NOT_SATISFIABLE,
                    "InvalidRange",
                    format!("{} is not satisfiable for {} bytes", r, data.len()),
                )),
            },
        }
    }

    async fn put_object(
        &self,
        bucket: &BucketRef,
        key: &str,
        data: Bytes,
    ) -> Result<(), ClientError> {
        let mut st = self.lock();
        st.record("put_object");
        Self::store(&mut st, bucket, key, data)
    }

    async fn create_multipart_upload(
        &self,
        bucket: &BucketRef,
        key: &str,
    ) -> Result<MultipartUpload, ClientError> {
        let mut st = self.lock();
        st.record("create_multipart_upload");
        st.bucket(bucket)?;
        st.next_upload += 1;
        let upload_id = format!("upload-{}", st.next_upload);
        st.uploads.insert(upload_id.clone(), Upload { key: key.to_string(), ..Default::default() });
        Ok(MultipartUpload { key: key.to_string(), upload_id })
    }

    async fn upload_part(
        &self,
        _bucket: &BucketRef,
        upload: &MultipartUpload,
        part_num: u32,
        data: Bytes,
    ) -> Result<String, ClientError> {
        let cancel = {
            let mut st = self.lock();
            st.record("upload_part");
            let up = st
                .uploads
                .get_mut(&upload.upload_id)
                .ok_or_else(|| ClientError::not_found(&upload.upload_id))?;
            up.parts.insert(part_num, data);
            st.faults
                .cancel_on_part
                .clone()
                .and_then(|(n, token)| (n == part_num).then_some(token))
        };
        if let Some(token) = cancel {
            token.cancel();
            // stay in flight until the caller polls again
            tokio::task::yield_now().await;
        }
        Ok(format!("{}-{}", upload.upload_id, part_num))
    }

    async fn commit_multipart_upload(
        &self,
        bucket: &BucketRef,
        upload: &MultipartUpload,
        parts: &[CommitPart],
    ) -> Result<(), ClientError> {
        let mut st = self.lock();
        st.record("commit_multipart_upload");
        let up = st
            .uploads
            .remove(&upload.upload_id)
            .ok_or_else(|| ClientError::not_found(&upload.upload_id))?;

        let mut data = BytesMut::new();
        for p in parts {
            let etag = format!("{}-{}", upload.upload_id, p.part_num);
            let part = up.parts.get(&p.part_num).filter(|_| p.etag == etag);
            match part {
                Some(bytes) => data.extend_from_slice(bytes),
                None => {
                    return Err(ClientError::status(
                        StatusCode::BAD_REQUEST,
                        "InvalidUploadPart",
                        format!("part {} of {}", p.part_num, up.key),
                    ))
                }
            }
        }
        Self::store(&mut st, bucket, &up.key, data.freeze())
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &BucketRef,
        upload: &MultipartUpload,
    ) -> Result<(), ClientError> {
        let mut st = self.lock();
        st.record("abort_multipart_upload");
        st.uploads.remove(&upload.upload_id);
        Ok(())
    }

    async fn delete_object(&self, bucket: &BucketRef, key: &str) -> Result<(), ClientError> {
        let mut st = self.lock();
        st.record("delete_object");
        if st.faults.fail_deletes {
            return Err(injected("delete"));
        }
        match st.bucket(bucket)?.remove(key) {
            Some(_) => Ok(()),
            None => Err(ClientError::not_found(key)),
        }
    }

    async fn list_objects(
        &self,
        bucket: &BucketRef,
        prefix: &str,
        start: Option<&str>,
    ) -> Result<ListPage, ClientError> {
        let page_size = self.page_size;
        let mut st = self.lock();
        st.record("list_objects");
        let mut names = st
            .bucket(bucket)?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .filter(|k| start.map_or(true, |s| k.as_str() >= s))
            .take(page_size + 1)
            .cloned()
            .collect::<Vec<_>>();

        let next_start = if names.len() > page_size { names.pop() } else { None };
        Ok(ListPage { names, next_start })
    }

    async fn copy_object(&self, req: &CopyRequest) -> Result<(), ClientError> {
        let mut st = self.lock();
        st.record("copy_object");
        if st.faults.fail_copies {
            return Err(injected("copy"));
        }
        let objects = st.bucket(&req.bucket)?;
        let data = objects
            .get(&req.source)
            .cloned()
            .ok_or_else(|| ClientError::not_found(&req.source))?;
        objects.insert(req.destination.clone(), data);
        Ok(())
    }
}
