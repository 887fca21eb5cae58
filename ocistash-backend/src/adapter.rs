//! The OCI Object Storage repository backend.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ocistash_common::layout::{base_name, join_path, layout_by_name};
use ocistash_common::{
    default_delete, default_load, Backend, BackendError, Consumer, ContentHasher, DefaultLayout,
    FileInfo, FileType, Handle, KeyLayout, RewindReader, S3LegacyLayout, Visitor,
};

use crate::auth::{fetch_region, METADATA_BASE_URL};
use crate::bucket::ensure_bucket_exists;
use crate::client::{BucketRef, CopyRequest, HttpClient, ObjectStoreClient};
use crate::config::ResolvedConfig;
use crate::range::ByteRange;
use crate::upload::upload_object;

const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

/// Progress of a rename emulated by copy and delete.
///
/// The copy always completes before the delete is issued, so an
/// interrupted rename leaves the blob under both keys, never under none.
#[derive(Debug)]
pub enum RenameState {
    /// Old and new key are identical; nothing to do.
    SameKey,
    CopyPending,
    /// The source was already gone: an earlier attempt finished the rename.
    AlreadyRenamed,
    CopyFailed(BackendError),
    DeletePending,
    Done,
}

impl RenameState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RenameState::SameKey
                | RenameState::AlreadyRenamed
                | RenameState::CopyFailed(_)
                | RenameState::Done
        )
    }
}

/// Repository backend storing blobs as objects in one bucket.
pub struct OciBackend {
    client: Arc<dyn ObjectStoreClient>,
    bucket: String,
    prefix: String,
    region: String,
    connections: usize,
    part_size: usize,
    namespace: OnceCell<String>,
    layout: Box<dyn KeyLayout>,
}

impl OciBackend {
    /// Open an existing repository.
    pub async fn open(
        cfg: &ResolvedConfig,
        client: Arc<dyn ObjectStoreClient>,
    ) -> Result<Self, BackendError> {
        let mut be = Self::new(cfg, client, Box::new(DefaultLayout::new(&cfg.prefix)));
        be.layout = match layout_by_name(&cfg.layout, &cfg.prefix)? {
            Some(l) => l,
            None => be.detect_layout().await?,
        };
        debug!(
            bucket = %be.bucket,
            prefix = %be.prefix,
            layout = be.layout.name(),
            "Opened OCI backend"
        );
        Ok(be)
    }

    /// Open a repository for creation, creating the bucket if it is missing.
    pub async fn create(
        cfg: &ResolvedConfig,
        client: Arc<dyn ObjectStoreClient>,
    ) -> Result<Self, BackendError> {
        let layout = layout_by_name(&cfg.layout, &cfg.prefix)?
            .unwrap_or_else(|| Box::new(DefaultLayout::new(&cfg.prefix)));
        let be = Self::new(cfg, client, layout);
        let bucket = be.bucket_ref().await?;
        ensure_bucket_exists(be.client.as_ref(), &bucket, &cfg.compartment_ocid).await?;
        Ok(be)
    }

    /// Build the signed HTTP client for `cfg` and open (or create) the
    /// repository through it.
    pub async fn connect(cfg: &ResolvedConfig, create: bool) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Config(format!("failed to build HTTP client: {}", e)))?;
        let signer = cfg
            .principal
            .signer(&http)
            .map_err(|e| BackendError::Config(e.to_string()))?;

        let mut cfg = cfg.clone();
        let region = match known_region(&cfg) {
            Some(r) => r,
            None => fetch_region(&http, METADATA_BASE_URL)
                .await
                .map_err(|e| BackendError::remote("FetchRegion", e))?,
        };
        let client: Arc<dyn ObjectStoreClient> = match &cfg.endpoint {
            Some(endpoint) => Arc::new(HttpClient::with_endpoint(http, endpoint.clone(), signer)),
            None => Arc::new(HttpClient::new(http, &region, signer)),
        };
        cfg.region = Some(region);

        if create {
            Self::create(&cfg, client).await
        } else {
            Self::open(&cfg, client).await
        }
    }

    fn new(
        cfg: &ResolvedConfig,
        client: Arc<dyn ObjectStoreClient>,
        layout: Box<dyn KeyLayout>,
    ) -> Self {
        Self {
            client,
            bucket: cfg.bucket.clone(),
            prefix: cfg.prefix.clone(),
            region: cfg.region.clone().unwrap_or_default(),
            connections: cfg.connections,
            part_size: cfg.part_size,
            namespace: OnceCell::new_with(cfg.namespace.clone()),
            layout,
        }
    }

    pub fn layout(&self) -> &dyn KeyLayout {
        self.layout.as_ref()
    }

    fn key(&self, h: &Handle) -> Result<String, BackendError> {
        h.check()?;
        Ok(self.layout.filename(h))
    }

    /// The bucket with its namespace, resolving the namespace on first use.
    async fn bucket_ref(&self) -> Result<BucketRef, BackendError> {
        let namespace = self
            .namespace
            .get_or_try_init(|| async {
                self.client
                    .get_namespace()
                    .await
                    .map_err(|e| BackendError::remote("GetNamespace", e))
            })
            .await?;
        Ok(BucketRef { namespace: namespace.clone(), name: self.bucket.clone() })
    }

    /// Pick the legacy layout only when its key directory has objects and
    /// the default one has none.
    async fn detect_layout(&self) -> Result<Box<dyn KeyLayout>, BackendError> {
        let default = DefaultLayout::new(&self.prefix);
        let legacy = S3LegacyLayout::new(&self.prefix);
        let bucket = self.bucket_ref().await?;

        if self.has_objects(&bucket, &default.basedir(FileType::Key).0).await? {
            return Ok(Box::new(default));
        }
        if self.has_objects(&bucket, &legacy.basedir(FileType::Key).0).await? {
            info!(bucket = %self.bucket, "Detected s3legacy repository layout");
            return Ok(Box::new(legacy));
        }
        Ok(Box::new(default))
    }

    async fn has_objects(&self, bucket: &BucketRef, dir: &str) -> Result<bool, BackendError> {
        let page = self
            .client
            .list_objects(bucket, &dir_prefix(dir), None)
            .await
            .map_err(|e| BackendError::remote("client.ListObjects", e))?;
        Ok(!page.names.is_empty())
    }

    async fn open_reader(
        &self,
        cancel: &CancellationToken,
        bucket: &BucketRef,
        key: &str,
        length: usize,
        offset: u64,
    ) -> Result<Bytes, BackendError> {
        let range = ByteRange::for_read(length, offset)?;
        debug!(key = %key, length, offset, "Fetching object");
        // the ranged body is buffered whole; default_load hands the consumer a fresh reader over it
        cancellable(cancel, async {
            self.client
                .get_object(bucket, key, range.as_ref())
                .await
                .map_err(|e| e.into_backend("client.GetObject", key))
        })
        .await
    }

    async fn head(
        &self,
        cancel: &CancellationToken,
        bucket: &BucketRef,
        key: &str,
        op: &'static str,
    ) -> Result<u64, BackendError> {
        cancellable(cancel, async {
            self.client
                .head_object(bucket, key)
                .await
                .map(|m| m.size)
                .map_err(|e| e.into_backend(op, key))
        })
        .await
    }

    async fn delete_key(
        &self,
        cancel: &CancellationToken,
        bucket: &BucketRef,
        key: &str,
    ) -> Result<(), BackendError> {
        let res = cancellable(cancel, async {
            self.client
                .delete_object(bucket, key)
                .await
                .map_err(|e| e.into_backend("client.DeleteObject", key))
        })
        .await;
        match res {
            Err(e) if e.is_not_exist() => Ok(()),
            other => other,
        }
    }

    async fn rename_step(
        &self,
        cancel: &CancellationToken,
        bucket: &BucketRef,
        from: &str,
        to: &str,
        state: RenameState,
    ) -> Result<RenameState, BackendError> {
        match state {
            RenameState::CopyPending => {
                let req = CopyRequest {
                    bucket: bucket.clone(),
                    region: self.region.clone(),
                    source: from.to_string(),
                    destination: to.to_string(),
                };
                let copied = cancellable(cancel, async {
                    self.client
                        .copy_object(&req)
                        .await
                        .map_err(|e| e.into_backend("client.CopyObject", from))
                })
                .await;
                Ok(match copied {
                    Ok(()) => RenameState::DeletePending,
                    Err(e) if e.is_not_exist() => RenameState::AlreadyRenamed,
                    Err(e) => RenameState::CopyFailed(e),
                })
            }
            RenameState::DeletePending => {
                self.delete_key(cancel, bucket, from).await?;
                Ok(RenameState::Done)
            }
            terminal => Ok(terminal),
        }
    }
}

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackendError::Cancelled),
        res = fut => res,
    }
}

/// Region from the configuration, else the one the principal is bound to.
fn known_region(cfg: &ResolvedConfig) -> Option<String> {
    cfg.region
        .clone()
        .or_else(|| cfg.principal.region().map(str::to_string))
}

/// Listing prefix for a layout directory; the bucket root lists everything.
fn dir_prefix(dir: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() || dir == "." {
        String::new()
    } else {
        format!("{}/", dir)
    }
}

#[async_trait]
impl Backend for OciBackend {
    fn location(&self) -> String {
        join_path(&[&self.bucket, &self.prefix])
    }

    fn path(&self) -> &str {
        &self.prefix
    }

    fn connections(&self) -> usize {
        self.connections
    }

    fn hasher(&self) -> Option<ContentHasher> {
        None
    }

    fn has_atomic_replace(&self) -> bool {
        true
    }

    async fn save(
        &self,
        cancel: &CancellationToken,
        h: &Handle,
        rd: &mut dyn RewindReader,
    ) -> Result<(), BackendError> {
        let key = self.key(h)?;
        let bucket = cancellable(cancel, self.bucket_ref()).await?;
        let expected = rd.length();
        debug!(handle = %h, key = %key, length = expected, "Saving object");

        // upload_object observes cancel itself and aborts unfinished multipart uploads
        upload_object(self.client.as_ref(), &bucket, &key, rd, self.part_size, cancel).await?;

        let actual = self.head(cancel, &bucket, &key, "client.HeadObject").await?;
        if actual != expected {
            return Err(BackendError::SizeMismatch { expected, actual });
        }
        Ok(())
    }

    async fn load(
        &self,
        cancel: &CancellationToken,
        h: &Handle,
        length: usize,
        offset: u64,
        consumer: &mut Consumer<'_>,
    ) -> Result<(), BackendError> {
        let key = self.key(h)?;
        let bucket = cancellable(cancel, self.bucket_ref()).await?;
        default_load(
            h,
            length,
            offset,
            |length, offset| self.open_reader(cancel, &bucket, &key, length, offset),
            consumer,
        )
        .await
    }

    async fn stat(&self, cancel: &CancellationToken, h: &Handle) -> Result<FileInfo, BackendError> {
        let key = self.key(h)?;
        let bucket = cancellable(cancel, self.bucket_ref()).await?;
        let size = self.head(cancel, &bucket, &key, "Stat").await?;
        Ok(FileInfo { name: h.name.clone(), size })
    }

    async fn remove(&self, cancel: &CancellationToken, h: &Handle) -> Result<(), BackendError> {
        let key = self.key(h)?;
        let bucket = cancellable(cancel, self.bucket_ref()).await?;
        debug!(handle = %h, key = %key, "Removing object");
        self.delete_key(cancel, &bucket, &key).await
    }

    async fn list(
        &self,
        cancel: &CancellationToken,
        t: FileType,
        visit: &mut Visitor<'_>,
    ) -> Result<(), BackendError> {
        let prefix = dir_prefix(&self.layout.basedir(t).0);
        let bucket = cancellable(cancel, self.bucket_ref()).await?;
        debug!(prefix = %prefix, file_type = %t, "Listing objects");

        let mut start: Option<String> = None;
        loop {
            let page = cancellable(cancel, async {
                self.client
                    .list_objects(&bucket, &prefix, start.as_deref())
                    .await
                    .map_err(|e| BackendError::remote("client.ListObjects", e))
            })
            .await?;

            for key in page.names {
                let rest = key.strip_prefix(prefix.as_str()).unwrap_or(&key);
                if rest.is_empty() || rest.ends_with('/') {
                    continue;
                }
                let size = self.head(cancel, &bucket, &key, "List").await?;

                if cancel.is_cancelled() {
                    return Err(BackendError::Cancelled);
                }
                visit(FileInfo { name: base_name(rest).to_string(), size })
                    .map_err(BackendError::Consumer)?;
                if cancel.is_cancelled() {
                    return Err(BackendError::Cancelled);
                }
            }

            match page.next_start {
                Some(next) => start = Some(next),
                None => return Ok(()),
            }
        }
    }

    async fn rename(
        &self,
        cancel: &CancellationToken,
        h: &Handle,
        new_layout: &dyn KeyLayout,
    ) -> Result<(), BackendError> {
        let from = self.key(h)?;
        let to = new_layout.filename(h);
        let bucket = cancellable(cancel, self.bucket_ref()).await?;

        let mut state = if from == to { RenameState::SameKey } else { RenameState::CopyPending };
        while !state.is_terminal() {
            debug!(handle = %h, from = %from, to = %to, state = ?state, "Rename step");
            state = self.rename_step(cancel, &bucket, &from, &to, state).await?;
        }

        match state {
            RenameState::CopyFailed(e) => Err(e),
            RenameState::AlreadyRenamed => {
                debug!(handle = %h, to = %to, "Source already gone, rename done earlier");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn delete(&self, cancel: &CancellationToken) -> Result<(), BackendError> {
        info!(location = %self.location(), "Deleting all repository objects");
        default_delete(self, cancel).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }
}
