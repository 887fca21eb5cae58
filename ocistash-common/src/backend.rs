use std::future::Future;
use std::io::Read;

use bytes::{Buf, Bytes};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::BackendError;
use crate::handle::{FileInfo, FileType, Handle};
use crate::layout::KeyLayout;
use crate::reader::RewindReader;

/// Content hash a backend wants computed alongside uploaded data.
pub type ContentHasher = Box<dyn sha2::digest::DynDigest + Send>;

/// Receives the bytes of a loaded blob.
pub type Consumer<'a> = dyn FnMut(&mut dyn Read) -> anyhow::Result<()> + Send + 'a;

/// Receives one entry per listed blob.
pub type Visitor<'a> = dyn FnMut(FileInfo) -> anyhow::Result<()> + Send + 'a;

/// Trait implemented by every repository storage backend.
///
/// A backend stores opaque blobs addressed by [`Handle`]. It is responsible
/// only for moving bytes; retries, concurrency limits and caching live in
/// the layers above. Implementations must be safe for concurrent use.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable location of the repository.
    fn location(&self) -> String;

    /// Key prefix used inside the store.
    fn path(&self) -> &str;

    /// Number of concurrent operations the caller should schedule at most.
    fn connections(&self) -> usize;

    /// Hash function to compute while uploading, if the backend wants one.
    fn hasher(&self) -> Option<ContentHasher>;

    /// Whether `save` replaces an existing blob atomically.
    fn has_atomic_replace(&self) -> bool;

    fn is_not_exist(&self, err: &BackendError) -> bool {
        err.is_not_exist()
    }

    /// Store the reader's contents at `h`.
    async fn save(
        &self,
        cancel: &CancellationToken,
        h: &Handle,
        rd: &mut dyn RewindReader,
    ) -> Result<(), BackendError>;

    /// Run `consumer` with a reader over `length` bytes of `h` starting at
    /// `offset`. A length of zero reads to the end of the blob.
    async fn load(
        &self,
        cancel: &CancellationToken,
        h: &Handle,
        length: usize,
        offset: u64,
        consumer: &mut Consumer<'_>,
    ) -> Result<(), BackendError>;

    async fn stat(&self, cancel: &CancellationToken, h: &Handle) -> Result<FileInfo, BackendError>;

    /// Remove the blob at `h`. Removing a missing blob succeeds.
    async fn remove(&self, cancel: &CancellationToken, h: &Handle) -> Result<(), BackendError>;

    /// Call `visit` for every blob of type `t`. Stops at the first error.
    async fn list(
        &self,
        cancel: &CancellationToken,
        t: FileType,
        visit: &mut Visitor<'_>,
    ) -> Result<(), BackendError>;

    /// Move `h` from the backend's layout to its key under `new_layout`.
    /// Calling it again after a completed rename succeeds.
    async fn rename(
        &self,
        cancel: &CancellationToken,
        h: &Handle,
        new_layout: &dyn KeyLayout,
    ) -> Result<(), BackendError>;

    /// Remove every blob of the repository, leaving the container in place.
    async fn delete(&self, cancel: &CancellationToken) -> Result<(), BackendError>;

    async fn close(&self) -> Result<(), BackendError>;
}

/// Shared load path for backends that can open a fresh reader per request.
///
/// `open_reader` is called once per invocation and must build its reader
/// from scratch each time, so an outer retry layer can call `default_load`
/// again after a failed consumer and get the bytes anew.
pub async fn default_load<F, Fut>(
    h: &Handle,
    length: usize,
    offset: u64,
    open_reader: F,
    consumer: &mut Consumer<'_>,
) -> Result<(), BackendError>
where
    F: Fn(usize, u64) -> Fut,
    Fut: Future<Output = Result<Bytes, BackendError>>,
{
    let mut data = open_reader(length, offset).await?;
    if length > 0 && data.len() > length {
        // past offset zero the extra bytes cannot be placed
        if offset > 0 {
            let got = data.len();
            return Err(BackendError::remote(
                "Load",
                format!("{}: got {} bytes for {} at offset {}", h, got, length, offset),
            ));
        }
        debug!(handle = %h, got = data.len(), length, "Truncating oversized range response");
        data.truncate(length);
    }
    let mut rd = data.reader();
    consumer(&mut rd).map_err(BackendError::Consumer)
}

/// Remove every blob of every type, then the config file.
pub async fn default_delete<B>(be: &B, cancel: &CancellationToken) -> Result<(), BackendError>
where
    B: Backend + ?Sized,
{
    for t in FileType::LISTABLE {
        let mut names = Vec::new();
        be.list(cancel, t, &mut |fi: FileInfo| {
            names.push(fi.name);
            Ok(())
        })
        .await?;

        for name in names {
            be.remove(cancel, &Handle::new(t, name)).await?;
        }
    }

    match be.remove(cancel, &Handle::config()).await {
        Err(e) if be.is_not_exist(&e) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_default_load_passes_fresh_reader() {
        let h = Handle::new(FileType::Pack, "abcd");
        let opens = AtomicUsize::new(0);
        let open = |length: usize, offset: u64| {
            opens.fetch_add(1, Ordering::SeqCst);
            let data = Bytes::from_static(b"0123456789");
            let start = offset as usize;
            let end = if length == 0 { data.len() } else { start + length };
            async move { Ok(data.slice(start..end)) }
        };

        let mut out = Vec::new();
        default_load(&h, 4, 2, &open, &mut |rd: &mut dyn Read| {
            rd.read_to_end(&mut out)?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(out, b"2345");

        // a second call reopens and sees the same bytes again
        let mut again = Vec::new();
        default_load(&h, 4, 2, &open, &mut |rd: &mut dyn Read| {
            rd.read_to_end(&mut again)?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(again, b"2345");
        assert_eq!(opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_default_load_truncates_long_response() {
        let h = Handle::new(FileType::Pack, "abcd");
        let mut out = Vec::new();
        default_load(
            &h,
            3,
            0,
            |_, _| async { Ok(Bytes::from_static(b"abcdef")) },
            &mut |rd: &mut dyn Read| {
                rd.read_to_end(&mut out)?;
                Ok(())
            },
        )
        .await
        .unwrap();
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn test_default_load_rejects_oversized_response_past_offset() {
        let h = Handle::new(FileType::Pack, "abcd");
        let mut called = false;
        let err = default_load(
            &h,
            3,
            5,
            |_, _| async { Ok(Bytes::from_static(b"0123456789")) },
            &mut |_: &mut dyn Read| {
                called = true;
                Ok(())
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackendError::Remote { op: "Load", .. }));
        assert!(!called);
    }

    #[tokio::test]
    async fn test_default_load_consumer_error_propagates() {
        let h = Handle::new(FileType::Index, "abcd");
        let err = default_load(
            &h,
            0,
            0,
            |_, _| async { Ok(Bytes::from_static(b"abc")) },
            &mut |_: &mut dyn Read| Err(anyhow::anyhow!("checksum mismatch")),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BackendError::Consumer(_)));
        assert_eq!(err.to_string(), "checksum mismatch");
    }

    #[tokio::test]
    async fn test_default_load_open_error_skips_consumer() {
        let h = Handle::new(FileType::Index, "abcd");
        let mut called = false;
        let err = default_load(
            &h,
            0,
            0,
            |_, _| async { Err(BackendError::NotFound("index/abcd".into())) },
            &mut |_: &mut dyn Read| {
                called = true;
                Ok(())
            },
        )
        .await
        .unwrap_err();
        assert!(err.is_not_exist());
        assert!(!called);
    }
}
