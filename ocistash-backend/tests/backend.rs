use std::io::Read;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use ocistash_backend::auth::InstancePrincipal;
use ocistash_backend::{MemoryClient, MemoryFaults, OciBackend, Principal, ResolvedConfig};
use ocistash_common::{
    Backend, BackendError, ByteReader, FileInfo, FileType, Handle, S3LegacyLayout,
};

const PACK: &str = "5f7b1d2c3e4a5b6c7d8e9f0a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c";

fn config() -> ResolvedConfig {
    ResolvedConfig {
        bucket: "repo".to_string(),
        prefix: "backups/host1".to_string(),
        region: Some("eu-frankfurt-1".to_string()),
        namespace: None,
        compartment_ocid: "ocid1.compartment.oc1..c".to_string(),
        endpoint: None,
        connections: 5,
        layout: "default".to_string(),
        part_size: 64,
        principal: Principal::Instance(InstancePrincipal { region: None }),
    }
}

async fn setup() -> (Arc<MemoryClient>, OciBackend) {
    let client = Arc::new(MemoryClient::default().with_bucket("repo"));
    let be = OciBackend::open(&config(), client.clone()).await.unwrap();
    (client, be)
}

fn payload(n: usize) -> Vec<u8> {
    (0..n).map(|i| (i * 7 % 251) as u8).collect()
}

async fn save(be: &OciBackend, h: &Handle, data: Vec<u8>) -> Result<(), BackendError> {
    be.save(&CancellationToken::new(), h, &mut ByteReader::new(data)).await
}

async fn load(
    be: &OciBackend,
    h: &Handle,
    length: usize,
    offset: u64,
) -> Result<Vec<u8>, BackendError> {
    let mut out = Vec::new();
    be.load(&CancellationToken::new(), h, length, offset, &mut |rd: &mut dyn Read| {
        rd.read_to_end(&mut out)?;
        Ok(())
    })
    .await?;
    Ok(out)
}

async fn list(be: &OciBackend, t: FileType) -> Vec<FileInfo> {
    let mut out = Vec::new();
    be.list(&CancellationToken::new(), t, &mut |fi: FileInfo| {
        out.push(fi);
        Ok(())
    })
    .await
    .unwrap();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

#[tokio::test]
async fn test_save_then_stat() {
    let (client, be) = setup().await;
    let h = Handle::new(FileType::Pack, PACK);
    save(&be, &h, payload(40)).await.unwrap();

    let fi = be.stat(&CancellationToken::new(), &h).await.unwrap();
    assert_eq!(fi, FileInfo { name: PACK.to_string(), size: 40 });
    assert!(client.object("repo", &format!("backups/host1/data/5f/{}", PACK)).is_some());
}

#[tokio::test]
async fn test_save_multipart_payload() {
    let (client, be) = setup().await;
    let h = Handle::new(FileType::Pack, PACK);
    let data = payload(200);
    save(&be, &h, data.clone()).await.unwrap();

    assert_eq!(client.calls("upload_part"), 4);
    assert_eq!(load(&be, &h, 0, 0).await.unwrap(), data);
}

#[tokio::test]
async fn test_save_detects_truncation() {
    let (client, be) = setup().await;
    client.set_faults(MemoryFaults { truncate_puts: 5, ..Default::default() });
    let err = save(&be, &Handle::new(FileType::Index, "ab"), payload(30)).await.unwrap_err();
    match err {
        BackendError::SizeMismatch { expected, actual } => assert_eq!((expected, actual), (30, 25)),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_cancelled_multipart_save_is_aborted() {
    let (client, be) = setup().await;
    let cancel = CancellationToken::new();
    client.set_faults(MemoryFaults {
        cancel_on_part: Some((2, cancel.clone())),
        ..Default::default()
    });

    let h = Handle::new(FileType::Pack, PACK);
    let err = be.save(&cancel, &h, &mut ByteReader::new(payload(200))).await.unwrap_err();
    assert!(matches!(err, BackendError::Cancelled));
    assert_eq!(client.calls("create_multipart_upload"), 1);
    assert_eq!(client.calls("abort_multipart_upload"), 1);
    assert!(client.keys("repo").is_empty());
}

#[tokio::test]
async fn test_names_cannot_reach_other_keys() {
    let (client, be) = setup().await;
    let lock = Handle::new(FileType::Lock, "abc");
    save(&be, &lock, b"mine".to_vec()).await.unwrap();

    for name in ["../locks/abc", "../../outside", "a/b", "..", "."] {
        let h = Handle::new(FileType::Key, name);
        let err = save(&be, &h, b"theirs".to_vec()).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidName(_)), "{}", name);
        assert!(matches!(load(&be, &h, 0, 0).await, Err(BackendError::InvalidName(_))));
        assert!(be.remove(&CancellationToken::new(), &h).await.is_err());
    }
    assert_eq!(load(&be, &lock, 0, 0).await.unwrap(), b"mine");
    assert_eq!(client.keys("repo"), vec!["backups/host1/locks/abc".to_string()]);
}

#[tokio::test]
async fn test_non_ascii_names_round_trip() {
    let (_, be) = setup().await;
    let h = Handle::new(FileType::Pack, "aé-blob");
    save(&be, &h, b"0123456789".to_vec()).await.unwrap();
    assert_eq!(load(&be, &h, 3, 5).await.unwrap(), b"567");
    assert_eq!(list(&be, FileType::Pack).await[0].name, "aé-blob");
}

#[tokio::test]
async fn test_load_ranges() {
    let (_, be) = setup().await;
    let h = Handle::new(FileType::Snapshot, "snap1");
    let data = payload(50);
    save(&be, &h, data.clone()).await.unwrap();

    assert_eq!(load(&be, &h, 0, 0).await.unwrap(), data);
    assert_eq!(load(&be, &h, 10, 5).await.unwrap(), &data[5..15]);
    assert_eq!(load(&be, &h, 0, 45).await.unwrap(), &data[45..]);
    assert_eq!(load(&be, &h, 1, 0).await.unwrap(), &data[..1]);
    // a range running past the end yields what exists
    assert_eq!(load(&be, &h, 100, 40).await.unwrap(), &data[40..]);
}

#[tokio::test]
async fn test_load_missing_is_not_exist() {
    let (_, be) = setup().await;
    let err = load(&be, &Handle::new(FileType::Lock, "gone"), 0, 0).await.unwrap_err();
    assert!(be.is_not_exist(&err));

    let gone = Handle::new(FileType::Lock, "gone");
    let err = be.stat(&CancellationToken::new(), &gone).await.unwrap_err();
    assert!(be.is_not_exist(&err));
}

#[tokio::test]
async fn test_load_rejects_offset_beyond_i64() {
    let (client, be) = setup().await;
    let h = Handle::new(FileType::Snapshot, "snap1");
    save(&be, &h, payload(5)).await.unwrap();
    let before = client.calls("get_object");
    let err = load(&be, &h, 1, u64::MAX).await.unwrap_err();
    assert!(matches!(err, BackendError::InvalidRange { .. }));
    assert_eq!(client.calls("get_object"), before);
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let (_, be) = setup().await;
    let cancel = CancellationToken::new();
    let h = Handle::new(FileType::Lock, "lock1");
    save(&be, &h, payload(3)).await.unwrap();

    be.remove(&cancel, &h).await.unwrap();
    be.remove(&cancel, &h).await.unwrap();
    assert!(be.stat(&cancel, &h).await.unwrap_err().is_not_exist());
}

#[tokio::test]
async fn test_remove_propagates_other_failures() {
    let (client, be) = setup().await;
    let h = Handle::new(FileType::Lock, "lock1");
    save(&be, &h, payload(3)).await.unwrap();
    client.set_faults(MemoryFaults { fail_deletes: true, ..Default::default() });
    let err = be.remove(&CancellationToken::new(), &h).await.unwrap_err();
    assert!(matches!(err, BackendError::Remote { .. }));
}

#[tokio::test]
async fn test_list_reports_names_and_sizes() {
    let (client, be) = setup().await;
    let packs = ["aa01", "aa02", "bb01"];
    for (i, name) in packs.iter().enumerate() {
        save(&be, &Handle::new(FileType::Pack, *name), payload(i + 1)).await.unwrap();
    }
    save(&be, &Handle::new(FileType::Key, "k1"), payload(9)).await.unwrap();
    // directory placeholder objects are skipped
    client.insert("repo", "backups/host1/data/cc/", "");

    let found = list(&be, FileType::Pack).await;
    let names: Vec<&str> = found.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, packs);
    assert_eq!(found.iter().map(|f| f.size).collect::<Vec<_>>(), vec![1, 2, 3]);

    assert_eq!(list(&be, FileType::Key).await, vec![FileInfo { name: "k1".into(), size: 9 }]);
    assert!(list(&be, FileType::Snapshot).await.is_empty());
}

#[tokio::test]
async fn test_list_empty_prefix_never_calls_visitor() {
    let (_, be) = setup().await;
    let mut calls = 0;
    be.list(&CancellationToken::new(), FileType::Index, &mut |_| {
        calls += 1;
        Ok(())
    })
    .await
    .unwrap();
    assert_eq!(calls, 0);
}

#[tokio::test]
async fn test_list_follows_pages() {
    let client = Arc::new(MemoryClient::default().with_bucket("repo").with_page_size(2));
    let be = OciBackend::open(&config(), client.clone()).await.unwrap();
    for i in 0..5 {
        let h = Handle::new(FileType::Index, format!("idx{}", i));
        save(&be, &h, payload(i + 1)).await.unwrap();
    }
    assert_eq!(list(&be, FileType::Index).await.len(), 5);
    assert_eq!(client.calls("list_objects"), 3);
}

#[tokio::test]
async fn test_list_stops_when_cancelled() {
    let (_, be) = setup().await;
    for name in ["l1", "l2", "l3"] {
        save(&be, &Handle::new(FileType::Lock, name), payload(2)).await.unwrap();
    }

    let cancel = CancellationToken::new();
    let mut seen = 0;
    let err = be
        .list(&cancel, FileType::Lock, &mut |_| {
            seen += 1;
            cancel.cancel();
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Cancelled));
    assert_eq!(seen, 1);
}

#[tokio::test]
async fn test_list_head_failure_aborts() {
    let (client, be) = setup().await;
    save(&be, &Handle::new(FileType::Lock, "l1"), payload(2)).await.unwrap();
    client.set_faults(MemoryFaults { fail_heads: true, ..Default::default() });

    let mut seen = 0;
    let err = be
        .list(&CancellationToken::new(), FileType::Lock, &mut |_| {
            seen += 1;
            Ok(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Remote { op: "List", .. }));
    assert_eq!(seen, 0);
}

#[tokio::test]
async fn test_visitor_error_stops_listing() {
    let (_, be) = setup().await;
    for name in ["s1", "s2"] {
        save(&be, &Handle::new(FileType::Snapshot, name), payload(2)).await.unwrap();
    }
    let mut seen = 0;
    let err = be
        .list(&CancellationToken::new(), FileType::Snapshot, &mut |_| {
            seen += 1;
            Err(anyhow::anyhow!("stop here"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "stop here");
    assert_eq!(seen, 1);
}

#[tokio::test]
async fn test_rename_twice_succeeds() {
    let (client, be) = setup().await;
    let cancel = CancellationToken::new();
    let legacy = S3LegacyLayout::new("backups/host1");
    let h = Handle::new(FileType::Key, "key1");
    save(&be, &h, payload(12)).await.unwrap();

    be.rename(&cancel, &h, &legacy).await.unwrap();
    be.rename(&cancel, &h, &legacy).await.unwrap();

    assert!(client.object("repo", "backups/host1/keys/key1").is_none());
    assert_eq!(client.object("repo", "backups/host1/key/key1").unwrap(), payload(12));
}

#[tokio::test]
async fn test_rename_same_key_is_noop() {
    let (client, be) = setup().await;
    let legacy = S3LegacyLayout::new("backups/host1");
    save(&be, &Handle::config(), payload(4)).await.unwrap();

    be.rename(&CancellationToken::new(), &Handle::config(), &legacy).await.unwrap();
    assert_eq!(client.calls("copy_object"), 0);
    assert!(client.object("repo", "backups/host1/config").is_some());
}

#[tokio::test]
async fn test_rename_delete_failure_keeps_both_keys() {
    let (client, be) = setup().await;
    let legacy = S3LegacyLayout::new("backups/host1");
    let h = Handle::new(FileType::Snapshot, "snap1");
    save(&be, &h, payload(8)).await.unwrap();

    client.set_faults(MemoryFaults { fail_deletes: true, ..Default::default() });
    let err = be.rename(&CancellationToken::new(), &h, &legacy).await.unwrap_err();
    assert!(matches!(err, BackendError::Remote { op: "client.DeleteObject", .. }));

    assert_eq!(client.object("repo", "backups/host1/snapshots/snap1").unwrap(), payload(8));
    assert_eq!(client.object("repo", "backups/host1/snapshot/snap1").unwrap(), payload(8));
}

#[tokio::test]
async fn test_delete_removes_everything_but_bucket() {
    let (client, be) = setup().await;
    save(&be, &Handle::config(), payload(4)).await.unwrap();
    save(&be, &Handle::new(FileType::Pack, PACK), payload(4)).await.unwrap();
    save(&be, &Handle::new(FileType::Key, "k"), payload(4)).await.unwrap();
    save(&be, &Handle::new(FileType::Snapshot, "s"), payload(4)).await.unwrap();

    be.delete(&CancellationToken::new()).await.unwrap();
    assert!(client.keys("repo").is_empty());
    assert!(client.has_bucket("repo"));

    // deleting an empty repository succeeds too
    be.delete(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn test_cancelled_token_short_circuits() {
    let (client, be) = setup().await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = be.stat(&cancel, &Handle::new(FileType::Pack, PACK)).await.unwrap_err();
    assert!(matches!(err, BackendError::Cancelled));
    assert_eq!(client.calls("head_object"), 0);
}

#[tokio::test]
async fn test_create_makes_missing_bucket() {
    let client = Arc::new(MemoryClient::default());
    let be = OciBackend::create(&config(), client.clone()).await.unwrap();
    assert!(client.has_bucket("repo"));
    save(&be, &Handle::config(), payload(4)).await.unwrap();
    assert!(client.object("repo", "backups/host1/config").is_some());
}
