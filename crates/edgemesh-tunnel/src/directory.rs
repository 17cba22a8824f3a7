//! Address directory
//!
//! Maps node names to peer address records in a store shared by every node.
//! Writes use optimistic concurrency: a record is only replaced if its
//! version has not moved since it was read, otherwise the write fails with
//! [`DirectoryError::Conflict`] and the caller decides whether to retry.

use edgemesh_tunnel_core::{Multiaddr, PeerAddrInfo, PeerId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Lock files older than this are considered abandoned
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// Directory errors
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("No record for {0}")]
    NotFound(String),
    #[error("Concurrent modification of {0}")]
    Conflict(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed record: {0}")]
    Decode(#[from] edgemesh_tunnel_core::Error),
    #[error("Invalid key {0:?}")]
    InvalidKey(String),
    #[error("Refusing to publish an empty address set")]
    EmptyAddressSet,
    #[error("Address cannot be published: {0}")]
    InvalidAddress(#[source] edgemesh_tunnel_core::Error),
}

impl DirectoryError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Backend(_) | Self::Io(_))
    }
}

/// A stored value with its version
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedValue {
    pub version: u64,
    pub value: Vec<u8>,
}

/// Storage behind an [`AddressDirectory`]
pub trait DirectoryBackend: Send + Sync + 'static {
    fn load(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<VersionedValue>, DirectoryError>> + Send;

    /// Store a new key; `Conflict` if it already exists. Returns the version.
    fn create(
        &self,
        key: &str,
        value: &[u8],
    ) -> impl Future<Output = Result<u64, DirectoryError>> + Send;

    /// Replace a key at `expected_version`; `Conflict` if it moved
    fn update(
        &self,
        key: &str,
        expected_version: u64,
        value: &[u8],
    ) -> impl Future<Output = Result<u64, DirectoryError>> + Send;
}

/// Result of [`AddressDirectory::set`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetOutcome {
    /// Stored record already matched; nothing written
    Unchanged,
    Created,
    Updated,
}

/// Node name to peer address lookup
pub struct AddressDirectory<B> {
    backend: B,
}

impl<B: DirectoryBackend> AddressDirectory<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Look up the addresses published for `node_name`
    pub async fn get(&self, node_name: &str) -> Result<PeerAddrInfo, DirectoryError> {
        validate_key(node_name)?;
        let stored = self
            .backend
            .load(node_name)
            .await?
            .ok_or_else(|| DirectoryError::NotFound(node_name.to_string()))?;
        Ok(PeerAddrInfo::from_record(&stored.value)?)
    }

    /// Publish `addrs` for `node_name`, owned by `peer`
    ///
    /// Each address is stored suffixed with `/p2p/<peer>`. Addresses that
    /// would not read back unchanged are rejected before anything is written.
    /// Writing a record identical to the stored one is a no-op.
    pub async fn set(
        &self,
        node_name: &str,
        peer: PeerId,
        addrs: &[Multiaddr],
    ) -> Result<SetOutcome, DirectoryError> {
        validate_key(node_name)?;
        if addrs.is_empty() {
            return Err(DirectoryError::EmptyAddressSet);
        }

        let record = PeerAddrInfo::new(peer, addrs.iter().cloned())
            .to_record()
            .map_err(DirectoryError::InvalidAddress)?;
        let outcome = match self.backend.load(node_name).await? {
            Some(stored) if stored.value == record => SetOutcome::Unchanged,
            Some(stored) => {
                self.backend
                    .update(node_name, stored.version, &record)
                    .await?;
                SetOutcome::Updated
            }
            None => {
                self.backend.create(node_name, &record).await?;
                SetOutcome::Created
            }
        };

        match outcome {
            SetOutcome::Unchanged => debug!("Record for {} unchanged", node_name),
            _ => info!("Published {} address(es) for {} ({:?})", addrs.len(), node_name, outcome),
        }
        Ok(outcome)
    }
}

fn validate_key(key: &str) -> Result<(), DirectoryError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DirectoryError::InvalidKey(key.to_string()))
    }
}

/// In-process backend
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, VersionedValue>>,
    writes: AtomicUsize,
    conflicts: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful create/update calls
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Fail the next `n` writes with `Conflict`
    pub fn inject_conflicts(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Stored raw value, if any
    pub fn raw(&self, key: &str) -> Option<VersionedValue> {
        self.entries.lock().get(key).cloned()
    }

    fn take_conflict(&self, key: &str) -> Result<(), DirectoryError> {
        let injected = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(DirectoryError::Conflict(key.to_string()))
        } else {
            Ok(())
        }
    }
}

impl DirectoryBackend for MemoryBackend {
    async fn load(&self, key: &str) -> Result<Option<VersionedValue>, DirectoryError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn create(&self, key: &str, value: &[u8]) -> Result<u64, DirectoryError> {
        self.take_conflict(key)?;
        let mut entries = self.entries.lock();
        if entries.contains_key(key) {
            return Err(DirectoryError::Conflict(key.to_string()));
        }
        entries.insert(
            key.to_string(),
            VersionedValue {
                version: 1,
                value: value.to_vec(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }

    async fn update(&self, key: &str, expected_version: u64, value: &[u8]) -> Result<u64, DirectoryError> {
        self.take_conflict(key)?;
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.version == expected_version => {
                entry.version += 1;
                entry.value = value.to_vec();
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(entry.version)
            }
            _ => Err(DirectoryError::Conflict(key.to_string())),
        }
    }
}

/// Backend on a directory shared between nodes, one file per key
///
/// `<key>.rec` holds an 8-byte big-endian version followed by the value.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    /// Open (creating if needed) a directory-backed store
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DirectoryError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.rec"))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.lock"))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.root
            .join(format!(".{key}.{:016x}.tmp", rand::random::<u64>()))
    }

    async fn write_temp(&self, key: &str, version: u64, value: &[u8]) -> Result<PathBuf, DirectoryError> {
        let path = self.temp_path(key);
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&version.to_be_bytes()).await?;
        file.write_all(value).await?;
        file.sync_all().await?;
        Ok(path)
    }

    async fn acquire_lock(&self, key: &str) -> Result<LockGuard, DirectoryError> {
        let path = self.lock_path(key);
        for _ in 0..2 {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(LockGuard { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !lock_is_stale(&path).await {
                        return Err(DirectoryError::Conflict(key.to_string()));
                    }
                    warn!("Breaking stale directory lock {}", path.display());
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(DirectoryError::Conflict(key.to_string()))
    }
}

async fn lock_is_stale(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        // vanished in between; treat as free
        return true;
    };
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release directory lock {}: {}", self.path.display(), e);
        }
    }
}

fn decode_file(key: &str, bytes: &[u8]) -> Result<VersionedValue, DirectoryError> {
    if bytes.len() < 8 {
        return Err(DirectoryError::Backend(format!("truncated record file for {key}")));
    }
    let (version, value) = bytes.split_at(8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(version);
    Ok(VersionedValue {
        version: u64::from_be_bytes(buf),
        value: value.to_vec(),
    })
}

impl DirectoryBackend for FileBackend {
    async fn load(&self, key: &str) -> Result<Option<VersionedValue>, DirectoryError> {
        match tokio::fs::read(self.record_path(key)).await {
            Ok(bytes) => decode_file(key, &bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, key: &str, value: &[u8]) -> Result<u64, DirectoryError> {
        let temp = self.write_temp(key, 1, value).await?;
        // hard_link fails if the record exists, making creation atomic
        let linked = tokio::fs::hard_link(&temp, self.record_path(key)).await;
        let _ = tokio::fs::remove_file(&temp).await;
        match linked {
            Ok(()) => Ok(1),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(DirectoryError::Conflict(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, key: &str, expected_version: u64, value: &[u8]) -> Result<u64, DirectoryError> {
        let _lock = self.acquire_lock(key).await?;
        let current = self
            .load(key)
            .await?
            .ok_or_else(|| DirectoryError::Conflict(key.to_string()))?;
        if current.version != expected_version {
            return Err(DirectoryError::Conflict(key.to_string()));
        }

        let version = expected_version + 1;
        let temp = self.write_temp(key, version, value).await?;
        if let Err(e) = tokio::fs::rename(&temp, self.record_path(key)).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn peer(n: u8) -> PeerId {
        PeerId([n; 32])
    }

    fn addrs() -> Vec<Multiaddr> {
        vec![
            "/ip4/10.0.0.5/tcp/10006".parse().unwrap(),
            format!("/ip4/1.2.3.4/tcp/10004/p2p/{}/p2p-circuit", peer(9))
                .parse()
                .unwrap(),
        ]
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let dir = AddressDirectory::new(MemoryBackend::new());
        assert_eq!(dir.set("node-a", peer(1), &addrs()).await.unwrap(), SetOutcome::Created);

        let info = dir.get("node-a").await.unwrap();
        assert_eq!(info.id, peer(1));
        assert_eq!(info.addrs, addrs());
    }

    #[tokio::test]
    async fn test_stored_addresses_carry_owner_suffix() {
        let dir = AddressDirectory::new(MemoryBackend::new());
        dir.set("node-a", peer(1), &addrs()[..1]).await.unwrap();

        let raw = dir.backend().raw("node-a").unwrap().value;
        let stored = Multiaddr::try_from(raw).unwrap();
        assert_eq!(stored.to_string(), format!("/ip4/10.0.0.5/tcp/10006/p2p/{}", peer(1)));
    }

    #[tokio::test]
    async fn test_identical_set_writes_once() {
        let dir = AddressDirectory::new(MemoryBackend::new());
        assert_eq!(dir.set("node-a", peer(1), &addrs()).await.unwrap(), SetOutcome::Created);
        assert_eq!(dir.set("node-a", peer(1), &addrs()).await.unwrap(), SetOutcome::Unchanged);
        assert_eq!(dir.backend().writes(), 1);

        assert_eq!(
            dir.set("node-a", peer(1), &addrs()[..1]).await.unwrap(),
            SetOutcome::Updated
        );
        assert_eq!(dir.backend().writes(), 2);
    }

    #[tokio::test]
    async fn test_missing_and_invalid_keys() {
        let dir = AddressDirectory::new(MemoryBackend::new());
        assert!(matches!(dir.get("nobody").await, Err(DirectoryError::NotFound(_))));
        assert!(matches!(dir.get("../etc").await, Err(DirectoryError::InvalidKey(_))));
        assert!(matches!(
            dir.set("node-a", peer(1), &[]).await,
            Err(DirectoryError::EmptyAddressSet)
        ));
    }

    #[tokio::test]
    async fn test_set_rejects_addresses_that_do_not_read_back() {
        let dir = AddressDirectory::new(MemoryBackend::new());

        let foreign: Multiaddr = format!("/ip4/10.0.0.5/tcp/10006/p2p/{}", peer(2)).parse().unwrap();
        let err = dir.set("node-a", peer(1), &[foreign]).await.unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidAddress(_)));
        assert!(!err.is_transient());

        let with_empty = vec![Multiaddr::empty(), addrs()[0].clone()];
        assert!(matches!(
            dir.set("node-a", peer(1), &with_empty).await,
            Err(DirectoryError::InvalidAddress(_))
        ));

        assert_eq!(dir.backend().writes(), 0);
        assert!(matches!(dir.get("node-a").await, Err(DirectoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_own_suffix_is_accepted() {
        let dir = AddressDirectory::new(MemoryBackend::new());
        let own: Multiaddr = format!("/ip4/10.0.0.5/tcp/10006/p2p/{}", peer(1)).parse().unwrap();
        dir.set("node-a", peer(1), &[own]).await.unwrap();
        assert_eq!(dir.get("node-a").await.unwrap().addrs, addrs()[..1].to_vec());
    }

    #[tokio::test]
    async fn test_malformed_record_is_decode_error() {
        let backend = MemoryBackend::new();
        backend.create("broken", &[0xff, 0xff, 0x03]).await.unwrap();
        let dir = AddressDirectory::new(backend);
        let err = dir.get("broken").await.unwrap_err();
        assert!(matches!(err, DirectoryError::Decode(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_conflict_is_transient_and_not_retried() {
        let dir = AddressDirectory::new(MemoryBackend::new());
        dir.backend().inject_conflicts(1);

        let err = dir.set("node-a", peer(1), &addrs()).await.unwrap_err();
        assert!(matches!(err, DirectoryError::Conflict(_)));
        assert!(err.is_transient());
        assert_eq!(dir.backend().writes(), 0);

        assert_eq!(dir.set("node-a", peer(1), &addrs()).await.unwrap(), SetOutcome::Created);
    }

    #[tokio::test]
    async fn test_stale_version_update_conflicts() {
        let backend = MemoryBackend::new();
        backend.create("k", b"one").await.unwrap();
        backend.update("k", 1, b"two").await.unwrap();
        assert!(matches!(
            backend.update("k", 1, b"three").await,
            Err(DirectoryError::Conflict(_))
        ));
        assert_eq!(backend.raw("k").unwrap().value, b"two");
    }

    #[tokio::test]
    async fn test_concurrent_identical_sets() {
        let dir = Arc::new(AddressDirectory::new(MemoryBackend::new()));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let dir = dir.clone();
            tasks.push(tokio::spawn(async move {
                dir.set("node-a", peer(1), &addrs()).await
            }));
        }
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) | Err(DirectoryError::Conflict(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(dir.backend().writes(), 1);
        assert_eq!(dir.get("node-a").await.unwrap().addrs, addrs());
    }

    #[tokio::test]
    async fn test_file_backend_roundtrip_and_versions() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = AddressDirectory::new(FileBackend::open(tmp.path()).unwrap());

        assert_eq!(dir.set("node-a", peer(1), &addrs()).await.unwrap(), SetOutcome::Created);
        assert_eq!(dir.set("node-a", peer(1), &addrs()).await.unwrap(), SetOutcome::Unchanged);
        assert_eq!(
            dir.set("node-a", peer(1), &addrs()[1..]).await.unwrap(),
            SetOutcome::Updated
        );

        let stored = dir.backend().load("node-a").await.unwrap().unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(dir.get("node-a").await.unwrap().addrs, addrs()[1..].to_vec());

        // a second handle on the same volume sees the same record
        let other = AddressDirectory::new(FileBackend::open(tmp.path()).unwrap());
        assert_eq!(other.get("node-a").await.unwrap().id, peer(1));
    }

    #[tokio::test]
    async fn test_file_backend_create_conflicts_when_present() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(tmp.path()).unwrap();
        backend.create("k", b"first").await.unwrap();
        assert!(matches!(
            backend.create("k", b"second").await,
            Err(DirectoryError::Conflict(_))
        ));
        assert!(matches!(
            backend.update("k", 7, b"second").await,
            Err(DirectoryError::Conflict(_))
        ));
        assert_eq!(backend.load("k").await.unwrap().unwrap().value, b"first");
    }

    #[tokio::test]
    async fn test_file_backend_held_lock_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(tmp.path()).unwrap();
        backend.create("k", b"first").await.unwrap();

        std::fs::write(tmp.path().join("k.lock"), b"").unwrap();
        assert!(matches!(
            backend.update("k", 1, b"second").await,
            Err(DirectoryError::Conflict(_))
        ));

        std::fs::remove_file(tmp.path().join("k.lock")).unwrap();
        assert_eq!(backend.update("k", 1, b"second").await.unwrap(), 2);
        assert!(!tmp.path().join("k.lock").exists());
    }

    #[tokio::test]
    async fn test_file_backend_breaks_abandoned_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(tmp.path()).unwrap();
        backend.create("k", b"first").await.unwrap();

        // left behind by a writer that died mid-update
        let lock = tmp.path().join("k.lock");
        let abandoned = std::fs::File::create(&lock).unwrap();
        abandoned
            .set_modified(SystemTime::now() - STALE_LOCK_AGE - Duration::from_secs(30))
            .unwrap();
        drop(abandoned);

        assert_eq!(backend.update("k", 1, b"second").await.unwrap(), 2);
        assert_eq!(backend.load("k").await.unwrap().unwrap().value, b"second");
        assert!(!lock.exists());
    }
}
