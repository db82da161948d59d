use crate::error::{CairnError, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use ulid::Ulid;

const TMP_PREFIX: &str = "tmp";

/// Local content-addressed blob storage.
///
/// Blobs live at `<base>/blobs/<first two hex chars>/<oid>`; in-flight writes
/// go to `<base>/tmp<ulid>` and are renamed into place once verified.
pub struct BlobStore {
    base_path: PathBuf,
}

impl BlobStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(base_path.join("blobs"))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Store bytes and return their OID.
    pub async fn put(&self, data: Bytes) -> Result<String> {
        let oid = compute_hash(&data);
        self.write_stream(Some(&oid), futures_util::stream::iter([Ok(data)]))
            .await?;
        Ok(oid)
    }

    /// Store bytes that must hash to `oid`.
    pub async fn put_verified(&self, oid: &str, data: Bytes) -> Result<u64> {
        let (_, length) = self
            .write_stream(Some(oid), futures_util::stream::iter([Ok(data)]))
            .await?;
        Ok(length)
    }

    /// Stream a blob to a temp file while hashing it, then move it into place.
    ///
    /// When `expected` is given the content must match it, otherwise the temp
    /// file is discarded and `HashMismatch` returned.
    pub async fn write_stream<S>(&self, expected: Option<&str>, mut stream: S) -> Result<(String, u64)>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let temp_path = self
            .base_path
            .join(format!("{}{}", TMP_PREFIX, Ulid::new()));
        let mut file = fs::File::create(&temp_path).await?;
        let mut hasher = Sha256::new();
        let mut length = 0u64;

        let written: Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                hasher.update(&chunk);
                length += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(file);

        if let Err(error) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(error);
        }

        let oid = hex::encode(hasher.finalize());
        if let Some(expected) = expected {
            if expected != oid {
                let _ = fs::remove_file(&temp_path).await;
                return Err(CairnError::HashMismatch {
                    expected: expected.to_string(),
                    actual: oid,
                });
            }
        }

        let blob_path = self.blob_path(&oid)?;
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&temp_path, &blob_path).await?;

        tracing::debug!("Stored blob oid={} length={}", oid, length);
        Ok((oid, length))
    }

    pub async fn get(&self, oid: &str) -> Result<Bytes> {
        let blob_path = self.blob_path(oid)?;
        match fs::read(&blob_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                Err(CairnError::BlobNotFound(oid.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Open a blob for streaming, with its length.
    pub async fn open(&self, oid: &str) -> Result<Option<(fs::File, u64)>> {
        let blob_path = self.blob_path(oid)?;
        match fs::File::open(&blob_path).await {
            Ok(file) => {
                let length = file.metadata().await?.len();
                Ok(Some((file, length)))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    pub fn exists(&self, oid: &str) -> bool {
        self.blob_path(oid)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    /// Remove a local blob, returning whether it was there.
    pub async fn remove(&self, oid: &str) -> Result<bool> {
        let blob_path = self.blob_path(oid)?;
        match fs::remove_file(&blob_path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// Re-hash a stored blob. Returns its length when the content matches.
    pub async fn verify(&self, oid: &str) -> Result<u64> {
        let blob_path = self.blob_path(oid)?;
        let mut file = match fs::File::open(&blob_path).await {
            Ok(file) => file,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(CairnError::BlobNotFound(oid.to_string()));
            }
            Err(error) => return Err(error.into()),
        };

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut length = 0u64;
        loop {
            let read = file.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            length += read as u64;
        }

        let actual = hex::encode(hasher.finalize());
        if actual != oid {
            return Err(CairnError::HashMismatch {
                expected: oid.to_string(),
                actual,
            });
        }
        Ok(length)
    }

    /// List the OIDs of all stored blobs.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut oids = Vec::new();
        let mut shards = fs::read_dir(self.base_path.join("blobs")).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                if let Some(name) = entry.file_name().to_str() {
                    if is_valid_oid(name) {
                        oids.push(name.to_string());
                    }
                }
            }
        }
        oids.sort();
        Ok(oids)
    }

    /// Bytes used by stored blobs.
    pub async fn used_bytes(&self) -> Result<u64> {
        let mut total = 0u64;
        for oid in self.list().await? {
            if let Ok(meta) = fs::metadata(self.blob_path(&oid)?).await {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Remove abandoned temp files older than `max_age`.
    pub async fn cleanup_tmp(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(TMP_PREFIX) || !entry.file_type().await?.is_file() {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age < max_age {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    removed += 1;
                    tracing::info!("Removed stale temp file {}", name);
                }
                Err(error) => {
                    tracing::warn!("Failed to remove temp file {}: {}", name, error);
                }
            }
        }
        Ok(removed)
    }

    fn blob_path(&self, oid: &str) -> Result<PathBuf> {
        if !is_valid_oid(oid) {
            return Err(CairnError::InvalidRequest(format!("invalid oid: {}", oid)));
        }
        Ok(self.base_path.join("blobs").join(&oid[..2]).join(oid))
    }
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the expected hash
pub fn verify_hash(data: &[u8], expected_hash: &str) -> Result<()> {
    let actual_hash = compute_hash(data);
    if actual_hash != expected_hash {
        return Err(CairnError::HashMismatch {
            expected: expected_hash.to_string(),
            actual: actual_hash,
        });
    }
    Ok(())
}

/// OIDs are lowercase hex SHA-256 digests.
pub fn is_valid_oid(oid: &str) -> bool {
    oid.len() == 64 && oid.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
