//! Filesystem-backed content-addressed image store.
//!
//! Normalized ballot images are written once and never rewritten. Reads
//! re-hash the bytes so an image altered on disk is reported instead of
//! being handed to a reviewer as evidence.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::{CasStore, ContentDigest, StorageResult};

const EXTENSION: &str = "png";

/// Image store sharded by the first byte of the digest.
///
/// Layout: `<root>/<hex[..2]>/<hex[2..]>.png`
pub struct FsCasStore {
    root: PathBuf,
}

impl FsCasStore {
    /// Open (creating if needed) an image store rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn shard(&self, digest: &ContentDigest) -> PathBuf {
        self.root.join(&digest.as_str()[..2])
    }

    fn image_path(&self, digest: &ContentDigest) -> PathBuf {
        self.shard(digest)
            .join(format!("{}.{EXTENSION}", &digest.as_str()[2..]))
    }
}

#[async_trait]
impl CasStore for FsCasStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let path = self.image_path(&digest);
        if path.exists() {
            debug!(digest = %digest.short(), "image already stored");
            return Ok(digest);
        }

        let shard = self.shard(&digest);
        fs::create_dir_all(&shard)?;

        // A partially written image must never be visible under its digest.
        let mut tmp = NamedTempFile::new_in(&shard)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;

        debug!(digest = %digest.short(), bytes = data.len(), "image stored");
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let bytes = match fs::read(self.image_path(digest)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound {
                    digest: digest.as_str().to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        if &ContentDigest::from_bytes(&bytes) != digest {
            warn!(digest = %digest.short(), "stored image failed digest check");
            return Err(StorageError::Corrupt {
                digest: digest.as_str().to_string(),
            });
        }
        Ok(bytes)
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        Ok(self.image_path(digest).is_file())
    }
}
