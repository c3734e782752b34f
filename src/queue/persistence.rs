//! Key/value storage of queue snapshots, one blob per proposal.

use crate::env;
use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Storage for serialized queue snapshots
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn save(&self, proposal_id: u64, blob: &str) -> QueueResult<()>;

    /// Stored blob of a proposal, `None` when nothing was saved
    async fn load(&self, proposal_id: u64) -> QueueResult<Option<String>>;
}

/// In-memory store, mostly useful for tests
#[derive(Default)]
pub struct MemoryQueueStore {
    blobs: RwLock<HashMap<String, String>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn save(&self, proposal_id: u64, blob: &str) -> QueueResult<()> {
        self.blobs
            .write()
            .await
            .insert(env::queue_key(proposal_id), blob.to_string());
        Ok(())
    }

    async fn load(&self, proposal_id: u64) -> QueueResult<Option<String>> {
        Ok(self
            .blobs
            .read()
            .await
            .get(&env::queue_key(proposal_id))
            .cloned())
    }
}

/// One file per proposal under a directory, written through a temp file
/// and renamed into place
pub struct FileQueueStore {
    directory: PathBuf,
    compress: bool,
}

impl FileQueueStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            compress: false,
        }
    }

    /// Gzip blobs on save
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of a proposal's snapshot in the requested encoding
    pub fn snapshot_path(&self, proposal_id: u64, compressed: bool) -> PathBuf {
        let extension = if compressed {
            env::COMPRESSED_SNAPSHOT_EXTENSION
        } else {
            env::SNAPSHOT_EXTENSION
        };
        self.directory
            .join(format!("{}.{}", env::queue_key(proposal_id), extension))
    }

    fn encode(&self, blob: &str) -> QueueResult<Vec<u8>> {
        if !self.compress {
            return Ok(blob.as_bytes().to_vec());
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(blob.as_bytes())?;
        Ok(encoder.finish()?)
    }

    fn decode_compressed(data: &[u8]) -> QueueResult<String> {
        let mut decoder = GzDecoder::new(data);
        let mut blob = String::new();
        decoder
            .read_to_string(&mut blob)
            .map_err(|e| QueueError::Persistence(format!("corrupt compressed snapshot: {}", e)))?;
        Ok(blob)
    }
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn save(&self, proposal_id: u64, blob: &str) -> QueueResult<()> {
        async_fs::create_dir_all(&self.directory).await?;

        let data = self.encode(blob)?;
        let final_path = self.snapshot_path(proposal_id, self.compress);
        let temp_path = final_path.with_extension("tmp");

        let mut file = async_fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        async_fs::rename(&temp_path, &final_path).await?;

        // A snapshot in the other encoding would shadow this one on load
        let stale = self.snapshot_path(proposal_id, !self.compress);
        if async_fs::try_exists(&stale).await? {
            async_fs::remove_file(&stale).await?;
        }

        info!(
            "Saved queue {} ({} bytes) to {}",
            env::queue_key(proposal_id),
            data.len(),
            final_path.display()
        );
        Ok(())
    }

    async fn load(&self, proposal_id: u64) -> QueueResult<Option<String>> {
        for compressed in [self.compress, !self.compress] {
            let path = self.snapshot_path(proposal_id, compressed);
            if !async_fs::try_exists(&path).await? {
                continue;
            }

            debug!("Loading queue snapshot from {}", path.display());
            return read_snapshot_file(&path).await.map(Some);
        }

        Ok(None)
    }
}

/// Read a snapshot file written by [`FileQueueStore`] or by hand, gzipped
/// when its name ends in `.gz`
pub async fn read_snapshot_file(path: &Path) -> QueueResult<String> {
    let data = async_fs::read(path).await?;
    let compressed = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));

    if compressed {
        FileQueueStore::decode_compressed(&data)
    } else {
        String::from_utf8(data)
            .map_err(|e| QueueError::Persistence(format!("snapshot is not valid UTF-8: {}", e)))
    }
}
