use async_trait::async_trait;
use std::path::PathBuf;

/// Raw container logs land at `jobs/{jobId}/raw/game_NNN.txt`, numbered by
/// 1-based container position.
pub fn raw_log_path(job_id: &str, game_number: u32) -> String {
    format!("jobs/{job_id}/raw/game_{game_number:03}.txt")
}

pub fn condensed_path(job_id: &str) -> String {
    format!("jobs/{job_id}/condensed.json")
}

/// Minimal blob interface the engine needs: upload raw logs incrementally
/// from workers, read them back during aggregation.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> anyhow::Result<()>;

    async fn get(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>>;
}

/// Filesystem-backed blob store rooted under the data directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let target = self.root.join(path);
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
