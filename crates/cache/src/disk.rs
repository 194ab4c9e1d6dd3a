use chrono::{DateTime, Utc};
use ibkr_bridge_core::{Fingerprint, ToolResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::debug;

use crate::CacheError;

const FILE_PREFIX: &str = "ibkr_";
const FILE_SUFFIX: &str = ".json";

/// On-disk representation of one cached result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEntry {
    pub fingerprint: Fingerprint,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub result: ToolResult,
}

/// Summary of the disk tier for the `cache stats` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiskStats {
    pub directory: PathBuf,
    pub entries: usize,
    pub bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// JSON-file tier under a single directory, one file per fingerprint.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &Fingerprint) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", FILE_PREFIX, key.as_str(), FILE_SUFFIX))
    }

    fn is_cache_file(path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(FILE_PREFIX) && name.ends_with(FILE_SUFFIX))
            .unwrap_or(false)
    }

    /// Load an unexpired entry. Expired files are removed; corrupt files are
    /// removed and reported.
    pub async fn get(&self, key: &Fingerprint, now: DateTime<Utc>) -> Result<Option<DiskEntry>, CacheError> {
        let path = self.path_for(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry: DiskEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(source) => {
                let _ = fs::remove_file(&path).await;
                return Err(CacheError::Corrupt { path, source });
            }
        };

        if entry.fingerprint != *key {
            let _ = fs::remove_file(&path).await;
            return Err(CacheError::Mismatch { path });
        }

        if entry.expires_at <= now {
            debug!(fingerprint = %key, "Removing expired disk entry");
            fs::remove_file(&path).await?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    /// Write an entry, replacing any previous file for the same key.
    pub async fn put(&self, entry: &DiskEntry) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&entry.fingerprint);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec(entry).map_err(CacheError::Serialize)?;
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn cache_files(&self) -> Result<Vec<(PathBuf, std::fs::Metadata)>, CacheError> {
        let mut files = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if !Self::is_cache_file(&path) {
                continue;
            }
            let meta = item.metadata().await?;
            if meta.is_file() {
                files.push((path, meta));
            }
        }
        Ok(files)
    }

    pub async fn stats(&self) -> Result<DiskStats, CacheError> {
        let mut stats = DiskStats {
            directory: self.dir.clone(),
            ..Default::default()
        };
        for (_, meta) in self.cache_files().await? {
            stats.entries += 1;
            stats.bytes += meta.len();
            if let Ok(modified) = meta.modified() {
                let modified = DateTime::<Utc>::from(modified);
                stats.oldest = Some(stats.oldest.map_or(modified, |o| o.min(modified)));
                stats.newest = Some(stats.newest.map_or(modified, |n| n.max(modified)));
            }
        }
        Ok(stats)
    }

    /// Remove cache files, or only those last written more than `older_than` ago.
    pub async fn clear(&self, older_than: Option<Duration>) -> Result<usize, CacheError> {
        let now = SystemTime::now();
        let mut removed = 0;
        for (path, meta) in self.cache_files().await? {
            if let Some(limit) = older_than {
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or_default();
                if age <= limit {
                    continue;
                }
            }
            fs::remove_file(&path).await?;
            removed += 1;
        }
        Ok(removed)
    }
}
