/// Filesystem identity cache
///
/// Per-type subdirectories with independent lifetimes: `handles/` and
/// `records/` expire after 24h, `repos/` after 10h, `dids/` never.
/// Writes are best-effort; a failed stash is logged and the request
/// proceeds.
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::PdsResult;

/// Cache entry categories with their lifetimes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Handles,
    Dids,
    Records,
    Repos,
}

impl CacheKind {
    pub fn dir_name(&self) -> &'static str {
        match self {
            CacheKind::Handles => "handles",
            CacheKind::Dids => "dids",
            CacheKind::Records => "records",
            CacheKind::Repos => "repos",
        }
    }

    /// Lifetime for the cleaner; `None` entries never expire
    pub fn lifetime(&self) -> Option<Duration> {
        match self {
            CacheKind::Handles | CacheKind::Records => Some(Duration::from_secs(24 * 3600)),
            CacheKind::Repos => Some(Duration::from_secs(10 * 3600)),
            CacheKind::Dids => None,
        }
    }

    fn all() -> [CacheKind; 4] {
        [
            CacheKind::Handles,
            CacheKind::Dids,
            CacheKind::Records,
            CacheKind::Repos,
        ]
    }
}

/// Largest file the cache will read back
const MAX_ENTRY_BYTES: u64 = 1024 * 1024;

#[derive(Clone)]
pub struct FileCache {
    dir: PathBuf,
    disabled: bool,
}

impl FileCache {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            disabled: false,
        }
    }

    pub fn disabled() -> Self {
        Self {
            dir: PathBuf::new(),
            disabled: true,
        }
    }

    fn entry_path(&self, kind: CacheKind, key: &str) -> PathBuf {
        let safe_key = key.replace(['/', ':', '%'], "_");
        self.dir.join(kind.dir_name()).join(safe_key)
    }

    /// Read a cached JSON value, honoring the kind's lifetime
    pub async fn get<T: serde::de::DeserializeOwned>(
        &self,
        kind: CacheKind,
        key: &str,
    ) -> Option<T> {
        if self.disabled {
            return None;
        }
        let path = self.entry_path(kind, key);
        let metadata = tokio::fs::metadata(&path).await.ok()?;
        if metadata.len() > MAX_ENTRY_BYTES {
            return None;
        }
        if let Some(lifetime) = kind.lifetime() {
            let modified = metadata.modified().ok()?;
            if SystemTime::now().duration_since(modified).ok()? > lifetime {
                return None;
            }
        }
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Best-effort write; failures are logged, never surfaced
    pub async fn stash<T: serde::Serialize>(&self, kind: CacheKind, key: &str, value: &T) {
        if self.disabled {
            return;
        }
        let path = self.entry_path(kind, key);
        let result: PdsResult<()> = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let bytes = serde_json::to_vec(value)
                .map_err(|e| crate::error::PdsError::internal(e.to_string()))?;
            tokio::fs::write(&path, bytes).await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::debug!(path = %path.display(), error = %e, "file cache stash failed");
        }
    }

    pub async fn remove(&self, kind: CacheKind, key: &str) {
        if self.disabled {
            return;
        }
        let _ = tokio::fs::remove_file(self.entry_path(kind, key)).await;
    }

    /// Delete entries past their kind's lifetime; returns removed count
    pub async fn clean(&self) -> PdsResult<usize> {
        if self.disabled {
            return Ok(0);
        }
        let mut removed = 0;
        for kind in CacheKind::all() {
            let Some(lifetime) = kind.lifetime() else {
                continue;
            };
            removed += clean_dir(&self.dir.join(kind.dir_name()), lifetime).await?;
        }
        Ok(removed)
    }
}

async fn clean_dir(dir: &Path, lifetime: Duration) -> PdsResult<usize> {
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let now = SystemTime::now();
    while let Some(entry) = entries.next_entry().await? {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if now.duration_since(modified).unwrap_or(Duration::ZERO) > lifetime {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stash_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());
        cache
            .stash(CacheKind::Handles, "alice.test", &"did:plc:abc".to_string())
            .await;
        let hit: Option<String> = cache.get(CacheKind::Handles, "alice.test").await;
        assert_eq!(hit.as_deref(), Some("did:plc:abc"));
    }

    #[tokio::test]
    async fn test_keys_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());
        cache
            .stash(CacheKind::Dids, "did:plc:abc/../../etc", &42u32)
            .await;
        let hit: Option<u32> = cache.get(CacheKind::Dids, "did:plc:abc/../../etc").await;
        assert_eq!(hit, Some(42));
        // Nothing escaped the cache directory
        assert!(dir.path().join("dids").exists());
    }

    #[tokio::test]
    async fn test_disabled_cache_is_silent() {
        let cache = FileCache::disabled();
        cache.stash(CacheKind::Repos, "x", &1u8).await;
        let hit: Option<u8> = cache.get(CacheKind::Repos, "x").await;
        assert!(hit.is_none());
        assert_eq!(cache.clean().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleaner_respects_lifetimes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(dir.path().to_path_buf());
        cache.stash(CacheKind::Handles, "fresh.test", &1u8).await;
        cache.stash(CacheKind::Dids, "did:plc:pinned", &1u8).await;
        // Nothing is old enough to clean
        assert_eq!(cache.clean().await.unwrap(), 0);
        let hit: Option<u8> = cache.get(CacheKind::Dids, "did:plc:pinned").await;
        assert_eq!(hit, Some(1));
    }
}
