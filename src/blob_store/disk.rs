/// Disk-backed blob storage
///
/// Layout under the root directory:
///   `<root>/<did>/<cid>`            permanent
///   `<root>/temp/<did>/<key>`       staged uploads
///   `<root>/quarantine/<did>/<cid>` quarantined
///
/// Writes go to a scratch file first and are renamed into place, so a
/// crash never leaves a half-written object at its final path.
use async_trait::async_trait;
use libipld::Cid;
use rand::RngCore;
use std::path::PathBuf;
use std::time::SystemTime;
use tokio::fs;

use crate::blob_store::BlobStore;
use crate::error::{PdsError, PdsResult};

#[derive(Clone)]
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn safe_did(did: &str) -> String {
        did.replace([':', '%'], "_")
    }

    fn permanent_path(&self, did: &str, cid: &Cid) -> PathBuf {
        self.root.join(Self::safe_did(did)).join(cid.to_string())
    }

    fn temp_path(&self, did: &str, key: &str) -> PathBuf {
        self.root.join("temp").join(Self::safe_did(did)).join(key)
    }

    fn quarantine_path(&self, did: &str, cid: &Cid) -> PathBuf {
        self.root
            .join("quarantine")
            .join(Self::safe_did(did))
            .join(cid.to_string())
    }

    /// Write-then-rename so the final path only ever holds complete bytes
    async fn atomic_write(&self, dest: &PathBuf, bytes: &[u8]) -> PdsResult<()> {
        let parent = dest
            .parent()
            .ok_or_else(|| PdsError::internal("blob path has no parent"))?;
        fs::create_dir_all(parent).await?;
        let mut scratch = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut scratch);
        let scratch_path = parent.join(format!(".write-{}", hex::encode(scratch)));
        fs::write(&scratch_path, bytes).await?;
        fs::rename(&scratch_path, dest).await?;
        Ok(())
    }

    /// Move a file between regions, tolerating an existing destination
    async fn shift(&self, from: PathBuf, to: PathBuf, cid: &Cid) -> PdsResult<()> {
        if !from.exists() {
            return Err(PdsError::BlobNotFound(cid.to_string()));
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&from, &to).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn put_temp(&self, did: &str, bytes: &[u8]) -> PdsResult<String> {
        let mut key_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key_bytes);
        let key = hex::encode(key_bytes);
        self.atomic_write(&self.temp_path(did, &key), bytes).await?;
        Ok(key)
    }

    async fn make_permanent(&self, did: &str, key: &str, cid: &Cid) -> PdsResult<()> {
        let temp = self.temp_path(did, key);
        let dest = self.permanent_path(did, cid);
        if dest.exists() {
            // Already promoted; discard the staged copy
            if temp.exists() {
                let _ = fs::remove_file(&temp).await;
            }
            return Ok(());
        }
        if !temp.exists() {
            return Err(PdsError::BlobNotFound(cid.to_string()));
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&temp, &dest).await?;
        Ok(())
    }

    async fn put_permanent(&self, did: &str, cid: &Cid, bytes: &[u8]) -> PdsResult<()> {
        self.atomic_write(&self.permanent_path(did, cid), bytes).await
    }

    async fn get_bytes(&self, did: &str, cid: &Cid) -> PdsResult<Vec<u8>> {
        match fs::read(self.permanent_path(did, cid)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PdsError::BlobNotFound(cid.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn has_stored(&self, did: &str, cid: &Cid) -> PdsResult<bool> {
        Ok(self.permanent_path(did, cid).exists())
    }

    async fn has_temp(&self, did: &str, key: &str) -> PdsResult<bool> {
        Ok(self.temp_path(did, key).exists())
    }

    async fn delete(&self, did: &str, cid: &Cid) -> PdsResult<()> {
        match fs::remove_file(self.permanent_path(did, cid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_many(&self, did: &str, cids: &[Cid]) -> PdsResult<()> {
        for cid in cids {
            self.delete(did, cid).await?;
        }
        Ok(())
    }

    async fn delete_all(&self, did: &str) -> PdsResult<()> {
        for dir in [
            self.root.join(Self::safe_did(did)),
            self.root.join("temp").join(Self::safe_did(did)),
            self.root.join("quarantine").join(Self::safe_did(did)),
        ] {
            if dir.exists() {
                fs::remove_dir_all(&dir).await?;
            }
        }
        Ok(())
    }

    async fn quarantine(&self, did: &str, cid: &Cid) -> PdsResult<()> {
        self.shift(
            self.permanent_path(did, cid),
            self.quarantine_path(did, cid),
            cid,
        )
        .await
    }

    async fn unquarantine(&self, did: &str, cid: &Cid) -> PdsResult<()> {
        self.shift(
            self.quarantine_path(did, cid),
            self.permanent_path(did, cid),
            cid,
        )
        .await
    }

    async fn stale_temp_keys(&self, cutoff: SystemTime) -> PdsResult<Vec<(String, String)>> {
        let temp_root = self.root.join("temp");
        let mut stale = Vec::new();
        let mut actors = match fs::read_dir(&temp_root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stale),
            Err(e) => return Err(e.into()),
        };
        while let Some(actor) = actors.next_entry().await? {
            let did = actor.file_name().to_string_lossy().to_string();
            let mut files = fs::read_dir(actor.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let modified = file.metadata().await?.modified()?;
                if modified < cutoff {
                    stale.push((did.clone(), file.file_name().to_string_lossy().to_string()));
                }
            }
        }
        Ok(stale)
    }

    async fn delete_temp(&self, did: &str, key: &str) -> PdsResult<()> {
        match fs::remove_file(self.temp_path(did, key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
