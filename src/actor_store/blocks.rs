/// Per-actor block store
///
/// CID -> content persistence for MST nodes, records, and commits, plus
/// the single `repo_root` row naming the current signed commit. An
/// in-memory cache fronts the database and stays coherent across writes
/// and deletes.
use chrono::Utc;
use libipld::Cid;
use sqlx::Row;

use crate::actor_store::models::RepoRoot;
use crate::actor_store::ActorDb;
use crate::error::{PdsError, PdsResult};
use crate::repo::{dag, BlockMap, CidSet, CommitData, ReadableBlockstore};

#[derive(Clone, Debug)]
pub struct BlockStore {
    did: String,
    db: ActorDb,
    verify_on_read: bool,
}

impl BlockStore {
    pub(crate) fn new(did: String, db: ActorDb, verify_on_read: bool) -> Self {
        Self {
            did,
            db,
            verify_on_read,
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    /// Fetch one block, cache first
    pub async fn get(&self, cid: &Cid) -> PdsResult<Option<Vec<u8>>> {
        let key = cid.to_string();
        {
            let cache = self.db.block_cache.read().await;
            if let Some(bytes) = cache.get(&key) {
                return Ok(Some(bytes.clone()));
            }
        }
        let content: Option<Vec<u8>> =
            sqlx::query_scalar("SELECT content FROM repo_block WHERE cid = ?1")
                .bind(&key)
                .fetch_optional(&self.db.pool)
                .await?;
        if let Some(bytes) = &content {
            if self.verify_on_read && dag::cid_for_bytes(bytes) != *cid {
                return Err(PdsError::internal(format!(
                    "stored block does not hash to {}",
                    cid
                )));
            }
            let mut cache = self.db.block_cache.write().await;
            cache.insert(key, bytes.clone());
        }
        Ok(content)
    }

    pub async fn has(&self, cid: &Cid) -> PdsResult<bool> {
        {
            let cache = self.db.block_cache.read().await;
            if cache.contains_key(&cid.to_string()) {
                return Ok(true);
            }
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repo_block WHERE cid = ?1")
            .bind(cid.to_string())
            .fetch_one(&self.db.pool)
            .await?;
        Ok(count > 0)
    }

    /// Store one block, recording the rev that introduced it
    pub async fn put_block(&self, cid: &Cid, bytes: &[u8], rev: &str) -> PdsResult<()> {
        sqlx::query(
            "INSERT INTO repo_block (cid, repo_rev, size, content)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cid) DO NOTHING",
        )
        .bind(cid.to_string())
        .bind(rev)
        .bind(bytes.len() as i64)
        .bind(bytes)
        .execute(&self.db.pool)
        .await?;
        let mut cache = self.db.block_cache.write().await;
        cache.insert(cid.to_string(), bytes.to_vec());
        Ok(())
    }

    /// Store a batch of blocks under one rev
    pub async fn put_many(&self, blocks: &BlockMap, rev: &str) -> PdsResult<()> {
        for (cid, bytes) in blocks.iter() {
            self.put_block(cid, bytes, rev).await?;
        }
        Ok(())
    }

    /// Fetch a batch, reporting which CIDs were missing
    pub async fn get_blocks(&self, cids: &[Cid]) -> PdsResult<(BlockMap, Vec<Cid>)> {
        let mut found = BlockMap::new();
        let mut missing = Vec::new();
        for cid in cids {
            match self.get(cid).await? {
                Some(bytes) => found.set(*cid, bytes),
                None => missing.push(*cid),
            }
        }
        Ok((found, missing))
    }

    /// Delete a set of blocks (no-op for absent CIDs)
    pub async fn delete_many(&self, cids: &CidSet) -> PdsResult<()> {
        {
            let mut cache = self.db.block_cache.write().await;
            for cid in cids {
                cache.remove(&cid.to_string());
            }
        }
        for cid in cids {
            sqlx::query("DELETE FROM repo_block WHERE cid = ?1")
                .bind(cid.to_string())
                .execute(&self.db.pool)
                .await?;
        }
        Ok(())
    }

    /// All blocks introduced at `rev`, used to warm the cache
    pub async fn list_by_rev(&self, rev: &str) -> PdsResult<BlockMap> {
        let rows = sqlx::query("SELECT cid, content FROM repo_block WHERE repo_rev = ?1")
            .bind(rev)
            .fetch_all(&self.db.pool)
            .await?;
        let mut blocks = BlockMap::new();
        for row in rows {
            let cid: String = row.get("cid");
            let content: Vec<u8> = row.get("content");
            blocks.set(dag::parse_cid(&cid)?, content);
        }
        Ok(blocks)
    }

    /// Every block in the store, for full repo export
    pub async fn all_blocks(&self) -> PdsResult<BlockMap> {
        let rows = sqlx::query("SELECT cid, content FROM repo_block")
            .fetch_all(&self.db.pool)
            .await?;
        let mut blocks = BlockMap::new();
        for row in rows {
            let cid: String = row.get("cid");
            let content: Vec<u8> = row.get("content");
            blocks.set(dag::parse_cid(&cid)?, content);
        }
        Ok(blocks)
    }

    /// Current repo root, if the repo has committed at least once
    pub async fn get_root(&self) -> PdsResult<Option<RepoRoot>> {
        let row = sqlx::query("SELECT did, cid, rev, indexed_at FROM repo_root WHERE did = ?1")
            .bind(&self.did)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(match row {
            Some(row) => {
                let indexed_at: String = row.get("indexed_at");
                Some(RepoRoot {
                    did: row.get("did"),
                    cid: row.get("cid"),
                    rev: row.get("rev"),
                    indexed_at: chrono::DateTime::parse_from_rfc3339(&indexed_at)
                        .map_err(|e| PdsError::internal(format!("invalid root timestamp: {}", e)))?
                        .with_timezone(&Utc),
                })
            }
            None => None,
        })
    }

    /// Point the repo at a new signed commit
    pub async fn update_root(&self, cid: &Cid, rev: &str, is_create: bool) -> PdsResult<()> {
        let now = Utc::now().to_rfc3339();
        if is_create {
            sqlx::query(
                "INSERT INTO repo_root (did, cid, rev, indexed_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(did) DO UPDATE SET
                    cid = excluded.cid,
                    rev = excluded.rev,
                    indexed_at = excluded.indexed_at",
            )
            .bind(&self.did)
            .bind(cid.to_string())
            .bind(rev)
            .bind(&now)
            .execute(&self.db.pool)
            .await?;
        } else {
            let result = sqlx::query(
                "UPDATE repo_root SET cid = ?1, rev = ?2, indexed_at = ?3 WHERE did = ?4",
            )
            .bind(cid.to_string())
            .bind(rev)
            .bind(&now)
            .bind(&self.did)
            .execute(&self.db.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(PdsError::RepoNotFound(self.did.clone()));
            }
        }
        Ok(())
    }

    /// Persist a formatted commit: root pointer, new blocks, removed blocks
    pub async fn apply_commit(&self, commit: &CommitData, is_create: bool) -> PdsResult<()> {
        self.update_root(&commit.cid, &commit.rev, is_create).await?;
        self.put_many(&commit.new_blocks, &commit.rev).await?;
        self.delete_many(&commit.removed_cids).await?;
        Ok(())
    }

    /// Export the whole repository as a CARv1 stream rooted at the
    /// current commit
    pub async fn export_car(&self) -> PdsResult<Vec<u8>> {
        let root = self
            .get_root()
            .await?
            .ok_or_else(|| PdsError::RepoNotFound(self.did.clone()))?;
        let blocks = self.all_blocks().await?;
        crate::car::blocks_to_car(&dag::parse_cid(&root.cid)?, &blocks)
    }
}

#[async_trait::async_trait]
impl ReadableBlockstore for BlockStore {
    async fn get_bytes(&self, cid: &Cid) -> PdsResult<Option<Vec<u8>>> {
        self.get(cid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor_store::test_store;
    use crate::crypto::Keypair;
    use libipld::Ipld;

    async fn block_store() -> (tempfile::TempDir, BlockStore) {
        let (dir, store) = test_store().await;
        store
            .create("did:plc:blocks", &Keypair::generate())
            .await
            .unwrap();
        let blocks = store.blocks("did:plc:blocks").await.unwrap();
        (dir, blocks)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_dir, store) = block_store().await;
        let (cid, bytes) = dag::cid_for_ipld(&Ipld::String("block".to_string())).unwrap();
        store.put_block(&cid, &bytes, "3jzfcijpj2z2a").await.unwrap();
        assert_eq!(store.get(&cid).await.unwrap(), Some(bytes.clone()));
        assert!(store.has(&cid).await.unwrap());

        // Verify-on-read passes because content hashes to the CID
        let (found, missing) = store.get_blocks(&[cid]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (_dir, store) = block_store().await;
        let (cid, bytes) = dag::cid_for_ipld(&Ipld::Integer(42)).unwrap();
        store.put_block(&cid, &bytes, "rev-a").await.unwrap();
        store.put_block(&cid, &bytes, "rev-b").await.unwrap();
        // First writer wins; the rev records the introducing commit
        let by_rev = store.list_by_rev("rev-a").await.unwrap();
        assert!(by_rev.has(&cid));
    }

    #[tokio::test]
    async fn test_delete_clears_cache_too() {
        let (_dir, store) = block_store().await;
        let (cid, bytes) = dag::cid_for_ipld(&Ipld::Bool(true)).unwrap();
        store.put_block(&cid, &bytes, "rev").await.unwrap();
        let mut set = CidSet::new();
        set.insert(cid);
        store.delete_many(&set).await.unwrap();
        assert_eq!(store.get(&cid).await.unwrap(), None);
        assert!(!store.has(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_root_lifecycle() {
        let (_dir, store) = block_store().await;
        assert!(store.get_root().await.unwrap().is_none());

        let (cid, _) = dag::cid_for_ipld(&Ipld::String("commit1".to_string())).unwrap();
        store.update_root(&cid, "rev1", true).await.unwrap();
        let root = store.get_root().await.unwrap().unwrap();
        assert_eq!(root.cid, cid.to_string());
        assert_eq!(root.rev, "rev1");

        let (cid2, _) = dag::cid_for_ipld(&Ipld::String("commit2".to_string())).unwrap();
        store.update_root(&cid2, "rev2", false).await.unwrap();
        let root = store.get_root().await.unwrap().unwrap();
        assert_eq!(root.cid, cid2.to_string());
    }
}
