/// Actor store - per-user isolated storage
///
/// Every actor gets its own directory holding a SQLite database
/// (`store.sqlite`: blocks, repo root, records, backlinks, blob index,
/// preferences) and a raw signing key file. The database path is sharded
/// by the first two hex characters of the DID's SHA-256 so one directory
/// never accumulates every actor.

pub mod blobs;
pub mod blocks;
pub mod models;
pub mod preferences;
pub mod prepare;
pub mod records;
pub mod transactor;

pub use blocks::BlockStore;
pub use records::RecordStore;
pub use transactor::RepoTransactor;

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::crypto::Keypair;
use crate::error::{PdsError, PdsResult};

/// Configuration for the actor store
#[derive(Debug, Clone)]
pub struct ActorStoreConfig {
    pub base_directory: PathBuf,
    /// Number of open per-actor database pools to keep
    pub cache_size: usize,
    /// Re-hash block content on read
    pub verify_blocks_on_read: bool,
}

impl Default for ActorStoreConfig {
    fn default() -> Self {
        Self {
            base_directory: PathBuf::from("./data/actors"),
            cache_size: 100,
            verify_blocks_on_read: false,
        }
    }
}

/// Filesystem layout for one actor
#[derive(Debug, Clone)]
pub struct ActorLocation {
    pub directory: PathBuf,
    pub db_location: PathBuf,
    pub key_location: PathBuf,
}

/// One actor's open database plus its shared block cache
#[derive(Clone, Debug)]
pub(crate) struct ActorDb {
    pub pool: SqlitePool,
    pub block_cache: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

/// Actor store - manages per-user repositories
#[derive(Clone)]
pub struct ActorStore {
    config: ActorStoreConfig,
    db_cache: Arc<RwLock<HashMap<String, ActorDb>>>,
}

impl ActorStore {
    pub fn new(config: ActorStoreConfig) -> Self {
        Self {
            config,
            db_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Location of an actor's directory, database, and key file
    pub fn get_location(&self, did: &str) -> ActorLocation {
        let hash = Sha256::digest(did.as_bytes());
        let shard = hex::encode(&hash[..1]);
        let safe_did = did.replace([':', '%'], "_");
        let directory = self.config.base_directory.join(shard).join(safe_did);
        ActorLocation {
            db_location: directory.join("store.sqlite"),
            key_location: directory.join("key"),
            directory,
        }
    }

    pub async fn exists(&self, did: &str) -> bool {
        self.get_location(did).db_location.exists()
    }

    /// Create a new actor: directory, key file, database schema
    pub async fn create(&self, did: &str, keypair: &Keypair) -> PdsResult<()> {
        let location = self.get_location(did);
        tokio::fs::create_dir_all(&location.directory).await?;
        keypair.save_to_file(&location.key_location)?;

        let pool = open_pool(&location.db_location, true).await?;
        create_schema(&pool).await?;

        let mut cache = self.db_cache.write().await;
        evict_if_full(&mut cache, self.config.cache_size);
        cache.insert(
            did.to_string(),
            ActorDb {
                pool,
                block_cache: Arc::new(RwLock::new(HashMap::new())),
            },
        );
        Ok(())
    }

    /// Open (or fetch the cached) database handle for an actor
    pub(crate) async fn open_db(&self, did: &str) -> PdsResult<ActorDb> {
        {
            let cache = self.db_cache.read().await;
            if let Some(db) = cache.get(did) {
                return Ok(db.clone());
            }
        }
        let location = self.get_location(did);
        if !location.db_location.exists() {
            return Err(PdsError::RepoNotFound(did.to_string()));
        }
        let pool = open_pool(&location.db_location, false).await?;
        let db = ActorDb {
            pool,
            block_cache: Arc::new(RwLock::new(HashMap::new())),
        };
        let mut cache = self.db_cache.write().await;
        evict_if_full(&mut cache, self.config.cache_size);
        cache.insert(did.to_string(), db.clone());
        Ok(db)
    }

    /// The actor's signing keypair from its key file
    pub fn keypair(&self, did: &str) -> PdsResult<Keypair> {
        let location = self.get_location(did);
        if !location.key_location.exists() {
            return Err(PdsError::RepoNotFound(did.to_string()));
        }
        Keypair::load_from_file(&location.key_location)
    }

    /// Block store handle for an actor
    pub async fn blocks(&self, did: &str) -> PdsResult<BlockStore> {
        let db = self.open_db(did).await?;
        Ok(BlockStore::new(
            did.to_string(),
            db,
            self.config.verify_blocks_on_read,
        ))
    }

    /// Record index handle for an actor
    pub async fn records(&self, did: &str) -> PdsResult<RecordStore> {
        let db = self.open_db(did).await?;
        Ok(RecordStore::new(did.to_string(), db))
    }

    /// Blob index handle for an actor
    pub async fn blobs(&self, did: &str) -> PdsResult<blobs::BlobIndex> {
        let db = self.open_db(did).await?;
        Ok(blobs::BlobIndex::new(did.to_string(), db))
    }

    /// Preference store handle for an actor
    pub async fn preferences(&self, did: &str) -> PdsResult<preferences::PreferenceStore> {
        let db = self.open_db(did).await?;
        Ok(preferences::PreferenceStore::new(db))
    }

    /// Destroy an actor's storage entirely
    pub async fn destroy(&self, did: &str) -> PdsResult<()> {
        {
            let mut cache = self.db_cache.write().await;
            if let Some(db) = cache.remove(did) {
                db.pool.close().await;
            }
        }
        let location = self.get_location(did);
        if location.directory.exists() {
            tokio::fs::remove_dir_all(&location.directory).await?;
        }
        Ok(())
    }
}

fn evict_if_full(cache: &mut HashMap<String, ActorDb>, limit: usize) {
    if cache.len() >= limit {
        if let Some(key) = cache.keys().next().cloned() {
            cache.remove(&key);
        }
    }
}

async fn open_pool(path: &std::path::Path, create: bool) -> PdsResult<SqlitePool> {
    let options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true)
        .create_if_missing(create)
        .busy_timeout(std::time::Duration::from_secs(5));
    SqlitePool::connect_with(options)
        .await
        .map_err(PdsError::Database)
}

/// Per-actor schema, created inline on first open
async fn create_schema(pool: &SqlitePool) -> PdsResult<()> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS repo_root (
            did TEXT PRIMARY KEY NOT NULL,
            cid TEXT NOT NULL,
            rev TEXT NOT NULL,
            indexed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS repo_block (
            cid TEXT PRIMARY KEY NOT NULL,
            repo_rev TEXT NOT NULL,
            size INTEGER NOT NULL,
            content BLOB NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_repo_block_rev ON repo_block(repo_rev);

        CREATE TABLE IF NOT EXISTS record (
            uri TEXT PRIMARY KEY NOT NULL,
            cid TEXT NOT NULL,
            collection TEXT NOT NULL,
            rkey TEXT NOT NULL,
            repo_rev TEXT,
            indexed_at TEXT NOT NULL,
            takedown_ref TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_record_collection ON record(collection, rkey);
        CREATE INDEX IF NOT EXISTS idx_record_cid ON record(cid);

        CREATE TABLE IF NOT EXISTS backlink (
            uri TEXT NOT NULL,
            path TEXT NOT NULL,
            link_to TEXT NOT NULL,
            PRIMARY KEY (uri, path)
        );
        CREATE INDEX IF NOT EXISTS idx_backlink_target ON backlink(path, link_to);

        CREATE TABLE IF NOT EXISTS blob (
            cid TEXT PRIMARY KEY NOT NULL,
            mime_type TEXT NOT NULL,
            size INTEGER NOT NULL,
            temp_key TEXT,
            created_at TEXT NOT NULL,
            takedown_ref TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_blob_temp_key ON blob(temp_key);

        CREATE TABLE IF NOT EXISTS record_blob (
            blob_cid TEXT NOT NULL,
            record_uri TEXT NOT NULL,
            PRIMARY KEY (blob_cid, record_uri)
        );

        CREATE TABLE IF NOT EXISTS account_pref (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            value_json TEXT NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_store() -> (tempfile::TempDir, ActorStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = ActorStore::new(ActorStoreConfig {
        base_directory: dir.path().to_path_buf(),
        cache_size: 10,
        verify_blocks_on_read: true,
    });
    (dir, store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_reopen() {
        let (_dir, store) = test_store().await;
        let keypair = Keypair::generate();
        store.create("did:plc:layout", &keypair).await.unwrap();
        assert!(store.exists("did:plc:layout").await);

        let loaded = store.keypair("did:plc:layout").unwrap();
        assert_eq!(loaded.secret_bytes(), keypair.secret_bytes());

        // Reopen goes through the cache path
        store.blocks("did:plc:layout").await.unwrap();
        store.records("did:plc:layout").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_actor_is_repo_not_found() {
        let (_dir, store) = test_store().await;
        let err = store.blocks("did:plc:nobody").await.unwrap_err();
        assert!(matches!(err, PdsError::RepoNotFound(_)));
    }

    #[tokio::test]
    async fn test_destroy_removes_directory() {
        let (_dir, store) = test_store().await;
        let keypair = Keypair::generate();
        store.create("did:plc:doomed", &keypair).await.unwrap();
        let location = store.get_location("did:plc:doomed");
        assert!(location.directory.exists());
        store.destroy("did:plc:doomed").await.unwrap();
        assert!(!location.directory.exists());
        assert!(!store.exists("did:plc:doomed").await);
    }
}
