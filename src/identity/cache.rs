/// Persistent identity cache
///
/// Two tables: `did_doc` and `did_handle`. Every read reports whether the
/// entry is stale (should be refreshed soon) or expired (must not be
/// used); expired rows are cleared on read.
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{PdsError, PdsResult};
use crate::identity::DidDocument;

/// A cache read with freshness flags
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
    pub value: T,
    pub updated_at: DateTime<Utc>,
    /// Usable, but a refresh is due
    pub stale: bool,
}

#[derive(Clone)]
pub struct DidCache {
    db: SqlitePool,
    stale_ttl: Duration,
    max_ttl: Duration,
}

impl DidCache {
    pub async fn new(db: SqlitePool, stale_ttl: Duration, max_ttl: Duration) -> PdsResult<Self> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS did_doc (
                did TEXT PRIMARY KEY NOT NULL,
                doc TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS did_handle (
                handle TEXT PRIMARY KEY NOT NULL,
                did TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_did_handle_did ON did_handle(did);
            "#,
        )
        .execute(&db)
        .await?;
        Ok(Self {
            db,
            stale_ttl,
            max_ttl,
        })
    }

    fn freshness(&self, updated_at: DateTime<Utc>) -> (bool, bool) {
        let age = Utc::now() - updated_at;
        (age > self.stale_ttl, age > self.max_ttl)
    }

    /// Cached DID document; expired entries are cleared and not returned
    pub async fn get_doc(&self, did: &str) -> PdsResult<Option<CacheResult<DidDocument>>> {
        let row = sqlx::query("SELECT doc, updated_at FROM did_doc WHERE did = ?1")
            .bind(did)
            .fetch_optional(&self.db)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let updated_at = parse_time(&row.get::<String, _>("updated_at"))?;
        let (stale, expired) = self.freshness(updated_at);
        if expired {
            self.delete_doc(did).await?;
            return Ok(None);
        }
        let doc: DidDocument = serde_json::from_str(&row.get::<String, _>("doc"))
            .map_err(|e| PdsError::internal(format!("corrupt cached DID document: {}", e)))?;
        Ok(Some(CacheResult {
            value: doc,
            updated_at,
            stale,
        }))
    }

    pub async fn put_doc(&self, did: &str, doc: &DidDocument) -> PdsResult<()> {
        let json = serde_json::to_string(doc)
            .map_err(|e| PdsError::internal(format!("failed to encode DID document: {}", e)))?;
        sqlx::query(
            "INSERT INTO did_doc (did, doc, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(did) DO UPDATE SET
                doc = excluded.doc, updated_at = excluded.updated_at",
        )
        .bind(did)
        .bind(json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn delete_doc(&self, did: &str) -> PdsResult<()> {
        sqlx::query("DELETE FROM did_doc WHERE did = ?1")
            .bind(did)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Cached handle mapping with the same freshness semantics
    pub async fn get_handle(&self, handle: &str) -> PdsResult<Option<CacheResult<String>>> {
        let row = sqlx::query("SELECT did, updated_at FROM did_handle WHERE handle = ?1")
            .bind(handle)
            .fetch_optional(&self.db)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let updated_at = parse_time(&row.get::<String, _>("updated_at"))?;
        let (stale, expired) = self.freshness(updated_at);
        if expired {
            self.delete_handle(handle).await?;
            return Ok(None);
        }
        Ok(Some(CacheResult {
            value: row.get("did"),
            updated_at,
            stale,
        }))
    }

    pub async fn put_handle(&self, handle: &str, did: &str) -> PdsResult<()> {
        sqlx::query(
            "INSERT INTO did_handle (handle, did, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(handle) DO UPDATE SET
                did = excluded.did, updated_at = excluded.updated_at",
        )
        .bind(handle)
        .bind(did)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn delete_handle(&self, handle: &str) -> PdsResult<()> {
        sqlx::query("DELETE FROM did_handle WHERE handle = ?1")
            .bind(handle)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Remove handle rows pointing at a DID (used by purge)
    pub async fn delete_handles_for_did(&self, did: &str) -> PdsResult<()> {
        sqlx::query("DELETE FROM did_handle WHERE did = ?1")
            .bind(did)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Drop rows past the max TTL
    pub async fn cleanup_expired(&self) -> PdsResult<u64> {
        let cutoff = (Utc::now() - self.max_ttl).to_rfc3339();
        let docs = sqlx::query("DELETE FROM did_doc WHERE updated_at < ?1")
            .bind(&cutoff)
            .execute(&self.db)
            .await?;
        let handles = sqlx::query("DELETE FROM did_handle WHERE updated_at < ?1")
            .bind(&cutoff)
            .execute(&self.db)
            .await?;
        Ok(docs.rows_affected() + handles.rows_affected())
    }
}

fn parse_time(s: &str) -> PdsResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PdsError::internal(format!("invalid cache timestamp: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn cache(stale_secs: i64, max_secs: i64) -> DidCache {
        let db = crate::db::memory_pool().await.unwrap();
        DidCache::new(
            db,
            Duration::seconds(stale_secs),
            Duration::seconds(max_secs),
        )
        .await
        .unwrap()
    }

    fn doc(did: &str) -> DidDocument {
        DidDocument {
            id: did.to_string(),
            also_known_as: vec!["at://alice.test".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fresh_read() {
        let cache = cache(3600, 86400).await;
        cache.put_doc("did:plc:a", &doc("did:plc:a")).await.unwrap();
        let hit = cache.get_doc("did:plc:a").await.unwrap().unwrap();
        assert!(!hit.stale);
        assert_eq!(hit.value.id, "did:plc:a");
    }

    #[tokio::test]
    async fn test_stale_read_is_still_served() {
        // stale immediately, expired far in the future
        let cache = cache(0, 86400).await;
        cache.put_handle("alice.test", "did:plc:a").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let hit = cache.get_handle("alice.test").await.unwrap().unwrap();
        assert!(hit.stale);
        assert_eq!(hit.value, "did:plc:a");
    }

    #[tokio::test]
    async fn test_expired_entry_is_cleared() {
        let cache = cache(0, 0).await;
        cache.put_handle("old.test", "did:plc:old").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(cache.get_handle("old.test").await.unwrap().is_none());
        // Row physically gone now
        let again = cache.get_handle("old.test").await.unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_purge_by_did() {
        let cache = cache(3600, 86400).await;
        cache.put_handle("one.test", "did:plc:x").await.unwrap();
        cache.put_handle("two.test", "did:plc:x").await.unwrap();
        cache.delete_handles_for_did("did:plc:x").await.unwrap();
        assert!(cache.get_handle("one.test").await.unwrap().is_none());
        assert!(cache.get_handle("two.test").await.unwrap().is_none());
    }
}
