/// Blob index - per-actor blob metadata and record links
///
/// The `blob` table tracks metadata and temp staging; `record_blob` pins
/// blobs to the records that reference them. A blob with no remaining
/// link is dereferenced and deleted (quarantined blobs are left for the
/// moderation flow).
use chrono::Utc;
use libipld::Cid;
use sqlx::Row;

use crate::actor_store::models::BlobRow;
use crate::actor_store::prepare::PreparedWrite;
use crate::actor_store::ActorDb;
use crate::blob_store::BlobStore;
use crate::error::{PdsError, PdsResult};
use crate::repo::WriteAction;

#[derive(Clone)]
pub struct BlobIndex {
    did: String,
    db: ActorDb,
}

impl BlobIndex {
    pub(crate) fn new(did: String, db: ActorDb) -> Self {
        Self { did, db }
    }

    /// Record a staged upload before any record references it
    pub async fn track_untethered(
        &self,
        cid: &Cid,
        mime_type: &str,
        size: i64,
        temp_key: &str,
    ) -> PdsResult<BlobRow> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO blob (cid, mime_type, size, temp_key, created_at, takedown_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)
             ON CONFLICT(cid) DO UPDATE SET
                temp_key = CASE WHEN blob.temp_key IS NOT NULL THEN excluded.temp_key
                                ELSE blob.temp_key END",
        )
        .bind(cid.to_string())
        .bind(mime_type)
        .bind(size)
        .bind(temp_key)
        .bind(&now)
        .execute(&self.db.pool)
        .await?;
        self.get_blob(cid)
            .await?
            .ok_or_else(|| PdsError::internal("blob row missing after insert"))
    }

    pub async fn get_blob(&self, cid: &Cid) -> PdsResult<Option<BlobRow>> {
        let row = sqlx::query(
            "SELECT cid, mime_type, size, temp_key, created_at, takedown_ref
             FROM blob WHERE cid = ?1",
        )
        .bind(cid.to_string())
        .fetch_optional(&self.db.pool)
        .await?;
        Ok(row.map(|row| BlobRow {
            cid: row.get("cid"),
            mime_type: row.get("mime_type"),
            size: row.get("size"),
            temp_key: row.get("temp_key"),
            created_at: row.get("created_at"),
            takedown_ref: row.get("takedown_ref"),
        }))
    }

    /// CIDs of blobs pinned by a record
    pub async fn blobs_for_record(&self, uri: &str) -> PdsResult<Vec<String>> {
        let cids: Vec<String> =
            sqlx::query_scalar("SELECT blob_cid FROM record_blob WHERE record_uri = ?1")
                .bind(uri)
                .fetch_all(&self.db.pool)
                .await?;
        Ok(cids)
    }

    /// Reconcile blobs for one commit's writes
    ///
    /// Updates and deletes drop the links of the previous record version;
    /// creates and updates verify, link, and promote every referenced
    /// blob. Dereferenced blobs are removed at the end.
    pub async fn process_write_blobs(
        &self,
        writes: &[PreparedWrite],
        store: &dyn BlobStore,
    ) -> PdsResult<()> {
        let touched: Vec<&str> = writes
            .iter()
            .filter(|w| w.action != WriteAction::Create)
            .map(|w| w.uri.as_str())
            .collect();
        self.unlink_records(&touched).await?;

        for write in writes {
            if write.action == WriteAction::Delete {
                continue;
            }
            for blob_ref in &write.blobs {
                self.verify_blob_and_make_permanent(&blob_ref.cid, store)
                    .await?;
                self.link_record_blob(&write.uri, &blob_ref.cid).await?;
            }
        }

        self.delete_dereferenced_blobs(store).await
    }

    /// Promote a staged blob; a no-op if it is already permanent
    async fn verify_blob_and_make_permanent(
        &self,
        cid: &Cid,
        store: &dyn BlobStore,
    ) -> PdsResult<()> {
        let row = self
            .get_blob(cid)
            .await?
            .ok_or_else(|| PdsError::BlobNotFound(cid.to_string()))?;
        if row.takedown_ref.is_some() {
            return Err(PdsError::invalid_request(format!(
                "Blob {} is not available",
                cid
            )));
        }
        if let Some(temp_key) = &row.temp_key {
            store.make_permanent(&self.did, temp_key, cid).await?;
            sqlx::query("UPDATE blob SET temp_key = NULL WHERE cid = ?1")
                .bind(cid.to_string())
                .execute(&self.db.pool)
                .await?;
        } else if !store.has_stored(&self.did, cid).await? {
            return Err(PdsError::BlobNotFound(cid.to_string()));
        }
        Ok(())
    }

    async fn link_record_blob(&self, uri: &str, cid: &Cid) -> PdsResult<()> {
        sqlx::query(
            "INSERT INTO record_blob (blob_cid, record_uri) VALUES (?1, ?2)
             ON CONFLICT(blob_cid, record_uri) DO NOTHING",
        )
        .bind(cid.to_string())
        .bind(uri)
        .execute(&self.db.pool)
        .await?;
        Ok(())
    }

    async fn unlink_records(&self, uris: &[&str]) -> PdsResult<()> {
        for uri in uris {
            sqlx::query("DELETE FROM record_blob WHERE record_uri = ?1")
                .bind(uri)
                .execute(&self.db.pool)
                .await?;
        }
        Ok(())
    }

    /// Delete blobs that no record pins any more
    ///
    /// Quarantined (takedown) blobs are kept for moderation; the
    /// maintenance sweep re-runs this same query, so a crash between the
    /// row delete and the object delete self-heals.
    pub async fn delete_dereferenced_blobs(&self, store: &dyn BlobStore) -> PdsResult<()> {
        let orphans: Vec<String> = sqlx::query_scalar(
            "SELECT cid FROM blob
             WHERE temp_key IS NULL
               AND takedown_ref IS NULL
               AND cid NOT IN (SELECT blob_cid FROM record_blob)",
        )
        .fetch_all(&self.db.pool)
        .await?;
        for cid_str in orphans {
            sqlx::query("DELETE FROM blob WHERE cid = ?1")
                .bind(&cid_str)
                .execute(&self.db.pool)
                .await?;
            let cid = crate::repo::dag::parse_cid(&cid_str)?;
            if let Err(e) = store.delete(&self.did, &cid).await {
                tracing::warn!(cid = %cid_str, error = %e, "failed to delete dereferenced blob");
            }
        }
        Ok(())
    }

    /// Take down a blob: quarantine the object and mark the row
    pub async fn takedown_blob(
        &self,
        cid: &Cid,
        takedown_ref: &str,
        store: &dyn BlobStore,
    ) -> PdsResult<()> {
        store.quarantine(&self.did, cid).await?;
        sqlx::query("UPDATE blob SET takedown_ref = ?1 WHERE cid = ?2")
            .bind(takedown_ref)
            .bind(cid.to_string())
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    /// Reverse a blob takedown
    pub async fn restore_blob(&self, cid: &Cid, store: &dyn BlobStore) -> PdsResult<()> {
        store.unquarantine(&self.did, cid).await?;
        sqlx::query("UPDATE blob SET takedown_ref = NULL WHERE cid = ?1")
            .bind(cid.to_string())
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    /// All blob CIDs referenced by at least one record, paged by CID
    pub async fn list_blobs(&self, limit: i64, cursor: Option<&str>) -> PdsResult<Vec<String>> {
        let cids: Vec<String> = match cursor {
            Some(cursor) => {
                sqlx::query_scalar(
                    "SELECT DISTINCT blob_cid FROM record_blob
                     WHERE blob_cid > ?1 ORDER BY blob_cid ASC LIMIT ?2",
                )
                .bind(cursor)
                .bind(limit)
                .fetch_all(&self.db.pool)
                .await?
            }
            None => {
                sqlx::query_scalar(
                    "SELECT DISTINCT blob_cid FROM record_blob
                     ORDER BY blob_cid ASC LIMIT ?1",
                )
                .bind(limit)
                .fetch_all(&self.db.pool)
                .await?
            }
        };
        Ok(cids)
    }
}
