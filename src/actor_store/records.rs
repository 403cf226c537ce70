/// Record index and backlinks
///
/// Mirrors the MST leaves into relational rows for efficient lookup and
/// derives backlinks for the record types whose `subject` field points at
/// another actor or record. The index is rewritten alongside every commit
/// so it always reflects the tree at the current rev.
use libipld::{Cid, Ipld};
use sqlx::Row;

use crate::actor_store::models::{Backlink, ListRecordsParams, RecordPage, RecordRow};
use crate::actor_store::ActorDb;
use crate::error::{PdsError, PdsResult};
use crate::repo::WriteAction;
use crate::validation;

#[derive(Clone)]
pub struct RecordStore {
    did: String,
    db: ActorDb,
}

impl RecordStore {
    pub(crate) fn new(did: String, db: ActorDb) -> Self {
        Self { did, db }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    /// Look up a record row by URI, optionally pinning an expected CID
    pub async fn get_record(
        &self,
        uri: &str,
        cid: Option<&Cid>,
        include_soft_deleted: bool,
    ) -> PdsResult<Option<RecordRow>> {
        let row = sqlx::query(
            "SELECT uri, cid, collection, rkey, repo_rev, indexed_at, takedown_ref
             FROM record WHERE uri = ?1",
        )
        .bind(uri)
        .fetch_optional(&self.db.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let record = row_to_record(&row);
        if !include_soft_deleted && record.takedown_ref.is_some() {
            return Ok(None);
        }
        if let Some(expected) = cid {
            if record.cid != expected.to_string() {
                return Ok(None);
            }
        }
        Ok(Some(record))
    }

    /// Page through a collection ordered by rkey
    pub async fn list_for_collection(&self, params: &ListRecordsParams) -> PdsResult<RecordPage> {
        let limit = params.limit.clamp(1, 100);
        let order = if params.reverse { "DESC" } else { "ASC" };
        let comparison = if params.reverse { "<" } else { ">" };
        let query = match &params.cursor {
            Some(_) => format!(
                "SELECT uri, cid, collection, rkey, repo_rev, indexed_at, takedown_ref
                 FROM record
                 WHERE collection = ?1 AND takedown_ref IS NULL AND rkey {} ?2
                 ORDER BY rkey {} LIMIT ?3",
                comparison, order
            ),
            None => format!(
                "SELECT uri, cid, collection, rkey, repo_rev, indexed_at, takedown_ref
                 FROM record
                 WHERE collection = ?1 AND takedown_ref IS NULL
                 ORDER BY rkey {} LIMIT ?2",
                order
            ),
        };
        let mut q = sqlx::query(&query).bind(&params.collection);
        if let Some(cursor) = &params.cursor {
            q = q.bind(cursor);
        }
        let rows = q.bind(limit).fetch_all(&self.db.pool).await?;
        let records: Vec<RecordRow> = rows.iter().map(row_to_record).collect();
        let cursor = if records.len() as i64 == limit {
            records.last().map(|r| r.rkey.clone())
        } else {
            None
        };
        Ok(RecordPage { records, cursor })
    }

    /// Distinct collections present in the repo
    pub async fn list_collections(&self) -> PdsResult<Vec<String>> {
        let collections: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT collection FROM record ORDER BY collection")
                .fetch_all(&self.db.pool)
                .await?;
        Ok(collections)
    }

    pub async fn record_count(&self) -> PdsResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM record")
            .fetch_one(&self.db.pool)
            .await?;
        Ok(count)
    }

    /// Upsert the row for a created or updated record and rebuild its
    /// backlinks. Indexing the same (uri, cid) twice is a no-op.
    pub async fn index_record(
        &self,
        uri: &str,
        cid: &Cid,
        record: &Ipld,
        action: WriteAction,
        rev: &str,
        timestamp: &str,
    ) -> PdsResult<()> {
        let (_, collection, rkey) = validation::parse_at_uri(uri)?;
        sqlx::query(
            "INSERT INTO record (uri, cid, collection, rkey, repo_rev, indexed_at, takedown_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
             ON CONFLICT(uri) DO UPDATE SET
                cid = excluded.cid,
                repo_rev = excluded.repo_rev,
                indexed_at = excluded.indexed_at",
        )
        .bind(uri)
        .bind(cid.to_string())
        .bind(&collection)
        .bind(&rkey)
        .bind(rev)
        .bind(timestamp)
        .execute(&self.db.pool)
        .await?;

        if action == WriteAction::Update {
            self.remove_backlinks_by_uri(uri).await?;
        }
        self.add_backlinks(&backlinks_for_record(uri, record)).await?;
        Ok(())
    }

    /// Drop a deleted record's row and backlinks
    pub async fn delete_record(&self, uri: &str) -> PdsResult<()> {
        sqlx::query("DELETE FROM record WHERE uri = ?1")
            .bind(uri)
            .execute(&self.db.pool)
            .await?;
        self.remove_backlinks_by_uri(uri).await?;
        Ok(())
    }

    pub async fn remove_backlinks_by_uri(&self, uri: &str) -> PdsResult<()> {
        sqlx::query("DELETE FROM backlink WHERE uri = ?1")
            .bind(uri)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }

    pub async fn add_backlinks(&self, backlinks: &[Backlink]) -> PdsResult<()> {
        for link in backlinks {
            sqlx::query(
                "INSERT INTO backlink (uri, path, link_to) VALUES (?1, ?2, ?3)
                 ON CONFLICT(uri, path) DO UPDATE SET link_to = excluded.link_to",
            )
            .bind(&link.uri)
            .bind(&link.path)
            .bind(&link.link_to)
            .execute(&self.db.pool)
            .await?;
        }
        Ok(())
    }

    /// Records already pointing at the same targets this record would
    /// backlink; used to reject duplicate follows/likes/reposts.
    pub async fn get_backlink_conflicts(&self, uri: &str, record: &Ipld) -> PdsResult<Vec<String>> {
        let (_, collection, _) = validation::parse_at_uri(uri)?;
        let mut conflicts = Vec::new();
        for link in backlinks_for_record(uri, record) {
            let rows = sqlx::query(
                "SELECT record.uri FROM record
                 INNER JOIN backlink ON backlink.uri = record.uri
                 WHERE backlink.path = ?1 AND backlink.link_to = ?2
                   AND record.collection = ?3 AND record.uri != ?4",
            )
            .bind(&link.path)
            .bind(&link.link_to)
            .bind(&collection)
            .bind(uri)
            .fetch_all(&self.db.pool)
            .await?;
            conflicts.extend(rows.iter().map(|r| r.get::<String, _>("uri")));
        }
        Ok(conflicts)
    }

    /// Any record holding this CID outside the given URIs; used by the
    /// transactor to keep shared blocks out of a commit's removed set.
    pub async fn get_record_by_cid_excluding(
        &self,
        cid: &Cid,
        excluded_uris: &[&str],
    ) -> PdsResult<Option<String>> {
        let rows = sqlx::query("SELECT uri FROM record WHERE cid = ?1")
            .bind(cid.to_string())
            .fetch_all(&self.db.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| r.get::<String, _>("uri"))
            .find(|uri| !excluded_uris.contains(&uri.as_str())))
    }

    /// Soft-delete or restore a record
    pub async fn update_record_takedown(
        &self,
        uri: &str,
        takedown_ref: Option<&str>,
    ) -> PdsResult<()> {
        sqlx::query("UPDATE record SET takedown_ref = ?1 WHERE uri = ?2")
            .bind(takedown_ref)
            .bind(uri)
            .execute(&self.db.pool)
            .await?;
        Ok(())
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> RecordRow {
    RecordRow {
        uri: row.get("uri"),
        cid: row.get("cid"),
        collection: row.get("collection"),
        rkey: row.get("rkey"),
        repo_rev: row.get("repo_rev"),
        indexed_at: row.get("indexed_at"),
        takedown_ref: row.get("takedown_ref"),
    }
}

/// Derive backlinks from a record body, keyed on its `$type`
///
/// Graph records (`follow`, `block`) point at a DID in `subject`;
/// reaction records (`like`, `repost`) point at an AT-URI in
/// `subject.uri`. Anything else, or a malformed subject, produces none.
pub fn backlinks_for_record(uri: &str, record: &Ipld) -> Vec<Backlink> {
    let Ipld::Map(map) = record else {
        return Vec::new();
    };
    let Some(Ipld::String(record_type)) = map.get("$type") else {
        return Vec::new();
    };
    let last_segment = record_type.rsplit('.').next().unwrap_or("");
    match last_segment {
        "follow" | "block" => {
            if let Some(Ipld::String(subject)) = map.get("subject") {
                if validation::is_valid_did(subject) {
                    return vec![Backlink {
                        uri: uri.to_string(),
                        path: "subject".to_string(),
                        link_to: subject.clone(),
                    }];
                }
            }
            Vec::new()
        }
        "like" | "repost" => {
            if let Some(Ipld::Map(subject)) = map.get("subject") {
                if let Some(Ipld::String(target)) = subject.get("uri") {
                    if validation::is_valid_at_uri(target) {
                        return vec![Backlink {
                            uri: uri.to_string(),
                            path: "subject.uri".to_string(),
                            link_to: target.clone(),
                        }];
                    }
                }
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}
