/// Row types for the per-actor database
use chrono::{DateTime, Utc};

/// Current repository root pointer; exactly one row per actor
#[derive(Debug, Clone)]
pub struct RepoRoot {
    pub did: String,
    pub cid: String,
    pub rev: String,
    pub indexed_at: DateTime<Utc>,
}

/// Indexed record row mirroring one MST leaf
#[derive(Debug, Clone)]
pub struct RecordRow {
    pub uri: String,
    pub cid: String,
    pub collection: String,
    pub rkey: String,
    pub repo_rev: Option<String>,
    pub indexed_at: String,
    pub takedown_ref: Option<String>,
}

/// Materialized outbound reference from a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backlink {
    pub uri: String,
    pub path: String,
    pub link_to: String,
}

/// Blob metadata row
#[derive(Debug, Clone)]
pub struct BlobRow {
    pub cid: String,
    pub mime_type: String,
    pub size: i64,
    /// Set while the blob is still staged in temp storage
    pub temp_key: Option<String>,
    pub created_at: String,
    pub takedown_ref: Option<String>,
}

/// Page of records plus the cursor for the next page
#[derive(Debug, Clone)]
pub struct RecordPage {
    pub records: Vec<RecordRow>,
    pub cursor: Option<String>,
}

/// Query parameters for listing a collection
#[derive(Debug, Clone)]
pub struct ListRecordsParams {
    pub collection: String,
    pub limit: i64,
    pub cursor: Option<String>,
    pub reverse: bool,
}

impl Default for ListRecordsParams {
    fn default() -> Self {
        Self {
            collection: String::new(),
            limit: 50,
            cursor: None,
            reverse: false,
        }
    }
}
