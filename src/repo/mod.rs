/// Content-addressed repository core
///
/// A repository is an ordered `<collection>/<rkey>` -> record-CID mapping
/// stored as a Merkle Search Tree of DAG-CBOR blocks, capped by a signed
/// commit. This module is pure data manipulation; persistence lives in the
/// actor store.

pub mod block_map;
pub mod commit;
pub mod dag;
pub mod mst;
pub mod repository;
pub mod tid;

pub use block_map::BlockMap;
pub use commit::{sign_commit, verify_commit_sig, SignedCommit, UnsignedCommit};
pub use repository::{CommitData, Repo};
pub use tid::TidClock;

use libipld::{Cid, Ipld};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{PdsError, PdsResult};

/// Repository format version
pub const REPO_VERSION: i64 = 3;

/// Set of CIDs, used for tracking removed and new leaf blocks
pub type CidSet = HashSet<Cid>;

/// Write operation action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteAction {
    Create,
    Update,
    Delete,
}

impl WriteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteAction::Create => "create",
            WriteAction::Update => "update",
            WriteAction::Delete => "delete",
        }
    }
}

/// A single record write applied to the tree
#[derive(Debug, Clone)]
pub struct RecordWrite {
    pub action: WriteAction,
    pub collection: String,
    pub rkey: String,
    /// Record body; `None` for deletes
    pub record: Option<Ipld>,
}

impl RecordWrite {
    /// Tree key for this write
    pub fn data_key(&self) -> String {
        format!("{}/{}", self.collection, self.rkey)
    }
}

/// Read access to a block store, used when loading trees and commits
#[async_trait::async_trait]
pub trait ReadableBlockstore: Send + Sync {
    async fn get_bytes(&self, cid: &Cid) -> PdsResult<Option<Vec<u8>>>;
}

/// Fetch a block that must exist; a miss means the store is corrupt
pub async fn must_get(store: &dyn ReadableBlockstore, cid: &Cid) -> PdsResult<Vec<u8>> {
    store
        .get_bytes(cid)
        .await?
        .ok_or_else(|| PdsError::internal(format!("missing block {}", cid)))
}
