/// Typed event variants carried by the sequencer
use serde::{Deserialize, Serialize};

/// Commit event - repository data changed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitEvent {
    pub rebase: bool,
    pub too_big: bool,
    /// DID of the repository
    pub repo: String,
    /// CID of the new signed commit
    pub commit: String,
    /// New revision TID
    pub rev: String,
    /// Revision the commit was built on
    pub since: Option<String>,
    /// CAR-encoded blocks introduced by the commit
    #[serde(with = "serde_bytes")]
    pub blocks: Vec<u8>,
    pub ops: Vec<CommitOp>,
    /// CIDs of blobs referenced by the written records
    pub blobs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
}

/// One operation within a commit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOp {
    pub action: String,
    /// `collection/rkey`
    pub path: String,
    /// Record CID; absent for deletes
    pub cid: Option<String>,
}

/// Identity event - handle or DID document changed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityEvent {
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// Account event - account status changed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEvent {
    pub did: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AccountStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Takendown,
    Suspended,
    Deleted,
    Deactivated,
}

/// Handle event - explicit handle change notification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleEvent {
    pub did: String,
    pub handle: String,
}

/// Migrate event - repository moved to another host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateEvent {
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrate_to: Option<String>,
}

/// Tombstone event - repository permanently deleted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TombstoneEvent {
    pub did: String,
}

/// Info event - control messages on the stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoEvent {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Unified event wrapper delivered to subscribers
///
/// Exactly one variant is populated; `seq` and `time` are stamped by the
/// publisher.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "$type")]
pub enum SeqEvent {
    #[serde(rename = "#commit")]
    Commit {
        seq: i64,
        time: String,
        #[serde(flatten)]
        evt: CommitEvent,
    },
    #[serde(rename = "#identity")]
    Identity {
        seq: i64,
        time: String,
        #[serde(flatten)]
        evt: IdentityEvent,
    },
    #[serde(rename = "#account")]
    Account {
        seq: i64,
        time: String,
        #[serde(flatten)]
        evt: AccountEvent,
    },
    #[serde(rename = "#handle")]
    Handle {
        seq: i64,
        time: String,
        #[serde(flatten)]
        evt: HandleEvent,
    },
    #[serde(rename = "#migrate")]
    Migrate {
        seq: i64,
        time: String,
        #[serde(flatten)]
        evt: MigrateEvent,
    },
    #[serde(rename = "#tombstone")]
    Tombstone {
        seq: i64,
        time: String,
        #[serde(flatten)]
        evt: TombstoneEvent,
    },
    #[serde(rename = "#info")]
    Info {
        seq: i64,
        time: String,
        #[serde(flatten)]
        evt: InfoEvent,
    },
}

impl SeqEvent {
    pub fn seq(&self) -> i64 {
        match self {
            SeqEvent::Commit { seq, .. }
            | SeqEvent::Identity { seq, .. }
            | SeqEvent::Account { seq, .. }
            | SeqEvent::Handle { seq, .. }
            | SeqEvent::Migrate { seq, .. }
            | SeqEvent::Tombstone { seq, .. }
            | SeqEvent::Info { seq, .. } => *seq,
        }
    }

    pub fn did(&self) -> &str {
        match self {
            SeqEvent::Commit { evt, .. } => &evt.repo,
            SeqEvent::Identity { evt, .. } => &evt.did,
            SeqEvent::Account { evt, .. } => &evt.did,
            SeqEvent::Handle { evt, .. } => &evt.did,
            SeqEvent::Migrate { evt, .. } => &evt.did,
            SeqEvent::Tombstone { evt, .. } => &evt.did,
            SeqEvent::Info { .. } => "",
        }
    }
}

impl CommitEvent {
    pub fn new(
        repo: String,
        commit: String,
        rev: String,
        since: Option<String>,
        prev: Option<String>,
        blocks: Vec<u8>,
        ops: Vec<CommitOp>,
        blobs: Vec<String>,
    ) -> Self {
        Self {
            rebase: false,
            too_big: false,
            repo,
            commit,
            rev,
            since,
            blocks,
            ops,
            blobs,
            prev,
        }
    }
}
