/// Repository commit formatting
///
/// A `Repo` is the in-memory view of one actor's tree at a given root:
/// the flat leaf map plus the set of reachable CIDs. Formatting a commit
/// applies writes to the leaf set, rebuilds the tree, signs the new
/// commit, and reports exactly which blocks are new and which became
/// unreachable. Persisting the result is the block store's job.
use libipld::Cid;

use crate::crypto::Signer;
use crate::error::{PdsError, PdsResult};
use crate::repo::{
    must_get, mst, sign_commit, BlockMap, CidSet, ReadableBlockstore, RecordWrite, SignedCommit,
    TidClock, UnsignedCommit, WriteAction, REPO_VERSION,
};

/// Everything needed to persist and broadcast one commit
#[derive(Debug, Clone)]
pub struct CommitData {
    /// CID of the new signed commit
    pub cid: Cid,
    /// New revision TID
    pub rev: String,
    /// Revision this commit was built on, if any
    pub since: Option<String>,
    /// Previous commit CID, absent for the first commit
    pub prev: Option<Cid>,
    /// Blocks introduced by this commit (nodes, records, the commit itself)
    pub new_blocks: BlockMap,
    /// CIDs no longer reachable from the new root
    pub removed_cids: CidSet,
}

/// In-memory view of a repository at one root
pub struct Repo {
    pub did: String,
    pub root: Option<Cid>,
    pub commit: Option<SignedCommit>,
    tree: mst::LoadedTree,
}

impl Repo {
    /// A repository that has never committed
    pub fn empty(did: impl Into<String>) -> Self {
        Self {
            did: did.into(),
            root: None,
            commit: None,
            tree: mst::LoadedTree::default(),
        }
    }

    /// Load the repository at `root` from the block store
    pub async fn load(
        store: &dyn ReadableBlockstore,
        did: impl Into<String>,
        root: Cid,
    ) -> PdsResult<Self> {
        let bytes = must_get(store, &root).await?;
        let commit = SignedCommit::from_bytes(&bytes)?;
        let tree = mst::load(store, commit.data).await?;
        Ok(Self {
            did: did.into(),
            root: Some(root),
            commit: Some(commit),
            tree,
        })
    }

    /// Current revision
    pub fn rev(&self) -> Option<&str> {
        self.commit.as_ref().map(|c| c.rev.as_str())
    }

    /// CID of the record at `<collection>/<rkey>`, if present
    pub fn get(&self, key: &str) -> Option<Cid> {
        self.tree.leaves.get(key).copied()
    }

    pub fn leaves(&self) -> &std::collections::BTreeMap<String, Cid> {
        &self.tree.leaves
    }

    /// Apply writes and produce the next signed commit
    pub fn format_commit(
        &self,
        writes: &[RecordWrite],
        clock: &TidClock,
        signer: &dyn Signer,
    ) -> PdsResult<CommitData> {
        let mut leaves = self.tree.leaves.clone();
        let mut record_blocks = BlockMap::new();

        for write in writes {
            let key = write.data_key();
            mst::ensure_valid_key(&key)?;
            match write.action {
                WriteAction::Create => {
                    if leaves.contains_key(&key) {
                        return Err(PdsError::invalid_request(format!(
                            "record already exists at {}",
                            key
                        )));
                    }
                    let record = write.record.as_ref().ok_or_else(|| {
                        PdsError::invalid_request("create operation requires a record")
                    })?;
                    let cid = record_blocks.add(record)?;
                    leaves.insert(key, cid);
                }
                WriteAction::Update => {
                    if !leaves.contains_key(&key) {
                        return Err(PdsError::RecordNotFound(key));
                    }
                    let record = write.record.as_ref().ok_or_else(|| {
                        PdsError::invalid_request("update operation requires a record")
                    })?;
                    let cid = record_blocks.add(record)?;
                    leaves.insert(key, cid);
                }
                WriteAction::Delete => {
                    if leaves.remove(&key).is_none() {
                        return Err(PdsError::RecordNotFound(key));
                    }
                }
            }
        }

        let (data_root, node_blocks) = mst::build(&leaves)?;

        let mut old_reachable = self.tree.reachable();
        if let Some(root) = self.root {
            old_reachable.insert(root);
        }
        let mut new_reachable: CidSet = node_blocks.cids().copied().collect();
        new_reachable.extend(leaves.values().copied());

        let rev = match self.rev() {
            Some(prev) => clock.next_after(prev),
            None => clock.next(),
        };
        let commit = sign_commit(
            &UnsignedCommit {
                did: self.did.clone(),
                version: REPO_VERSION,
                prev: self.root,
                data: data_root,
                rev: rev.clone(),
            },
            signer,
        )?;
        let (commit_cid, commit_bytes) = commit.to_block()?;
        new_reachable.insert(commit_cid);

        let mut new_blocks = BlockMap::new();
        for (cid, bytes) in node_blocks.iter() {
            if !old_reachable.contains(cid) {
                new_blocks.set(*cid, bytes.clone());
            }
        }
        for (cid, bytes) in record_blocks.iter() {
            // A freshly written record may hash to bytes the store already
            // holds; those are not new blocks.
            if !old_reachable.contains(cid) {
                new_blocks.set(*cid, bytes.clone());
            }
        }
        new_blocks.set(commit_cid, commit_bytes);

        let removed_cids: CidSet = old_reachable
            .difference(&new_reachable)
            .copied()
            .collect();

        Ok(CommitData {
            cid: commit_cid,
            rev,
            since: self.rev().map(String::from),
            prev: self.root,
            new_blocks,
            removed_cids,
        })
    }

    /// First commit of a new repository (possibly over an empty tree)
    pub fn format_init_commit(
        did: impl Into<String>,
        writes: &[RecordWrite],
        clock: &TidClock,
        signer: &dyn Signer,
    ) -> PdsResult<CommitData> {
        let repo = Repo::empty(did);
        for write in writes {
            if write.action != WriteAction::Create {
                return Err(PdsError::invalid_request(
                    "initial commit only accepts create operations",
                ));
            }
        }
        repo.format_commit(writes, clock, signer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::repo::verify_commit_sig;
    use libipld::Ipld;
    use std::collections::BTreeMap as Map;
    use std::sync::Mutex;

    struct MapStore(Mutex<BlockMap>);

    #[async_trait::async_trait]
    impl ReadableBlockstore for MapStore {
        async fn get_bytes(&self, cid: &Cid) -> PdsResult<Option<Vec<u8>>> {
            Ok(self.0.lock().unwrap().get(cid).cloned())
        }
    }

    fn post(text: &str) -> Ipld {
        Ipld::Map(Map::from([
            (
                "$type".to_string(),
                Ipld::String("app.bsky.feed.post".to_string()),
            ),
            ("text".to_string(), Ipld::String(text.to_string())),
        ]))
    }

    fn create(rkey: &str, text: &str) -> RecordWrite {
        RecordWrite {
            action: WriteAction::Create,
            collection: "app.bsky.feed.post".to_string(),
            rkey: rkey.to_string(),
            record: Some(post(text)),
        }
    }

    #[test]
    fn test_init_commit_signs_and_links() {
        let keypair = Keypair::generate();
        let clock = TidClock::new();
        let commit = Repo::format_init_commit(
            "did:plc:alice",
            &[create("one", "first post")],
            &clock,
            &keypair,
        )
        .unwrap();
        assert!(commit.prev.is_none());
        assert!(commit.since.is_none());
        assert!(commit.removed_cids.is_empty());
        // Commit block, one node, one record
        assert_eq!(commit.new_blocks.len(), 3);

        let bytes = commit.new_blocks.get(&commit.cid).unwrap();
        let signed = SignedCommit::from_bytes(bytes).unwrap();
        assert_eq!(signed.rev, commit.rev);
        assert!(verify_commit_sig(&signed, &keypair.public_key_compressed()).unwrap());
    }

    async fn persisted(commit: &CommitData) -> MapStore {
        let mut blocks = BlockMap::new();
        for (cid, bytes) in commit.new_blocks.iter() {
            blocks.set(*cid, bytes.clone());
        }
        MapStore(Mutex::new(blocks))
    }

    #[tokio::test]
    async fn test_second_commit_diffs_against_first() {
        let keypair = Keypair::generate();
        let clock = TidClock::new();
        let init =
            Repo::format_init_commit("did:plc:alice", &[create("one", "hello")], &clock, &keypair)
                .unwrap();
        let store = persisted(&init).await;

        let repo = Repo::load(&store, "did:plc:alice", init.cid).await.unwrap();
        assert_eq!(repo.leaves().len(), 1);

        let next = repo
            .format_commit(&[create("two", "again")], &clock, &keypair)
            .unwrap();
        assert_eq!(next.prev, Some(init.cid));
        assert_eq!(next.since.as_deref(), repo.rev());
        assert!(next.rev > init.rev);
        // Old commit and old root node are no longer reachable
        assert!(next.removed_cids.contains(&init.cid));
    }

    #[tokio::test]
    async fn test_empty_writes_still_advance_rev() {
        let keypair = Keypair::generate();
        let clock = TidClock::new();
        let init =
            Repo::format_init_commit("did:plc:alice", &[create("one", "hello")], &clock, &keypair)
                .unwrap();
        let store = persisted(&init).await;
        let repo = Repo::load(&store, "did:plc:alice", init.cid).await.unwrap();

        let next = repo.format_commit(&[], &clock, &keypair).unwrap();
        assert!(next.rev > init.rev);
        // Only the commit block itself is new
        assert_eq!(next.new_blocks.len(), 1);
        assert!(next.new_blocks.has(&next.cid));
        // The old commit block is replaced
        assert_eq!(next.removed_cids.len(), 1);
        assert!(next.removed_cids.contains(&init.cid));
    }

    #[tokio::test]
    async fn test_delete_removes_leaf() {
        let keypair = Keypair::generate();
        let clock = TidClock::new();
        let init = Repo::format_init_commit(
            "did:plc:alice",
            &[create("one", "hello"), create("two", "world")],
            &clock,
            &keypair,
        )
        .unwrap();
        let store = persisted(&init).await;
        let repo = Repo::load(&store, "did:plc:alice", init.cid).await.unwrap();
        let victim = repo.get("app.bsky.feed.post/one").unwrap();

        let next = repo
            .format_commit(
                &[RecordWrite {
                    action: WriteAction::Delete,
                    collection: "app.bsky.feed.post".to_string(),
                    rkey: "one".to_string(),
                    record: None,
                }],
                &clock,
                &keypair,
            )
            .unwrap();
        assert!(next.removed_cids.contains(&victim));
    }

    #[test]
    fn test_update_missing_record_fails() {
        let keypair = Keypair::generate();
        let clock = TidClock::new();
        let repo = Repo::empty("did:plc:alice");
        let err = repo
            .format_commit(
                &[RecordWrite {
                    action: WriteAction::Update,
                    collection: "app.bsky.feed.post".to_string(),
                    rkey: "ghost".to_string(),
                    record: Some(post("nope")),
                }],
                &clock,
                &keypair,
            )
            .unwrap_err();
        assert!(matches!(err, PdsError::RecordNotFound(_)));
    }

    #[test]
    fn test_duplicate_create_fails() {
        let keypair = Keypair::generate();
        let clock = TidClock::new();
        let err = Repo::format_init_commit(
            "did:plc:alice",
            &[create("same", "a"), create("same", "b")],
            &clock,
            &keypair,
        )
        .unwrap_err();
        assert!(matches!(err, PdsError::InvalidRequest(_)));
    }
}
