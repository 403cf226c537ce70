/// Repo transactor - the apply-writes pipeline
///
/// Single entry point for mutating a repository. Formatting validates the
/// swap assertions and produces a signed commit; applying fans out to the
/// block store, the record index, and the blob reconcile concurrently and
/// unwinds the root pointer if any branch fails. On success exactly one
/// commit event is emitted to the sequencer.
use chrono::Utc;
use libipld::Cid;
use std::sync::Arc;

use crate::actor_store::blobs::BlobIndex;
use crate::actor_store::prepare::{validate_batch, PreparedWrite};
use crate::actor_store::{ActorStore, BlockStore, RecordStore};
use crate::blob_store::BlobStore;
use crate::car;
use crate::crypto::Keypair;
use crate::error::{PdsError, PdsResult};
use crate::metrics;
use crate::repo::{CommitData, Repo, TidClock, WriteAction};
use crate::sequencer::{CommitEvent, CommitOp, Sequencer};

pub struct RepoTransactor {
    did: String,
    blocks: BlockStore,
    records: RecordStore,
    blob_index: BlobIndex,
    blob_store: Arc<dyn BlobStore>,
    signing_key: Keypair,
    clock: Arc<TidClock>,
    sequencer: Option<Arc<Sequencer>>,
}

impl RepoTransactor {
    /// Open a transactor over an existing actor
    pub async fn open(
        actors: &ActorStore,
        blob_store: Arc<dyn BlobStore>,
        did: &str,
        clock: Arc<TidClock>,
        sequencer: Option<Arc<Sequencer>>,
    ) -> PdsResult<Self> {
        Ok(Self {
            did: did.to_string(),
            blocks: actors.blocks(did).await?,
            records: actors.records(did).await?,
            blob_index: actors.blobs(did).await?,
            blob_store,
            signing_key: actors.keypair(did)?,
            clock,
            sequencer,
        })
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    /// First commit of a brand-new repository
    pub async fn create_repo(&self, writes: Vec<PreparedWrite>) -> PdsResult<CommitData> {
        validate_batch(&writes)?;
        for write in &writes {
            if write.action != WriteAction::Create {
                return Err(PdsError::invalid_request(
                    "repo creation only accepts create operations",
                ));
            }
        }
        let record_writes: Vec<_> = writes.iter().map(|w| w.to_record_write()).collect();
        let commit = Repo::format_init_commit(
            self.did.clone(),
            &record_writes,
            &self.clock,
            &self.signing_key,
        )?;
        self.apply(&commit, &writes, true).await?;
        metrics::COMMITS_APPLIED.inc();
        Ok(commit)
    }

    /// Apply a batch of writes as one commit
    pub async fn process_writes(
        &self,
        writes: Vec<PreparedWrite>,
        swap_commit: Option<Cid>,
    ) -> PdsResult<CommitData> {
        validate_batch(&writes)?;
        let commit = self.format_commit(&writes, swap_commit).await?;
        self.apply(&commit, &writes, false).await?;
        metrics::COMMITS_APPLIED.inc();
        for write in &writes {
            metrics::RECORD_WRITES
                .with_label_values(&[write.action.as_str()])
                .inc();
        }
        self.emit_commit_event(&commit, &writes).await;
        Ok(commit)
    }

    /// Validate swaps, apply writes to the tree, and sign the new commit
    async fn format_commit(
        &self,
        writes: &[PreparedWrite],
        swap_commit: Option<Cid>,
    ) -> PdsResult<CommitData> {
        let root = self
            .blocks
            .get_root()
            .await?
            .ok_or_else(|| PdsError::RepoNotFound(self.did.clone()))?;
        let root_cid = crate::repo::dag::parse_cid(&root.cid)?;
        if let Some(expected) = swap_commit {
            if expected != root_cid {
                return Err(PdsError::BadCommitSwap);
            }
        }

        // Per-record swap assertions against the current index
        for write in writes {
            if !write.swap_requested {
                continue;
            }
            let current = self
                .records
                .get_record(&write.uri, None, true)
                .await?
                .map(|r| r.cid);
            match write.action {
                WriteAction::Create => {
                    // A create may not assert a prior CID
                    if write.swap_cid.is_some() || current.is_some() {
                        return Err(PdsError::BadRecordSwap);
                    }
                }
                WriteAction::Update | WriteAction::Delete => {
                    let expected = write
                        .swap_cid
                        .map(|c| c.to_string())
                        .ok_or(PdsError::BadRecordSwap)?;
                    if current.as_deref() != Some(expected.as_str()) {
                        return Err(PdsError::BadRecordSwap);
                    }
                }
            }
        }

        let repo = Repo::load(&self.blocks, self.did.clone(), root_cid).await?;
        let record_writes: Vec<_> = writes.iter().map(|w| w.to_record_write()).collect();
        let mut commit = repo.format_commit(&record_writes, &self.clock, &self.signing_key)?;

        // A removed CID still referenced by an untouched record stays put
        let touched: Vec<&str> = writes
            .iter()
            .filter(|w| w.action != WriteAction::Create)
            .map(|w| w.uri.as_str())
            .collect();
        let duplicates = self
            .duplicate_record_cids(&commit.removed_cids, &touched)
            .await?;
        for cid in duplicates {
            commit.removed_cids.remove(&cid);
        }
        Ok(commit)
    }

    /// Three-way concurrent apply with root rollback on failure
    async fn apply(
        &self,
        commit: &CommitData,
        writes: &[PreparedWrite],
        is_create: bool,
    ) -> PdsResult<()> {
        let result = tokio::try_join!(
            self.blocks.apply_commit(commit, is_create),
            self.index_writes(writes, &commit.rev),
            self.blob_index
                .process_write_blobs(writes, self.blob_store.as_ref()),
        );
        if let Err(e) = result {
            tracing::error!(did = %self.did, error = %e, "commit apply failed, rolling back root");
            self.rollback(commit, is_create).await;
            return Err(e);
        }
        Ok(())
    }

    /// Restore the previous root and drop this commit's blocks. Blob
    /// promotions that already happened are reconciled by the next
    /// maintenance sweep.
    async fn rollback(&self, commit: &CommitData, is_create: bool) {
        if is_create {
            return;
        }
        if let Some(prev) = commit.prev {
            if let Some(since) = &commit.since {
                if let Err(e) = self.blocks.update_root(&prev, since, false).await {
                    tracing::error!(did = %self.did, error = %e, "root rollback failed");
                }
            }
        }
        let new_cids = commit.new_blocks.cids().copied().collect();
        if let Err(e) = self.blocks.delete_many(&new_cids).await {
            tracing::error!(did = %self.did, error = %e, "block rollback failed");
        }
    }

    /// Mirror the writes into the record index
    async fn index_writes(&self, writes: &[PreparedWrite], rev: &str) -> PdsResult<()> {
        let now = Utc::now().to_rfc3339();
        for write in writes {
            match write.action {
                WriteAction::Create | WriteAction::Update => {
                    let record = write
                        .record
                        .as_ref()
                        .ok_or_else(|| PdsError::internal("prepared write missing record"))?;
                    let cid = write
                        .cid
                        .ok_or_else(|| PdsError::internal("prepared write missing cid"))?;
                    self.records
                        .index_record(&write.uri, &cid, record, write.action, rev, &now)
                        .await?;
                }
                WriteAction::Delete => {
                    self.records.delete_record(&write.uri).await?;
                }
            }
        }
        Ok(())
    }

    /// CIDs slated for removal that untouched records still point at
    async fn duplicate_record_cids(
        &self,
        removed: &crate::repo::CidSet,
        touched_uris: &[&str],
    ) -> PdsResult<Vec<Cid>> {
        if removed.is_empty() {
            return Ok(Vec::new());
        }
        let mut duplicates = Vec::new();
        for cid in removed {
            let row = self
                .records
                .get_record_by_cid_excluding(cid, touched_uris)
                .await?;
            if row.is_some() {
                duplicates.push(*cid);
            }
        }
        Ok(duplicates)
    }

    /// Publish the commit to the firehose; sequencing failures do not
    /// unwind an already-persisted commit.
    async fn emit_commit_event(&self, commit: &CommitData, writes: &[PreparedWrite]) {
        let Some(sequencer) = &self.sequencer else {
            return;
        };
        let car = match car::blocks_to_car(&commit.cid, &commit.new_blocks) {
            Ok(car) => car,
            Err(e) => {
                tracing::error!(did = %self.did, error = %e, "failed to encode commit CAR");
                return;
            }
        };
        let ops = writes
            .iter()
            .map(|w| CommitOp {
                action: w.action.as_str().to_string(),
                path: w.data_key(),
                cid: w.cid.map(|c| c.to_string()),
            })
            .collect();
        let blobs = writes
            .iter()
            .flat_map(|w| w.blobs.iter().map(|b| b.cid.to_string()))
            .collect();
        let event = CommitEvent::new(
            self.did.clone(),
            commit.cid.to_string(),
            commit.rev.clone(),
            commit.since.clone(),
            commit.prev.map(|c| c.to_string()),
            car,
            ops,
            blobs,
        );
        if let Err(e) = sequencer.sequence_commit(event).await {
            tracing::warn!(did = %self.did, error = %e, "failed to sequence commit event");
        }
    }
}
