/// Application context and dependency wiring
///
/// Every shared service is constructed once from configuration and
/// passed through request state; there are no implicit singletons.
use std::sync::Arc;

use crate::account::{AccountCreator, AccountManager, AccountStatus};
use crate::actor_store::{ActorStore, ActorStoreConfig, RepoTransactor};
use crate::blob_store::{BlobStore, DiskBlobStore};
use crate::config::ServerConfig;
use crate::db;
use crate::error::{PdsError, PdsResult};
use crate::identity::{DidCache, FileCache, IdentityResolver, IdentityResolverConfig};
use crate::repo::TidClock;
use crate::sequencer::{Sequencer, SequencerConfig};

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub account_manager: Arc<AccountManager>,
    pub account_creator: Arc<AccountCreator>,
    pub actor_store: Arc<ActorStore>,
    pub blob_store: Arc<dyn BlobStore>,
    pub identity_resolver: Arc<IdentityResolver>,
    pub sequencer: Arc<Sequencer>,
    pub tid_clock: Arc<TidClock>,
}

impl AppContext {
    /// Build every service from configuration
    pub async fn new(config: ServerConfig) -> PdsResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        Self::ensure_directories(&config).await?;

        let account_db =
            db::create_pool(&config.storage.account_db, db::DatabaseOptions::default()).await?;
        db::test_connection(&account_db).await?;
        let account_manager = Arc::new(AccountManager::new(account_db, config.clone()).await?);

        let actor_store = Arc::new(ActorStore::new(ActorStoreConfig {
            base_directory: config.storage.actor_store_directory.clone(),
            cache_size: 100,
            verify_blocks_on_read: false,
        }));

        let blob_store: Arc<dyn BlobStore> =
            Arc::new(DiskBlobStore::new(config.storage.blob_directory.clone()));

        let sequencer_db =
            db::create_pool(&config.storage.sequencer_db, db::DatabaseOptions::default()).await?;
        let sequencer = Arc::new(Sequencer::new(sequencer_db, SequencerConfig::default()).await?);

        let cache_db =
            db::create_pool(&config.storage.did_cache_db, db::DatabaseOptions::default()).await?;
        let (stale_ttl, max_ttl) = IdentityResolver::cache_ttls(
            config.identity.cache_stale_ttl_secs,
            config.identity.cache_max_ttl_secs,
        );
        let did_cache = DidCache::new(cache_db, stale_ttl, max_ttl).await?;
        let file_cache = FileCache::new(config.storage.identity_file_cache_directory.clone());
        let identity_resolver = Arc::new(IdentityResolver::new(
            IdentityResolverConfig {
                plc_url: config.identity.did_plc_url.clone(),
                timeout: std::time::Duration::from_secs(
                    config.identity.resolution_timeout_secs,
                ),
                dev_mode: config.service.dev_mode,
                user_agent: format!("tidehollow-pds/{}", config.service.version),
            },
            did_cache,
            file_cache,
        )?);

        let tid_clock = Arc::new(TidClock::new());

        let account_creator = Arc::new(AccountCreator::new(
            config.clone(),
            account_manager.clone(),
            actor_store.clone(),
            blob_store.clone(),
            sequencer.clone(),
            identity_resolver.clone(),
            tid_clock.clone(),
        ));

        Ok(Self {
            config,
            account_manager,
            account_creator,
            actor_store,
            blob_store,
            identity_resolver,
            sequencer,
            tid_clock,
        })
    }

    /// Transactor for one actor's repository; commits are only allowed
    /// while the account is active.
    pub async fn transactor_for(&self, did: &str) -> PdsResult<RepoTransactor> {
        match self.account_manager.account_status(did).await? {
            AccountStatus::Active => {}
            AccountStatus::Takendown => return Err(PdsError::AccountTakedown),
            AccountStatus::Deactivated => return Err(PdsError::RepoDeactivated),
            AccountStatus::Deleted => return Err(PdsError::RepoNotFound(did.to_string())),
        }
        RepoTransactor::open(
            &self.actor_store,
            self.blob_store.clone(),
            did,
            self.tid_clock.clone(),
            Some(self.sequencer.clone()),
        )
        .await
    }

    /// Change an actor's handle and announce it on the firehose
    pub async fn update_handle(&self, did: &str, raw_handle: &str) -> PdsResult<()> {
        let handle = crate::validation::normalize_handle(raw_handle);
        crate::validation::ensure_valid_handle(&handle)?;
        if let Some(domain) = crate::validation::service_domain_for(
            &handle,
            &self.config.identity.service_handle_domains,
        ) {
            crate::validation::ensure_valid_service_handle(&handle, domain, false)?;
        }
        self.account_manager.update_handle(did, &handle).await?;
        self.identity_resolver.purge(did).await?;
        tokio::try_join!(
            self.sequencer.sequence_identity(crate::sequencer::IdentityEvent {
                did: did.to_string(),
                handle: Some(handle.clone()),
            }),
            self.sequencer.sequence_handle(crate::sequencer::HandleEvent {
                did: did.to_string(),
                handle,
            }),
        )?;
        Ok(())
    }

    /// Tear an account down to nothing: rows, repo storage, blobs, and a
    /// tombstone on the firehose.
    pub async fn delete_account(&self, did: &str) -> PdsResult<()> {
        self.account_manager.delete_account(did).await?;
        self.actor_store.destroy(did).await?;
        self.blob_store.delete_all(did).await?;
        self.sequencer.invalidate_for_did(did).await?;
        self.sequencer
            .sequence_tombstone(crate::sequencer::TombstoneEvent {
                did: did.to_string(),
            })
            .await?;
        self.identity_resolver.purge(did).await?;
        Ok(())
    }

    /// Status transitions, each announced as an account event
    pub async fn set_account_status(&self, did: &str, status: AccountStatus) -> PdsResult<()> {
        use crate::sequencer::{AccountEvent, AccountStatus as EventStatus};
        let (active, event_status) = match status {
            AccountStatus::Active => {
                self.account_manager.activate_account(did).await?;
                (true, None)
            }
            AccountStatus::Deactivated => {
                self.account_manager.deactivate_account(did, None).await?;
                (false, Some(EventStatus::Deactivated))
            }
            AccountStatus::Takendown => {
                self.account_manager
                    .takedown_account(did, &format!("takedown-{}", self.tid_clock.next()))
                    .await?;
                (false, Some(EventStatus::Takendown))
            }
            AccountStatus::Deleted => {
                return Err(PdsError::invalid_request(
                    "Deletion goes through delete_account",
                ))
            }
        };
        self.sequencer
            .sequence_account(AccountEvent {
                did: did.to_string(),
                active,
                status: event_status,
            })
            .await?;
        Ok(())
    }

    async fn ensure_directories(config: &ServerConfig) -> PdsResult<()> {
        for dir in [
            &config.storage.data_directory,
            &config.storage.actor_store_directory,
            &config.storage.blob_directory,
            &config.storage.identity_file_cache_directory,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    pub fn service_did(&self) -> &str {
        &self.config.service.service_did
    }
}
