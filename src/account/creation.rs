/// Account creation flow
///
/// One entry point turns `(handle, email, password, invite?)` into a
/// provisioned actor: validated handle, fresh signing key, registered
/// DID, empty initial commit, transactional account registration, and
/// the `identity`/`commit`/`account` events on the firehose.
use std::sync::Arc;

use crate::account::manager::{AccountManager, CreateAccountOpts, SessionTokens};
use crate::actor_store::{ActorStore, RepoTransactor};
use crate::blob_store::BlobStore;
use crate::car;
use crate::config::ServerConfig;
use crate::crypto::plc::{PlcClient, PlcOperation};
use crate::crypto::{Keypair, Signer};
use crate::error::{PdsError, PdsResult};
use crate::identity::{DidDocument, DidService, IdentityResolver, VerificationMethod};
use crate::repo::TidClock;
use crate::sequencer::{AccountEvent, CommitEvent, IdentityEvent, Sequencer};
use crate::validation;

/// Request to create an account
#[derive(Debug, Clone, Default)]
pub struct CreateAccountInput {
    pub handle: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub invite_code: Option<String>,
    /// Bring-your-own DID; requires authentication as that DID
    pub did: Option<String>,
    /// Extra PLC rotation key supplied by the user
    pub recovery_key: Option<String>,
}

/// Provisioned account
#[derive(Debug, Clone)]
pub struct CreateAccountResult {
    pub did: String,
    pub handle: String,
    pub access_jwt: String,
    pub refresh_jwt: String,
    pub did_doc: Option<DidDocument>,
}

pub struct AccountCreator {
    config: Arc<ServerConfig>,
    accounts: Arc<AccountManager>,
    actors: Arc<ActorStore>,
    blob_store: Arc<dyn BlobStore>,
    sequencer: Arc<Sequencer>,
    resolver: Arc<IdentityResolver>,
    plc: PlcClient,
    clock: Arc<TidClock>,
}

impl AccountCreator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ServerConfig>,
        accounts: Arc<AccountManager>,
        actors: Arc<ActorStore>,
        blob_store: Arc<dyn BlobStore>,
        sequencer: Arc<Sequencer>,
        resolver: Arc<IdentityResolver>,
        clock: Arc<TidClock>,
    ) -> Self {
        let plc = PlcClient::new(
            config.identity.did_plc_url.clone(),
            config.service.dev_mode,
        );
        Self {
            config,
            accounts,
            actors,
            blob_store,
            sequencer,
            resolver,
            plc,
            clock,
        }
    }

    /// Create an account end to end
    ///
    /// `authed_did` is the DID of the authenticated requester, needed only
    /// when bringing an existing DID (that account starts deactivated).
    pub async fn create_account(
        &self,
        input: CreateAccountInput,
        authed_did: Option<&str>,
    ) -> PdsResult<CreateAccountResult> {
        if self.config.invites.required {
            let code = input
                .invite_code
                .as_deref()
                .ok_or(PdsError::InvalidInviteCode)?;
            self.accounts.ensure_invite_is_available(code).await?;
        }

        let handle = self.validate_handle(&input.handle, input.did.as_deref()).await?;

        let email = input.email.as_ref().map(|e| e.to_lowercase());
        self.check_availability(&handle, email.as_deref()).await?;

        let signing_key = Keypair::generate();

        let (did, deactivated, genesis) = match &input.did {
            Some(did) => {
                // Bringing a DID requires proving control of it
                if authed_did != Some(did.as_str()) {
                    return Err(PdsError::Forbidden(
                        "Account creation for another DID requires authentication as that DID"
                            .to_string(),
                    ));
                }
                (did.clone(), true, None)
            }
            None => {
                let (did, op) = self
                    .register_plc_did(&signing_key, &handle, input.recovery_key.as_deref())
                    .await?;
                (did, false, Some(op))
            }
        };

        self.actors.create(&did, &signing_key).await?;
        let transactor = RepoTransactor::open(
            &self.actors,
            self.blob_store.clone(),
            &did,
            self.clock.clone(),
            Some(self.sequencer.clone()),
        )
        .await?;
        let commit = transactor.create_repo(Vec::new()).await?;

        let tokens = self
            .accounts
            .create_account(CreateAccountOpts {
                did: did.clone(),
                handle: handle.clone(),
                email,
                password: input.password.clone(),
                repo_cid: commit.cid.to_string(),
                repo_rev: commit.rev.clone(),
                invite_code: input.invite_code.clone(),
                deactivated,
            })
            .await?;

        let did_doc = genesis
            .as_ref()
            .map(|op| self.local_did_doc(&did, op))
            .transpose()?;
        if let Some(doc) = &did_doc {
            if let Err(e) = self.resolver.prime(&handle, &did, doc).await {
                tracing::warn!(error = %e, "failed to prime identity caches");
            }
        }

        if !deactivated {
            self.publish_creation_events(&did, &handle, &commit).await?;
        }

        tracing::info!(%did, %handle, "account created");
        Ok(CreateAccountResult {
            did,
            handle,
            access_jwt: tokens.access_jwt,
            refresh_jwt: tokens.refresh_jwt,
            did_doc,
        })
    }

    /// Normalize and police the handle; non-service handles must already
    /// resolve to the DID being brought.
    async fn validate_handle(&self, raw: &str, supplied_did: Option<&str>) -> PdsResult<String> {
        let handle = validation::normalize_handle(raw);
        validation::ensure_valid_handle(&handle)?;
        match validation::service_domain_for(&handle, &self.config.identity.service_handle_domains)
        {
            Some(domain) => {
                validation::ensure_valid_service_handle(&handle, domain, false)?;
            }
            None => {
                let did = supplied_did.ok_or_else(|| {
                    PdsError::invalid_request(
                        "External handles require bringing the DID they resolve to",
                    )
                })?;
                let resolved = self.resolver.resolve_handle(&handle).await?;
                if resolved != did {
                    return Err(PdsError::invalid_request(format!(
                        "Handle {} does not resolve to {}",
                        handle, did
                    )));
                }
            }
        }
        Ok(handle)
    }

    /// Handle and email availability, checked concurrently
    async fn check_availability(&self, handle: &str, email: Option<&str>) -> PdsResult<()> {
        let (handle_taken, email_taken) = tokio::try_join!(
            self.accounts.handle_taken(handle),
            async {
                match email {
                    Some(email) => self.accounts.email_taken(email).await,
                    None => Ok(false),
                }
            }
        )?;
        if handle_taken {
            return Err(PdsError::invalid_request("Handle already taken"));
        }
        if email_taken {
            return Err(PdsError::invalid_request("Email already registered"));
        }
        Ok(())
    }

    /// Build, sign, and submit the PLC genesis operation
    async fn register_plc_did(
        &self,
        signing_key: &Keypair,
        handle: &str,
        recovery_key: Option<&str>,
    ) -> PdsResult<(String, PlcOperation)> {
        let rotation_key = match &self.config.auth.plc_rotation_key_hex {
            Some(hex) => Keypair::from_hex(hex)?,
            None if self.config.service.dev_mode => Keypair::generate(),
            None => {
                return Err(PdsError::internal(
                    "PLC rotation key is not configured",
                ))
            }
        };
        let mut op = PlcOperation::genesis(
            signing_key.did_key(),
            rotation_key.did_key(),
            handle,
            &self.config.public_url(),
        );
        if let Some(recovery) = recovery_key {
            op.rotation_keys.insert(0, recovery.to_string());
        }
        let op = op.sign(&rotation_key)?;
        let did = self.plc.create_did(&op).await?;
        Ok((did, op))
    }

    /// DID document mirroring the genesis operation, served locally until
    /// the registry propagates.
    fn local_did_doc(&self, did: &str, op: &PlcOperation) -> PdsResult<DidDocument> {
        let signing = op
            .verification_methods
            .get("atproto")
            .ok_or_else(|| PdsError::internal("genesis operation missing signing key"))?;
        let multibase = signing
            .strip_prefix("did:key:")
            .unwrap_or(signing)
            .to_string();
        Ok(DidDocument {
            id: did.to_string(),
            also_known_as: op.also_known_as.clone(),
            verification_method: vec![VerificationMethod {
                id: format!("{}#atproto", did),
                method_type: "Multikey".to_string(),
                controller: Some(did.to_string()),
                public_key_multibase: Some(multibase),
            }],
            service: op
                .services
                .iter()
                .map(|(name, service)| DidService {
                    id: format!("#{}", name),
                    service_type: service.service_type.clone(),
                    service_endpoint: service.endpoint.clone(),
                })
                .collect(),
        })
    }

    /// The three creation events, published concurrently
    async fn publish_creation_events(
        &self,
        did: &str,
        handle: &str,
        commit: &crate::repo::CommitData,
    ) -> PdsResult<()> {
        let commit_event = CommitEvent::new(
            did.to_string(),
            commit.cid.to_string(),
            commit.rev.clone(),
            None,
            None,
            car::blocks_to_car(&commit.cid, &commit.new_blocks)?,
            Vec::new(),
            Vec::new(),
        );
        tokio::try_join!(
            self.sequencer.sequence_identity(IdentityEvent {
                did: did.to_string(),
                handle: Some(handle.to_string()),
            }),
            self.sequencer.sequence_commit(commit_event),
            self.sequencer.sequence_account(AccountEvent {
                did: did.to_string(),
                active: true,
                status: None,
            }),
        )?;
        Ok(())
    }

    /// Issue a session for an existing account (used by login glue)
    pub async fn session_for(&self, did: &str) -> PdsResult<SessionTokens> {
        self.accounts.create_session(did, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::DiskBlobStore;
    use crate::identity::{DidCache, FileCache, IdentityResolverConfig};
    use crate::sequencer::{SeqEvent, SequencerConfig};

    struct Fixture {
        _dir: tempfile::TempDir,
        creator: AccountCreator,
        accounts: Arc<AccountManager>,
        actors: Arc<ActorStore>,
        sequencer: Arc<Sequencer>,
    }

    async fn fixture(invite_required: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::test_config(dir.path());
        config.invites.required = invite_required;
        let config = Arc::new(config);

        let account_db = crate::db::memory_pool().await.unwrap();
        let accounts = Arc::new(
            AccountManager::new(account_db, config.clone())
                .await
                .unwrap(),
        );
        let actors = Arc::new(ActorStore::new(crate::actor_store::ActorStoreConfig {
            base_directory: config.storage.actor_store_directory.clone(),
            cache_size: 10,
            verify_blocks_on_read: true,
        }));
        let blob_store: Arc<dyn BlobStore> = Arc::new(DiskBlobStore::new(
            config.storage.blob_directory.clone(),
        ));
        let seq_db = crate::db::memory_pool().await.unwrap();
        let sequencer = Arc::new(
            Sequencer::new(seq_db, SequencerConfig::default())
                .await
                .unwrap(),
        );
        let cache_db = crate::db::memory_pool().await.unwrap();
        let cache = DidCache::new(
            cache_db,
            chrono::Duration::seconds(3600),
            chrono::Duration::seconds(86400),
        )
        .await
        .unwrap();
        let resolver = Arc::new(
            IdentityResolver::new(
                IdentityResolverConfig {
                    dev_mode: true,
                    ..Default::default()
                },
                cache,
                FileCache::disabled(),
            )
            .unwrap(),
        );
        let creator = AccountCreator::new(
            config.clone(),
            accounts.clone(),
            actors.clone(),
            blob_store,
            sequencer.clone(),
            resolver,
            Arc::new(TidClock::new()),
        );
        Fixture {
            _dir: dir,
            creator,
            accounts,
            actors,
            sequencer,
        }
    }

    fn input(handle: &str) -> CreateAccountInput {
        CreateAccountInput {
            handle: handle.to_string(),
            email: Some(format!("{}@example.com", handle.replace('.', "-"))),
            password: Some("a-strong-password".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_creation_flow_emits_three_events() {
        let f = fixture(false).await;
        let mut rx = f.sequencer.subscribe(None).await.unwrap();

        let result = f
            .creator
            .create_account(input("alice.test"), None)
            .await
            .unwrap();
        assert!(result.did.starts_with("did:plc:"));
        assert_eq!(result.handle, "alice.test");
        assert!(!result.access_jwt.is_empty());
        assert!(!result.refresh_jwt.is_empty());
        let doc = result.did_doc.unwrap();
        assert_eq!(doc.id, result.did);
        assert_eq!(doc.declared_handle(), Some("alice.test"));

        // identity, commit, account — in seq order
        let kinds: Vec<&'static str> = vec![
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| match e {
            SeqEvent::Identity { .. } => "identity",
            SeqEvent::Commit { .. } => "commit",
            SeqEvent::Account { .. } => "account",
            _ => "other",
        })
        .collect();
        assert_eq!(kinds, vec!["identity", "commit", "account"]);

        // Actor store and account rows exist
        assert!(f.actors.exists(&result.did).await);
        let account = f.accounts.get_account(&result.did).await.unwrap().unwrap();
        assert_eq!(account.handle.as_deref(), Some("alice.test"));
    }

    #[tokio::test]
    async fn test_invite_gating() {
        let f = fixture(true).await;
        // Missing invite
        let err = f
            .creator
            .create_account(input("noinvite.test"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PdsError::InvalidInviteCode));

        // With a minted invite it works
        let codes = f
            .accounts
            .create_invite_codes(1, 1, "admin", "admin")
            .await
            .unwrap();
        let mut request = input("invited.test");
        request.invite_code = Some(codes[0].clone());
        let result = f.creator.create_account(request, None).await.unwrap();
        assert_eq!(result.handle, "invited.test");
    }

    #[tokio::test]
    async fn test_service_handle_rules_enforced() {
        let f = fixture(false).await;
        // Reserved front part
        let err = f
            .creator
            .create_account(input("admin.test"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PdsError::InvalidRequest(_)));
        // Too-short front part
        let err = f
            .creator
            .create_account(input("ab.test"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PdsError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_duplicate_handle_rejected() {
        let f = fixture(false).await;
        f.creator
            .create_account(input("taken.test"), None)
            .await
            .unwrap();
        let mut second = input("taken.test");
        second.email = Some("different@example.com".to_string());
        let err = f.creator.create_account(second, None).await.unwrap_err();
        assert!(matches!(err, PdsError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_brought_did_requires_auth_and_deactivates() {
        let f = fixture(false).await;
        let mut request = input("brought.test");
        request.did = Some("did:plc:broughtdid123".to_string());

        // Unauthenticated: rejected
        let err = f
            .creator
            .create_account(request.clone(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PdsError::Forbidden(_)));

        // Authenticated as that DID: created deactivated, no events
        let before = f.sequencer.current_seq().await.unwrap();
        let result = f
            .creator
            .create_account(request, Some("did:plc:broughtdid123"))
            .await
            .unwrap();
        assert_eq!(result.did, "did:plc:broughtdid123");
        assert!(result.did_doc.is_none());
        let account = f.accounts.get_account(&result.did).await.unwrap().unwrap();
        assert!(account.deactivated_at.is_some());
        assert_eq!(f.sequencer.current_seq().await.unwrap(), before);
    }
}
