/// Identity resolver
///
/// Handle resolution races a DNS TXT lookup against an HTTPS well-known
/// probe; the first success wins and cancels the other. DID resolution
/// fetches from the PLC directory or a did:web host. Every network result
/// flows back through the cache layers.
use chrono::Duration as ChronoDuration;
use hickory_resolver::{Resolver, TokioResolver};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PdsError, PdsResult};
use crate::identity::file_cache::CacheKind;
use crate::identity::{DidCache, DidDocument, FileCache, Identity, MemoryCache};
use crate::metrics;
use crate::validation;

/// Identity resolution configuration
#[derive(Debug, Clone)]
pub struct IdentityResolverConfig {
    pub plc_url: String,
    /// Per-leg handle resolution timeout
    pub timeout: Duration,
    /// Dev mode probes well-known over plain http
    pub dev_mode: bool,
    pub user_agent: String,
}

impl Default for IdentityResolverConfig {
    fn default() -> Self {
        Self {
            plc_url: "https://plc.directory".to_string(),
            timeout: Duration::from_secs(5),
            dev_mode: false,
            user_agent: format!("tidehollow-pds/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Layered resolver: memory LRU, SQLite cache, file cache, then network
pub struct IdentityResolver {
    config: IdentityResolverConfig,
    dns: TokioResolver,
    http: reqwest::Client,
    cache: DidCache,
    memory: MemoryCache,
    files: FileCache,
}

impl IdentityResolver {
    pub fn new(
        config: IdentityResolverConfig,
        cache: DidCache,
        files: FileCache,
    ) -> PdsResult<Self> {
        let (dns_config, options) =
            hickory_resolver::system_conf::read_system_conf().unwrap_or_default();
        let dns = Resolver::builder_with_config(
            dns_config,
            hickory_resolver::name_server::TokioConnectionProvider::default(),
        )
        .with_options(options)
        .build();
        let http = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(20))
            .timeout(config.timeout)
            .build()
            .map_err(|e| PdsError::internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            memory: MemoryCache::new(
                250_000,
                Duration::from_secs(120),
                Duration::from_secs(24 * 3600),
            ),
            config,
            dns,
            http,
            cache,
            files,
        })
    }

    /// SQLite cache TTLs expressed for the constructor
    pub fn cache_ttls(stale_secs: u64, max_secs: u64) -> (ChronoDuration, ChronoDuration) {
        (
            ChronoDuration::seconds(stale_secs as i64),
            ChronoDuration::seconds(max_secs as i64),
        )
    }

    /// Resolve a handle to a DID, caches first
    pub async fn resolve_handle(&self, handle: &str) -> PdsResult<String> {
        let handle = validation::normalize_handle(handle);
        validation::ensure_valid_handle(&handle)?;

        if let Some(hit) = self.cache.get_handle(&handle).await? {
            metrics::IDENTITY_RESOLUTIONS
                .with_label_values(&["handle", "cache"])
                .inc();
            return Ok(hit.value);
        }
        if let Some(did) = self.files.get::<String>(CacheKind::Handles, &handle).await {
            metrics::IDENTITY_RESOLUTIONS
                .with_label_values(&["handle", "file-cache"])
                .inc();
            return Ok(did);
        }

        let did = self.resolve_handle_network(&handle).await?;
        validation::ensure_valid_did(&did)?;
        self.cache.put_handle(&handle, &did).await?;
        self.files.stash(CacheKind::Handles, &handle, &did).await;
        metrics::IDENTITY_RESOLUTIONS
            .with_label_values(&["handle", "network"])
            .inc();
        Ok(did)
    }

    /// Race DNS TXT against the well-known probe
    async fn resolve_handle_network(&self, handle: &str) -> PdsResult<String> {
        race_first_success(
            self.config.timeout,
            self.resolve_handle_dns(handle),
            self.resolve_handle_well_known(handle),
        )
        .await
    }

    /// `_atproto.<handle>` TXT record of the form `did=<did>`
    async fn resolve_handle_dns(&self, handle: &str) -> PdsResult<String> {
        let name = format!("_atproto.{}.", handle);
        let lookup = self
            .dns
            .txt_lookup(name)
            .await
            .map_err(|e| PdsError::HandleResolutionFailed(format!("DNS lookup failed: {}", e)))?;
        for record in lookup.iter() {
            let text = record.to_string();
            if let Some(did) = text.strip_prefix("did=") {
                return Ok(did.to_string());
            }
        }
        Err(PdsError::HandleResolutionFailed(format!(
            "no did TXT record for {}",
            handle
        )))
    }

    /// `GET /.well-known/atproto-did`; 404 is terminal, 5xx is upstream
    async fn resolve_handle_well_known(&self, handle: &str) -> PdsResult<String> {
        let scheme = if self.config.dev_mode { "http" } else { "https" };
        let url = format!("{}://{}/.well-known/atproto-did", scheme, handle);
        let response = self.http.get(&url).send().await.map_err(|e| {
            PdsError::HandleResolutionFailed(format!("well-known request failed: {}", e))
        })?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PdsError::HandleResolutionFailed(format!(
                "no well-known DID for {}",
                handle
            )));
        }
        if status.is_server_error() {
            return Err(PdsError::HandleResolutionFailed(format!(
                "well-known probe got {} from {}",
                status, handle
            )));
        }
        if !status.is_success() {
            return Err(PdsError::HandleResolutionFailed(format!(
                "well-known probe got {} from {}",
                status, handle
            )));
        }
        let body = response.text().await.map_err(|e| {
            PdsError::HandleResolutionFailed(format!("well-known body unreadable: {}", e))
        })?;
        let did = body.trim().to_string();
        validation::ensure_valid_did(&did)
            .map_err(|_| PdsError::HandleResolutionFailed(format!("{} returned a non-DID", handle)))?;
        Ok(did)
    }

    /// Resolve a DID to its document, caches first
    pub async fn resolve_did(&self, did: &str) -> PdsResult<DidDocument> {
        validation::ensure_valid_did(did)?;
        if let Some((identity, stale)) = self.memory.get(did) {
            if !stale {
                return Ok(identity.doc);
            }
        }
        if let Some(hit) = self.cache.get_doc(did).await? {
            // Stale entries are served; the maintenance sweep refreshes
            metrics::IDENTITY_RESOLUTIONS
                .with_label_values(&["did", "cache"])
                .inc();
            return Ok(hit.value);
        }
        if let Some(doc) = self.files.get::<DidDocument>(CacheKind::Dids, did).await {
            metrics::IDENTITY_RESOLUTIONS
                .with_label_values(&["did", "file-cache"])
                .inc();
            return Ok(doc);
        }

        let doc = self.fetch_did_document(did).await?;
        self.cache.put_doc(did, &doc).await?;
        self.files.stash(CacheKind::Dids, did, &doc).await;
        metrics::IDENTITY_RESOLUTIONS
            .with_label_values(&["did", "network"])
            .inc();
        Ok(doc)
    }

    async fn fetch_did_document(&self, did: &str) -> PdsResult<DidDocument> {
        if did.starts_with("did:plc:") {
            self.fetch_plc_document(did).await
        } else if did.starts_with("did:web:") {
            self.fetch_web_document(did).await
        } else {
            Err(PdsError::DidNotFound(format!(
                "unsupported DID method: {}",
                did
            )))
        }
    }

    async fn fetch_plc_document(&self, did: &str) -> PdsResult<DidDocument> {
        let url = format!("{}/{}", self.config.plc_url.trim_end_matches('/'), did);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PdsError::UpstreamFailure(format!("PLC fetch failed: {}", e)))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PdsError::DidNotFound(did.to_string()));
        }
        if !response.status().is_success() {
            return Err(PdsError::UpstreamFailure(format!(
                "PLC directory returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| PdsError::UpstreamFailure(format!("invalid PLC document: {}", e)))
    }

    async fn fetch_web_document(&self, did: &str) -> PdsResult<DidDocument> {
        let host = did
            .strip_prefix("did:web:")
            .filter(|host| !host.contains(':'))
            .ok_or_else(|| {
                PdsError::invalid_request(format!("unsupported did:web form: {}", did))
            })?;
        // The host must be domain-shaped; bare IPs and ports are rejected
        validation::ensure_valid_handle(host)
            .map_err(|_| PdsError::invalid_request(format!("invalid did:web host: {}", host)))?;
        let scheme = if self.config.dev_mode { "http" } else { "https" };
        let url = format!("{}://{}/.well-known/did.json", scheme, host);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PdsError::UpstreamFailure(format!("did:web fetch failed: {}", e)))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PdsError::DidNotFound(did.to_string()));
        }
        if !response.status().is_success() {
            return Err(PdsError::UpstreamFailure(format!(
                "did:web host returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| PdsError::UpstreamFailure(format!("invalid did:web document: {}", e)))
    }

    /// Composite lookup by handle or DID with bidirectional verification
    pub async fn lookup(&self, identifier: &str) -> PdsResult<Identity> {
        let identity = if identifier.starts_with("did:") {
            let doc = self.resolve_did(identifier).await?;
            let declared = doc.declared_handle().map(String::from);
            let (handle, mismatch) = match &declared {
                Some(handle) => match self.resolve_handle(handle).await {
                    Ok(did) if did == identifier => (declared.clone(), false),
                    _ => (None, true),
                },
                None => (None, false),
            };
            Identity {
                did: identifier.to_string(),
                handle,
                doc,
                handle_mismatch: mismatch,
            }
        } else {
            let handle = validation::normalize_handle(identifier);
            let did = self.resolve_handle(&handle).await?;
            let doc = self.resolve_did(&did).await?;
            if doc.declared_handle() == Some(handle.as_str()) {
                Identity {
                    did,
                    handle: Some(handle),
                    doc,
                    handle_mismatch: false,
                }
            } else {
                // Partial identity: the document does not claim this handle
                Identity {
                    did,
                    handle: None,
                    doc,
                    handle_mismatch: true,
                }
            }
        };
        self.memory.put(identity.clone());
        Ok(identity)
    }

    /// Clear an identifier from every cache layer
    pub async fn purge(&self, identifier: &str) -> PdsResult<()> {
        if identifier.starts_with("did:") {
            self.memory.remove(identifier);
            self.cache.delete_doc(identifier).await?;
            self.cache.delete_handles_for_did(identifier).await?;
            self.files.remove(CacheKind::Dids, identifier).await;
        } else {
            let handle = validation::normalize_handle(identifier);
            if let Some(hit) = self.cache.get_handle(&handle).await? {
                self.memory.remove(&hit.value);
                self.cache.delete_doc(&hit.value).await?;
                self.files.remove(CacheKind::Dids, &hit.value).await;
            }
            self.cache.delete_handle(&handle).await?;
            self.files.remove(CacheKind::Handles, &handle).await;
        }
        Ok(())
    }

    /// Drop expired rows in the persistent layer and stale cache files
    pub async fn cleanup(&self) -> PdsResult<u64> {
        let rows = self.cache.cleanup_expired().await?;
        let files = self.files.clean().await? as u64;
        Ok(rows + files)
    }

    /// Seed the caches after a local identity change (e.g. new account)
    pub async fn prime(&self, handle: &str, did: &str, doc: &DidDocument) -> PdsResult<()> {
        self.cache.put_handle(handle, did).await?;
        self.cache.put_doc(did, doc).await?;
        self.files.stash(CacheKind::Handles, handle, &did.to_string()).await;
        self.files.stash(CacheKind::Dids, did, doc).await;
        Ok(())
    }
}

/// Run two legs concurrently; the first success wins and the loser is
/// cancelled by drop. If both fail the second leg's error is reported
/// (the well-known error, in handle resolution).
pub(crate) async fn race_first_success<T, A, B>(
    timeout: Duration,
    leg_a: A,
    leg_b: B,
) -> PdsResult<T>
where
    A: Future<Output = PdsResult<T>>,
    B: Future<Output = PdsResult<T>>,
{
    let leg_a = tokio::time::timeout(timeout, leg_a);
    let leg_b = tokio::time::timeout(timeout, leg_b);
    tokio::pin!(leg_a);
    tokio::pin!(leg_b);

    let mut a_done = false;
    let mut b_done = false;
    let mut a_err: Option<PdsError> = None;
    let mut b_err: Option<PdsError> = None;

    while !(a_done && b_done) {
        tokio::select! {
            result = &mut leg_a, if !a_done => {
                a_done = true;
                match result {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(e)) => a_err = Some(e),
                    Err(_) => {
                        a_err = Some(PdsError::UpstreamTimeout(
                            "handle resolution timed out".to_string(),
                        ))
                    }
                }
            }
            result = &mut leg_b, if !b_done => {
                b_done = true;
                match result {
                    Ok(Ok(value)) => return Ok(value),
                    Ok(Err(e)) => b_err = Some(e),
                    Err(_) => {
                        b_err = Some(PdsError::UpstreamTimeout(
                            "handle resolution timed out".to_string(),
                        ))
                    }
                }
            }
        }
    }
    Err(b_err
        .or(a_err)
        .unwrap_or_else(|| PdsError::internal("resolution race finished with no result")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    async fn resolver() -> IdentityResolver {
        let db = crate::db::memory_pool().await.unwrap();
        let cache = DidCache::new(
            db,
            ChronoDuration::seconds(3600),
            ChronoDuration::seconds(86400),
        )
        .await
        .unwrap();
        IdentityResolver::new(
            IdentityResolverConfig::default(),
            cache,
            FileCache::disabled(),
        )
        .unwrap()
    }

    fn doc_with_handle(did: &str, handle: &str) -> DidDocument {
        DidDocument {
            id: did.to_string(),
            also_known_as: vec![format!("at://{}", handle)],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cached_handle_short_circuits_network() {
        let resolver = resolver().await;
        resolver
            .cache
            .put_handle("alice.test", "did:plc:alice")
            .await
            .unwrap();
        let did = resolver.resolve_handle("ALICE.test").await.unwrap();
        assert_eq!(did, "did:plc:alice");
    }

    #[tokio::test]
    async fn test_cached_lookup_verifies_declared_handle() {
        let resolver = resolver().await;
        resolver
            .cache
            .put_handle("alice.test", "did:plc:alice")
            .await
            .unwrap();
        resolver
            .cache
            .put_doc("did:plc:alice", &doc_with_handle("did:plc:alice", "alice.test"))
            .await
            .unwrap();

        let identity = resolver.lookup("alice.test").await.unwrap();
        assert_eq!(identity.did, "did:plc:alice");
        assert_eq!(identity.handle.as_deref(), Some("alice.test"));
        assert!(!identity.handle_mismatch);
    }

    #[tokio::test]
    async fn test_mismatched_document_flags_partial_identity() {
        let resolver = resolver().await;
        resolver
            .cache
            .put_handle("alice.test", "did:plc:alice")
            .await
            .unwrap();
        // Document declares a different handle
        resolver
            .cache
            .put_doc("did:plc:alice", &doc_with_handle("did:plc:alice", "eve.test"))
            .await
            .unwrap();

        let identity = resolver.lookup("alice.test").await.unwrap();
        assert_eq!(identity.did, "did:plc:alice");
        assert!(identity.handle.is_none());
        assert!(identity.handle_mismatch);
    }

    #[tokio::test]
    async fn test_purge_clears_handle_and_doc() {
        let resolver = resolver().await;
        resolver
            .prime(
                "bob.test",
                "did:plc:bob",
                &doc_with_handle("did:plc:bob", "bob.test"),
            )
            .await
            .unwrap();
        resolver.purge("bob.test").await.unwrap();
        assert!(resolver.cache.get_handle("bob.test").await.unwrap().is_none());
        assert!(resolver.cache.get_doc("did:plc:bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_race_prefers_first_success() {
        let fast = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, PdsError>("fast".to_string())
        };
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, PdsError>("slow".to_string())
        };
        let started = std::time::Instant::now();
        let winner = race_first_success(Duration::from_secs(1), slow, fast)
            .await
            .unwrap();
        assert_eq!(winner, "fast");
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_race_failure_waits_for_both_and_reports_second_leg() {
        let dns = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<String, _>(PdsError::HandleResolutionFailed("dns says no".to_string()))
        };
        let http = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<String, _>(PdsError::HandleResolutionFailed("http says no".to_string()))
        };
        let err = race_first_success(Duration::from_secs(1), dns, http)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("http says no"));
    }

    #[tokio::test]
    async fn test_race_success_beats_failure() {
        let failing = async {
            Err::<String, _>(PdsError::HandleResolutionFailed("nope".to_string()))
        };
        let succeeding = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, PdsError>("did:plc:won".to_string())
        };
        let winner = race_first_success(Duration::from_secs(1), failing, succeeding)
            .await
            .unwrap();
        assert_eq!(winner, "did:plc:won");
    }

    #[tokio::test]
    async fn test_unsupported_did_method() {
        let resolver = resolver().await;
        let err = resolver.resolve_did("did:key:zabc").await.unwrap_err();
        // did:key is syntactically valid but not resolvable
        assert!(matches!(err, PdsError::DidNotFound(_)));
    }
}
