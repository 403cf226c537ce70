/// Identity resolution - handles, DIDs, and documents
///
/// The resolver is the trust anchor for cross-server operations. Three
/// cache layers sit in front of the network: an in-memory LRU, a SQLite
/// cache with stale/max TTLs, and a best-effort filesystem cache.

pub mod cache;
pub mod file_cache;
pub mod memory;
pub mod resolver;

pub use cache::DidCache;
pub use file_cache::FileCache;
pub use memory::MemoryCache;
pub use resolver::{IdentityResolver, IdentityResolverConfig};

use serde::{Deserialize, Serialize};

/// A DID document as served by the PLC directory or a did:web host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub verification_method: Vec<VerificationMethod>,
    #[serde(default)]
    pub service: Vec<DidService>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,
    #[serde(rename = "type")]
    pub method_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_multibase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidService {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub service_endpoint: String,
}

impl DidDocument {
    /// Handle declared in `alsoKnownAs`, without the `at://` prefix
    pub fn declared_handle(&self) -> Option<&str> {
        self.also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
    }

    /// The `atproto` signing key, multibase form
    pub fn signing_key_multibase(&self) -> Option<&str> {
        self.verification_method
            .iter()
            .find(|m| m.id.ends_with("#atproto"))
            .and_then(|m| m.public_key_multibase.as_deref())
    }

    /// The declared PDS endpoint
    pub fn pds_endpoint(&self) -> Option<&str> {
        self.service
            .iter()
            .find(|s| s.service_type == "AtprotoPersonalDataServer")
            .map(|s| s.service_endpoint.as_str())
    }
}

/// A resolved identity
#[derive(Debug, Clone)]
pub struct Identity {
    pub did: String,
    /// Verified handle; `None` when the document disagrees
    pub handle: Option<String>,
    pub doc: DidDocument,
    /// Set when the declared handle failed bidirectional verification
    pub handle_mismatch: bool,
}
