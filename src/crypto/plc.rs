/// PLC registry operations
///
/// DIDs under the `plc` method are derived from their signed genesis
/// operation: `did:plc:` plus the first 24 base32 characters of the
/// SHA-256 of the operation's DAG-CBOR encoding. The registry client
/// submits operations over HTTP; in dev mode the DID is derived locally
/// and nothing leaves the process.
use base32::Alphabet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::crypto::Signer;
use crate::error::{PdsError, PdsResult};

/// A PLC operation, genesis or update
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlcOperation {
    #[serde(rename = "type")]
    pub op_type: String,
    pub rotation_keys: Vec<String>,
    pub verification_methods: BTreeMap<String, String>,
    pub also_known_as: Vec<String>,
    pub services: BTreeMap<String, PlcService>,
    pub prev: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlcService {
    #[serde(rename = "type")]
    pub service_type: String,
    pub endpoint: String,
}

impl PlcOperation {
    /// Genesis operation for a fresh actor
    pub fn genesis(
        signing_did_key: String,
        rotation_did_key: String,
        handle: &str,
        pds_endpoint: &str,
    ) -> Self {
        let mut verification_methods = BTreeMap::new();
        verification_methods.insert("atproto".to_string(), signing_did_key);
        let mut services = BTreeMap::new();
        services.insert(
            "atproto_pds".to_string(),
            PlcService {
                service_type: "AtprotoPersonalDataServer".to_string(),
                endpoint: pds_endpoint.to_string(),
            },
        );
        Self {
            op_type: "plc_operation".to_string(),
            rotation_keys: vec![rotation_did_key],
            verification_methods,
            also_known_as: vec![format!("at://{}", handle)],
            services,
            prev: None,
            sig: None,
        }
    }

    /// Sign with a rotation key; the signature covers the CBOR encoding of
    /// the unsigned form and is stored base64url unpadded.
    pub fn sign(mut self, key: &dyn Signer) -> PdsResult<Self> {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
        self.sig = None;
        let bytes = serde_cbor::to_vec(&self)
            .map_err(|e| PdsError::internal(format!("failed to encode PLC operation: {}", e)))?;
        let sig = key.sign(&bytes)?;
        self.sig = Some(URL_SAFE_NO_PAD.encode(sig));
        Ok(self)
    }

    /// Derive the DID named by this (signed) genesis operation
    pub fn derive_did(&self) -> PdsResult<String> {
        if self.sig.is_none() {
            return Err(PdsError::internal("cannot derive DID from unsigned operation"));
        }
        let bytes = serde_cbor::to_vec(self)
            .map_err(|e| PdsError::internal(format!("failed to encode PLC operation: {}", e)))?;
        let hash = Sha256::digest(&bytes);
        let encoded = base32::encode(Alphabet::Rfc4648Lower { padding: false }, &hash);
        Ok(format!("did:plc:{}", &encoded[..24]))
    }
}

/// Client for the PLC directory
#[derive(Clone)]
pub struct PlcClient {
    url: String,
    http: reqwest::Client,
    /// Dev mode derives DIDs locally and skips the network
    dev_mode: bool,
}

impl PlcClient {
    pub fn new(url: String, dev_mode: bool) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
            dev_mode,
        }
    }

    /// Create a new DID from a signed genesis operation
    pub async fn create_did(&self, operation: &PlcOperation) -> PdsResult<String> {
        let did = operation.derive_did()?;
        if self.dev_mode {
            tracing::debug!(%did, "dev-mode PLC registration");
            return Ok(did);
        }
        let endpoint = format!("{}/{}", self.url.trim_end_matches('/'), did);
        let response = self
            .http
            .post(&endpoint)
            .json(operation)
            .send()
            .await
            .map_err(|e| PdsError::UpstreamFailure(format!("PLC registration failed: {}", e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PdsError::UpstreamFailure(format!(
                "PLC directory returned {}: {}",
                status, body
            )));
        }
        Ok(did)
    }

    /// Fetch the DID document for a `did:plc` identifier
    pub async fn get_document(&self, did: &str) -> PdsResult<serde_json::Value> {
        let endpoint = format!("{}/{}", self.url.trim_end_matches('/'), did);
        let response = self
            .http
            .get(&endpoint)
            .send()
            .await
            .map_err(|e| PdsError::UpstreamFailure(format!("PLC lookup failed: {}", e)))?;
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn signed_genesis() -> PlcOperation {
        let signing = Keypair::generate();
        let rotation = Keypair::generate();
        PlcOperation::genesis(
            signing.did_key(),
            rotation.did_key(),
            "alice.test",
            "https://pds.test",
        )
        .sign(&rotation)
        .unwrap()
    }

    #[test]
    fn test_derive_did_shape() {
        let did = signed_genesis().derive_did().unwrap();
        assert!(did.starts_with("did:plc:"));
        assert_eq!(did.len(), "did:plc:".len() + 24);
    }

    #[test]
    fn test_derive_did_is_deterministic() {
        let op = signed_genesis();
        assert_eq!(op.derive_did().unwrap(), op.derive_did().unwrap());
    }

    #[test]
    fn test_unsigned_operation_has_no_did() {
        let signing = Keypair::generate();
        let rotation = Keypair::generate();
        let op = PlcOperation::genesis(
            signing.did_key(),
            rotation.did_key(),
            "bob.test",
            "https://pds.test",
        );
        assert!(op.derive_did().is_err());
    }

    #[tokio::test]
    async fn test_dev_mode_skips_network() {
        let client = PlcClient::new("https://plc.invalid".to_string(), true);
        let did = client.create_did(&signed_genesis()).await.unwrap();
        assert!(did.starts_with("did:plc:"));
    }
}
