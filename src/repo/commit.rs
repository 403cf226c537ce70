/// Signed repository commits
///
/// A commit block caps the tree: `{did, version, prev, data, rev, sig}`
/// where `data` is the MST root CID and `sig` is an ECDSA secp256k1
/// signature over the DAG-CBOR encoding of the unsigned form.
use k256::ecdsa::signature::Verifier;
use k256::ecdsa::{Signature, VerifyingKey};
use libipld::{Cid, Ipld};
use std::collections::BTreeMap;

use crate::crypto::Signer;
use crate::error::{PdsError, PdsResult};
use crate::repo::{dag, REPO_VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedCommit {
    pub did: String,
    pub version: i64,
    pub prev: Option<Cid>,
    pub data: Cid,
    pub rev: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCommit {
    pub did: String,
    pub version: i64,
    pub prev: Option<Cid>,
    pub data: Cid,
    pub rev: String,
    pub sig: Vec<u8>,
}

fn commit_fields(
    did: &str,
    version: i64,
    prev: Option<Cid>,
    data: Cid,
    rev: &str,
) -> BTreeMap<String, Ipld> {
    let mut map = BTreeMap::new();
    map.insert("did".to_string(), Ipld::String(did.to_string()));
    map.insert("version".to_string(), Ipld::Integer(version as i128));
    map.insert(
        "prev".to_string(),
        match prev {
            Some(cid) => Ipld::Link(cid),
            None => Ipld::Null,
        },
    );
    map.insert("data".to_string(), Ipld::Link(data));
    map.insert("rev".to_string(), Ipld::String(rev.to_string()));
    map
}

impl UnsignedCommit {
    pub fn to_ipld(&self) -> Ipld {
        Ipld::Map(commit_fields(
            &self.did,
            self.version,
            self.prev,
            self.data,
            &self.rev,
        ))
    }
}

impl SignedCommit {
    pub fn to_ipld(&self) -> Ipld {
        let mut map = commit_fields(&self.did, self.version, self.prev, self.data, &self.rev);
        map.insert("sig".to_string(), Ipld::Bytes(self.sig.clone()));
        Ipld::Map(map)
    }

    /// Canonical block bytes and CID
    pub fn to_block(&self) -> PdsResult<(Cid, Vec<u8>)> {
        dag::cid_for_ipld(&self.to_ipld())
    }

    /// Strip the signature back off
    pub fn unsigned(&self) -> UnsignedCommit {
        UnsignedCommit {
            did: self.did.clone(),
            version: self.version,
            prev: self.prev,
            data: self.data,
            rev: self.rev.clone(),
        }
    }

    pub fn from_ipld(value: &Ipld) -> PdsResult<Self> {
        let map = match value {
            Ipld::Map(map) => map,
            _ => return Err(PdsError::internal("commit block is not a map")),
        };
        let did = match map.get("did") {
            Some(Ipld::String(s)) => s.clone(),
            _ => return Err(PdsError::internal("commit missing did")),
        };
        let version = match map.get("version") {
            Some(Ipld::Integer(n)) => *n as i64,
            _ => return Err(PdsError::internal("commit missing version")),
        };
        if version != REPO_VERSION {
            return Err(PdsError::invalid_request(format!(
                "unsupported repo version {}",
                version
            )));
        }
        let prev = match map.get("prev") {
            Some(Ipld::Link(cid)) => Some(*cid),
            Some(Ipld::Null) | None => None,
            _ => return Err(PdsError::internal("commit has invalid prev link")),
        };
        let data = match map.get("data") {
            Some(Ipld::Link(cid)) => *cid,
            _ => return Err(PdsError::internal("commit missing data link")),
        };
        let rev = match map.get("rev") {
            Some(Ipld::String(s)) => s.clone(),
            _ => return Err(PdsError::internal("commit missing rev")),
        };
        let sig = match map.get("sig") {
            Some(Ipld::Bytes(b)) => b.clone(),
            _ => return Err(PdsError::internal("commit missing signature")),
        };
        Ok(SignedCommit {
            did,
            version,
            prev,
            data,
            rev,
            sig,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> PdsResult<Self> {
        Self::from_ipld(&dag::decode(bytes)?)
    }
}

/// Sign an unsigned commit with the actor's signing key
pub fn sign_commit(unsigned: &UnsignedCommit, signer: &dyn Signer) -> PdsResult<SignedCommit> {
    let bytes = dag::encode(&unsigned.to_ipld())?;
    let sig = signer.sign(&bytes)?;
    Ok(SignedCommit {
        did: unsigned.did.clone(),
        version: unsigned.version,
        prev: unsigned.prev,
        data: unsigned.data,
        rev: unsigned.rev.clone(),
        sig,
    })
}

/// Verify a commit signature against a compressed secp256k1 public key
pub fn verify_commit_sig(commit: &SignedCommit, public_key: &[u8]) -> PdsResult<bool> {
    let key = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| PdsError::invalid_request(format!("invalid public key: {}", e)))?;
    let sig = match Signature::from_slice(&commit.sig) {
        Ok(sig) => sig,
        Err(_) => return Ok(false),
    };
    let bytes = dag::encode(&commit.unsigned().to_ipld())?;
    Ok(key.verify(&bytes, &sig).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn test_commit(data: Cid) -> UnsignedCommit {
        UnsignedCommit {
            did: "did:plc:commit-test".to_string(),
            version: REPO_VERSION,
            prev: None,
            data,
            rev: "3jzfcijpj2z2a".to_string(),
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::generate();
        let (data, _) = dag::cid_for_ipld(&Ipld::String("root".to_string())).unwrap();
        let signed = sign_commit(&test_commit(data), &keypair).unwrap();
        assert!(verify_commit_sig(&signed, &keypair.public_key_compressed()).unwrap());
    }

    #[test]
    fn test_tampered_commit_fails_verification() {
        let keypair = Keypair::generate();
        let (data, _) = dag::cid_for_ipld(&Ipld::String("root".to_string())).unwrap();
        let mut signed = sign_commit(&test_commit(data), &keypair).unwrap();
        signed.rev = "3jzfcijpj2z2b".to_string();
        assert!(!verify_commit_sig(&signed, &keypair.public_key_compressed()).unwrap());
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let (data, _) = dag::cid_for_ipld(&Ipld::String("root".to_string())).unwrap();
        let signed = sign_commit(&test_commit(data), &keypair).unwrap();
        assert!(!verify_commit_sig(&signed, &other.public_key_compressed()).unwrap());
    }

    #[test]
    fn test_commit_block_round_trip() {
        let keypair = Keypair::generate();
        let (data, _) = dag::cid_for_ipld(&Ipld::String("root".to_string())).unwrap();
        let signed = sign_commit(&test_commit(data), &keypair).unwrap();
        let (cid, bytes) = signed.to_block().unwrap();
        let decoded = SignedCommit::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, signed);
        assert_eq!(dag::cid_for_bytes(&bytes), cid);
    }
}
