/// Key management and signing
///
/// Commit signing, PLC operations, and service JWTs all use secp256k1
/// ECDSA. The `Signer` capability hides where key material lives so the
/// on-disk layout can be swapped for hardware-backed keys.

pub mod plc;

use k256::ecdsa::signature::Signer as _;
use k256::ecdsa::{Signature, SigningKey};
use k256::SecretKey;
use rand::RngCore;
use std::path::Path;

use crate::error::{PdsError, PdsResult};

/// Multicodec prefix for secp256k1 public keys (varint of 0xe7)
const SECP256K1_MULTICODEC: [u8; 2] = [0xe7, 0x01];

/// Signing capability for an actor
pub trait Signer: Send + Sync {
    /// ECDSA signature over `sha256(msg)`, 64 bytes
    fn sign(&self, msg: &[u8]) -> PdsResult<Vec<u8>>;

    /// Compressed SEC1 public key (33 bytes)
    fn public_key_compressed(&self) -> Vec<u8>;

    /// `did:key` form of the public key (multibase base58btc)
    fn did_key(&self) -> String;
}

/// secp256k1 keypair held in memory
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        loop {
            rand::thread_rng().fill_bytes(&mut secret);
            if let Ok(key) = SecretKey::from_slice(&secret) {
                return Self {
                    signing_key: SigningKey::from(key),
                };
            }
        }
    }

    /// Restore a keypair from a raw 32-byte secret
    pub fn from_bytes(secret: &[u8]) -> PdsResult<Self> {
        if secret.len() != 32 {
            return Err(PdsError::invalid_request(
                "private key must be exactly 32 bytes",
            ));
        }
        let key = SecretKey::from_slice(secret)
            .map_err(|e| PdsError::internal(format!("invalid private key: {}", e)))?;
        Ok(Self {
            signing_key: SigningKey::from(key),
        })
    }

    /// Restore a keypair from a hex-encoded secret
    pub fn from_hex(hex_key: &str) -> PdsResult<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| PdsError::invalid_request(format!("invalid hex private key: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Raw 32-byte secret
    pub fn secret_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }

    /// Load a key file written by `save_to_file`
    pub fn load_from_file(path: &Path) -> PdsResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Persist the raw secret, readable only by the server user
    pub fn save_to_file(&self, path: &Path) -> PdsResult<()> {
        std::fs::write(path, self.secret_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    pub fn verifying_key(&self) -> k256::ecdsa::VerifyingKey {
        *self.signing_key.verifying_key()
    }
}

impl Signer for Keypair {
    fn sign(&self, msg: &[u8]) -> PdsResult<Vec<u8>> {
        let signature: Signature = self.signing_key.sign(msg);
        Ok(signature.to_bytes().to_vec())
    }

    fn public_key_compressed(&self) -> Vec<u8> {
        self.signing_key
            .verifying_key()
            .to_encoded_point(true)
            .as_bytes()
            .to_vec()
    }

    fn did_key(&self) -> String {
        let mut data = SECP256K1_MULTICODEC.to_vec();
        data.extend_from_slice(&self.public_key_compressed());
        format!("did:key:z{}", bs58::encode(data).into_string())
    }
}

/// Extract the compressed public key from a `did:key` string
pub fn public_key_from_did_key(did_key: &str) -> PdsResult<Vec<u8>> {
    let encoded = did_key
        .strip_prefix("did:key:")
        .ok_or_else(|| PdsError::invalid_request(format!("not a did:key: {:?}", did_key)))?;
    public_key_from_multibase(encoded)
}

/// Extract the compressed public key from a multibase string (`z...`)
pub fn public_key_from_multibase(multibase: &str) -> PdsResult<Vec<u8>> {
    let encoded = multibase
        .strip_prefix('z')
        .ok_or_else(|| PdsError::invalid_request("unsupported multibase prefix"))?;
    let data = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| PdsError::invalid_request(format!("invalid multibase encoding: {}", e)))?;
    if data.len() < 2 || data[..2] != SECP256K1_MULTICODEC {
        return Err(PdsError::invalid_request(
            "key is not a secp256k1 multikey",
        ));
    }
    Ok(data[2..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::signature::Verifier;

    #[test]
    fn test_sign_produces_valid_signature() {
        let keypair = Keypair::generate();
        let msg = b"the bytes to sign";
        let sig = keypair.sign(msg).unwrap();
        assert_eq!(sig.len(), 64);
        let parsed = Signature::from_slice(&sig).unwrap();
        assert!(keypair.verifying_key().verify(msg, &parsed).is_ok());
    }

    #[test]
    fn test_did_key_round_trip() {
        let keypair = Keypair::generate();
        let did_key = keypair.did_key();
        assert!(did_key.starts_with("did:key:z"));
        let recovered = public_key_from_did_key(&did_key).unwrap();
        assert_eq!(recovered, keypair.public_key_compressed());
    }

    #[test]
    fn test_key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        let keypair = Keypair::generate();
        keypair.save_to_file(&path).unwrap();
        let loaded = Keypair::load_from_file(&path).unwrap();
        assert_eq!(loaded.secret_bytes(), keypair.secret_bytes());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(Keypair::from_bytes(&[1u8; 16]).is_err());
    }
}
