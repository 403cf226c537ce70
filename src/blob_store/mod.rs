/// Blob store - content-addressed binary sidecar storage
///
/// Blobs move through three regions: `temp` (keyed by an opaque upload
/// key), `permanent` (keyed by CID), and `quarantine`. A CID lives in at
/// most one region at a time. The disk backend is the default; the trait
/// keeps the door open for object-storage backends.

pub mod disk;

pub use disk::DiskBlobStore;

use async_trait::async_trait;
use libipld::multihash::{Code, MultihashDigest};
use libipld::Cid;

use crate::error::PdsResult;

/// Multicodec code for raw blocks; blob CIDs hash the raw bytes
const RAW_CODE: u64 = 0x55;

/// CID for blob content
pub fn blob_cid(bytes: &[u8]) -> Cid {
    Cid::new_v1(RAW_CODE, Code::Sha2_256.digest(bytes))
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stage bytes in temp storage; returns the opaque temp key
    async fn put_temp(&self, did: &str, bytes: &[u8]) -> PdsResult<String>;

    /// Promote a staged upload to permanent storage under its CID.
    /// Idempotent: if the CID already exists the temp file is discarded.
    async fn make_permanent(&self, did: &str, key: &str, cid: &Cid) -> PdsResult<()>;

    /// Write directly into permanent storage
    async fn put_permanent(&self, did: &str, cid: &Cid, bytes: &[u8]) -> PdsResult<()>;

    /// Read from permanent storage only; fails with `BlobNotFound`
    async fn get_bytes(&self, did: &str, cid: &Cid) -> PdsResult<Vec<u8>>;

    /// Whether a CID exists in permanent storage
    async fn has_stored(&self, did: &str, cid: &Cid) -> PdsResult<bool>;

    /// Whether a temp key is still staged
    async fn has_temp(&self, did: &str, key: &str) -> PdsResult<bool>;

    /// Delete from permanent storage; absent objects are not an error
    async fn delete(&self, did: &str, cid: &Cid) -> PdsResult<()>;

    async fn delete_many(&self, did: &str, cids: &[Cid]) -> PdsResult<()>;

    /// Remove every object (all regions) belonging to an actor
    async fn delete_all(&self, did: &str) -> PdsResult<()>;

    /// Move a blob from permanent to quarantine; fails with `BlobNotFound`
    async fn quarantine(&self, did: &str, cid: &Cid) -> PdsResult<()>;

    /// Move a blob back from quarantine; fails with `BlobNotFound`
    async fn unquarantine(&self, did: &str, cid: &Cid) -> PdsResult<()>;

    /// Temp keys older than the cutoff, for the maintenance sweep
    async fn stale_temp_keys(&self, cutoff: std::time::SystemTime) -> PdsResult<Vec<(String, String)>>;

    /// Drop one staged temp object
    async fn delete_temp(&self, did: &str, key: &str) -> PdsResult<()>;
}
