/// Write preparation
///
/// Raw write requests (JSON bodies, collection/rkey strings) become
/// `PreparedWrite`s: validated, CID-stamped, with blob references
/// extracted. The transactor consumes prepared writes only.
use libipld::{Cid, Ipld};

use crate::error::{PdsError, PdsResult};
use crate::repo::{dag, RecordWrite, TidClock, WriteAction};
use crate::validation;

/// Maximum encoded record size
const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// A blob reference found inside a prepared record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedBlobRef {
    pub cid: Cid,
}

/// A validated write ready for the transactor
#[derive(Debug, Clone)]
pub struct PreparedWrite {
    pub action: WriteAction,
    pub uri: String,
    pub collection: String,
    pub rkey: String,
    /// Record body and its CID; absent for deletes
    pub record: Option<Ipld>,
    pub cid: Option<Cid>,
    pub blobs: Vec<PreparedBlobRef>,
    /// Expected CID of the record currently at this URI
    pub swap_cid: Option<Cid>,
    /// Whether the swap assertion was supplied at all
    pub swap_requested: bool,
}

impl PreparedWrite {
    pub fn data_key(&self) -> String {
        format!("{}/{}", self.collection, self.rkey)
    }

    pub fn to_record_write(&self) -> RecordWrite {
        RecordWrite {
            action: self.action,
            collection: self.collection.clone(),
            rkey: self.rkey.clone(),
            record: self.record.clone(),
        }
    }
}

fn prepare_record(
    did: &str,
    collection: &str,
    rkey: &str,
    record_json: &serde_json::Value,
) -> PdsResult<(String, Ipld, Cid, Vec<PreparedBlobRef>)> {
    validation::ensure_valid_nsid(collection)?;
    validation::ensure_valid_rkey(rkey)?;

    let record = dag::ipld_from_json(record_json)?;
    match &record {
        Ipld::Map(map) => match map.get("$type") {
            Some(Ipld::String(declared)) if declared == collection => {}
            Some(_) => {
                return Err(PdsError::invalid_request(
                    "Record $type does not match the target collection",
                ))
            }
            None => {
                return Err(PdsError::invalid_request("Record is missing a $type field"))
            }
        },
        _ => return Err(PdsError::invalid_request("Record must be an object")),
    }

    let (cid, bytes) = dag::cid_for_ipld(&record)?;
    if bytes.len() > MAX_RECORD_BYTES {
        return Err(PdsError::invalid_request(format!(
            "Record is too large: {} bytes",
            bytes.len()
        )));
    }

    let mut blob_cids = Vec::new();
    dag::blob_refs_in(&record, &mut blob_cids);
    let blobs = blob_cids
        .into_iter()
        .map(|cid| PreparedBlobRef { cid })
        .collect();

    let uri = format!("at://{}/{}/{}", did, collection, rkey);
    Ok((uri, record, cid, blobs))
}

/// Prepare a create; a missing rkey gets a fresh TID
pub fn prepare_create(
    did: &str,
    collection: &str,
    rkey: Option<&str>,
    record: &serde_json::Value,
    swap_cid: Option<Cid>,
    clock: &TidClock,
) -> PdsResult<PreparedWrite> {
    let rkey = match rkey {
        Some(k) => k.to_string(),
        None => clock.next(),
    };
    let (uri, record, cid, blobs) = prepare_record(did, collection, &rkey, record)?;
    Ok(PreparedWrite {
        action: WriteAction::Create,
        uri,
        collection: collection.to_string(),
        rkey,
        record: Some(record),
        cid: Some(cid),
        blobs,
        swap_requested: swap_cid.is_some(),
        swap_cid,
    })
}

pub fn prepare_update(
    did: &str,
    collection: &str,
    rkey: &str,
    record: &serde_json::Value,
    swap_cid: Option<Cid>,
) -> PdsResult<PreparedWrite> {
    let (uri, record, cid, blobs) = prepare_record(did, collection, rkey, record)?;
    Ok(PreparedWrite {
        action: WriteAction::Update,
        uri,
        collection: collection.to_string(),
        rkey: rkey.to_string(),
        record: Some(record),
        cid: Some(cid),
        blobs,
        swap_requested: swap_cid.is_some(),
        swap_cid,
    })
}

pub fn prepare_delete(
    did: &str,
    collection: &str,
    rkey: &str,
    swap_cid: Option<Cid>,
) -> PdsResult<PreparedWrite> {
    validation::ensure_valid_nsid(collection)?;
    validation::ensure_valid_rkey(rkey)?;
    Ok(PreparedWrite {
        action: WriteAction::Delete,
        uri: format!("at://{}/{}/{}", did, collection, rkey),
        collection: collection.to_string(),
        rkey: rkey.to_string(),
        record: None,
        cid: None,
        blobs: Vec::new(),
        swap_requested: swap_cid.is_some(),
        swap_cid,
    })
}

/// Cross-write batch checks: no duplicate keys, sane batch size
pub fn validate_batch(writes: &[PreparedWrite]) -> PdsResult<()> {
    const MAX_BATCH: usize = 200;
    if writes.len() > MAX_BATCH {
        return Err(PdsError::invalid_request(format!(
            "Batch exceeds {} writes",
            MAX_BATCH
        )));
    }
    let mut seen = std::collections::HashSet::new();
    for write in writes {
        if !seen.insert(write.data_key()) {
            return Err(PdsError::invalid_request(format!(
                "Duplicate operation for {}",
                write.data_key()
            )));
        }
    }
    Ok(())
}
