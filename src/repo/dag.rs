/// DAG-CBOR encoding and CID derivation
///
/// The canonical form of every block is its DAG-CBOR encoding; CIDs are
/// v1 with the dag-cbor codec over a SHA-256 multihash. JSON is a derived
/// projection in which links become `{"$link": "<cid>"}` and byte strings
/// become `{"$bytes": "<base64>"}`.
use base64::{engine::general_purpose::STANDARD, Engine as _};
use libipld::{
    cbor::DagCborCodec,
    codec::Codec,
    multihash::{Code, MultihashDigest},
    Cid, Ipld,
};
use std::collections::BTreeMap;

use crate::error::{PdsError, PdsResult};

/// Multicodec code for dag-cbor
const DAG_CBOR_CODE: u64 = 0x71;

/// Encode a value to canonical DAG-CBOR bytes
pub fn encode(value: &Ipld) -> PdsResult<Vec<u8>> {
    DagCborCodec
        .encode(value)
        .map_err(|e| PdsError::internal(format!("dag-cbor encode failed: {}", e)))
}

/// Decode DAG-CBOR bytes back into an IPLD value
pub fn decode(bytes: &[u8]) -> PdsResult<Ipld> {
    DagCborCodec
        .decode(bytes)
        .map_err(|e| PdsError::internal(format!("dag-cbor decode failed: {}", e)))
}

/// CID over raw dag-cbor bytes
pub fn cid_for_bytes(bytes: &[u8]) -> Cid {
    Cid::new_v1(DAG_CBOR_CODE, Code::Sha2_256.digest(bytes))
}

/// Encode a value and derive its CID
pub fn cid_for_ipld(value: &Ipld) -> PdsResult<(Cid, Vec<u8>)> {
    let bytes = encode(value)?;
    Ok((cid_for_bytes(&bytes), bytes))
}

/// Parse a CID from its string form
pub fn parse_cid(s: &str) -> PdsResult<Cid> {
    s.parse::<Cid>()
        .map_err(|e| PdsError::invalid_request(format!("invalid CID {:?}: {}", s, e)))
}

/// Convert a JSON record body into IPLD
///
/// `{"$link": "<cid>"}` maps become links and `{"$bytes": "<base64>"}` maps
/// become byte strings; everything else converts structurally. Floats
/// without a fractional part arrive from JSON as integers.
pub fn ipld_from_json(value: &serde_json::Value) -> PdsResult<Ipld> {
    Ok(match value {
        serde_json::Value::Null => Ipld::Null,
        serde_json::Value::Bool(b) => Ipld::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ipld::Integer(i as i128)
            } else {
                Ipld::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Ipld::String(s.clone()),
        serde_json::Value::Array(items) => {
            let mut list = Vec::with_capacity(items.len());
            for item in items {
                list.push(ipld_from_json(item)?);
            }
            Ipld::List(list)
        }
        serde_json::Value::Object(map) => {
            if map.len() == 1 {
                if let Some(serde_json::Value::String(link)) = map.get("$link") {
                    return Ok(Ipld::Link(parse_cid(link)?));
                }
                if let Some(serde_json::Value::String(b64)) = map.get("$bytes") {
                    let bytes = STANDARD.decode(b64).map_err(|e| {
                        PdsError::invalid_request(format!("invalid $bytes value: {}", e))
                    })?;
                    return Ok(Ipld::Bytes(bytes));
                }
            }
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), ipld_from_json(v)?);
            }
            Ipld::Map(out)
        }
    })
}

/// Project an IPLD value back into JSON
pub fn json_from_ipld(value: &Ipld) -> serde_json::Value {
    match value {
        Ipld::Null => serde_json::Value::Null,
        Ipld::Bool(b) => serde_json::Value::Bool(*b),
        Ipld::Integer(i) => serde_json::json!(*i as i64),
        Ipld::Float(f) => serde_json::json!(f),
        Ipld::String(s) => serde_json::Value::String(s.clone()),
        Ipld::Bytes(b) => serde_json::json!({ "$bytes": STANDARD.encode(b) }),
        Ipld::List(items) => {
            serde_json::Value::Array(items.iter().map(json_from_ipld).collect())
        }
        Ipld::Map(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), json_from_ipld(v));
            }
            serde_json::Value::Object(out)
        }
        Ipld::Link(cid) => serde_json::json!({ "$link": cid.to_string() }),
    }
}

/// Collect every blob reference (`$type: blob`) inside a record
///
/// Blob refs carry a `ref` link, a `mimeType`, and a `size`; the returned
/// CIDs are what the record pins in the blob store.
pub fn blob_refs_in(value: &Ipld, out: &mut Vec<Cid>) {
    match value {
        Ipld::Map(map) => {
            let is_blob = matches!(map.get("$type"), Some(Ipld::String(t)) if t == "blob");
            if is_blob {
                if let Some(Ipld::Link(cid)) = map.get("ref") {
                    out.push(*cid);
                    return;
                }
            }
            for v in map.values() {
                blob_refs_in(v, out);
            }
        }
        Ipld::List(items) => {
            for v in items {
                blob_refs_in(v, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_is_deterministic() {
        let value = Ipld::Map(BTreeMap::from([
            ("text".to_string(), Ipld::String("hi".to_string())),
            (
                "$type".to_string(),
                Ipld::String("app.bsky.feed.post".to_string()),
            ),
        ]));
        let (a, bytes_a) = cid_for_ipld(&value).unwrap();
        let (b, bytes_b) = cid_for_ipld(&value).unwrap();
        assert_eq!(a, b);
        assert_eq!(bytes_a, bytes_b);
        assert_eq!(a, cid_for_bytes(&bytes_a));
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let value = Ipld::Map(BTreeMap::from([
            ("a".to_string(), Ipld::Integer(7)),
            ("bb".to_string(), Ipld::List(vec![Ipld::Bool(true), Ipld::Null])),
            ("c".to_string(), Ipld::Bytes(vec![1, 2, 3])),
        ]));
        let bytes = encode(&value).unwrap();
        assert_eq!(decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_json_link_projection() {
        let (cid, _) = cid_for_ipld(&Ipld::String("x".to_string())).unwrap();
        let json = serde_json::json!({ "subject": { "$link": cid.to_string() } });
        let ipld = ipld_from_json(&json).unwrap();
        match &ipld {
            Ipld::Map(m) => assert!(matches!(m.get("subject"), Some(Ipld::Link(c)) if *c == cid)),
            _ => panic!("expected map"),
        }
        assert_eq!(json_from_ipld(&ipld), json);
    }

    #[test]
    fn test_blob_ref_collection() {
        let (cid, _) = cid_for_ipld(&Ipld::String("blobdata".to_string())).unwrap();
        let json = serde_json::json!({
            "embed": {
                "image": {
                    "$type": "blob",
                    "ref": { "$link": cid.to_string() },
                    "mimeType": "image/png",
                    "size": 4
                }
            }
        });
        let ipld = ipld_from_json(&json).unwrap();
        let mut refs = Vec::new();
        blob_refs_in(&ipld, &mut refs);
        assert_eq!(refs, vec![cid]);
    }
}
