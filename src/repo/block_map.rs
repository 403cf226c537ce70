/// BlockMap - in-memory CID -> bytes collection
///
/// Accumulates the blocks produced while formatting a commit before they
/// are persisted in one batch.
use libipld::{Cid, Ipld};
use std::collections::HashMap;

use crate::error::PdsResult;
use crate::repo::dag;

#[derive(Debug, Clone, Default)]
pub struct BlockMap {
    map: HashMap<Cid, Vec<u8>>,
}

impl BlockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a value, store its block, and return the CID
    pub fn add(&mut self, value: &Ipld) -> PdsResult<Cid> {
        let (cid, bytes) = dag::cid_for_ipld(value)?;
        self.map.insert(cid, bytes);
        Ok(cid)
    }

    pub fn set(&mut self, cid: Cid, bytes: Vec<u8>) {
        self.map.insert(cid, bytes);
    }

    pub fn get(&self, cid: &Cid) -> Option<&Vec<u8>> {
        self.map.get(cid)
    }

    pub fn has(&self, cid: &Cid) -> bool {
        self.map.contains_key(cid)
    }

    pub fn delete(&mut self, cid: &Cid) {
        self.map.remove(cid);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Cid, &Vec<u8>)> {
        self.map.iter()
    }

    pub fn cids(&self) -> impl Iterator<Item = &Cid> {
        self.map.keys()
    }

    /// Merge another map into this one
    pub fn add_map(&mut self, other: BlockMap) {
        self.map.extend(other.map);
    }

    /// Split the requested CIDs into found blocks and missing CIDs
    pub fn get_many(&self, cids: &[Cid]) -> (Vec<(Cid, Vec<u8>)>, Vec<Cid>) {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for cid in cids {
            match self.map.get(cid) {
                Some(bytes) => found.push((*cid, bytes.clone())),
                None => missing.push(*cid),
            }
        }
        (found, missing)
    }

    /// Total byte size of all stored blocks
    pub fn byte_size(&self) -> usize {
        self.map.values().map(|b| b.len()).sum()
    }
}

impl IntoIterator for BlockMap {
    type Item = (Cid, Vec<u8>);
    type IntoIter = std::collections::hash_map::IntoIter<Cid, Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let mut blocks = BlockMap::new();
        let cid = blocks.add(&Ipld::String("hello".to_string())).unwrap();
        assert!(blocks.has(&cid));
        assert_eq!(blocks.len(), 1);
        let bytes = blocks.get(&cid).unwrap();
        assert_eq!(dag::cid_for_bytes(bytes), cid);
    }

    #[test]
    fn test_identical_values_share_a_cid() {
        let mut blocks = BlockMap::new();
        let a = blocks.add(&Ipld::String("same".to_string())).unwrap();
        let b = blocks.add(&Ipld::String("same".to_string())).unwrap();
        assert_eq!(a, b);
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn test_get_many_reports_missing() {
        let mut blocks = BlockMap::new();
        let present = blocks.add(&Ipld::Integer(1)).unwrap();
        let (absent, _) = dag::cid_for_ipld(&Ipld::Integer(2)).unwrap();
        let (found, missing) = blocks.get_many(&[present, absent]);
        assert_eq!(found.len(), 1);
        assert_eq!(missing, vec![absent]);
    }
}
