/// CARv1 stream encoder
///
/// Layout:
/// - Header: varint length, then DAG-CBOR `{version: 1, roots: [CID]}`
/// - Blocks: repeated varint(cid_len + block_len), cid bytes, block bytes
use libipld::{Cid, Ipld};
use std::collections::BTreeMap;

use crate::error::PdsResult;
use crate::repo::dag;

pub struct CarEncoder {
    buffer: Vec<u8>,
}

impl CarEncoder {
    /// Start a CAR file with the given root CID
    pub fn new(root: &Cid) -> PdsResult<Self> {
        let mut buffer = Vec::new();
        let header = Ipld::Map(BTreeMap::from([
            ("version".to_string(), Ipld::Integer(1)),
            ("roots".to_string(), Ipld::List(vec![Ipld::Link(*root)])),
        ]));
        let header_bytes = dag::encode(&header)?;
        write_varint(&mut buffer, header_bytes.len() as u64);
        buffer.extend_from_slice(&header_bytes);
        Ok(Self { buffer })
    }

    /// Append one block
    pub fn add_block(&mut self, cid: &Cid, data: &[u8]) -> PdsResult<()> {
        let cid_bytes = cid.to_bytes();
        write_varint(&mut self.buffer, (cid_bytes.len() + data.len()) as u64);
        self.buffer.extend_from_slice(&cid_bytes);
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Finish and return the CAR bytes
    pub fn finalize(self) -> Vec<u8> {
        self.buffer
    }
}

/// Write an unsigned LEB128 varint
fn write_varint(buffer: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buffer.push((value as u8) | 0x80);
        value >>= 7;
    }
    buffer.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encoding() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0);
        assert_eq!(buf, vec![0]);

        let mut buf = Vec::new();
        write_varint(&mut buf, 127);
        assert_eq!(buf, vec![127]);

        let mut buf = Vec::new();
        write_varint(&mut buf, 128);
        assert_eq!(buf, vec![0x80, 0x01]);

        let mut buf = Vec::new();
        write_varint(&mut buf, 300);
        assert_eq!(buf, vec![0xAC, 0x02]);
    }

    #[test]
    fn test_car_layout() {
        let (root, bytes) = dag::cid_for_ipld(&Ipld::String("root".to_string())).unwrap();
        let mut encoder = CarEncoder::new(&root).unwrap();
        encoder.add_block(&root, &bytes).unwrap();
        let car = encoder.finalize();
        assert!(!car.is_empty());
        // Header length varint is first; the root CID bytes appear after it
        let cid_bytes = root.to_bytes();
        assert!(car
            .windows(cid_bytes.len())
            .any(|window| window == cid_bytes.as_slice()));
    }
}
