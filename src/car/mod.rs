/// CAR (Content Addressable aRchive) encoding
///
/// Commit events carry their new blocks as a CARv1 slice; full repo
/// exports use the same encoder over every reachable block.

pub mod encoder;

pub use encoder::CarEncoder;

use libipld::Cid;

use crate::error::PdsResult;
use crate::repo::BlockMap;

/// Encode a block map rooted at `root` into CARv1 bytes
pub fn blocks_to_car(root: &Cid, blocks: &BlockMap) -> PdsResult<Vec<u8>> {
    let mut encoder = CarEncoder::new(root)?;
    for (cid, bytes) in blocks.iter() {
        encoder.add_block(cid, bytes)?;
    }
    Ok(encoder.finalize())
}
