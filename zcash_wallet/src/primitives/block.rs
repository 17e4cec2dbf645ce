use std::fmt;

use zcash_protocol::consensus::BlockHeight;

use super::transaction::Transaction;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHash(pub [u8; 32]);

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut data = self.0;
        data.reverse();
        f.write_str(&hex::encode(data))
    }
}

/// A block as delivered by the chain, carrying the commitment tree roots that result
/// from appending its notes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub height: BlockHeight,
    pub time: i64,
    pub vtx: Vec<Transaction>,
    pub final_sprout_root: [u8; 32],
    pub final_sapling_root: [u8; 32],
}
