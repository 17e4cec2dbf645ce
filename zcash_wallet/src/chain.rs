//! The wallet's view of the node's active chain.

use zcash_protocol::{consensus::BlockHeight, TxId};

use crate::primitives::{Block, BlockHash};
use crate::tree::{SaplingCommitmentTree, SproutCommitmentTree};

/// Read access to the active chain, provided by the host node.
///
/// Lookups return `None` when the requested data cannot be read right now. Callers treat
/// that as a transient condition rather than as evidence that the block does not exist.
pub trait ChainView {
    fn tip_height(&self) -> Option<BlockHeight>;

    /// The timestamp of the tip block, in seconds since the epoch.
    fn tip_time(&self) -> Option<i64>;

    /// Whether the node is still catching up with the network.
    fn is_initial_sync(&self) -> bool;

    fn block_by_hash(&self, hash: &BlockHash) -> Option<Block>;

    fn block_at_height(&self, height: BlockHeight) -> Option<Block>;

    /// The height of `hash` if it is on the active chain.
    fn height_of(&self, hash: &BlockHash) -> Option<BlockHeight>;

    /// The Sprout commitment tree whose root is `root`.
    fn sprout_tree_at(&self, root: &[u8; 32]) -> Option<SproutCommitmentTree>;

    /// The Sapling commitment tree whose root is `root`.
    fn sapling_tree_at(&self, root: &[u8; 32]) -> Option<SaplingCommitmentTree>;

    /// The number of in-mempool ancestors and descendants of `txid`, counting the
    /// transaction itself. `(0, 0)` if it is not in the mempool.
    fn mempool_ancestry(&self, _txid: &TxId) -> (usize, usize) {
        (0, 0)
    }
}

/// Depth in the active chain of something confirmed at `height`: 1 for the tip block.
pub fn depth_at(tip: Option<BlockHeight>, height: BlockHeight) -> u32 {
    match tip {
        Some(tip) if tip >= height => u32::from(tip) - u32::from(height) + 1,
        _ => 0,
    }
}
