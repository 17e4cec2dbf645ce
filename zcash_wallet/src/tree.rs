//! Note commitment trees for the two shielded pools.

use std::io::{self, Read, Write};

use incrementalmerkletree::{frontier::CommitmentTree, witness::IncrementalWitness, Hashable, Level};
use zcash_primitives::merkle_tree::{
    read_commitment_tree, read_incremental_witness, write_commitment_tree,
    write_incremental_witness, HashSer,
};
use zcash_wallet_keys::sprout::sha256_compress;

pub const SPROUT_TREE_DEPTH: u8 = 29;
pub const SAPLING_TREE_DEPTH: u8 = 32;

/// A node of the Sprout note commitment tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SproutNode([u8; 32]);

impl SproutNode {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        SproutNode(bytes)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Hashable for SproutNode {
    fn empty_leaf() -> Self {
        SproutNode([0; 32])
    }

    /// Sprout nodes are combined with the unpadded SHA-256 compression function,
    /// independent of the level.
    fn combine(_: Level, lhs: &Self, rhs: &Self) -> Self {
        let mut block = [0u8; 64];
        block[..32].copy_from_slice(&lhs.0);
        block[32..].copy_from_slice(&rhs.0);
        SproutNode(sha256_compress(&block))
    }
}

impl HashSer for SproutNode {
    fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut bytes = [0; 32];
        reader.read_exact(&mut bytes)?;
        Ok(SproutNode(bytes))
    }

    fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.0)
    }
}

pub type SproutCommitmentTree = CommitmentTree<SproutNode, SPROUT_TREE_DEPTH>;
pub type SproutWitness = IncrementalWitness<SproutNode, SPROUT_TREE_DEPTH>;
pub type SaplingCommitmentTree = CommitmentTree<sapling::Node, SAPLING_TREE_DEPTH>;
pub type SaplingWitness = IncrementalWitness<sapling::Node, SAPLING_TREE_DEPTH>;

/// The canonical 32-byte encoding of a tree node or root.
pub fn node_bytes<H: HashSer>(node: &H) -> [u8; 32] {
    let mut buf = Vec::with_capacity(32);
    // Writing to a Vec cannot fail.
    let _ = node.write(&mut buf);
    let mut bytes = [0; 32];
    if buf.len() == 32 {
        bytes.copy_from_slice(&buf);
    }
    bytes
}

pub fn node_from_bytes<H: HashSer>(bytes: &[u8; 32]) -> io::Result<H> {
    H::read(&bytes[..])
}

pub fn read_tree<H: HashSer + Clone, R: Read, const DEPTH: u8>(
    reader: R,
) -> io::Result<CommitmentTree<H, DEPTH>> {
    read_commitment_tree(reader)
}

pub fn write_tree<H: HashSer, W: Write, const DEPTH: u8>(
    tree: &CommitmentTree<H, DEPTH>,
    writer: W,
) -> io::Result<()> {
    write_commitment_tree(tree, writer)
}

pub fn read_witness<H: HashSer + Clone, R: Read, const DEPTH: u8>(
    reader: R,
) -> io::Result<IncrementalWitness<H, DEPTH>> {
    read_incremental_witness(reader)
}

pub fn write_witness<H: HashSer, W: Write, const DEPTH: u8>(
    witness: &IncrementalWitness<H, DEPTH>,
    writer: W,
) -> io::Result<()> {
    write_incremental_witness(witness, writer)
}
