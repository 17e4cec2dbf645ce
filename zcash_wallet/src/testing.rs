//! Utilities for testing wallets against an in-memory chain.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use incrementalmerkletree::frontier::CommitmentTree;
use rand_core::RngCore;
use sha2::{Digest, Sha256};
use zcash_protocol::{consensus::BlockHeight, TxId};
use zcash_wallet_keys::{sapling_keys::IvkTag, KeyVault};

use crate::chain::ChainView;
use crate::ledger::{SaplingNoteData, SaplingOutPoint};
use crate::primitives::{
    transaction::{JsDescription, OutputDescription, SpendDescription},
    Block, BlockHash, OutPoint, Script, Transaction, TxIn, TxOut,
};
use crate::scan::{DefaultScanner, DetectedNotes, NoteScanner};
use crate::selection::SigningFailure;
use crate::signing::{Broadcaster, BroadcastError, SaplingOutput, SaplingSpend, ShieldedProver};
use crate::tree::{node_bytes, SaplingCommitmentTree, SproutCommitmentTree, SproutNode};

/// The spacing of block timestamps produced by [`MockChain`].
pub const BLOCK_INTERVAL: i64 = 150;

const GENESIS_TIME: i64 = 1_477_641_360;

/// An in-memory chain that computes the commitment trees of the blocks pushed to it.
#[derive(Debug)]
pub struct MockChain {
    blocks: Vec<Block>,
    sprout_trees: BTreeMap<[u8; 32], SproutCommitmentTree>,
    sapling_trees: BTreeMap<[u8; 32], SaplingCommitmentTree>,
    hidden: BTreeSet<BlockHeight>,
    trees_available: bool,
    initial_sync: bool,
    ancestry: BTreeMap<TxId, (usize, usize)>,
    nonce: u64,
}

impl Default for MockChain {
    fn default() -> Self {
        MockChain::new()
    }
}

impl MockChain {
    /// A chain holding only an empty genesis block.
    pub fn new() -> Self {
        let mut chain = MockChain {
            blocks: vec![],
            sprout_trees: BTreeMap::new(),
            sapling_trees: BTreeMap::new(),
            hidden: BTreeSet::new(),
            trees_available: true,
            initial_sync: false,
            ancestry: BTreeMap::new(),
            nonce: 0,
        };
        chain.push_block(vec![]);
        chain
    }

    pub fn next_height(&self) -> BlockHeight {
        BlockHeight::from_u32(self.blocks.len() as u32)
    }

    pub fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Appends a block containing `vtx` and returns it.
    pub fn push_block(&mut self, vtx: Vec<Transaction>) -> Block {
        let height = self.next_height();
        let previous = self.blocks.last();
        let prev_hash = previous.map_or(BlockHash([0; 32]), |b| b.hash);

        let mut sprout_tree = previous
            .and_then(|b| self.sprout_trees.get(&b.final_sprout_root).cloned())
            .unwrap_or_else(CommitmentTree::empty);
        let mut sapling_tree = previous
            .and_then(|b| self.sapling_trees.get(&b.final_sapling_root).cloned())
            .unwrap_or_else(CommitmentTree::empty);
        for tx in &vtx {
            for cm in tx.joinsplits.iter().flat_map(|js| js.commitments) {
                sprout_tree
                    .append(SproutNode::from_bytes(cm))
                    .expect("mock Sprout tree is not full");
            }
            for output in &tx.shielded_outputs {
                let cmu = Option::from(sapling::note::ExtractedNoteCommitment::from_bytes(
                    &output.cmu,
                ))
                .expect("mock outputs carry valid commitments");
                sapling_tree
                    .append(sapling::Node::from_cmu(&cmu))
                    .expect("mock Sapling tree is not full");
            }
        }
        let final_sprout_root = node_bytes(&sprout_tree.root());
        let final_sapling_root = node_bytes(&sapling_tree.root());
        self.sprout_trees.insert(final_sprout_root, sprout_tree);
        self.sapling_trees.insert(final_sapling_root, sapling_tree);

        self.nonce += 1;
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.0);
        hasher.update(u32::from(height).to_le_bytes());
        hasher.update(self.nonce.to_le_bytes());
        for tx in &vtx {
            hasher.update(tx.to_bytes());
        }

        let block = Block {
            hash: BlockHash(hasher.finalize().into()),
            prev_hash,
            height,
            time: GENESIS_TIME + i64::from(u32::from(height)) * BLOCK_INTERVAL,
            vtx,
            final_sprout_root,
            final_sapling_root,
        };
        self.blocks.push(block.clone());
        block
    }

    /// Removes the tip block and returns it. Its trees stay queryable, as they would
    /// in a node that has seen the block.
    pub fn pop_block(&mut self) -> Option<Block> {
        if self.blocks.len() <= 1 {
            return None;
        }
        self.blocks.pop()
    }

    /// Makes the block at `height` unreadable until [`MockChain::reveal_block`].
    pub fn hide_block(&mut self, height: BlockHeight) {
        self.hidden.insert(height);
    }

    pub fn reveal_block(&mut self, height: BlockHeight) {
        self.hidden.remove(&height);
    }

    pub fn set_trees_available(&mut self, available: bool) {
        self.trees_available = available;
    }

    pub fn set_initial_sync(&mut self, initial_sync: bool) {
        self.initial_sync = initial_sync;
    }

    pub fn set_mempool_ancestry(&mut self, txid: TxId, ancestors: usize, descendants: usize) {
        self.ancestry.insert(txid, (ancestors, descendants));
    }

    fn readable(&self, block: &Block) -> Option<Block> {
        (!self.hidden.contains(&block.height)).then(|| block.clone())
    }
}

impl ChainView for MockChain {
    fn tip_height(&self) -> Option<BlockHeight> {
        self.blocks.last().map(|b| b.height)
    }

    fn tip_time(&self) -> Option<i64> {
        self.blocks.last().map(|b| b.time)
    }

    fn is_initial_sync(&self) -> bool {
        self.initial_sync
    }

    fn block_by_hash(&self, hash: &BlockHash) -> Option<Block> {
        self.blocks
            .iter()
            .find(|b| &b.hash == hash)
            .and_then(|b| self.readable(b))
    }

    fn block_at_height(&self, height: BlockHeight) -> Option<Block> {
        self.blocks
            .get(u32::from(height) as usize)
            .and_then(|b| self.readable(b))
    }

    fn height_of(&self, hash: &BlockHash) -> Option<BlockHeight> {
        self.blocks.iter().find(|b| &b.hash == hash).map(|b| b.height)
    }

    fn sprout_tree_at(&self, root: &[u8; 32]) -> Option<SproutCommitmentTree> {
        if !self.trees_available {
            return None;
        }
        self.sprout_trees.get(root).cloned()
    }

    fn sapling_tree_at(&self, root: &[u8; 32]) -> Option<SaplingCommitmentTree> {
        if !self.trees_available {
            return None;
        }
        self.sapling_trees.get(root).cloned()
    }

    fn mempool_ancestry(&self, txid: &TxId) -> (usize, usize) {
        self.ancestry.get(txid).copied().unwrap_or((0, 0))
    }
}

/// A prover producing correctly sized descriptions without proofs. Output commitments
/// are real, so that the trees built from them are meaningful.
#[derive(Clone, Copy, Debug, Default)]
pub struct MockProver;

impl ShieldedProver for MockProver {
    fn prove_spend(&self, spend: &SaplingSpend<'_>) -> Result<SpendDescription, SigningFailure> {
        Ok(SpendDescription {
            anchor: spend.anchor,
            nullifier: spend.nullifier,
            ..SpendDescription::dummy()
        })
    }

    fn prove_output(&self, output: &SaplingOutput) -> Result<OutputDescription, SigningFailure> {
        Ok(OutputDescription {
            cmu: output.note().cmu().to_bytes(),
            ..OutputDescription::dummy()
        })
    }

    fn binding_signature(
        &self,
        _: &Transaction,
        sighash: &[u8; 32],
    ) -> Result<[u8; 64], SigningFailure> {
        let mut sig = [0xff; 64];
        sig[..32].copy_from_slice(sighash);
        Ok(sig)
    }
}

/// A scanner that reports notes registered for a transaction in addition to those
/// found by trial decryption. Clones share their registrations.
#[derive(Clone, Debug, Default)]
pub struct MockScanner {
    registered: Arc<Mutex<BTreeMap<TxId, DetectedNotes>>>,
}

impl MockScanner {
    pub fn new() -> Self {
        MockScanner::default()
    }

    /// Reports Sapling output `n` of `tx` as belonging to the key `ivk`.
    pub fn register_sapling(&self, tx: &Transaction, n: u32, ivk: IvkTag, note: &sapling::Note) {
        let txid = tx.txid();
        let mut registered = self.registered.lock().expect("not poisoned");
        registered
            .entry(txid)
            .or_default()
            .sapling
            .insert(SaplingOutPoint::new(txid, n), SaplingNoteData::from_note(ivk, note));
    }
}

impl NoteScanner for MockScanner {
    fn scan(&self, tx: &Transaction, vault: &KeyVault) -> DetectedNotes {
        let mut detected = DefaultScanner.scan(tx, vault);
        let registered = self.registered.lock().expect("not poisoned");
        if let Some(extra) = registered.get(&tx.txid()) {
            detected.sprout.extend(extra.sprout.clone());
            detected.sapling.extend(extra.sapling.clone());
        }
        detected
    }
}

/// Records every broadcast transaction, optionally rejecting them.
#[derive(Debug, Default)]
pub struct MockBroadcaster {
    sent: Mutex<Vec<TxId>>,
    reject: bool,
}

impl MockBroadcaster {
    pub fn new() -> Self {
        MockBroadcaster::default()
    }

    pub fn rejecting() -> Self {
        MockBroadcaster {
            sent: Mutex::new(vec![]),
            reject: true,
        }
    }

    pub fn sent(&self) -> Vec<TxId> {
        self.sent.lock().expect("not poisoned").clone()
    }
}

impl Broadcaster for MockBroadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<(), BroadcastError> {
        if self.reject {
            return Err(BroadcastError("mempool full".to_owned()));
        }
        self.sent.lock().expect("not poisoned").push(tx.txid());
        Ok(())
    }
}

/// A coinbase transaction for the block at `height`.
pub fn coinbase_tx(height: BlockHeight, outputs: Vec<TxOut>) -> Transaction {
    let mut input = TxIn::new(OutPoint::null());
    input.script_sig = Script::default().push_data(&u32::from(height).to_le_bytes());
    Transaction {
        vin: vec![input],
        vout: outputs,
        ..Transaction::default()
    }
}

/// A transparent transaction spending `inputs`.
pub fn payment_tx(inputs: &[OutPoint], outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        vin: inputs.iter().copied().map(TxIn::new).collect(),
        vout: outputs,
        ..Transaction::default()
    }
}

/// A transaction with a single Sapling output of `value` to `to`, and the note it
/// creates.
pub fn sapling_output_tx<R: RngCore>(
    to: sapling::PaymentAddress,
    value: u64,
    rng: &mut R,
) -> (Transaction, sapling::Note) {
    let mut rseed = [0; 32];
    rng.fill_bytes(&mut rseed);
    let output = SaplingOutput {
        to,
        value,
        rseed,
        memo: [0; 512],
    };
    let note = output.note();
    let tx = Transaction {
        value_balance: -(value as i64),
        shielded_outputs: vec![OutputDescription {
            cmu: note.cmu().to_bytes(),
            ..OutputDescription::dummy()
        }],
        ..Transaction::default()
    };
    (tx, note)
}

/// A transaction with one JoinSplit creating `commitments` and revealing
/// `nullifiers`.
pub fn joinsplit_tx(commitments: [[u8; 32]; 2], nullifiers: [[u8; 32]; 2]) -> Transaction {
    let js = JsDescription {
        commitments,
        nullifiers,
        ..JsDescription::default()
    };
    Transaction {
        joinsplits: vec![js],
        ..Transaction::default()
    }
}

/// A transaction revealing the Sapling nullifier `nf`.
pub fn sapling_spend_tx(nf: [u8; 32]) -> Transaction {
    Transaction {
        shielded_spends: vec![SpendDescription {
            nullifier: nf,
            ..SpendDescription::dummy()
        }],
        ..Transaction::default()
    }
}
