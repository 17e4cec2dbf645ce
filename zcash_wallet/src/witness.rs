//! Maintenance of incremental Merkle witnesses for the wallet's shielded notes.
//!
//! Every note confirmed in the active chain carries a [`WitnessCache`] holding the
//! witnesses of its commitment as of the most recent blocks, newest first. Connecting a
//! block appends that block's commitments to a copy of each note's newest witness;
//! disconnecting a block drops the newest witness again. Because the cache holds up to
//! `cache_size` witnesses, reorganizations shallower than that are handled without
//! consulting the chain.
//!
//! Before extending, each note's newest witness is checked against the final tree root
//! of the block it is current for. Notes whose cache is missing, stale, or inconsistent
//! with the chain are rebuilt from the commitment tree as of the block before the one
//! that confirmed them, and replayed forward.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use incrementalmerkletree::{frontier::CommitmentTree, witness::IncrementalWitness, Hashable};
use tracing::{debug, warn};
use zcash_primitives::merkle_tree::HashSer;
use zcash_protocol::{consensus::BlockHeight, TxId};
use zcash_wallet_keys::KeyVault;

use crate::chain::ChainView;
use crate::ledger::{
    JsOutPoint, SaplingNoteData, SaplingOutPoint, SproutNoteData, TransactionRecord, TxStatus,
    WalletLedger, WitnessCache, WitnessState,
};
use crate::primitives::{Block, Nullifier, Transaction};
use crate::tree::{node_bytes, SproutNode, SAPLING_TREE_DEPTH, SPROUT_TREE_DEPTH};

/// The pool-specific parts of witness maintenance.
pub trait WitnessPool<const DEPTH: u8> {
    type Node: Hashable + HashSer + Clone + PartialEq + fmt::Debug;
    type NoteId: Ord + Copy + fmt::Debug;
    type Note;

    const NAME: &'static str;

    /// The note commitments created by `tx`, in tree order. `None` if any commitment
    /// is not a valid tree node.
    fn commitments(tx: &Transaction) -> Option<Vec<Self::Node>>;

    fn final_root(block: &Block) -> [u8; 32];

    fn tree_at<C: ChainView>(chain: &C, root: &[u8; 32]) -> Option<CommitmentTree<Self::Node, DEPTH>>;

    fn notes(record: &TransactionRecord) -> &BTreeMap<Self::NoteId, Self::Note>;

    fn notes_mut(record: &mut TransactionRecord) -> &mut BTreeMap<Self::NoteId, Self::Note>;

    fn commitment_index(id: &Self::NoteId) -> usize;

    fn cache(note: &Self::Note) -> &WitnessCache<Self::Node, DEPTH>;

    fn cache_mut(note: &mut Self::Note) -> &mut WitnessCache<Self::Node, DEPTH>;

    fn nullifier(note: &Self::Note) -> Option<Nullifier>;

    /// Derives and caches the nullifier of a witnessed note if the keys allow it.
    /// Returns whether a nullifier was newly cached.
    fn derive_nullifier(note: &mut Self::Note, vault: &KeyVault) -> bool;
}

pub struct SproutPool;

impl WitnessPool<SPROUT_TREE_DEPTH> for SproutPool {
    type Node = SproutNode;
    type NoteId = JsOutPoint;
    type Note = SproutNoteData;

    const NAME: &'static str = "Sprout";

    fn commitments(tx: &Transaction) -> Option<Vec<SproutNode>> {
        Some(
            tx.joinsplits
                .iter()
                .flat_map(|js| js.commitments)
                .map(SproutNode::from_bytes)
                .collect(),
        )
    }

    fn final_root(block: &Block) -> [u8; 32] {
        block.final_sprout_root
    }

    fn tree_at<C: ChainView>(chain: &C, root: &[u8; 32]) -> Option<CommitmentTree<SproutNode, SPROUT_TREE_DEPTH>> {
        chain.sprout_tree_at(root)
    }

    fn notes(record: &TransactionRecord) -> &BTreeMap<JsOutPoint, SproutNoteData> {
        &record.sprout_notes
    }

    fn notes_mut(record: &mut TransactionRecord) -> &mut BTreeMap<JsOutPoint, SproutNoteData> {
        &mut record.sprout_notes
    }

    fn commitment_index(id: &JsOutPoint) -> usize {
        id.commitment_index()
    }

    fn cache(note: &SproutNoteData) -> &WitnessCache<SproutNode, SPROUT_TREE_DEPTH> {
        &note.witnesses
    }

    fn cache_mut(note: &mut SproutNoteData) -> &mut WitnessCache<SproutNode, SPROUT_TREE_DEPTH> {
        &mut note.witnesses
    }

    fn nullifier(note: &SproutNoteData) -> Option<Nullifier> {
        note.nullifier.map(Nullifier::Sprout)
    }

    fn derive_nullifier(note: &mut SproutNoteData, vault: &KeyVault) -> bool {
        if note.nullifier.is_some() || note.witnesses.is_empty() {
            return false;
        }
        // Requires the spending key, so this fails while the vault is locked.
        match vault.sprout_nullifier(&note.address, &note.rho) {
            Ok(nf) => {
                note.nullifier = Some(nf);
                true
            }
            Err(_) => false,
        }
    }
}

pub struct SaplingPool;

impl WitnessPool<SAPLING_TREE_DEPTH> for SaplingPool {
    type Node = sapling::Node;
    type NoteId = SaplingOutPoint;
    type Note = SaplingNoteData;

    const NAME: &'static str = "Sapling";

    fn commitments(tx: &Transaction) -> Option<Vec<sapling::Node>> {
        tx.shielded_outputs
            .iter()
            .map(|out| {
                Option::from(sapling::note::ExtractedNoteCommitment::from_bytes(&out.cmu))
                    .map(|cmu| sapling::Node::from_cmu(&cmu))
            })
            .collect()
    }

    fn final_root(block: &Block) -> [u8; 32] {
        block.final_sapling_root
    }

    fn tree_at<C: ChainView>(
        chain: &C,
        root: &[u8; 32],
    ) -> Option<CommitmentTree<sapling::Node, SAPLING_TREE_DEPTH>> {
        chain.sapling_tree_at(root)
    }

    fn notes(record: &TransactionRecord) -> &BTreeMap<SaplingOutPoint, SaplingNoteData> {
        &record.sapling_notes
    }

    fn notes_mut(record: &mut TransactionRecord) -> &mut BTreeMap<SaplingOutPoint, SaplingNoteData> {
        &mut record.sapling_notes
    }

    fn commitment_index(id: &SaplingOutPoint) -> usize {
        id.n as usize
    }

    fn cache(note: &SaplingNoteData) -> &WitnessCache<sapling::Node, SAPLING_TREE_DEPTH> {
        &note.witnesses
    }

    fn cache_mut(note: &mut SaplingNoteData) -> &mut WitnessCache<sapling::Node, SAPLING_TREE_DEPTH> {
        &mut note.witnesses
    }

    fn nullifier(note: &SaplingNoteData) -> Option<Nullifier> {
        note.nullifier.map(Nullifier::Sapling)
    }

    fn derive_nullifier(note: &mut SaplingNoteData, vault: &KeyVault) -> bool {
        if note.nullifier.is_some() {
            return false;
        }
        let Some(position) = note.witnesses.newest().map(|w| w.witnessed_position()) else {
            return false;
        };
        let Some(vk) = vault.sapling_viewing_key(&note.ivk) else {
            return false;
        };
        let Some(sapling_note) = note.note() else {
            return false;
        };
        note.nullifier = Some(sapling_note.nf(&vk.nk(), u64::from(position)).0);
        true
    }
}

/// Conditions encountered during a witness pass that did not stop it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WitnessReport {
    /// Heights of blocks or trees that could not be read. Affected notes were left
    /// unwitnessed and will be retried on the next pass.
    pub unavailable: BTreeSet<BlockHeight>,
    /// Notes whose witnesses disagreed with the chain and were discarded.
    pub root_mismatches: usize,
    /// Notes whose witnesses were rebuilt from an earlier tree.
    pub rebuilt: usize,
}

impl WitnessReport {
    pub fn is_clean(&self) -> bool {
        self.unavailable.is_empty() && self.root_mismatches == 0
    }

    fn merge(&mut self, other: WitnessReport) {
        self.unavailable.extend(other.unavailable);
        self.root_mismatches += other.root_mismatches;
        self.rebuilt += other.rebuilt;
    }
}

/// A note selected for processing in a pass.
struct Target<Id> {
    txid: TxId,
    id: Id,
    confirmed_at: BlockHeight,
    tx_index: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct NoteWitnessEngine {
    cache_size: usize,
}

impl NoteWitnessEngine {
    pub fn new(cache_size: usize) -> Self {
        NoteWitnessEngine {
            cache_size: cache_size.max(1),
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    /// Brings every note's witnesses up to date with `block`, which must be the new tip.
    pub fn connect_block<C: ChainView>(
        &self,
        ledger: &mut WalletLedger,
        vault: &KeyVault,
        chain: &C,
        block: &Block,
    ) -> WitnessReport {
        let mut report = self.connect_pool::<SproutPool, SPROUT_TREE_DEPTH, C>(ledger, chain, block);
        report.merge(self.connect_pool::<SaplingPool, SAPLING_TREE_DEPTH, C>(ledger, chain, block));
        self.update_nullifiers(ledger, vault);
        if !report.is_clean() {
            warn!(
                "Witness pass for block {} at height {} incomplete: {:?}",
                block.hash, block.height, report
            );
        }
        report
    }

    /// Steps every maintained witness back before `block`.
    pub fn disconnect_block(&self, ledger: &mut WalletLedger, block: &Block) {
        self.disconnect_pool::<SproutPool, SPROUT_TREE_DEPTH>(ledger, block.height);
        self.disconnect_pool::<SaplingPool, SAPLING_TREE_DEPTH>(ledger, block.height);
    }

    /// Forgets the witnesses of every note confirmed at or above `height`, so that a
    /// scan starting there rebuilds them block by block.
    pub fn clear_from(&self, ledger: &mut WalletLedger, height: BlockHeight) {
        let mut cleared = vec![];
        for record in ledger.records_mut() {
            if record.has_notes() && record.height().is_some_and(|h| h >= height) {
                for note in record.sprout_notes.values_mut() {
                    note.witnesses.clear();
                }
                for note in record.sapling_notes.values_mut() {
                    note.witnesses.clear();
                }
                cleared.push(record.txid());
            }
        }
        for txid in cleared {
            ledger.mark_dirty(txid);
        }
    }

    /// Brings the notes confirmed before `height` up to date with the block before it,
    /// so that a scan starting at `height` only has to extend them.
    pub fn rebuild_before<C: ChainView>(
        &self,
        ledger: &mut WalletLedger,
        vault: &KeyVault,
        chain: &C,
        height: BlockHeight,
    ) -> WitnessReport {
        let mut report = WitnessReport::default();
        if u32::from(height) == 0 {
            return report;
        }
        let previous = chain.block_at_height(height - 1);
        for target in self.targets::<SproutPool, SPROUT_TREE_DEPTH>(ledger) {
            if target.confirmed_at < height {
                self.verify_note::<SproutPool, SPROUT_TREE_DEPTH, C>(
                    ledger,
                    chain,
                    previous.as_ref(),
                    height,
                    &target,
                    &mut report,
                );
            }
        }
        for target in self.targets::<SaplingPool, SAPLING_TREE_DEPTH>(ledger) {
            if target.confirmed_at < height {
                self.verify_note::<SaplingPool, SAPLING_TREE_DEPTH, C>(
                    ledger,
                    chain,
                    previous.as_ref(),
                    height,
                    &target,
                    &mut report,
                );
            }
        }
        self.update_nullifiers(ledger, vault);
        report
    }

    /// Caches nullifiers for witnessed notes that lack one. Returns whether any were
    /// added.
    pub fn update_nullifiers(&self, ledger: &mut WalletLedger, vault: &KeyVault) -> bool {
        let mut changed = vec![];
        for record in ledger.records_mut() {
            let mut record_changed = false;
            for note in record.sprout_notes.values_mut() {
                record_changed |= SproutPool::derive_nullifier(note, vault);
            }
            for note in record.sapling_notes.values_mut() {
                record_changed |= SaplingPool::derive_nullifier(note, vault);
            }
            if record_changed {
                changed.push(record.txid());
            }
        }
        let any = !changed.is_empty();
        for txid in changed {
            ledger.mark_dirty(txid);
        }
        if any {
            ledger.rebuild_owned_nullifiers();
        }
        any
    }

    /// Confirmed notes of pool `P` that are still within the maintenance window.
    fn targets<P: WitnessPool<D>, const D: u8>(
        &self,
        ledger: &WalletLedger,
    ) -> Vec<Target<P::NoteId>> {
        let mut targets = vec![];
        for record in ledger.records() {
            let TxStatus::Confirmed { height, index, .. } = record.status else {
                continue;
            };
            for (id, note) in P::notes(record) {
                let spend_depth = P::nullifier(note).map_or(0, |nf| ledger.spend_depth(&nf));
                if spend_depth as usize <= self.cache_size {
                    targets.push(Target {
                        txid: record.txid(),
                        id: *id,
                        confirmed_at: height,
                        tx_index: index,
                    });
                }
            }
        }
        targets
    }

    fn cache_mut<'a, P: WitnessPool<D>, const D: u8>(
        ledger: &'a mut WalletLedger,
        txid: &TxId,
        id: &P::NoteId,
    ) -> Option<&'a mut WitnessCache<P::Node, D>>
    where
        P::Note: 'a,
        P::NoteId: 'a,
    {
        ledger
            .get_mut(txid)
            .and_then(|record| P::notes_mut(record).get_mut(id))
            .map(P::cache_mut)
    }

    fn cache_ref<'a, P: WitnessPool<D>, const D: u8>(
        ledger: &'a WalletLedger,
        txid: &TxId,
        id: &P::NoteId,
    ) -> Option<&'a WitnessCache<P::Node, D>>
    where
        P::Note: 'a,
        P::NoteId: 'a,
    {
        ledger
            .get(txid)
            .and_then(|record| P::notes(record).get(id))
            .map(P::cache)
    }

    fn connect_pool<P: WitnessPool<D>, const D: u8, C: ChainView>(
        &self,
        ledger: &mut WalletLedger,
        chain: &C,
        block: &Block,
    ) -> WitnessReport {
        let mut report = WitnessReport::default();
        let height = block.height;
        let targets = self.targets::<P, D>(ledger);
        let (earlier, in_block): (Vec<_>, Vec<_>) =
            targets.into_iter().partition(|t| t.confirmed_at < height);

        // Verify and, where necessary, rebuild notes confirmed before this block so that
        // each is current as of the previous block.
        if !earlier.is_empty() {
            let previous = chain.block_by_hash(&block.prev_hash);
            for target in &earlier {
                self.verify_note::<P, D, C>(ledger, chain, previous.as_ref(), height, target, &mut report);
            }
        }

        // Extend every note that is current as of the previous block, and start
        // witnesses for notes confirmed in this block.
        let mut active: Vec<(TxId, P::NoteId, IncrementalWitness<P::Node, D>)> = earlier
            .iter()
            .filter_map(|t| {
                let cache = Self::cache_ref::<P, D>(ledger, &t.txid, &t.id)?;
                if cache.height() == Some(height - 1) {
                    cache.newest().map(|w| (t.txid, t.id, w.clone()))
                } else {
                    None
                }
            })
            .collect();

        let new_notes: BTreeMap<(u32, usize), (TxId, P::NoteId)> = in_block
            .iter()
            .filter(|t| {
                ledger
                    .get(&t.txid)
                    .is_some_and(|r| r.status.block() == Some(block.hash))
            })
            .map(|t| ((t.tx_index, P::commitment_index(&t.id)), (t.txid, t.id)))
            .collect();

        let mut tree = if new_notes.is_empty() {
            None
        } else {
            let tree = tree_before::<P, D, C>(chain, block);
            if tree.is_none() {
                report.unavailable.insert(height - 1);
                for (txid, id) in new_notes.values() {
                    if let Some(cache) = Self::cache_mut::<P, D>(ledger, txid, id) {
                        cache.clear();
                    }
                }
            }
            tree
        };

        let mut consistent = true;
        for (tx_index, tx) in block.vtx.iter().enumerate() {
            let Some(commitments) = P::commitments(tx) else {
                consistent = false;
                break;
            };
            for (ci, node) in commitments.into_iter().enumerate() {
                for (_, _, witness) in active.iter_mut() {
                    if witness.append(node.clone()).is_err() {
                        consistent = false;
                    }
                }
                if let Some(t) = tree.as_mut() {
                    if t.append(node).is_err() {
                        consistent = false;
                    }
                    if let Some((txid, id)) = new_notes.get(&(tx_index as u32, ci)) {
                        if let Some(witness) = IncrementalWitness::from_tree(t.clone()) {
                            active.push((*txid, *id, witness));
                        }
                    }
                }
            }
        }

        for (txid, id, witness) in active {
            let Some(cache) = Self::cache_mut::<P, D>(ledger, &txid, &id) else {
                continue;
            };
            if consistent {
                cache.push(witness, height, self.cache_size);
                cache.set_state(WitnessState::PartiallyValidated);
                ledger.mark_dirty(txid);
                Self::validate_note::<P, D>(ledger, &txid, &id, block, &mut report);
            } else {
                cache.clear();
                report.root_mismatches += 1;
                ledger.mark_dirty(txid);
            }
        }

        report
    }

    /// Checks the newest witness of a note current as of `block` against the block's
    /// final tree root. A match promotes the cache to [`WitnessState::Validated`]; a
    /// mismatch discards it. Returns whether the note is validated.
    fn validate_note<P: WitnessPool<D>, const D: u8>(
        ledger: &mut WalletLedger,
        txid: &TxId,
        id: &P::NoteId,
        block: &Block,
        report: &mut WitnessReport,
    ) -> bool {
        let Some(cache) = Self::cache_mut::<P, D>(ledger, txid, id) else {
            return false;
        };
        if cache.height() != Some(block.height) {
            return false;
        }
        let root = cache.newest().map(|w| node_bytes(&w.root()));
        if root == Some(P::final_root(block)) {
            if cache.state() == WitnessState::Validated {
                return true;
            }
            cache.set_state(WitnessState::Validated);
            ledger.mark_dirty(*txid);
            return true;
        }
        warn!(
            "{} witness for {:?} does not match the final root of block {}; discarding",
            P::NAME,
            id,
            block.hash
        );
        cache.clear();
        report.root_mismatches += 1;
        ledger.mark_dirty(*txid);
        false
    }

    /// Ensures that the note described by `target` holds witnesses current as of the
    /// block before `height` whose newest root agrees with that block.
    fn verify_note<P: WitnessPool<D>, const D: u8, C: ChainView>(
        &self,
        ledger: &mut WalletLedger,
        chain: &C,
        previous: Option<&Block>,
        height: BlockHeight,
        target: &Target<P::NoteId>,
        report: &mut WitnessReport,
    ) {
        let Some(cache) = Self::cache_ref::<P, D>(ledger, &target.txid, &target.id) else {
            return;
        };
        if cache.height() == Some(height - 1) {
            let Some(previous) = previous else {
                // Cannot check right now; keep what we have.
                return;
            };
            if Self::validate_note::<P, D>(ledger, &target.txid, &target.id, previous, report) {
                return;
            }
            debug!("Rebuilding {} witnesses for {:?}", P::NAME, target.id);
        }

        if self.rebuild_note::<P, D, C>(ledger, chain, target, height - 1, report) {
            if let Some(previous) = previous {
                Self::validate_note::<P, D>(ledger, &target.txid, &target.id, previous, report);
            }
        }
    }

    /// Replaces the witnesses of a note with ones recomputed from the chain up to block
    /// `until`. The rebuilt cache stays [`WitnessState::PartiallyValidated`] until its
    /// root is checked. Returns whether the rebuild succeeded.
    fn rebuild_note<P: WitnessPool<D>, const D: u8, C: ChainView>(
        &self,
        ledger: &mut WalletLedger,
        chain: &C,
        target: &Target<P::NoteId>,
        until: BlockHeight,
        report: &mut WitnessReport,
    ) -> bool {
        let rebuilt = self.rebuild::<P, D, C>(chain, target, until);
        let Some(cache) = Self::cache_mut::<P, D>(ledger, &target.txid, &target.id) else {
            return false;
        };
        cache.clear();
        let ok = match rebuilt {
            Ok(witnesses) => {
                for (h, witness) in witnesses {
                    cache.push(witness, h, self.cache_size);
                }
                cache.set_state(WitnessState::PartiallyValidated);
                report.rebuilt += 1;
                debug!("Rebuilt {} witnesses for {:?}", P::NAME, target.id);
                true
            }
            Err(unavailable) => {
                report.unavailable.insert(unavailable);
                false
            }
        };
        ledger.mark_dirty(target.txid);
        ok
    }

    /// Recomputes the witnesses of a note from the tree preceding its confirming block,
    /// up to and including block `until`. Returns the last `cache_size` witnesses,
    /// oldest first. On failure returns the height of the first block or tree that
    /// could not be read.
    #[allow(clippy::type_complexity)]
    fn rebuild<P: WitnessPool<D>, const D: u8, C: ChainView>(
        &self,
        chain: &C,
        target: &Target<P::NoteId>,
        until: BlockHeight,
    ) -> Result<Vec<(BlockHeight, IncrementalWitness<P::Node, D>)>, BlockHeight> {
        let confirming = chain
            .block_at_height(target.confirmed_at)
            .ok_or(target.confirmed_at)?;
        let mut tree = tree_before::<P, D, C>(chain, &confirming)
            .ok_or_else(|| target.confirmed_at - 1)?;

        // Replay the confirming block up to and including the note's commitment.
        let mut witness: Option<IncrementalWitness<P::Node, D>> = None;
        let wanted = P::commitment_index(&target.id);
        for (tx_index, tx) in confirming.vtx.iter().enumerate() {
            let commitments = P::commitments(tx).ok_or(target.confirmed_at)?;
            for (ci, node) in commitments.into_iter().enumerate() {
                match witness.as_mut() {
                    Some(w) => w.append(node).map_err(|_| target.confirmed_at)?,
                    None => {
                        tree.append(node).map_err(|_| target.confirmed_at)?;
                        if tx_index as u32 == target.tx_index && ci == wanted {
                            witness = IncrementalWitness::from_tree(tree.clone());
                        }
                    }
                }
            }
        }
        let mut witness = witness.ok_or(target.confirmed_at)?;

        let mut witnesses = vec![(target.confirmed_at, witness.clone())];
        let mut h = target.confirmed_at + 1;
        while h <= until {
            let block = chain.block_at_height(h).ok_or(h)?;
            for tx in &block.vtx {
                for node in P::commitments(tx).ok_or(h)? {
                    witness.append(node).map_err(|_| h)?;
                }
            }
            witnesses.push((h, witness.clone()));
            if witnesses.len() > self.cache_size {
                witnesses.remove(0);
            }
            h = h + 1;
        }
        Ok(witnesses)
    }

    fn disconnect_pool<P: WitnessPool<D>, const D: u8>(
        &self,
        ledger: &mut WalletLedger,
        height: BlockHeight,
    ) {
        let mut targets = vec![];
        for record in ledger.records() {
            for (id, note) in P::notes(record) {
                let spend_depth = P::nullifier(note).map_or(0, |nf| ledger.spend_depth(&nf));
                if P::cache(note).height().is_some_and(|h| h >= height)
                    && spend_depth as usize <= self.cache_size
                {
                    targets.push((record.txid(), *id));
                }
            }
        }

        for (txid, id) in targets {
            if let Some(cache) = Self::cache_mut::<P, D>(ledger, &txid, &id) {
                if !cache.pop() {
                    debug!("{} note {:?} is now unwitnessed", P::NAME, id);
                }
            }
            ledger.mark_dirty(txid);
        }
    }
}

/// The commitment tree as it was before `block` was applied.
fn tree_before<P: WitnessPool<D>, const D: u8, C: ChainView>(
    chain: &C,
    block: &Block,
) -> Option<CommitmentTree<P::Node, D>> {
    if u32::from(block.height) == 0 {
        return Some(CommitmentTree::empty());
    }
    let previous = chain.block_by_hash(&block.prev_hash)?;
    P::tree_at(chain, &P::final_root(&previous))
}

#[cfg(test)]
mod tests;
