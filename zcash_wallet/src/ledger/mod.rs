//! The authoritative set of wallet transactions and the indices relating them.
//!
//! Every transaction the wallet has seen is held in a [`TransactionRecord`], keyed by
//! transaction id. The ledger keeps three cross-referencing indices consistent with
//! those records:
//!
//! - insertion order (`order_pos`), used for smart timestamps and listing;
//! - spends by transparent outpoint and by shielded nullifier, used to detect conflicts
//!   and to decide whether an output or note has been spent;
//! - owned notes by nullifier, used to attribute shielded spends to the wallet.
//!
//! Records are never deleted by chain events. Reorganizations move them between
//! statuses, and explicit abandonment marks a transaction and its in-wallet descendants
//! as never going to confirm.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, warn};
use zcash_protocol::{consensus::BlockHeight, TxId};

use crate::chain::depth_at;
use crate::error::{Error, Result};
use crate::primitives::{Block, BlockHash, Nullifier, OutPoint, Transaction, TransparentAddress};

pub mod balance;
pub mod notes;
pub mod record;

pub use balance::{BalanceQuery, CoinQuery, NoteOutput, PoolBalance, WalletBalance, WalletOutput};
pub use notes::{
    JsOutPoint, NoteRef, NoteRseed, SaplingNoteData, SaplingOutPoint, SproutNoteData,
    WitnessCache, WitnessState,
};
pub use record::{TransactionRecord, TxStatus};

/// Transactions whose smart timestamp may borrow from an earlier record when that
/// record's time is within this many seconds of receipt.
const SMART_TIME_TOLERANCE: i64 = 300;

/// The result of [`WalletLedger::add_or_update`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    New,
    Updated,
    Unchanged,
}

/// Why a transaction left the node's mempool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemPoolRemovalReason {
    Expiry,
    SizeLimit,
    Reorg,
    Block,
    Conflict,
    Replaced { by: TxId },
}

/// A transaction observation to merge into the ledger.
#[derive(Clone, Debug)]
pub struct TxUpdate {
    pub tx: Transaction,
    pub status: TxStatus,
    /// The timestamp of the confirming block, if any.
    pub block_time: Option<i64>,
    pub from_me: bool,
    pub sprout_notes: BTreeMap<JsOutPoint, SproutNoteData>,
    pub sapling_notes: BTreeMap<SaplingOutPoint, SaplingNoteData>,
}

impl TxUpdate {
    pub fn new(tx: Transaction, status: TxStatus) -> Self {
        TxUpdate {
            tx,
            status,
            block_time: None,
            from_me: false,
            sprout_notes: BTreeMap::new(),
            sapling_notes: BTreeMap::new(),
        }
    }

    pub fn confirmed(tx: Transaction, block: &Block, index: u32) -> Self {
        let mut update = TxUpdate::new(
            tx,
            TxStatus::Confirmed {
                block: block.hash,
                height: block.height,
                index,
            },
        );
        update.block_time = Some(block.time);
        update
    }

    pub fn with_from_me(mut self, from_me: bool) -> Self {
        self.from_me = from_me;
        self
    }

    pub fn with_notes(
        mut self,
        sprout_notes: BTreeMap<JsOutPoint, SproutNoteData>,
        sapling_notes: BTreeMap<SaplingOutPoint, SaplingNoteData>,
    ) -> Self {
        self.sprout_notes = sprout_notes;
        self.sapling_notes = sapling_notes;
        self
    }
}

#[derive(Debug)]
pub struct WalletLedger {
    records: BTreeMap<TxId, TransactionRecord>,
    ordered: BTreeMap<u64, TxId>,
    next_order_pos: u64,
    spends: BTreeMap<OutPoint, BTreeSet<TxId>>,
    nullifier_spends: BTreeMap<Nullifier, BTreeSet<TxId>>,
    owned_nullifiers: BTreeMap<Nullifier, NoteRef>,
    used_destinations: BTreeSet<TransparentAddress>,
    locked_coins: BTreeSet<OutPoint>,
    locked_notes: BTreeSet<NoteRef>,
    dirty: BTreeSet<TxId>,
    tip: Option<BlockHeight>,
    coinbase_maturity: u32,
    balance_cache: Option<(BalanceQuery, Option<BlockHeight>, WalletBalance)>,
}

impl WalletLedger {
    pub fn new(coinbase_maturity: u32) -> Self {
        WalletLedger {
            records: BTreeMap::new(),
            ordered: BTreeMap::new(),
            next_order_pos: 0,
            spends: BTreeMap::new(),
            nullifier_spends: BTreeMap::new(),
            owned_nullifiers: BTreeMap::new(),
            used_destinations: BTreeSet::new(),
            locked_coins: BTreeSet::new(),
            locked_notes: BTreeSet::new(),
            dirty: BTreeSet::new(),
            tip: None,
            coinbase_maturity,
            balance_cache: None,
        }
    }

    pub fn tip(&self) -> Option<BlockHeight> {
        self.tip
    }

    pub fn set_tip(&mut self, tip: Option<BlockHeight>) {
        if self.tip != tip {
            self.tip = tip;
            self.invalidate_balances();
        }
    }

    pub fn coinbase_maturity(&self) -> u32 {
        self.coinbase_maturity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, txid: &TxId) -> Option<&TransactionRecord> {
        self.records.get(txid)
    }

    pub fn contains(&self, txid: &TxId) -> bool {
        self.records.contains_key(txid)
    }

    /// Records in insertion order.
    pub fn iter_ordered(&self) -> impl DoubleEndedIterator<Item = &TransactionRecord> {
        self.ordered.values().filter_map(|txid| self.records.get(txid))
    }

    pub fn records(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.records.values()
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = &mut TransactionRecord> {
        self.invalidate_balances();
        self.records.values_mut()
    }

    pub(crate) fn get_mut(&mut self, txid: &TxId) -> Option<&mut TransactionRecord> {
        self.invalidate_balances();
        self.records.get_mut(txid)
    }

    /// Takes the set of records that changed since the last call.
    pub fn take_dirty(&mut self) -> BTreeSet<TxId> {
        std::mem::take(&mut self.dirty)
    }

    /// Returns records to the dirty set after a failed write.
    pub fn restore_dirty(&mut self, txids: BTreeSet<TxId>) {
        self.dirty.extend(txids);
    }

    pub(crate) fn mark_dirty(&mut self, txid: TxId) {
        self.dirty.insert(txid);
        self.invalidate_balances();
    }

    pub fn depth(&self, txid: &TxId) -> Option<i64> {
        self.records.get(txid).map(|r| r.depth(self.tip))
    }

    /// Merges an observation of a transaction into the ledger.
    pub fn add_or_update(&mut self, update: TxUpdate, now: i64) -> UpdateOutcome {
        let txid = update.tx.txid();
        let outcome = match self.records.get_mut(&txid) {
            None => {
                let mut record = TransactionRecord::new(update.tx, update.status);
                record.time_received = now;
                record.order_pos = self.next_order_pos;
                record.from_me = update.from_me;
                record.sprout_notes = update.sprout_notes;
                record.sapling_notes = update.sapling_notes;
                record.time_smart = self.compute_time_smart(&record, update.block_time);
                self.next_order_pos += 1;

                self.ordered.insert(record.order_pos, txid);
                self.index_spends(record.tx(), txid);
                self.mark_used_destinations(record.tx());
                self.records.insert(txid, record);
                self.mark_spent_outputs_used(&txid);
                self.index_owned_nullifiers(&txid);
                UpdateOutcome::New
            }
            Some(record) => {
                let mut updated = false;
                match update.status {
                    TxStatus::Confirmed { .. } | TxStatus::Conflicted { .. }
                        if record.status != update.status =>
                    {
                        record.status = update.status;
                        updated = true;
                    }
                    // Seen again after having been abandoned.
                    TxStatus::Unconfirmed if record.status.is_abandoned() => {
                        record.status = TxStatus::Unconfirmed;
                        updated = true;
                    }
                    _ => (),
                }
                if merge_notes(
                    &mut record.sprout_notes,
                    update.sprout_notes,
                    SproutNoteData::same_note,
                    |old, new| {
                        new.witnesses = old.witnesses.clone();
                        new.nullifier = old.nullifier;
                    },
                ) {
                    updated = true;
                }
                if merge_notes(
                    &mut record.sapling_notes,
                    update.sapling_notes,
                    SaplingNoteData::same_note,
                    |old, new| {
                        new.witnesses = old.witnesses.clone();
                        new.nullifier = old.nullifier;
                    },
                ) {
                    updated = true;
                }
                if update.from_me && !record.from_me {
                    record.from_me = true;
                    updated = true;
                }
                if updated {
                    self.rebuild_owned_nullifiers();
                    UpdateOutcome::Updated
                } else {
                    UpdateOutcome::Unchanged
                }
            }
        };

        debug!(
            "AddToWallet {} {}{}",
            txid,
            if outcome == UpdateOutcome::New { "new" } else { "" },
            if outcome == UpdateOutcome::Updated { "update" } else { "" }
        );
        if outcome != UpdateOutcome::Unchanged {
            self.mark_dirty(txid);
        }
        outcome
    }

    /// Inserts a record read back from the store.
    pub fn load_record(&mut self, record: TransactionRecord) {
        let txid = record.txid();
        self.next_order_pos = self.next_order_pos.max(record.order_pos + 1);
        self.ordered.insert(record.order_pos, txid);
        self.index_spends(record.tx(), txid);
        self.records.insert(txid, record);
        self.index_owned_nullifiers(&txid);
        self.invalidate_balances();
    }

    /// Recomputes indices that depend on several records at once. Called once every
    /// stored record has been loaded.
    pub fn finish_load(&mut self) {
        self.used_destinations.clear();
        let txs = self
            .records
            .values()
            .map(|r| r.tx().clone())
            .collect::<Vec<_>>();
        for tx in &txs {
            self.mark_used_destinations(tx);
        }
    }

    /// Removes every record, returning the ids removed.
    pub fn zap(&mut self) -> Vec<TxId> {
        let removed = self.records.keys().copied().collect();
        let maturity = self.coinbase_maturity;
        let tip = self.tip;
        *self = WalletLedger::new(maturity);
        self.tip = tip;
        removed
    }

    fn compute_time_smart(&self, record: &TransactionRecord, block_time: Option<i64>) -> i64 {
        let block_time = match (record.status, block_time) {
            (TxStatus::Confirmed { .. }, Some(t)) => t,
            _ => return record.time_received,
        };

        let mut latest_now = record.time_received;
        let mut latest_entry = 0;
        let latest_tolerated = latest_now + SMART_TIME_TOLERANCE;
        for txid in self.ordered.values().rev() {
            if *txid == record.txid() {
                continue;
            }
            if let Some(prior) = self.records.get(txid) {
                let smart = if prior.time_smart != 0 {
                    prior.time_smart
                } else {
                    prior.time_received
                };
                if smart <= latest_tolerated {
                    latest_entry = smart;
                    latest_now = latest_now.max(smart);
                    break;
                }
            }
        }
        latest_entry.max(block_time.min(latest_now))
    }

    fn index_spends(&mut self, tx: &Transaction, txid: TxId) {
        if !tx.is_coinbase() {
            for txin in &tx.vin {
                self.spends.entry(txin.prevout).or_default().insert(txid);
            }
        }
        for nf in tx.nullifiers() {
            self.nullifier_spends.entry(nf).or_default().insert(txid);
        }
    }

    fn mark_used_destinations(&mut self, tx: &Transaction) {
        if tx.is_coinbase() {
            return;
        }
        for txin in &tx.vin {
            let addr = self
                .records
                .get(&txin.prevout.txid)
                .and_then(|parent| parent.tx().vout.get(txin.prevout.n as usize))
                .and_then(|out| out.script_pubkey.address());
            if let Some(addr) = addr {
                self.used_destinations.insert(addr);
            }
        }
    }

    /// Marks the destinations of `txid`'s outputs that wallet transactions seen earlier
    /// already spend.
    fn mark_spent_outputs_used(&mut self, txid: &TxId) {
        let Some(record) = self.records.get(txid) else {
            return;
        };
        let used = record
            .tx()
            .vout
            .iter()
            .enumerate()
            .filter(|(n, _)| self.spends.contains_key(&OutPoint::new(*txid, *n as u32)))
            .filter_map(|(_, out)| out.script_pubkey.address())
            .collect::<Vec<_>>();
        self.used_destinations.extend(used);
    }

    fn index_owned_nullifiers(&mut self, txid: &TxId) {
        if let Some(record) = self.records.get(txid) {
            for (op, note) in &record.sprout_notes {
                if let Some(nf) = note.nullifier {
                    self.owned_nullifiers
                        .insert(Nullifier::Sprout(nf), NoteRef::Sprout(*op));
                }
            }
            for (op, note) in &record.sapling_notes {
                if let Some(nf) = note.nullifier {
                    self.owned_nullifiers
                        .insert(Nullifier::Sapling(nf), NoteRef::Sapling(*op));
                }
            }
        }
    }

    pub(crate) fn rebuild_owned_nullifiers(&mut self) {
        self.owned_nullifiers.clear();
        let txids = self.records.keys().copied().collect::<Vec<_>>();
        for txid in txids {
            self.index_owned_nullifiers(&txid);
        }
        self.invalidate_balances();
    }

    /// The note a nullifier belongs to, if the wallet owns it.
    pub fn note_for_nullifier(&self, nf: &Nullifier) -> Option<NoteRef> {
        self.owned_nullifiers.get(nf).copied()
    }

    /// Wallet transactions other than `txid` that spend an input or reveal a nullifier
    /// that `tx` also spends.
    pub fn conflicting_spenders(&self, tx: &Transaction) -> BTreeSet<TxId> {
        let txid = tx.txid();
        let mut result = BTreeSet::new();
        if !tx.is_coinbase() {
            for txin in &tx.vin {
                if let Some(spenders) = self.spends.get(&txin.prevout) {
                    result.extend(spenders.iter().filter(|s| **s != txid));
                }
            }
        }
        for nf in tx.nullifiers() {
            if let Some(spenders) = self.nullifier_spends.get(&nf) {
                result.extend(spenders.iter().filter(|s| **s != txid));
            }
        }
        result
    }

    /// Wallet transactions spending some output or note of `record`.
    fn spenders_of(&self, record: &TransactionRecord) -> BTreeSet<TxId> {
        let txid = record.txid();
        let mut result = BTreeSet::new();
        for n in 0..record.tx().vout.len() {
            if let Some(spenders) = self.spends.get(&OutPoint::new(txid, n as u32)) {
                result.extend(spenders.iter().copied());
            }
        }
        let nullifiers = record
            .sprout_notes
            .values()
            .filter_map(|n| n.nullifier.map(Nullifier::Sprout))
            .chain(
                record
                    .sapling_notes
                    .values()
                    .filter_map(|n| n.nullifier.map(Nullifier::Sapling)),
            );
        for nf in nullifiers {
            if let Some(spenders) = self.nullifier_spends.get(&nf) {
                result.extend(spenders.iter().copied());
            }
        }
        result
    }

    fn spent_by(&self, spenders: Option<&BTreeSet<TxId>>) -> bool {
        spenders.is_some_and(|spenders| {
            spenders.iter().any(|txid| match self.records.get(txid) {
                Some(r) => {
                    let depth = r.depth(self.tip);
                    depth > 0 || (depth == 0 && !r.status.is_abandoned())
                }
                None => false,
            })
        })
    }

    /// Whether a wallet transaction that is confirmed, or may still confirm, spends
    /// `outpoint`.
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent_by(self.spends.get(outpoint))
    }

    pub fn is_nullifier_spent(&self, nf: &Nullifier) -> bool {
        self.spent_by(self.nullifier_spends.get(nf))
    }

    /// The depth of the deepest confirmed wallet transaction revealing `nf`, or 0 if it
    /// is unspent.
    pub fn spend_depth(&self, nf: &Nullifier) -> u32 {
        self.nullifier_spends
            .get(nf)
            .map(|spenders| {
                spenders
                    .iter()
                    .filter_map(|txid| self.records.get(txid))
                    .map(|r| r.depth(self.tip).max(0) as u32)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    pub fn is_used_destination(&self, addr: &TransparentAddress) -> bool {
        self.used_destinations.contains(addr)
    }

    /// Marks `txid`, and every wallet transaction descending from it, as conflicting
    /// with the block `block` at `height`.
    ///
    /// Has no effect unless `height` is in the active chain.
    pub fn mark_conflicted(&mut self, block: BlockHash, height: BlockHeight, txid: TxId) {
        let conflict_depth = -i64::from(depth_at(self.tip, height));
        if conflict_depth >= 0 {
            return;
        }

        let mut todo = VecDeque::from([txid]);
        let mut done = BTreeSet::new();
        while let Some(now) = todo.pop_front() {
            if !done.insert(now) {
                continue;
            }
            let Some(record) = self.records.get(&now) else {
                continue;
            };
            if conflict_depth < record.depth(self.tip) {
                warn!(
                    "Transaction {} conflicts with block {} at height {}",
                    now, block, height
                );
                let spenders = self.spenders_of(record);
                todo.extend(spenders.into_iter().filter(|s| !done.contains(s)));
                if let Some(record) = self.records.get_mut(&now) {
                    record.status = TxStatus::Conflicted { block, height };
                }
                self.mark_dirty(now);
            }
        }
    }

    /// Marks an unconfirmed transaction that is not in the mempool, and every wallet
    /// transaction descending from it, as abandoned. Their inputs become spendable again.
    pub fn abandon(&mut self, txid: &TxId) -> Result<()> {
        let record = self
            .records
            .get(txid)
            .ok_or(Error::TransactionNotFound(*txid))?;
        if record.depth(self.tip) != 0 || record.in_mempool {
            return Err(Error::CannotAbandon(*txid));
        }

        let mut todo = VecDeque::from([*txid]);
        let mut done = BTreeSet::new();
        while let Some(now) = todo.pop_front() {
            if !done.insert(now) {
                continue;
            }
            let Some(record) = self.records.get(&now) else {
                continue;
            };
            if record.depth(self.tip) == 0 && !record.status.is_abandoned() {
                let spenders = self.spenders_of(record);
                todo.extend(spenders.into_iter().filter(|s| !done.contains(s)));
                if let Some(record) = self.records.get_mut(&now) {
                    record.status = TxStatus::Abandoned;
                    for note in record.sprout_notes.values_mut() {
                        note.witnesses.clear();
                        note.nullifier = None;
                    }
                    for note in record.sapling_notes.values_mut() {
                        note.witnesses.clear();
                        note.nullifier = None;
                    }
                }
                debug!("Abandoned transaction {}", now);
                self.mark_dirty(now);
            }
        }
        self.rebuild_owned_nullifiers();
        Ok(())
    }

    /// Moves every record confirmed in, or conflicted by, `block` back to unconfirmed.
    pub fn disconnect_block(&mut self, block: &Block) {
        let mut reverted = vec![];
        for (txid, record) in self.records.iter_mut() {
            let affected = match record.status {
                TxStatus::Confirmed { block: b, .. } | TxStatus::Conflicted { block: b, .. } => {
                    b == block.hash
                }
                _ => false,
            };
            if affected {
                record.status = TxStatus::Unconfirmed;
                reverted.push(*txid);
            }
        }
        for txid in reverted {
            debug!("Transaction {} returned to unconfirmed by disconnect", txid);
            self.mark_dirty(txid);
        }
        let height = u32::from(block.height);
        self.set_tip(height.checked_sub(1).map(BlockHeight::from_u32));
    }

    pub fn set_in_mempool(&mut self, txid: &TxId, in_mempool: bool) {
        if let Some(record) = self.records.get_mut(txid) {
            if record.in_mempool != in_mempool {
                record.in_mempool = in_mempool;
                self.invalidate_balances();
            }
        }
    }

    pub fn on_removed_from_mempool(&mut self, txid: &TxId, reason: MemPoolRemovalReason) {
        if let Some(record) = self.records.get_mut(txid) {
            record.in_mempool = false;
            if let MemPoolRemovalReason::Replaced { by } = reason {
                record
                    .metadata
                    .insert(record::REPLACED_BY_TXID.to_owned(), by.to_string());
                self.mark_dirty(*txid);
            }
            debug!("Transaction {} left the mempool: {:?}", txid, reason);
            self.invalidate_balances();
        }
    }

    pub fn set_last_broadcast(&mut self, txid: &TxId, time: i64) {
        if let Some(record) = self.records.get_mut(txid) {
            record.last_broadcast = Some(time);
            self.mark_dirty(*txid);
        }
    }

    pub fn set_comment(&mut self, txid: &TxId, comment: String) -> Result<()> {
        let record = self
            .records
            .get_mut(txid)
            .ok_or(Error::TransactionNotFound(*txid))?;
        record
            .metadata
            .insert(record::COMMENT.to_owned(), comment);
        self.mark_dirty(*txid);
        Ok(())
    }

    //
    // Locked coins
    //

    pub fn lock_coin(&mut self, outpoint: OutPoint) {
        self.locked_coins.insert(outpoint);
    }

    pub fn unlock_coin(&mut self, outpoint: &OutPoint) {
        self.locked_coins.remove(outpoint);
    }

    pub fn is_locked_coin(&self, outpoint: &OutPoint) -> bool {
        self.locked_coins.contains(outpoint)
    }

    pub fn lock_note(&mut self, note: NoteRef) {
        self.locked_notes.insert(note);
    }

    pub fn unlock_note(&mut self, note: &NoteRef) {
        self.locked_notes.remove(note);
    }

    pub fn is_locked_note(&self, note: &NoteRef) -> bool {
        self.locked_notes.contains(note)
    }

    pub fn unlock_all(&mut self) {
        self.locked_coins.clear();
        self.locked_notes.clear();
    }

    pub fn locked_coins(&self) -> impl Iterator<Item = &OutPoint> {
        self.locked_coins.iter()
    }
}

/// Replaces `existing` with a non-empty `incoming` map when any note differs, carrying
/// over derived state for notes present in both. Returns whether anything changed.
fn merge_notes<K: Ord + Copy, V>(
    existing: &mut BTreeMap<K, V>,
    mut incoming: BTreeMap<K, V>,
    same: fn(&V, &V) -> bool,
    carry: impl Fn(&V, &mut V),
) -> bool {
    if incoming.is_empty() {
        return false;
    }
    let unchanged = incoming.len() == existing.len()
        && incoming
            .iter()
            .all(|(k, v)| existing.get(k).is_some_and(|old| same(old, v)));
    if unchanged {
        return false;
    }
    for (k, new) in incoming.iter_mut() {
        if let Some(old) = existing.get(k) {
            carry(old, new);
        }
    }
    *existing = incoming;
    true
}

#[cfg(test)]
mod tests;
