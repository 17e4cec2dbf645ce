//! Balances, trust and the listing of spendable value.

use zcash_protocol::consensus::BlockHeight;
use zcash_wallet_keys::sapling_keys::IvkTag;

use crate::ownership::{IsMine, Ownership, OwnershipFilter};
use crate::primitives::{Nullifier, OutPoint, TxOut};

use super::{NoteRef, TransactionRecord, WalletLedger, WitnessState};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolBalance {
    /// Value in transactions that are confirmed, or that are our own change.
    pub trusted: u64,
    /// Value in unconfirmed transactions from others that are in the mempool.
    pub untrusted_pending: u64,
    /// Coinbase value that is not yet spendable.
    pub immature: u64,
}

impl PoolBalance {
    pub fn total(&self) -> u64 {
        self.trusted + self.untrusted_pending + self.immature
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WalletBalance {
    pub transparent: PoolBalance,
    pub sprout: PoolBalance,
    pub sapling: PoolBalance,
}

impl WalletBalance {
    pub fn total(&self) -> u64 {
        self.transparent.total() + self.sprout.total() + self.sapling.total()
    }

    pub fn trusted(&self) -> u64 {
        self.transparent.trusted + self.sprout.trusted + self.sapling.trusted
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BalanceQuery {
    pub min_depth: u32,
    pub include_unconfirmed: bool,
    pub filter: OwnershipFilter,
    /// Excludes outputs paying to destinations that have already been spent from.
    pub avoid_reuse: bool,
    pub spend_zero_conf_change: bool,
}

impl Default for BalanceQuery {
    fn default() -> Self {
        BalanceQuery {
            min_depth: 0,
            include_unconfirmed: true,
            filter: OwnershipFilter::Spendable,
            avoid_reuse: false,
            spend_zero_conf_change: true,
        }
    }
}

/// A transparent output owned by the wallet and available to spend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletOutput {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    pub depth: u32,
    pub spendable: bool,
    /// Whether the containing transaction is trusted not to be double-spent.
    pub safe: bool,
    pub from_me: bool,
}

/// A shielded note owned by the wallet and available to spend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoteOutput {
    pub note: NoteRef,
    pub value: u64,
    pub depth: u32,
    /// The wallet holds the spending key and a witness current as of the tip.
    pub spendable: bool,
    pub safe: bool,
    pub from_me: bool,
    pub ivk: Option<IvkTag>,
}

/// Which coins and notes [`WalletLedger::available_coins`] and
/// [`WalletLedger::available_notes`] report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoinQuery {
    pub min_depth: u32,
    pub max_depth: u32,
    pub only_safe: bool,
    pub include_watch_only: bool,
    pub avoid_reuse: bool,
    pub spend_zero_conf_change: bool,
}

impl Default for CoinQuery {
    fn default() -> Self {
        CoinQuery {
            min_depth: 0,
            max_depth: u32::MAX,
            only_safe: true,
            include_watch_only: false,
            avoid_reuse: false,
            spend_zero_conf_change: true,
        }
    }
}

impl WalletLedger {
    fn parent_output(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.records
            .get(&outpoint.txid)
            .and_then(|parent| parent.tx().vout.get(outpoint.n as usize))
    }

    fn note_value(&self, note: &NoteRef) -> Option<u64> {
        let record = self.records.get(&note.txid())?;
        match note {
            NoteRef::Sprout(op) => record.sprout_notes.get(op).map(|n| n.value),
            NoteRef::Sapling(op) => record.sapling_notes.get(op).map(|n| n.value),
        }
    }

    fn note_ownership<O: Ownership>(&self, owner: &O, note: &NoteRef) -> IsMine {
        let Some(record) = self.records.get(&note.txid()) else {
            return IsMine::No;
        };
        match note {
            NoteRef::Sprout(op) => record
                .sprout_notes
                .get(op)
                .map_or(IsMine::No, |n| owner.sprout_ownership(&n.address)),
            NoteRef::Sapling(op) => record
                .sapling_notes
                .get(op)
                .map_or(IsMine::No, |n| owner.sapling_ownership(&n.ivk)),
        }
    }

    /// The value owned by the wallet that `record` spends.
    pub fn debit<O: Ownership>(
        &self,
        record: &TransactionRecord,
        owner: &O,
        filter: OwnershipFilter,
    ) -> u64 {
        let mut debit = 0;
        if !record.is_coinbase() {
            for txin in &record.tx().vin {
                if let Some(out) = self.parent_output(&txin.prevout) {
                    if owner.is_mine_script(&out.script_pubkey).matches(filter) {
                        debit += out.value.into_u64();
                    }
                }
            }
        }
        for nf in record.tx().nullifiers() {
            if let Some(note) = self.owned_nullifiers.get(&nf) {
                if self.note_ownership(owner, note).matches(filter) {
                    debit += self.note_value(note).unwrap_or(0);
                }
            }
        }
        debit
    }

    pub fn is_from_me<O: Ownership>(&self, record: &TransactionRecord, owner: &O) -> bool {
        record.from_me || self.debit(record, owner, OwnershipFilter::All) > 0
    }

    /// Whether the outputs of `record` can be relied on.
    ///
    /// Confirmed records are trusted. Unconfirmed records are trusted only when they
    /// spend exclusively our own spendable outputs, are in the mempool, have not
    /// expired, and zero-confirmation change spending is enabled.
    pub fn is_trusted<O: Ownership>(
        &self,
        record: &TransactionRecord,
        owner: &O,
        spend_zero_conf_change: bool,
    ) -> bool {
        if record.is_expired(self.tip) {
            return false;
        }
        let depth = record.depth(self.tip);
        if depth >= 1 {
            return true;
        }
        if depth < 0 || !spend_zero_conf_change || !self.is_from_me(record, owner) {
            return false;
        }
        if !record.in_mempool {
            return false;
        }
        record.tx().vin.iter().all(|txin| {
            self.parent_output(&txin.prevout)
                .is_some_and(|out| owner.is_mine_script(&out.script_pubkey) == IsMine::Spendable)
        })
    }

    fn transparent_credit<O: Ownership>(
        &self,
        record: &TransactionRecord,
        owner: &O,
        filter: OwnershipFilter,
        avoid_reuse: bool,
    ) -> u64 {
        let txid = record.txid();
        record
            .tx()
            .vout
            .iter()
            .enumerate()
            .filter(|(n, out)| {
                !self.is_spent(&OutPoint::new(txid, *n as u32))
                    && owner.is_mine_script(&out.script_pubkey).matches(filter)
                    && !(avoid_reuse
                        && out
                            .script_pubkey
                            .address()
                            .is_some_and(|a| self.is_used_destination(&a)))
            })
            .map(|(_, out)| out.value.into_u64())
            .sum()
    }

    fn sprout_credit<O: Ownership>(
        &self,
        record: &TransactionRecord,
        owner: &O,
        filter: OwnershipFilter,
    ) -> u64 {
        record
            .sprout_notes
            .values()
            .filter(|n| {
                !n.nullifier
                    .is_some_and(|nf| self.is_nullifier_spent(&Nullifier::Sprout(nf)))
                    && owner.sprout_ownership(&n.address).matches(filter)
            })
            .map(|n| n.value)
            .sum()
    }

    fn sapling_credit<O: Ownership>(
        &self,
        record: &TransactionRecord,
        owner: &O,
        filter: OwnershipFilter,
    ) -> u64 {
        record
            .sapling_notes
            .values()
            .filter(|n| {
                !n.nullifier
                    .is_some_and(|nf| self.is_nullifier_spent(&Nullifier::Sapling(nf)))
                    && owner.sapling_ownership(&n.ivk).matches(filter)
            })
            .map(|n| n.value)
            .sum()
    }

    /// Computes the wallet balance per pool. The result is cached until the ledger or
    /// the tip changes, or [`WalletLedger::invalidate_balances`] is called.
    pub fn compute_balance<O: Ownership>(&mut self, owner: &O, query: BalanceQuery) -> WalletBalance {
        if let Some((cached_query, tip, balance)) = &self.balance_cache {
            if *cached_query == query && *tip == self.tip {
                return *balance;
            }
        }

        let mut balance = WalletBalance::default();
        for record in self.records.values() {
            let credit = [
                self.transparent_credit(record, owner, query.filter, query.avoid_reuse),
                self.sprout_credit(record, owner, query.filter),
                self.sapling_credit(record, owner, query.filter),
            ];
            let pools = [
                &mut balance.transparent,
                &mut balance.sprout,
                &mut balance.sapling,
            ];

            let depth = record.depth(self.tip);
            if record.is_immature_coinbase(self.tip, self.coinbase_maturity) {
                if depth > 0 {
                    for (pool, value) in pools.into_iter().zip(credit) {
                        pool.immature += value;
                    }
                }
                continue;
            }

            let min_depth = if query.include_unconfirmed {
                i64::from(query.min_depth)
            } else {
                i64::from(query.min_depth.max(1))
            };
            if self.is_trusted(record, owner, query.spend_zero_conf_change) {
                if depth >= min_depth {
                    for (pool, value) in pools.into_iter().zip(credit) {
                        pool.trusted += value;
                    }
                }
            } else if depth == 0 && record.in_mempool && query.include_unconfirmed {
                for (pool, value) in pools.into_iter().zip(credit) {
                    pool.untrusted_pending += value;
                }
            }
        }

        self.balance_cache = Some((query, self.tip, balance));
        balance
    }

    pub fn invalidate_balances(&mut self) {
        self.balance_cache = None;
    }

    /// Returns `None` if the record's outputs cannot currently be spent at all, or
    /// `Some((depth, safe))` otherwise.
    fn spendability<O: Ownership>(
        &self,
        record: &TransactionRecord,
        owner: &O,
        query: &CoinQuery,
    ) -> Option<(u32, bool)> {
        if record.is_immature_coinbase(self.tip, self.coinbase_maturity) {
            return None;
        }
        let depth = record.depth(self.tip);
        if depth < 0 || (depth == 0 && !record.in_mempool) {
            return None;
        }
        let mut safe = self.is_trusted(record, owner, query.spend_zero_conf_change);
        if depth == 0 && record.metadata.contains_key(super::record::REPLACED_BY_TXID) {
            safe = false;
        }
        if query.only_safe && !safe {
            return None;
        }
        let depth = depth as u32;
        if depth < query.min_depth || depth > query.max_depth {
            return None;
        }
        Some((depth, safe))
    }

    /// Lists the unspent, unlocked transparent outputs owned by the wallet.
    pub fn available_coins<O: Ownership>(&self, owner: &O, query: &CoinQuery) -> Vec<WalletOutput> {
        let mut coins = vec![];
        for record in self.records.values() {
            let Some((depth, safe)) = self.spendability(record, owner, query) else {
                continue;
            };
            let from_me = self.is_from_me(record, owner);
            let txid = record.txid();
            for (n, txout) in record.tx().vout.iter().enumerate() {
                let outpoint = OutPoint::new(txid, n as u32);
                if self.is_locked_coin(&outpoint) || self.is_spent(&outpoint) {
                    continue;
                }
                let mine = owner.is_mine_script(&txout.script_pubkey);
                if mine == IsMine::No {
                    continue;
                }
                if query.avoid_reuse
                    && txout
                        .script_pubkey
                        .address()
                        .is_some_and(|a| self.is_used_destination(&a))
                {
                    continue;
                }
                let spendable = mine == IsMine::Spendable;
                if !spendable && !query.include_watch_only {
                    continue;
                }
                coins.push(WalletOutput {
                    outpoint,
                    txout: txout.clone(),
                    depth,
                    spendable,
                    safe,
                    from_me,
                });
            }
        }
        coins
    }

    /// Lists the unspent, unlocked shielded notes owned by the wallet.
    pub fn available_notes<O: Ownership>(&self, owner: &O, query: &CoinQuery) -> Vec<NoteOutput> {
        let mut notes = vec![];
        for record in self.records.values() {
            let Some((depth, safe)) = self.spendability(record, owner, query) else {
                continue;
            };
            let from_me = self.is_from_me(record, owner);

            for (op, note) in &record.sprout_notes {
                let note_ref = NoteRef::Sprout(*op);
                let spent = note
                    .nullifier
                    .is_some_and(|nf| self.is_nullifier_spent(&Nullifier::Sprout(nf)));
                let mine = owner.sprout_ownership(&note.address);
                if spent || self.is_locked_note(&note_ref) || mine == IsMine::No {
                    continue;
                }
                let spendable = mine == IsMine::Spendable
                    && witness_is_current(note.witnesses.state(), note.witnesses.height(), self.tip);
                if mine == IsMine::WatchOnly && !query.include_watch_only {
                    continue;
                }
                notes.push(NoteOutput {
                    note: note_ref,
                    value: note.value,
                    depth,
                    spendable,
                    safe,
                    from_me,
                    ivk: None,
                });
            }

            for (op, note) in &record.sapling_notes {
                let note_ref = NoteRef::Sapling(*op);
                let spent = note
                    .nullifier
                    .is_some_and(|nf| self.is_nullifier_spent(&Nullifier::Sapling(nf)));
                let mine = owner.sapling_ownership(&note.ivk);
                if spent || self.is_locked_note(&note_ref) || mine == IsMine::No {
                    continue;
                }
                let spendable = mine == IsMine::Spendable
                    && witness_is_current(note.witnesses.state(), note.witnesses.height(), self.tip);
                if mine == IsMine::WatchOnly && !query.include_watch_only {
                    continue;
                }
                notes.push(NoteOutput {
                    note: note_ref,
                    value: note.value,
                    depth,
                    spendable,
                    safe,
                    from_me,
                    ivk: Some(note.ivk),
                });
            }
        }
        notes
    }
}

fn witness_is_current(
    state: WitnessState,
    height: Option<BlockHeight>,
    tip: Option<BlockHeight>,
) -> bool {
    state == WitnessState::Validated && height.is_some() && height == tip
}
