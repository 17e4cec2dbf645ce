use std::collections::BTreeSet;

use assert_matches::assert_matches;
use zcash_protocol::{consensus::BlockHeight, value::Zatoshis, TxId};
use zcash_wallet_keys::{sapling_keys::IvkTag, sprout::SproutPaymentAddress};

use super::{
    BalanceQuery, CoinQuery, MemPoolRemovalReason, TxStatus, TxUpdate, UpdateOutcome,
    WalletLedger,
};
use crate::error::Error;
use crate::ownership::{IsMine, Ownership, OwnershipFilter};
use crate::primitives::{BlockHash, OutPoint, Script, Transaction, TxOut};
use crate::testing::{coinbase_tx, payment_tx, MockChain};

/// Owns a fixed set of transparent scripts and nothing shielded.
#[derive(Default)]
struct Scripts(BTreeSet<Script>);

impl Ownership for Scripts {
    fn is_mine_script(&self, script: &Script) -> IsMine {
        if self.0.contains(script) {
            IsMine::Spendable
        } else {
            IsMine::No
        }
    }

    fn sprout_ownership(&self, _: &SproutPaymentAddress) -> IsMine {
        IsMine::No
    }

    fn sapling_ownership(&self, _: &IvkTag) -> IsMine {
        IsMine::No
    }
}

fn mine() -> Script {
    Script::p2pkh(&[1; 20])
}

fn theirs() -> Script {
    Script::p2pkh(&[2; 20])
}

fn owner() -> Scripts {
    Scripts([mine()].into_iter().collect())
}

fn out(value: u64, script: Script) -> TxOut {
    TxOut::new(Zatoshis::const_from_u64(value), script)
}

fn foreign(n: u8) -> OutPoint {
    OutPoint::new(TxId::from_bytes([n; 32]), 0)
}

fn height(h: u32) -> Option<BlockHeight> {
    Some(BlockHeight::from_u32(h))
}

fn unconfirmed(tx: Transaction) -> TxUpdate {
    TxUpdate::new(tx, TxStatus::Unconfirmed)
}

#[test]
fn updates_are_idempotent() {
    let mut chain = MockChain::new();
    let tx = payment_tx(&[foreign(9)], vec![out(10_000, mine())]);
    let txid = tx.txid();
    let block = chain.push_block(vec![tx.clone()]);

    let mut ledger = WalletLedger::new(100);
    ledger.set_tip(Some(block.height));
    assert_eq!(ledger.add_or_update(unconfirmed(tx.clone()), 10), UpdateOutcome::New);
    assert_eq!(ledger.add_or_update(unconfirmed(tx.clone()), 11), UpdateOutcome::Unchanged);

    let confirmed = TxUpdate::confirmed(tx.clone(), &block, 0);
    assert_eq!(ledger.add_or_update(confirmed.clone(), 12), UpdateOutcome::Updated);
    assert_eq!(ledger.add_or_update(confirmed, 13), UpdateOutcome::Unchanged);
    // A later unconfirmed sighting does not undo the confirmation.
    assert_eq!(ledger.add_or_update(unconfirmed(tx), 14), UpdateOutcome::Unchanged);

    assert_eq!(ledger.len(), 1);
    let record = ledger.get(&txid).unwrap();
    assert_eq!(record.time_received, 10);
    assert_eq!(ledger.depth(&txid), Some(1));
    assert_eq!(ledger.take_dirty(), [txid].into_iter().collect());
    assert!(ledger.take_dirty().is_empty());
}

#[test]
fn abandoned_transactions_can_reappear() {
    let mut ledger = WalletLedger::new(100);
    let tx = payment_tx(&[foreign(9)], vec![out(10_000, mine())]);
    let txid = tx.txid();
    ledger.add_or_update(unconfirmed(tx.clone()), 0);

    ledger.abandon(&txid).unwrap();
    assert_eq!(ledger.get(&txid).unwrap().status, TxStatus::Abandoned);
    assert!(!ledger.is_spent(&foreign(9)));

    assert_eq!(ledger.add_or_update(unconfirmed(tx), 1), UpdateOutcome::Updated);
    assert_eq!(ledger.get(&txid).unwrap().status, TxStatus::Unconfirmed);
    assert!(ledger.is_spent(&foreign(9)));
}

#[test]
fn abandon_requires_an_unconfirmed_transaction_outside_the_mempool() {
    let mut chain = MockChain::new();
    let mut ledger = WalletLedger::new(100);

    let confirmed = payment_tx(&[foreign(1)], vec![out(1_000, mine())]);
    let block = chain.push_block(vec![confirmed.clone()]);
    ledger.set_tip(Some(block.height));
    ledger.add_or_update(TxUpdate::confirmed(confirmed.clone(), &block, 0), 0);
    assert_matches!(
        ledger.abandon(&confirmed.txid()),
        Err(Error::CannotAbandon(txid)) if txid == confirmed.txid()
    );

    let pending = payment_tx(&[foreign(2)], vec![out(1_000, mine())]);
    ledger.add_or_update(unconfirmed(pending.clone()), 0);
    ledger.set_in_mempool(&pending.txid(), true);
    assert_matches!(ledger.abandon(&pending.txid()), Err(Error::CannotAbandon(_)));

    assert_matches!(
        ledger.abandon(&TxId::from_bytes([7; 32])),
        Err(Error::TransactionNotFound(_))
    );
}

#[test]
fn abandon_reaches_descendants() {
    let mut ledger = WalletLedger::new(100);
    let parent = payment_tx(&[foreign(1)], vec![out(5_000, mine())]);
    let child = payment_tx(&[OutPoint::new(parent.txid(), 0)], vec![out(4_000, theirs())]);
    let unrelated = payment_tx(&[foreign(2)], vec![out(3_000, mine())]);
    for tx in [&parent, &child, &unrelated] {
        ledger.add_or_update(unconfirmed(tx.clone()), 0);
    }

    ledger.abandon(&parent.txid()).unwrap();
    assert!(ledger.get(&parent.txid()).unwrap().status.is_abandoned());
    assert!(ledger.get(&child.txid()).unwrap().status.is_abandoned());
    assert_eq!(ledger.get(&unrelated.txid()).unwrap().status, TxStatus::Unconfirmed);
    assert!(!ledger.is_spent(&OutPoint::new(parent.txid(), 0)));
}

#[test]
fn conflicts_close_over_descendants_and_revert_on_disconnect() {
    let mut chain = MockChain::new();
    let mut ledger = WalletLedger::new(100);

    let coinbase = coinbase_tx(chain.next_height(), vec![out(50_000, mine())]);
    let funding = chain.push_block(vec![coinbase.clone()]);
    ledger.set_tip(Some(funding.height));
    ledger.add_or_update(TxUpdate::confirmed(coinbase.clone(), &funding, 0), 0);

    let spend = payment_tx(&[OutPoint::new(coinbase.txid(), 0)], vec![out(40_000, mine())]);
    let child = payment_tx(&[OutPoint::new(spend.txid(), 0)], vec![out(30_000, theirs())]);
    ledger.add_or_update(unconfirmed(spend.clone()), 1);
    ledger.add_or_update(unconfirmed(child.clone()), 2);

    let double_spend = payment_tx(&[OutPoint::new(coinbase.txid(), 0)], vec![out(49_000, theirs())]);
    assert_eq!(
        ledger.conflicting_spenders(&double_spend),
        [spend.txid()].into_iter().collect()
    );
    let block = chain.push_block(vec![double_spend]);
    ledger.set_tip(Some(block.height));
    ledger.mark_conflicted(block.hash, block.height, spend.txid());

    let expected = TxStatus::Conflicted {
        block: block.hash,
        height: block.height,
    };
    assert_eq!(ledger.get(&spend.txid()).unwrap().status, expected);
    assert_eq!(ledger.get(&child.txid()).unwrap().status, expected);
    assert_eq!(ledger.depth(&spend.txid()), Some(-1));
    assert_eq!(ledger.depth(&child.txid()), Some(-1));

    ledger.disconnect_block(&block);
    assert_eq!(ledger.tip(), Some(funding.height));
    assert_eq!(ledger.get(&spend.txid()).unwrap().status, TxStatus::Unconfirmed);
    assert_eq!(ledger.get(&child.txid()).unwrap().status, TxStatus::Unconfirmed);
}

#[test]
fn conflicts_outside_the_active_chain_are_ignored() {
    let mut ledger = WalletLedger::new(100);
    let tx = payment_tx(&[foreign(1)], vec![out(1_000, mine())]);
    ledger.add_or_update(unconfirmed(tx.clone()), 0);
    ledger.set_tip(height(5));
    ledger.mark_conflicted(BlockHash([3; 32]), BlockHeight::from_u32(6), tx.txid());
    assert_eq!(ledger.get(&tx.txid()).unwrap().status, TxStatus::Unconfirmed);
}

#[test]
fn disconnect_and_reconnect_restore_the_confirmation() {
    let mut chain = MockChain::new();
    let mut ledger = WalletLedger::new(100);
    let tx = payment_tx(&[foreign(1)], vec![out(1_000, mine())]);
    let block = chain.push_block(vec![tx.clone()]);
    ledger.set_tip(Some(block.height));
    ledger.add_or_update(TxUpdate::confirmed(tx.clone(), &block, 0), 0);
    let status = ledger.get(&tx.txid()).unwrap().status;

    ledger.disconnect_block(&block);
    assert_eq!(ledger.get(&tx.txid()).unwrap().status, TxStatus::Unconfirmed);
    assert_eq!(ledger.depth(&tx.txid()), Some(0));

    ledger.set_tip(Some(block.height));
    assert_eq!(
        ledger.add_or_update(TxUpdate::confirmed(tx.clone(), &block, 0), 1),
        UpdateOutcome::Updated
    );
    assert_eq!(ledger.get(&tx.txid()).unwrap().status, status);
}

#[test]
fn smart_time_never_precedes_earlier_records() {
    let mut chain = MockChain::new();
    let mut ledger = WalletLedger::new(100);
    chain.push_block(vec![]);

    let first = payment_tx(&[foreign(1)], vec![out(1_000, mine())]);
    ledger.add_or_update(unconfirmed(first.clone()), 1_000);
    assert_eq!(ledger.get(&first.txid()).unwrap().time_smart, 1_000);

    // A block from the future is clamped to the time of receipt.
    let second = payment_tx(&[foreign(2)], vec![out(1_000, mine())]);
    let mut block = chain.push_block(vec![second.clone()]);
    block.time = 5_000;
    ledger.add_or_update(TxUpdate::confirmed(second.clone(), &block, 0), 2_000);
    assert_eq!(ledger.get(&second.txid()).unwrap().time_smart, 2_000);

    // A block from the past does not move the entry before the previous one.
    let third = payment_tx(&[foreign(3)], vec![out(1_000, mine())]);
    let mut block = chain.push_block(vec![third.clone()]);
    block.time = 500;
    ledger.add_or_update(TxUpdate::confirmed(third.clone(), &block, 0), 3_000);
    assert_eq!(ledger.get(&third.txid()).unwrap().time_smart, 2_000);

    let order = ledger.iter_ordered().map(|r| r.txid()).collect::<Vec<_>>();
    assert_eq!(order, vec![first.txid(), second.txid(), third.txid()]);
}

#[test]
fn coinbase_needs_maturity_plus_one_confirmations() {
    let mut chain = MockChain::new();
    let mut ledger = WalletLedger::new(100);
    let coinbase = coinbase_tx(chain.next_height(), vec![out(50_000, mine())]);
    let block = chain.push_block(vec![coinbase.clone()]);
    ledger.add_or_update(TxUpdate::confirmed(coinbase, &block, 0), 0);

    ledger.set_tip(height(100));
    let balance = ledger.compute_balance(&owner(), BalanceQuery::default());
    assert_eq!(balance.transparent.immature, 50_000);
    assert_eq!(balance.transparent.trusted, 0);
    assert!(ledger.available_coins(&owner(), &CoinQuery::default()).is_empty());

    ledger.set_tip(height(101));
    let balance = ledger.compute_balance(&owner(), BalanceQuery::default());
    assert_eq!(balance.transparent.immature, 0);
    assert_eq!(balance.transparent.trusted, 50_000);
    assert_eq!(ledger.available_coins(&owner(), &CoinQuery::default()).len(), 1);
}

#[test]
fn change_is_trusted_only_in_the_mempool() {
    let mut chain = MockChain::new();
    let mut ledger = WalletLedger::new(100);
    let owner = owner();

    let receive = payment_tx(&[foreign(1)], vec![out(10_000, mine())]);
    let block = chain.push_block(vec![receive.clone()]);
    ledger.set_tip(Some(block.height));
    ledger.add_or_update(TxUpdate::confirmed(receive.clone(), &block, 0), 0);
    assert_eq!(
        ledger
            .compute_balance(&owner, BalanceQuery::default())
            .transparent
            .trusted,
        10_000
    );

    let send = payment_tx(
        &[OutPoint::new(receive.txid(), 0)],
        vec![out(6_000, theirs()), out(3_000, mine())],
    );
    ledger.add_or_update(unconfirmed(send.clone()).with_from_me(true), 1);
    let record = ledger.get(&send.txid()).unwrap();
    assert_eq!(ledger.debit(record, &owner, OwnershipFilter::All), 10_000);

    // Spent funds leave the balance as soon as the spend is known.
    assert_eq!(ledger.compute_balance(&owner, BalanceQuery::default()).total(), 0);

    ledger.set_in_mempool(&send.txid(), true);
    let balance = ledger.compute_balance(&owner, BalanceQuery::default());
    assert_eq!(balance.transparent.trusted, 3_000);
    assert_eq!(balance.transparent.untrusted_pending, 0);

    let cautious = BalanceQuery {
        spend_zero_conf_change: false,
        ..BalanceQuery::default()
    };
    let balance = ledger.compute_balance(&owner, cautious);
    assert_eq!(balance.transparent.trusted, 0);
    assert_eq!(balance.transparent.untrusted_pending, 3_000);

    let confirmed_only = BalanceQuery {
        include_unconfirmed: false,
        ..BalanceQuery::default()
    };
    assert_eq!(ledger.compute_balance(&owner, confirmed_only).total(), 0);
}

#[test]
fn avoid_reuse_hides_outputs_to_spent_from_destinations() {
    let mut chain = MockChain::new();
    let mut ledger = WalletLedger::new(100);
    let owner = owner();

    let receive = payment_tx(&[foreign(1)], vec![out(5_000, mine()), out(7_000, mine())]);
    let first = chain.push_block(vec![receive.clone()]);
    ledger.set_tip(Some(first.height));
    ledger.add_or_update(TxUpdate::confirmed(receive.clone(), &first, 0), 0);

    let spend = payment_tx(&[OutPoint::new(receive.txid(), 0)], vec![out(4_000, theirs())]);
    let second = chain.push_block(vec![spend.clone()]);
    ledger.set_tip(Some(second.height));
    ledger.add_or_update(TxUpdate::confirmed(spend, &second, 0), 1);

    let addr = mine().address().unwrap();
    assert!(ledger.is_used_destination(&addr));

    let reuse = BalanceQuery::default();
    let avoid = BalanceQuery {
        avoid_reuse: true,
        ..BalanceQuery::default()
    };
    assert_eq!(ledger.compute_balance(&owner, reuse).transparent.trusted, 7_000);
    assert_eq!(ledger.compute_balance(&owner, avoid).transparent.trusted, 0);

    let query = CoinQuery {
        avoid_reuse: true,
        ..CoinQuery::default()
    };
    assert!(ledger.available_coins(&owner, &query).is_empty());
    assert_eq!(ledger.available_coins(&owner, &CoinQuery::default()).len(), 1);
}

#[test]
fn spends_seen_before_their_parent_mark_the_destination_used() {
    let mut chain = MockChain::new();
    let mut ledger = WalletLedger::new(100);
    let owner = owner();

    let receive = payment_tx(&[foreign(1)], vec![out(5_000, mine()), out(7_000, mine())]);
    let spend = payment_tx(&[OutPoint::new(receive.txid(), 0)], vec![out(4_000, theirs())]);
    ledger.add_or_update(unconfirmed(spend), 0);
    let addr = mine().address().unwrap();
    assert!(!ledger.is_used_destination(&addr));

    let block = chain.push_block(vec![receive.clone()]);
    ledger.set_tip(Some(block.height));
    ledger.add_or_update(TxUpdate::confirmed(receive, &block, 0), 1);
    assert!(ledger.is_used_destination(&addr));
    assert!(!ledger.is_used_destination(&theirs().address().unwrap()));

    let avoid = BalanceQuery {
        avoid_reuse: true,
        ..BalanceQuery::default()
    };
    assert_eq!(ledger.compute_balance(&owner, BalanceQuery::default()).transparent.trusted, 7_000);
    assert_eq!(ledger.compute_balance(&owner, avoid).transparent.trusted, 0);
}

#[test]
fn balance_buckets_partition_the_unspent_outputs() {
    let mut chain = MockChain::new();
    let mut ledger = WalletLedger::new(100);
    let owner = owner();

    let coinbase = coinbase_tx(chain.next_height(), vec![out(50_000, mine())]);
    let receive = payment_tx(&[foreign(1)], vec![out(10_000, mine()), out(20_000, mine())]);
    let block = chain.push_block(vec![coinbase.clone(), receive.clone()]);
    ledger.set_tip(Some(block.height));
    ledger.add_or_update(TxUpdate::confirmed(coinbase, &block, 0), 0);
    ledger.add_or_update(TxUpdate::confirmed(receive.clone(), &block, 1), 0);

    let send = payment_tx(
        &[OutPoint::new(receive.txid(), 0)],
        vec![out(6_000, theirs()), out(3_000, mine())],
    );
    ledger.add_or_update(unconfirmed(send.clone()).with_from_me(true), 1);
    ledger.set_in_mempool(&send.txid(), true);

    let incoming = payment_tx(&[foreign(2)], vec![out(2_000, mine())]);
    ledger.add_or_update(unconfirmed(incoming.clone()), 2);
    ledger.set_in_mempool(&incoming.txid(), true);

    let unspent: u64 = ledger
        .records()
        .flat_map(|record| {
            let txid = record.txid();
            record
                .tx()
                .vout
                .iter()
                .enumerate()
                .filter(|(n, out)| {
                    owner.is_mine_script(&out.script_pubkey) == IsMine::Spendable
                        && !ledger.is_spent(&OutPoint::new(txid, *n as u32))
                })
                .map(|(_, out)| out.value.into_u64())
                .collect::<Vec<_>>()
        })
        .sum();
    assert_eq!(unspent, 75_000);

    let balance = ledger.compute_balance(&owner, BalanceQuery::default());
    assert_eq!(balance.transparent.trusted, 23_000);
    assert_eq!(balance.transparent.untrusted_pending, 2_000);
    assert_eq!(balance.transparent.immature, 50_000);
    assert_eq!(balance.total(), unspent);

    // Zero-confirmation change moves between buckets without changing the total.
    let cautious = BalanceQuery {
        spend_zero_conf_change: false,
        ..BalanceQuery::default()
    };
    let balance = ledger.compute_balance(&owner, cautious);
    assert_eq!(balance.transparent.trusted, 20_000);
    assert_eq!(balance.transparent.untrusted_pending, 5_000);
    assert_eq!(balance.total(), unspent);
}

#[test]
fn locked_coins_are_not_available() {
    let mut chain = MockChain::new();
    let mut ledger = WalletLedger::new(100);
    let receive = payment_tx(&[foreign(1)], vec![out(5_000, mine()), out(7_000, mine())]);
    let block = chain.push_block(vec![receive.clone()]);
    ledger.set_tip(Some(block.height));
    ledger.add_or_update(TxUpdate::confirmed(receive.clone(), &block, 0), 0);

    let locked = OutPoint::new(receive.txid(), 1);
    ledger.lock_coin(locked);
    let coins = ledger.available_coins(&owner(), &CoinQuery::default());
    assert_eq!(coins.len(), 1);
    assert_eq!(coins[0].outpoint, OutPoint::new(receive.txid(), 0));
    assert_eq!(ledger.locked_coins().collect::<Vec<_>>(), vec![&locked]);

    ledger.unlock_all();
    assert_eq!(ledger.available_coins(&owner(), &CoinQuery::default()).len(), 2);
}

#[test]
fn replacement_is_recorded() {
    let mut ledger = WalletLedger::new(100);
    let tx = payment_tx(&[foreign(1)], vec![out(1_000, mine())]);
    let by = TxId::from_bytes([8; 32]);
    ledger.add_or_update(unconfirmed(tx.clone()), 0);
    ledger.set_in_mempool(&tx.txid(), true);
    ledger.take_dirty();

    ledger.on_removed_from_mempool(&tx.txid(), MemPoolRemovalReason::Replaced { by });
    let record = ledger.get(&tx.txid()).unwrap();
    assert!(!record.in_mempool);
    assert_eq!(
        record.metadata.get(super::record::REPLACED_BY_TXID),
        Some(&by.to_string())
    );
    assert!(ledger.take_dirty().contains(&tx.txid()));
}

#[test]
fn zap_keeps_the_tip() {
    let mut ledger = WalletLedger::new(100);
    ledger.set_tip(height(7));
    let tx = payment_tx(&[foreign(1)], vec![out(1_000, mine())]);
    ledger.add_or_update(unconfirmed(tx.clone()), 0);

    assert_eq!(ledger.zap(), vec![tx.txid()]);
    assert!(ledger.is_empty());
    assert_eq!(ledger.tip(), height(7));
    assert!(!ledger.is_spent(&foreign(1)));
}
