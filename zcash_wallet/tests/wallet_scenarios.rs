//! End-to-end behaviour of a wallet following a mock chain.

use assert_matches::assert_matches;
use rand_chacha::ChaChaRng;
use rand_core::SeedableRng;
use zcash_protocol::{
    consensus::{BlockHeight, NetworkType},
    value::Zatoshis,
};
use zcash_wallet::{
    config::WalletConfig,
    error::Error,
    ledger::{MemPoolRemovalReason, TxStatus},
    primitives::{Block, OutPoint, PaymentAddress, Script, Transaction, TransparentAddress, TxOut},
    scan::{DefaultScanner, NoteScanner},
    selection::{
        assembler::{Payment, TransactionRequest},
        fees::NoEstimates,
    },
    store::MemoryStore,
    testing::{
        coinbase_tx, payment_tx, sapling_output_tx, MockBroadcaster, MockChain, MockProver,
        MockScanner, BLOCK_INTERVAL,
    },
    wallet::{RescanStatus, WalletFlags},
    Wallet,
};
use zcash_wallet_keys::{sapling_keys::SaplingViewingKey, transparent::KeyChain};

const COIN: u64 = 100_000_000;

fn config() -> WalletConfig {
    WalletConfig::new(NetworkType::Test)
        .with_keypool_size(2)
        .with_kdf_target(std::time::Duration::from_millis(1))
}

fn new_wallet<N: NoteScanner>(name: &str, scanner: N, rng: &mut ChaChaRng) -> Wallet<MemoryStore, N> {
    Wallet::create(
        name,
        config(),
        MemoryStore::new(),
        scanner,
        WalletFlags::empty(),
        0,
        rng,
    )
    .unwrap()
}

fn out(value: u64, script: Script) -> TxOut {
    TxOut::new(Zatoshis::const_from_u64(value), script)
}

fn foreign(byte: u8) -> TransparentAddress {
    TransparentAddress::PublicKeyHash([byte; 20])
}

/// Mines a block containing `vtx` and tells the wallet about it.
fn connect<N: NoteScanner>(
    wallet: &Wallet<MemoryStore, N>,
    chain: &mut MockChain,
    vtx: Vec<Transaction>,
) -> Block {
    let block = chain.push_block(vtx);
    let report = wallet.on_block_connected(&*chain, &block, block.time).unwrap();
    assert!(report.is_clean());
    block
}

#[test]
fn coinbase_matures_after_maturity_plus_one_confirmations() {
    let mut rng = ChaChaRng::seed_from_u64(0);
    let wallet = new_wallet("miner", DefaultScanner, &mut rng);
    let addr = wallet.new_address(0, &mut rng).unwrap();
    let mut chain = MockChain::new();

    let coinbase = coinbase_tx(chain.next_height(), vec![out(COIN, addr.script())]);
    connect(&wallet, &mut chain, vec![coinbase.clone()]);
    let balance = wallet.balance(wallet.balance_query());
    assert_eq!(balance.transparent.immature, COIN);
    assert_eq!(balance.trusted(), 0);

    for _ in 0..99 {
        connect(&wallet, &mut chain, vec![]);
    }
    assert_eq!(wallet.depth(&coinbase.txid()), Some(100));
    assert_eq!(wallet.balance(wallet.balance_query()).transparent.immature, COIN);
    assert!(wallet.list_unspent(&wallet.coin_query()).is_empty());

    connect(&wallet, &mut chain, vec![]);
    let balance = wallet.balance(wallet.balance_query());
    assert_eq!(balance.transparent.immature, 0);
    assert_eq!(balance.transparent.trusted, COIN);
    let coins = wallet.list_unspent(&wallet.coin_query());
    assert_eq!(coins.len(), 1);
    assert_eq!(coins[0].outpoint, OutPoint::new(coinbase.txid(), 0));
}

#[test]
fn double_spend_in_a_block_conflicts_the_pending_spend() {
    let mut rng = ChaChaRng::seed_from_u64(1);
    let wallet = new_wallet("spender", DefaultScanner, &mut rng);
    let addr = wallet.new_address(0, &mut rng).unwrap();
    let mut chain = MockChain::new();

    let receive = payment_tx(&[], vec![out(COIN, addr.script())]);
    let funding = connect(&wallet, &mut chain, vec![receive.clone()]);
    let coin = OutPoint::new(receive.txid(), 0);

    let pending = payment_tx(&[coin], vec![out(COIN / 2, foreign(9).script())]);
    assert!(wallet
        .on_transaction_seen(&pending, funding.time + 10)
        .unwrap());
    let record = wallet.transaction(&pending.txid()).unwrap();
    assert!(record.from_me);
    assert!(record.in_mempool);

    let double_spend = payment_tx(&[coin], vec![out(COIN - 10_000, foreign(8).script())]);
    let block = connect(&wallet, &mut chain, vec![double_spend.clone()]);
    assert_eq!(wallet.depth(&pending.txid()), Some(-1));
    assert_eq!(wallet.depth(&double_spend.txid()), Some(1));
    assert_eq!(
        wallet.transaction(&pending.txid()).unwrap().status,
        TxStatus::Conflicted {
            block: block.hash,
            height: block.height,
        }
    );
    assert_matches!(
        wallet.abandon_transaction(&pending.txid()),
        Err(Error::CannotAbandon(_))
    );

    // The block is reorganized away: both spends are pending again.
    chain.pop_block();
    wallet.on_block_disconnected(&block).unwrap();
    assert_eq!(wallet.depth(&pending.txid()), Some(0));
    assert_eq!(wallet.depth(&double_spend.txid()), Some(0));
    assert_eq!(wallet.best_block().map(|b| b.hash), Some(funding.hash));

    wallet
        .on_transaction_removed(&pending.txid(), MemPoolRemovalReason::Conflict)
        .unwrap();
    wallet.abandon_transaction(&pending.txid()).unwrap();
    assert!(wallet
        .transaction(&pending.txid())
        .unwrap()
        .status
        .is_abandoned());
}

#[test]
fn reorganization_moves_confirmations_to_the_new_chain() {
    let mut rng = ChaChaRng::seed_from_u64(2);
    let wallet = new_wallet("reorg", DefaultScanner, &mut rng);
    let addr = wallet.new_address(0, &mut rng).unwrap();
    let mut chain = MockChain::new();

    let tx = payment_tx(&[], vec![out(COIN, addr.script())]);
    let stale = connect(&wallet, &mut chain, vec![tx.clone()]);
    assert_eq!(wallet.balance(wallet.balance_query()).transparent.trusted, COIN);

    chain.pop_block();
    wallet.on_block_disconnected(&stale).unwrap();
    assert_eq!(wallet.depth(&tx.txid()), Some(0));
    // Untrusted and not in the mempool, so nothing counts.
    assert_eq!(wallet.balance(wallet.balance_query()).total(), 0);

    let replacement = connect(&wallet, &mut chain, vec![]);
    assert_ne!(replacement.hash, stale.hash);
    let block = connect(&wallet, &mut chain, vec![tx.clone()]);
    assert_eq!(
        wallet.transaction(&tx.txid()).unwrap().status,
        TxStatus::Confirmed {
            block: block.hash,
            height: BlockHeight::from_u32(2),
            index: 0,
        }
    );
    assert_eq!(wallet.balance(wallet.balance_query()).transparent.trusted, COIN);
}

#[test]
fn transparent_send_survives_a_rejected_broadcast() {
    let mut rng = ChaChaRng::seed_from_u64(3);
    let wallet = new_wallet("sender", DefaultScanner, &mut rng);
    let addr = wallet.new_address(0, &mut rng).unwrap();
    let mut chain = MockChain::new();

    let receive = payment_tx(&[], vec![out(COIN, addr.script())]);
    connect(&wallet, &mut chain, vec![receive.clone()]);
    for _ in 0..5 {
        connect(&wallet, &mut chain, vec![]);
    }

    let now = chain.tip().unwrap().time + BLOCK_INTERVAL;
    let request = TransactionRequest::new(vec![Payment::new(
        PaymentAddress::Transparent(foreign(9)),
        Zatoshis::const_from_u64(COIN / 2),
    )]);
    let assembled = wallet
        .create_transaction(&chain, &NoEstimates, &MockProver, &request, now, &mut rng)
        .unwrap();
    assert!(assembled.change_key.is_some());
    assert_eq!(assembled.spent_coins, vec![OutPoint::new(receive.txid(), 0)]);

    let broadcaster = MockBroadcaster::rejecting();
    let txid = wallet.commit_transaction(assembled, &broadcaster, now).unwrap();
    let record = wallet.transaction(&txid).unwrap();
    assert!(record.from_me);
    assert!(!record.in_mempool);
    assert!(wallet.list_unspent(&wallet.coin_query()).is_empty());

    // Never relayed, so it can be given up on and its input reused.
    wallet.abandon_transaction(&txid).unwrap();
    let coins = wallet.list_unspent(&wallet.coin_query());
    assert_eq!(coins.len(), 1);
    assert_eq!(coins[0].outpoint, OutPoint::new(receive.txid(), 0));
}

#[test]
fn discarded_transactions_return_their_change_key() {
    let mut rng = ChaChaRng::seed_from_u64(4);
    let wallet = new_wallet("discard", DefaultScanner, &mut rng);
    let addr = wallet.new_address(0, &mut rng).unwrap();
    let mut chain = MockChain::new();
    connect(&wallet, &mut chain, vec![payment_tx(&[], vec![out(COIN, addr.script())])]);

    let before = wallet.keypool_available(KeyChain::Internal);
    let request = TransactionRequest::new(vec![Payment::new(
        PaymentAddress::Transparent(foreign(9)),
        Zatoshis::const_from_u64(COIN / 2),
    )]);
    let now = chain.tip().unwrap().time;
    let assembled = wallet
        .create_transaction(&chain, &NoEstimates, &MockProver, &request, now, &mut rng)
        .unwrap();
    wallet.discard_transaction(assembled);
    assert_eq!(wallet.keypool_available(KeyChain::Internal), before);
    assert_eq!(wallet.transactions().len(), 1);
}

#[test]
fn sapling_funds_can_be_received_spent_and_reloaded() {
    let mut rng = ChaChaRng::seed_from_u64(5);
    let scanner = MockScanner::new();
    let wallet = new_wallet("shielded", scanner.clone(), &mut rng);
    let to = wallet.new_sapling_address(0, &mut rng).unwrap();
    let ivk = SaplingViewingKey::new(wallet.export_sapling_viewing_key(&to).unwrap()).tag();
    let mut chain = MockChain::new();

    let (receive, note) = sapling_output_tx(to, COIN, &mut rng);
    scanner.register_sapling(&receive, 0, ivk, &note);
    connect(&wallet, &mut chain, vec![receive.clone()]);

    let notes = wallet.list_notes(&wallet.coin_query());
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].value, COIN);
    assert!(notes[0].spendable);
    assert_eq!(wallet.balance(wallet.balance_query()).sapling.trusted, COIN);

    let now = chain.tip().unwrap().time + BLOCK_INTERVAL;
    let request = TransactionRequest::new(vec![Payment::new(
        PaymentAddress::Transparent(foreign(9)),
        Zatoshis::const_from_u64(COIN / 4),
    )])
    .from_sapling();
    let assembled = wallet
        .create_transaction(&chain, &NoEstimates, &MockProver, &request, now, &mut rng)
        .unwrap();
    let fee = assembled.fee;
    assert!(fee > 0);
    assert!(assembled.sapling_change.is_some());
    let change = COIN - COIN / 4 - fee;

    let broadcaster = MockBroadcaster::new();
    let txid = wallet.commit_transaction(assembled, &broadcaster, now).unwrap();
    assert_eq!(broadcaster.sent(), vec![txid]);
    let balance = wallet.balance(wallet.balance_query());
    assert_eq!(balance.sapling.trusted, change);
    assert_eq!(balance.sapling.untrusted_pending, 0);

    let spend = wallet.transaction(&txid).unwrap().tx().clone();
    let block = connect(&wallet, &mut chain, vec![spend]);
    assert_eq!(wallet.depth(&txid), Some(1));
    let notes = wallet.list_notes(&wallet.coin_query());
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].value, change);
    assert!(notes[0].spendable);

    let store = wallet.close();
    let reloaded = Wallet::load("shielded", config(), store, scanner).unwrap();
    assert_eq!(reloaded.transactions().len(), 2);
    assert_eq!(reloaded.best_block().map(|b| b.hash), Some(block.hash));
    assert_eq!(
        reloaded.balance(reloaded.balance_query()).sapling.trusted,
        change
    );
    let notes = reloaded.list_notes(&reloaded.coin_query());
    assert_eq!(notes.len(), 1);
    assert!(notes[0].spendable);
}

#[test]
fn rescan_finds_missed_transactions() {
    let mut rng = ChaChaRng::seed_from_u64(6);
    let wallet = new_wallet("rescan", DefaultScanner, &mut rng);
    let addr = wallet.new_address(0, &mut rng).unwrap();

    // The chain advances without the wallet hearing about it.
    let mut chain = MockChain::new();
    let first = payment_tx(&[], vec![out(COIN, addr.script())]);
    let second = payment_tx(&[], vec![out(2 * COIN, addr.script())]);
    chain.push_block(vec![first.clone()]);
    chain.push_block(vec![]);
    chain.push_block(vec![second.clone()]);
    assert!(wallet.transactions().is_empty());

    // A pending abort does not carry over into a new rescan.
    wallet.abort_rescan();
    let now = chain.tip().unwrap().time;
    let result = wallet
        .rescan(&chain, BlockHeight::from_u32(0), None, now)
        .unwrap();
    assert_eq!(result.status, RescanStatus::Success);
    assert_eq!(result.last_scanned, Some(BlockHeight::from_u32(3)));
    assert_eq!(result.last_failed, None);
    assert!(!wallet.is_rescanning());

    assert_eq!(wallet.depth(&first.txid()), Some(3));
    assert_eq!(wallet.depth(&second.txid()), Some(1));
    assert_eq!(wallet.balance(wallet.balance_query()).transparent.trusted, 3 * COIN);

    chain.hide_block(BlockHeight::from_u32(2));
    let result = wallet
        .rescan(&chain, BlockHeight::from_u32(1), None, now)
        .unwrap();
    assert_eq!(result.status, RescanStatus::Failure);
    assert_eq!(result.last_failed, Some(BlockHeight::from_u32(2)));
    assert_eq!(result.last_scanned, Some(BlockHeight::from_u32(3)));
    assert_eq!(wallet.transactions().len(), 2);
}

#[test]
fn unconfirmed_transactions_are_rebroadcast() {
    let mut rng = ChaChaRng::seed_from_u64(7);
    let wallet = new_wallet("resend", DefaultScanner, &mut rng);
    let addr = wallet.new_address(0, &mut rng).unwrap();
    let mut chain = MockChain::new();

    let receive = payment_tx(&[], vec![out(COIN, addr.script())]);
    let funding = connect(&wallet, &mut chain, vec![receive.clone()]);
    let pending = payment_tx(
        &[OutPoint::new(receive.txid(), 0)],
        vec![out(COIN / 2, foreign(9).script())],
    );
    wallet
        .on_transaction_seen(&pending, funding.time + 10)
        .unwrap();

    let broadcaster = MockBroadcaster::new();
    // The first attempt only schedules the next one.
    assert!(wallet
        .resend_wallet_transactions(&broadcaster, funding.time, funding.time + 20, &mut rng)
        .unwrap()
        .is_empty());

    let later = funding.time + 3_600;
    let resent = wallet
        .resend_wallet_transactions(&broadcaster, later, later, &mut rng)
        .unwrap();
    assert_eq!(resent, vec![pending.txid()]);
    assert_eq!(broadcaster.sent(), vec![pending.txid()]);
    assert_eq!(
        wallet.transaction(&pending.txid()).unwrap().last_broadcast,
        Some(later)
    );
}
