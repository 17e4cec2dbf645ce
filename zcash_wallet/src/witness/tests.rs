use std::collections::BTreeMap;

use rand_chacha::ChaChaRng;
use rand_core::SeedableRng;
use zcash_protocol::consensus::{BlockHeight, NetworkType};
use zcash_wallet_keys::{sprout::SproutPaymentAddress, testing::seeded_vault, KeyVault};

use super::{NoteWitnessEngine, SproutPool, Target, WitnessReport};
use crate::chain::ChainView;
use crate::ledger::{
    CoinQuery, JsOutPoint, NoteRef, SaplingNoteData, SaplingOutPoint, SproutNoteData, TxUpdate,
    WalletLedger, WitnessState,
};
use crate::primitives::{Block, Nullifier};
use crate::testing::{joinsplit_tx, sapling_output_tx, sapling_spend_tx, MockChain};
use crate::tree::{node_bytes, SPROUT_TREE_DEPTH};

struct SproutFixture {
    chain: MockChain,
    ledger: WalletLedger,
    vault: KeyVault,
    engine: NoteWitnessEngine,
    note: JsOutPoint,
    confirming: Block,
}

/// A chain whose block 1 confirms a Sprout note owned by the vault, not yet connected.
fn sprout_fixture() -> SproutFixture {
    let mut rng = ChaChaRng::seed_from_u64(0);
    let mut vault = seeded_vault(NetworkType::Test, 1, &mut rng);
    let address: SproutPaymentAddress = vault.generate_sprout_key(0, &mut rng).unwrap();

    let mut chain = MockChain::new();
    let tx = joinsplit_tx([[1; 32], [2; 32]], [[3; 32], [4; 32]]);
    let note = JsOutPoint::new(tx.txid(), 0, 1);
    let confirming = chain.push_block(vec![tx.clone()]);

    let mut ledger = WalletLedger::new(100);
    ledger.set_tip(Some(confirming.height));
    let notes = [(note, SproutNoteData::new(address, 1_000, [5; 32], [6; 32]))]
        .into_iter()
        .collect();
    ledger.add_or_update(
        TxUpdate::confirmed(tx, &confirming, 0).with_notes(notes, BTreeMap::new()),
        0,
    );

    SproutFixture {
        chain,
        ledger,
        vault,
        engine: NoteWitnessEngine::new(crate::WITNESS_CACHE_SIZE),
        note,
        confirming,
    }
}

impl SproutFixture {
    fn note(&self) -> &SproutNoteData {
        &self.ledger.get(&self.note.txid).unwrap().sprout_notes[&self.note]
    }

    fn spendable(&self) -> bool {
        self.ledger
            .available_notes(&self.vault, &CoinQuery::default())
            .iter()
            .any(|n| n.note == NoteRef::Sprout(self.note) && n.spendable)
    }

    fn root(&self) -> Option<[u8; 32]> {
        self.note().witnesses.newest().map(|w| node_bytes(&w.root()))
    }

    /// Mines and connects a block with one unrelated JoinSplit.
    fn advance(&mut self, seed: u8) -> (Block, WitnessReport) {
        let tx = joinsplit_tx([[seed; 32], [seed + 1; 32]], [[seed + 2; 32], [seed + 3; 32]]);
        let block = self.chain.push_block(vec![tx]);
        self.ledger.set_tip(Some(block.height));
        let report = self
            .engine
            .connect_block(&mut self.ledger, &self.vault, &self.chain, &block);
        (block, report)
    }
}

#[test]
fn sprout_witnesses_follow_the_chain() {
    let mut f = sprout_fixture();
    let report = f
        .engine
        .connect_block(&mut f.ledger, &f.vault, &f.chain, &f.confirming);
    assert!(report.is_clean());
    let note = f.note();
    assert_eq!(note.witnesses.len(), 1);
    assert_eq!(note.witnesses.height(), Some(f.confirming.height));
    assert_eq!(note.witnesses.state(), WitnessState::Validated);
    let nf = note.nullifier.expect("spending key is available");
    assert_eq!(
        f.ledger.note_for_nullifier(&Nullifier::Sprout(nf)),
        Some(NoteRef::Sprout(f.note))
    );

    let (second, report) = f.advance(10);
    assert!(report.is_clean());
    let note = f.note();
    assert_eq!(note.witnesses.len(), 2);
    assert_eq!(note.witnesses.height(), Some(second.height));
    assert_eq!(
        node_bytes(&note.witnesses.newest().unwrap().root()),
        second.final_sprout_root
    );

    f.engine.disconnect_block(&mut f.ledger, &second);
    let note = f.note();
    assert_eq!(note.witnesses.len(), 1);
    assert_eq!(note.witnesses.height(), Some(f.confirming.height));
    assert_eq!(
        node_bytes(&note.witnesses.newest().unwrap().root()),
        f.confirming.final_sprout_root
    );

    let confirming = f.confirming.clone();
    f.engine.disconnect_block(&mut f.ledger, &confirming);
    let note = f.note();
    assert!(note.witnesses.is_empty());
    assert_eq!(note.witnesses.state(), WitnessState::Unwitnessed);
}

#[test]
fn lost_witnesses_are_rebuilt_from_the_chain() {
    let mut f = sprout_fixture();
    f.engine
        .connect_block(&mut f.ledger, &f.vault, &f.chain, &f.confirming);
    f.advance(10);

    f.engine.clear_from(&mut f.ledger, f.confirming.height);
    assert!(f.note().witnesses.is_empty());

    let (third, report) = f.advance(20);
    assert!(report.is_clean());
    assert_eq!(report.rebuilt, 1);
    let note = f.note();
    assert_eq!(note.witnesses.len(), 3);
    assert_eq!(note.witnesses.height(), Some(third.height));
    assert_eq!(note.witnesses.state(), WitnessState::Validated);
    assert_eq!(
        node_bytes(&note.witnesses.newest().unwrap().root()),
        third.final_sprout_root
    );
}

#[test]
fn missing_trees_leave_notes_unwitnessed_until_available() {
    let mut f = sprout_fixture();
    f.chain.set_trees_available(false);
    let report = f
        .engine
        .connect_block(&mut f.ledger, &f.vault, &f.chain, &f.confirming);
    assert!(!report.is_clean());
    assert!(report.unavailable.contains(&BlockHeight::from_u32(0)));
    assert!(f.note().witnesses.is_empty());
    assert_eq!(f.note().nullifier, None);

    f.chain.set_trees_available(true);
    let (second, report) = f.advance(10);
    assert!(report.is_clean());
    assert_eq!(report.rebuilt, 1);
    assert_eq!(f.note().witnesses.len(), 2);
    assert_eq!(f.note().witnesses.height(), Some(second.height));
    assert!(f.note().nullifier.is_some());
}

#[test]
fn unreadable_blocks_are_reported() {
    let mut f = sprout_fixture();
    f.engine
        .connect_block(&mut f.ledger, &f.vault, &f.chain, &f.confirming);
    f.advance(10);
    f.engine.clear_from(&mut f.ledger, f.confirming.height);

    f.chain.hide_block(f.confirming.height);
    let (_, report) = f.advance(20);
    assert!(report.unavailable.contains(&f.confirming.height));
    assert!(f.note().witnesses.is_empty());

    f.chain.reveal_block(f.confirming.height);
    let (fourth, report) = f.advance(30);
    assert!(report.is_clean());
    assert_eq!(f.note().witnesses.height(), Some(fourth.height));
}

#[test]
fn witnesses_disagreeing_with_the_block_are_discarded() {
    let mut f = sprout_fixture();
    let mut tampered = f.confirming.clone();
    tampered.final_sprout_root = [9; 32];
    let report = f
        .engine
        .connect_block(&mut f.ledger, &f.vault, &f.chain, &tampered);
    assert_eq!(report.root_mismatches, 1);
    assert!(f.note().witnesses.is_empty());
}

#[test]
fn sapling_notes_are_witnessed_until_their_spend_is_buried() {
    let mut rng = ChaChaRng::seed_from_u64(1);
    let mut vault = seeded_vault(NetworkType::Test, 2, &mut rng);
    let tag = vault.generate_sapling_key(0, &mut rng).unwrap();
    let vk = vault.sapling_viewing_key(&tag).unwrap();
    let (tx, note) = sapling_output_tx(vk.default_address(), 5_000, &mut rng);
    let op = SaplingOutPoint::new(tx.txid(), 0);

    let mut chain = MockChain::new();
    let mut ledger = WalletLedger::new(100);
    let engine = NoteWitnessEngine::new(2);

    let first = chain.push_block(vec![tx.clone()]);
    ledger.set_tip(Some(first.height));
    let notes = [(op, SaplingNoteData::from_note(tag, &note))]
        .into_iter()
        .collect();
    ledger.add_or_update(
        TxUpdate::confirmed(tx, &first, 0).with_notes(BTreeMap::new(), notes),
        0,
    );
    assert!(engine.connect_block(&mut ledger, &vault, &chain, &first).is_clean());

    let data = &ledger.get(&op.txid).unwrap().sapling_notes[&op];
    assert_eq!(data.witnesses.state(), WitnessState::Validated);
    assert_eq!(
        node_bytes(&data.witnesses.newest().unwrap().root()),
        first.final_sapling_root
    );
    let nf = data.nullifier.expect("viewing key derives the nullifier");
    assert_eq!(nf, note.nf(&vk.nk(), 0).0);
    assert_eq!(
        ledger.note_for_nullifier(&Nullifier::Sapling(nf)),
        Some(NoteRef::Sapling(op))
    );

    let spend = sapling_spend_tx(nf);
    let second = chain.push_block(vec![spend.clone()]);
    ledger.set_tip(Some(second.height));
    ledger.add_or_update(TxUpdate::confirmed(spend, &second, 0), 1);
    engine.connect_block(&mut ledger, &vault, &chain, &second);

    for _ in 0..2 {
        let block = chain.push_block(vec![]);
        ledger.set_tip(Some(block.height));
        engine.connect_block(&mut ledger, &vault, &chain, &block);
    }

    // The spend is three blocks deep at height 4, beyond the two-block window.
    let data = &ledger.get(&op.txid).unwrap().sapling_notes[&op];
    assert_eq!(data.witnesses.height(), Some(BlockHeight::from_u32(3)));
    assert_eq!(data.witnesses.len(), 2);
}

#[test]
fn rebuilt_witnesses_are_partially_validated_until_their_root_is_checked() {
    let mut f = sprout_fixture();
    f.engine
        .connect_block(&mut f.ledger, &f.vault, &f.chain, &f.confirming);
    let (second, _) = f.advance(10);
    assert!(f.spendable());

    f.engine.clear_from(&mut f.ledger, f.confirming.height);
    let target = Target {
        txid: f.note.txid,
        id: f.note,
        confirmed_at: f.confirming.height,
        tx_index: 0,
    };
    let mut report = WitnessReport::default();
    assert!(f.engine.rebuild_note::<SproutPool, SPROUT_TREE_DEPTH, MockChain>(
        &mut f.ledger,
        &f.chain,
        &target,
        second.height,
        &mut report,
    ));
    assert_eq!(report.rebuilt, 1);
    assert_eq!(f.note().witnesses.state(), WitnessState::PartiallyValidated);
    assert_eq!(f.note().witnesses.height(), Some(second.height));
    assert!(!f.spendable());

    let mut tampered = second.clone();
    tampered.final_sprout_root = [9; 32];
    assert!(!NoteWitnessEngine::validate_note::<SproutPool, SPROUT_TREE_DEPTH>(
        &mut f.ledger,
        &f.note.txid,
        &f.note,
        &tampered,
        &mut report,
    ));
    assert_eq!(report.root_mismatches, 1);
    assert_eq!(f.note().witnesses.state(), WitnessState::Unwitnessed);

    f.engine.rebuild_note::<SproutPool, SPROUT_TREE_DEPTH, MockChain>(
        &mut f.ledger,
        &f.chain,
        &target,
        second.height,
        &mut report,
    );
    assert!(NoteWitnessEngine::validate_note::<SproutPool, SPROUT_TREE_DEPTH>(
        &mut f.ledger,
        &f.note.txid,
        &f.note,
        &second,
        &mut report,
    ));
    assert_eq!(f.note().witnesses.state(), WitnessState::Validated);
    assert!(f.spendable());
}

#[test]
fn disconnecting_several_blocks_restores_the_earlier_witness() {
    let mut f = sprout_fixture();
    f.engine = NoteWitnessEngine::new(5);
    f.engine
        .connect_block(&mut f.ledger, &f.vault, &f.chain, &f.confirming);
    let (second, _) = f.advance(10);
    let root = f.root();
    assert_eq!(root, Some(second.final_sprout_root));

    for seed in [20, 30, 40] {
        assert!(f.advance(seed).1.is_clean());
    }
    assert_eq!(f.note().witnesses.len(), 5);
    assert_eq!(
        f.note().witnesses.height(),
        Some(BlockHeight::from_u32(5))
    );

    for _ in 0..3 {
        let block = f.chain.pop_block().unwrap();
        f.engine.disconnect_block(&mut f.ledger, &block);
    }
    f.ledger.set_tip(Some(second.height));
    assert_eq!(f.note().witnesses.len(), 2);
    assert_eq!(f.note().witnesses.height(), Some(second.height));
    assert_eq!(f.root(), root);
    assert_eq!(f.note().witnesses.state(), WitnessState::Validated);
    assert!(f.spendable());

    // A competing branch extends the restored witness without a rebuild.
    let (third, report) = f.advance(50);
    assert!(report.is_clean());
    assert_eq!(report.rebuilt, 0);
    assert_eq!(f.root(), Some(third.final_sprout_root));
}

#[test]
fn cache_holds_exactly_its_size_in_witnesses() {
    let mut f = sprout_fixture();
    f.engine = NoteWitnessEngine::new(3);
    f.engine
        .connect_block(&mut f.ledger, &f.vault, &f.chain, &f.confirming);
    f.advance(10);
    f.advance(20);
    assert_eq!(f.note().witnesses.len(), 3);

    // The witness as of the confirming block is evicted once the cache is full.
    let (fourth, _) = f.advance(30);
    assert_eq!(f.note().witnesses.len(), 3);
    assert_eq!(f.note().witnesses.height(), Some(fourth.height));

    for _ in 0..2 {
        let block = f.chain.pop_block().unwrap();
        f.engine.disconnect_block(&mut f.ledger, &block);
    }
    assert_eq!(f.note().witnesses.len(), 1);
    assert_eq!(
        f.note().witnesses.height(),
        Some(BlockHeight::from_u32(2))
    );

    // Going back further than the cache reaches leaves the note unwitnessed.
    let second = f.chain.pop_block().unwrap();
    f.engine.disconnect_block(&mut f.ledger, &second);
    assert!(f.note().witnesses.is_empty());
    assert_eq!(f.note().witnesses.state(), WitnessState::Unwitnessed);

    let (replacement, report) = f.advance(60);
    assert!(report.is_clean());
    assert_eq!(report.rebuilt, 1);
    assert_eq!(f.note().witnesses.height(), Some(replacement.height));
    assert_eq!(f.root(), Some(replacement.final_sprout_root));
}

#[test]
fn notes_before_a_rescan_are_rebuilt_once() {
    let mut f = sprout_fixture();
    f.engine
        .connect_block(&mut f.ledger, &f.vault, &f.chain, &f.confirming);
    for seed in [10, 20, 30] {
        f.advance(seed);
    }

    // A scan restarting at height 3 finds the witnesses current as of height 4.
    let start = BlockHeight::from_u32(3);
    let report = f
        .engine
        .rebuild_before(&mut f.ledger, &f.vault, &f.chain, start);
    assert!(report.is_clean());
    assert_eq!(report.rebuilt, 1);
    assert_eq!(f.note().witnesses.height(), Some(start - 1));
    assert_eq!(f.note().witnesses.state(), WitnessState::Validated);

    let mut height = start;
    while let Some(block) = f.chain.block_at_height(height) {
        let report = f
            .engine
            .connect_block(&mut f.ledger, &f.vault, &f.chain, &block);
        assert!(report.is_clean());
        assert_eq!(report.rebuilt, 0);
        assert_eq!(f.root(), Some(block.final_sprout_root));
        height = height + 1;
    }
}
