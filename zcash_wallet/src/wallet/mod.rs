//! A wallet: one ledger, one key vault and one store, kept consistent with the chain.
//!
//! [`Wallet`] owns its state behind two locks. The coarse state lock guards the ledger,
//! the witness engine, the wallet metadata and the store; the vault lock guards key
//! material. Whenever both are needed the state lock is taken first.
//!
//! Every mutating operation ends by writing the records it changed to the store in a
//! single batch. If that batch fails to commit, the in-memory state remains
//! authoritative and the changed records are retried with the next write.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};
use std::sync::atomic::AtomicBool;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand_core::{CryptoRng, RngCore};
use tracing::{debug, info, info_span, warn};
use zcash_encoding::Vector;
use zcash_protocol::TxId;
use zcash_wallet_keys::{hd::HdSeed, records::VaultRecordId, KeyVault, VaultConfig};

use crate::chain::ChainView;
use crate::config::WalletConfig;
use crate::error::{Error, Result};
use crate::ledger::{
    BalanceQuery, CoinQuery, MemPoolRemovalReason, NoteOutput, NoteRef, TxStatus, TxUpdate,
    UpdateOutcome, WalletBalance, WalletLedger, WalletOutput,
};
use crate::ownership::{IsMine, Ownership, OwnershipFilter};
use crate::primitives::{Block, OutPoint, PaymentAddress, Transaction};
use crate::scan::{DefaultScanner, NoteScanner};
use crate::store::{self, BestBlock, RecordKey, WalletBatch, WalletStore};
use crate::witness::{NoteWitnessEngine, WitnessReport};

mod keys;
mod rebroadcast;
mod rescan;
mod send;

pub use crate::ledger::TransactionRecord;
pub use rescan::{RescanResult, RescanStatus};

/// The newest wallet format this code understands.
pub const CURRENT_VERSION: u32 = 60_000;

/// The format written by wallets that predate versioning.
pub const BASE_VERSION: u32 = 10_500;

bitflags::bitflags! {
    /// Persistent wallet-wide behaviour switches.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct WalletFlags: u64 {
        /// Outputs paying destinations that have already been spent from are kept out
        /// of balances and coin selection.
        const AVOID_REUSE = 1 << 0;
        /// The wallet is watch-only and will never hold private keys.
        const DISABLE_PRIVATE_KEYS = 1 << 32;
    }
}

/// A labelled destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressBookEntry {
    pub name: String,
    /// Usually `"receive"` or `"send"`.
    pub purpose: String,
}

impl AddressBookEntry {
    pub fn new(name: impl Into<String>, purpose: impl Into<String>) -> Self {
        AddressBookEntry {
            name: name.into(),
            purpose: purpose.into(),
        }
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let name = read_string(&mut reader)?;
        let purpose = read_string(&mut reader)?;
        Ok(AddressBookEntry { name, purpose })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        write_string(&mut writer, &self.name)?;
        write_string(&mut writer, &self.purpose)
    }
}

fn read_string<R: Read>(reader: R) -> io::Result<String> {
    let bytes = Vector::read(reader, |r| {
        let mut b = [0];
        r.read_exact(&mut b).map(|_| b[0])
    })?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_string<W: Write>(writer: W, s: &str) -> io::Result<()> {
    Vector::write(writer, s.as_bytes(), |w, b| w.write_all(&[*b]))
}

/// Everything guarded by the wallet's coarse lock.
pub(crate) struct WalletState<S> {
    pub(crate) ledger: WalletLedger,
    pub(crate) witnesses: NoteWitnessEngine,
    pub(crate) store: S,
    address_book: BTreeMap<PaymentAddress, AddressBookEntry>,
    address_book_dirty: BTreeSet<PaymentAddress>,
    best_block: Option<BestBlock>,
    version: u32,
    flags: WalletFlags,
    meta_dirty: bool,
    /// Zero until the first rebroadcast attempt has scheduled one.
    pub(crate) next_resend: i64,
    pub(crate) last_resend: i64,
}

impl<S> WalletState<S> {
    fn new(config: &WalletConfig, store: S) -> Self {
        WalletState {
            ledger: WalletLedger::new(config.coinbase_maturity),
            witnesses: NoteWitnessEngine::new(config.witness_cache_size),
            store,
            address_book: BTreeMap::new(),
            address_book_dirty: BTreeSet::new(),
            best_block: None,
            version: CURRENT_VERSION,
            flags: WalletFlags::empty(),
            meta_dirty: false,
            next_resend: 0,
            last_resend: 0,
        }
    }
}

pub struct Wallet<S: WalletStore, N: NoteScanner = DefaultScanner> {
    name: String,
    config: WalletConfig,
    state: Mutex<WalletState<S>>,
    vault: RwLock<KeyVault>,
    scanner: N,
    rescanning: AtomicBool,
    abort_rescan: AtomicBool,
}

impl<S: WalletStore, N: NoteScanner> Wallet<S, N> {
    /// Creates a new wallet in an empty store.
    ///
    /// Unless `flags` disables private keys, fresh transparent and shielded seeds are
    /// generated and the keypool is filled.
    pub fn create<R: RngCore + CryptoRng>(
        name: impl Into<String>,
        config: WalletConfig,
        store: S,
        scanner: N,
        flags: WalletFlags,
        now: i64,
        rng: &mut R,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        let mut vault =
            KeyVault::new(VaultConfig::new(config.network).with_kdf(config.kdf_calibration()));
        if flags.contains(WalletFlags::DISABLE_PRIVATE_KEYS) {
            vault.disable_private_keys()?;
        } else {
            vault.generate_hd_seed(rng)?;
            vault.set_shielded_seed(HdSeed::random(rng), rng)?;
            vault.top_up_keypool(config.keypool_size, now, rng)?;
        }

        let mut state = WalletState::new(&config, store);
        state.flags = flags;
        state.meta_dirty = true;
        flush(&mut state, &mut vault)?;
        info!("Created wallet {} (flags {:?})", name, flags);

        Ok(Wallet::assemble(name, config, state, vault, scanner))
    }

    /// Reads a wallet back from `store`.
    pub fn load(name: impl Into<String>, config: WalletConfig, store: S, scanner: N) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        let mut vault =
            KeyVault::new(VaultConfig::new(config.network).with_kdf(config.kdf_calibration()));
        let mut state = WalletState::new(&config, store);
        state.version = BASE_VERSION;

        for (key, bytes) in state.store.records()? {
            match key {
                RecordKey::Transaction(txid) => {
                    let record = TransactionRecord::read(&bytes[..]).map_err(|e| {
                        Error::CorruptedRecord(format!("transaction {}: {}", txid, e))
                    })?;
                    if record.txid() != txid {
                        return Err(Error::CorruptedRecord(format!(
                            "transaction stored under {} hashes to {}",
                            txid,
                            record.txid()
                        )));
                    }
                    state.ledger.load_record(record);
                }
                RecordKey::Vault(id) => vault.load_record(&id, &bytes)?,
                RecordKey::AddressBook(address) => {
                    let entry = AddressBookEntry::read(&bytes[..]).map_err(|e| {
                        Error::CorruptedRecord(format!("address book entry: {}", e))
                    })?;
                    state.address_book.insert(address, entry);
                }
                RecordKey::BestBlock => {
                    let best = BestBlock::read(&bytes[..])
                        .map_err(|e| Error::CorruptedRecord(format!("best block: {}", e)))?;
                    state.best_block = Some(best);
                }
                RecordKey::Version => {
                    state.version = store::read_version(&bytes)
                        .map_err(|e| Error::CorruptedRecord(format!("version: {}", e)))?;
                }
                RecordKey::Flags => {
                    state.flags = store::read_flags(&bytes)
                        .map_err(|e| Error::CorruptedRecord(format!("flags: {}", e)))?;
                }
            }
        }

        if state.version > CURRENT_VERSION {
            return Err(Error::VersionDowngrade {
                current: state.version,
                requested: CURRENT_VERSION,
            });
        }
        if state.flags.contains(WalletFlags::DISABLE_PRIVATE_KEYS) {
            vault.disable_private_keys().map_err(|_| {
                Error::CorruptedRecord("watch-only wallet holds private keys".to_owned())
            })?;
        }
        state.ledger.set_tip(state.best_block.map(|b| b.height));
        state.ledger.finish_load();
        // Loading marks nothing as changed.
        vault.take_dirty();
        state.ledger.take_dirty();

        info!(
            "Loaded wallet {}: {} transactions, version {}",
            name,
            state.ledger.len(),
            state.version
        );
        Ok(Wallet::assemble(name, config, state, vault, scanner))
    }

    fn assemble(
        name: String,
        config: WalletConfig,
        state: WalletState<S>,
        vault: KeyVault,
        scanner: N,
    ) -> Self {
        Wallet {
            name,
            config,
            state: Mutex::new(state),
            vault: RwLock::new(vault),
            scanner,
            rescanning: AtomicBool::new(false),
            abort_rescan: AtomicBool::new(false),
        }
    }

    /// Consumes the wallet, returning its store.
    pub fn close(self) -> S {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .store
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, WalletState<S>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read_vault(&self) -> RwLockReadGuard<'_, KeyVault> {
        self.vault.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_vault(&self) -> RwLockWriteGuard<'_, KeyVault> {
        self.vault.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes every pending change to the store.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.lock_state();
        let mut vault = self.write_vault();
        flush(&mut state, &mut vault)
    }

    //
    // Chain events
    //

    /// Records a transaction that entered the mempool, if it concerns the wallet.
    /// Returns whether the ledger changed.
    pub fn on_transaction_seen(&self, tx: &Transaction, now: i64) -> Result<bool> {
        let mut state = self.lock_state();
        let mut vault = self.write_vault();
        let outcome = self.sync_transaction(&mut state, &mut vault, tx, None, now);
        if outcome.is_some() {
            state.ledger.set_in_mempool(&tx.txid(), true);
        }
        flush(&mut state, &mut vault)?;
        Ok(outcome.is_some_and(|o| o != UpdateOutcome::Unchanged))
    }

    pub fn on_transaction_removed(&self, txid: &TxId, reason: MemPoolRemovalReason) -> Result<()> {
        let mut state = self.lock_state();
        let mut vault = self.write_vault();
        state.ledger.on_removed_from_mempool(txid, reason);
        flush(&mut state, &mut vault)
    }

    /// Applies a block that has become the new tip.
    pub fn on_block_connected<C: ChainView>(
        &self,
        chain: &C,
        block: &Block,
        now: i64,
    ) -> Result<WitnessReport> {
        let span = info_span!("block_connected", height = u32::from(block.height));
        let _enter = span.enter();

        let mut guard = self.lock_state();
        let mut vault = self.write_vault();
        let state = &mut *guard;
        state.ledger.set_tip(Some(block.height));
        let report = self.apply_block(state, &mut vault, chain, block, now);
        state.best_block = Some(BestBlock {
            height: block.height,
            hash: block.hash,
        });
        state.meta_dirty = true;
        flush(state, &mut vault)?;
        Ok(report)
    }

    /// Reverts a block that has been removed from the tip of the chain.
    pub fn on_block_disconnected(&self, block: &Block) -> Result<()> {
        let span = info_span!("block_disconnected", height = u32::from(block.height));
        let _enter = span.enter();

        let mut guard = self.lock_state();
        let mut vault = self.write_vault();
        let state = &mut *guard;
        state.ledger.disconnect_block(block);
        let engine = state.witnesses;
        engine.disconnect_block(&mut state.ledger, block);
        state.best_block = u32::from(block.height)
            .checked_sub(1)
            .map(|h| BestBlock {
                height: h.into(),
                hash: block.prev_hash,
            });
        state.meta_dirty = true;
        flush(state, &mut vault)
    }

    /// Syncs every transaction in `block` and brings note witnesses up to date with it.
    /// The ledger tip must already include `block`.
    fn apply_block<C: ChainView>(
        &self,
        state: &mut WalletState<S>,
        vault: &mut KeyVault,
        chain: &C,
        block: &Block,
        now: i64,
    ) -> WitnessReport {
        for (index, tx) in block.vtx.iter().enumerate() {
            if self
                .sync_transaction(state, vault, tx, Some((block, index as u32)), now)
                .is_some()
            {
                state.ledger.set_in_mempool(&tx.txid(), false);
            }
        }
        let engine = state.witnesses;
        engine.connect_block(&mut state.ledger, vault, chain, block)
    }

    /// Adds `tx` to the ledger if it concerns the wallet, or updates the existing
    /// record. When `confirmed` is set, wallet transactions double-spending `tx` are
    /// marked as conflicted first. Returns `None` if `tx` is not relevant.
    fn sync_transaction(
        &self,
        state: &mut WalletState<S>,
        vault: &mut KeyVault,
        tx: &Transaction,
        confirmed: Option<(&Block, u32)>,
        now: i64,
    ) -> Option<UpdateOutcome> {
        let txid = tx.txid();
        if let Some((block, _)) = confirmed {
            for spender in state.ledger.conflicting_spenders(tx) {
                state.ledger.mark_conflicted(block.hash, block.height, spender);
            }
        }

        let detected = self.scanner.scan(tx, vault);
        let incoming = TransactionRecord::new(tx.clone(), TxStatus::Unconfirmed);
        let debit = state.ledger.debit(&incoming, &*vault, OwnershipFilter::All);
        let mut receives = false;
        for out in &tx.vout {
            if vault.is_mine_script(&out.script_pubkey).is_mine() {
                receives = true;
                if let Some(key_id) = out.script_pubkey.address().and_then(|a| a.key_id()) {
                    vault.mark_key_used(&key_id);
                }
            }
        }
        let spends_notes = tx
            .nullifiers()
            .any(|nf| state.ledger.note_for_nullifier(&nf).is_some());

        let relevant = state.ledger.contains(&txid)
            || receives
            || debit > 0
            || spends_notes
            || !detected.is_empty();
        if !relevant {
            return None;
        }

        for note in detected.sapling.values() {
            vault.add_sapling_address(note.recipient.to_bytes(), note.ivk);
        }
        let update = match confirmed {
            Some((block, index)) => TxUpdate::confirmed(tx.clone(), block, index),
            None => TxUpdate::new(tx.clone(), TxStatus::Unconfirmed),
        }
        .with_from_me(debit > 0)
        .with_notes(detected.sprout, detected.sapling);
        Some(state.ledger.add_or_update(update, now))
    }

    //
    // Queries
    //

    /// The balance query implied by this wallet's configuration and flags.
    pub fn balance_query(&self) -> BalanceQuery {
        let state = self.lock_state();
        BalanceQuery {
            avoid_reuse: self.avoid_reuse(&state),
            spend_zero_conf_change: self.config.spend_zero_conf_change,
            ..BalanceQuery::default()
        }
    }

    /// The coin query implied by this wallet's configuration and flags.
    pub fn coin_query(&self) -> CoinQuery {
        let state = self.lock_state();
        CoinQuery {
            avoid_reuse: self.avoid_reuse(&state),
            spend_zero_conf_change: self.config.spend_zero_conf_change,
            ..CoinQuery::default()
        }
    }

    pub fn balance(&self, query: BalanceQuery) -> WalletBalance {
        let mut state = self.lock_state();
        let vault = self.read_vault();
        state.ledger.compute_balance(&*vault, query)
    }

    pub fn list_unspent(&self, query: &CoinQuery) -> Vec<WalletOutput> {
        let state = self.lock_state();
        let vault = self.read_vault();
        state.ledger.available_coins(&*vault, query)
    }

    pub fn list_notes(&self, query: &CoinQuery) -> Vec<NoteOutput> {
        let state = self.lock_state();
        let vault = self.read_vault();
        state.ledger.available_notes(&*vault, query)
    }

    pub fn transaction(&self, txid: &TxId) -> Option<TransactionRecord> {
        self.lock_state().ledger.get(txid).cloned()
    }

    /// Every wallet transaction in the order it was first seen.
    pub fn transactions(&self) -> Vec<TransactionRecord> {
        self.lock_state().ledger.iter_ordered().cloned().collect()
    }

    /// The depth of `txid` in the active chain: negative for conflicted transactions.
    pub fn depth(&self, txid: &TxId) -> Option<i64> {
        self.lock_state().ledger.depth(txid)
    }

    pub fn best_block(&self) -> Option<BestBlock> {
        self.lock_state().best_block
    }

    /// Whether the wallet can see, or spend, value sent to `address`.
    pub fn is_mine(&self, address: &PaymentAddress) -> IsMine {
        let vault = self.read_vault();
        match address {
            PaymentAddress::Transparent(addr) => vault.is_mine_script(&addr.script()),
            PaymentAddress::Sprout(addr) => vault.sprout_ownership(addr),
            PaymentAddress::Sapling(addr) => vault
                .sapling_ivk_for_address(&addr.to_bytes())
                .map_or(IsMine::No, |ivk| vault.sapling_ownership(&ivk)),
        }
    }

    //
    // Ledger maintenance
    //

    pub fn abandon_transaction(&self, txid: &TxId) -> Result<()> {
        let mut state = self.lock_state();
        let mut vault = self.write_vault();
        state.ledger.abandon(txid)?;
        flush(&mut state, &mut vault)
    }

    pub fn set_comment(&self, txid: &TxId, comment: impl Into<String>) -> Result<()> {
        let mut state = self.lock_state();
        let mut vault = self.write_vault();
        state.ledger.set_comment(txid, comment.into())?;
        flush(&mut state, &mut vault)
    }

    /// Removes every transaction from the wallet and the store. Keys, metadata and the
    /// address book are kept. Returns the removed transaction ids.
    pub fn zap_transactions(&self) -> Result<Vec<TxId>> {
        let mut state = self.lock_state();
        let mut vault = self.write_vault();
        let removed = state.ledger.zap();
        state.ledger.restore_dirty(removed.iter().copied().collect());
        flush(&mut state, &mut vault)?;
        info!("Zapped {} transactions from wallet {}", removed.len(), self.name);
        Ok(removed)
    }

    pub fn lock_coin(&self, outpoint: OutPoint) {
        self.lock_state().ledger.lock_coin(outpoint);
    }

    pub fn unlock_coin(&self, outpoint: &OutPoint) {
        self.lock_state().ledger.unlock_coin(outpoint);
    }

    pub fn lock_note(&self, note: NoteRef) {
        self.lock_state().ledger.lock_note(note);
    }

    pub fn unlock_note(&self, note: &NoteRef) {
        self.lock_state().ledger.unlock_note(note);
    }

    pub fn unlock_all_coins(&self) {
        self.lock_state().ledger.unlock_all();
    }

    pub fn locked_coins(&self) -> Vec<OutPoint> {
        self.lock_state().ledger.locked_coins().copied().collect()
    }

    //
    // Version and flags
    //

    pub fn version(&self) -> u32 {
        self.lock_state().version
    }

    /// Raises the wallet format version. Versions never decrease.
    pub fn upgrade_version(&self, requested: u32) -> Result<()> {
        let mut state = self.lock_state();
        if requested < state.version {
            return Err(Error::VersionDowngrade {
                current: state.version,
                requested,
            });
        }
        if requested > CURRENT_VERSION {
            return Err(Error::InvalidConfig(format!(
                "unknown wallet version {}",
                requested
            )));
        }
        if requested != state.version {
            info!("Upgrading wallet {} to version {}", self.name, requested);
            state.version = requested;
            state.meta_dirty = true;
            let mut vault = self.write_vault();
            flush(&mut state, &mut vault)?;
        }
        Ok(())
    }

    pub fn flags(&self) -> WalletFlags {
        self.lock_state().flags
    }

    pub fn set_avoid_reuse(&self, enabled: bool) -> Result<()> {
        let mut state = self.lock_state();
        state.flags.set(WalletFlags::AVOID_REUSE, enabled);
        state.meta_dirty = true;
        state.ledger.invalidate_balances();
        let mut vault = self.write_vault();
        flush(&mut state, &mut vault)
    }

    /// Makes the wallet watch-only. Only possible while it holds no keys or
    /// transactions.
    pub fn disable_private_keys(&self) -> Result<()> {
        let mut state = self.lock_state();
        let mut vault = self.write_vault();
        if state.flags.contains(WalletFlags::DISABLE_PRIVATE_KEYS) {
            return Ok(());
        }
        if !state.ledger.is_empty() {
            return Err(Error::CannotDisablePrivateKeys);
        }
        vault
            .disable_private_keys()
            .map_err(|_| Error::CannotDisablePrivateKeys)?;
        state.flags.insert(WalletFlags::DISABLE_PRIVATE_KEYS);
        state.meta_dirty = true;
        flush(&mut state, &mut vault)
    }

    pub(crate) fn avoid_reuse(&self, state: &WalletState<S>) -> bool {
        self.config.avoid_reuse || state.flags.contains(WalletFlags::AVOID_REUSE)
    }

    //
    // Address book
    //

    pub fn set_address_book(&self, address: PaymentAddress, entry: AddressBookEntry) -> Result<()> {
        let mut state = self.lock_state();
        if state.address_book.get(&address) != Some(&entry) {
            state.address_book.insert(address, entry);
            state.address_book_dirty.insert(address);
        }
        let mut vault = self.write_vault();
        flush(&mut state, &mut vault)
    }

    /// Returns whether an entry was removed.
    pub fn delete_address_book(&self, address: &PaymentAddress) -> Result<bool> {
        let mut state = self.lock_state();
        let removed = state.address_book.remove(address).is_some();
        if removed {
            state.address_book_dirty.insert(*address);
            let mut vault = self.write_vault();
            flush(&mut state, &mut vault)?;
        }
        Ok(removed)
    }

    pub fn address_book_entry(&self, address: &PaymentAddress) -> Option<AddressBookEntry> {
        self.lock_state().address_book.get(address).cloned()
    }

    pub fn address_book(&self) -> Vec<(PaymentAddress, AddressBookEntry)> {
        self.lock_state()
            .address_book
            .iter()
            .map(|(a, e)| (*a, e.clone()))
            .collect()
    }
}

/// Writes every changed record in one batch. On failure the changes stay pending.
pub(crate) fn flush<S: WalletStore>(state: &mut WalletState<S>, vault: &mut KeyVault) -> Result<()> {
    let txids = state.ledger.take_dirty();
    let key_ids = vault.take_dirty();
    let addresses = std::mem::take(&mut state.address_book_dirty);
    let meta = std::mem::replace(&mut state.meta_dirty, false);
    if txids.is_empty() && key_ids.is_empty() && addresses.is_empty() && !meta {
        return Ok(());
    }

    match write_batch(state, vault, &txids, &key_ids, &addresses, meta) {
        Ok(()) => {
            debug!(
                "Wrote {} transactions, {} key records, {} address book entries",
                txids.len(),
                key_ids.len(),
                addresses.len()
            );
            Ok(())
        }
        Err(e) => {
            warn!("Wallet batch failed, keeping changes pending: {}", e);
            state.ledger.restore_dirty(txids);
            vault.restore_dirty(key_ids);
            state.address_book_dirty.extend(addresses);
            state.meta_dirty |= meta;
            Err(e)
        }
    }
}

fn write_batch<S: WalletStore>(
    state: &mut WalletState<S>,
    vault: &KeyVault,
    txids: &BTreeSet<TxId>,
    key_ids: &BTreeSet<VaultRecordId>,
    addresses: &BTreeSet<PaymentAddress>,
    meta: bool,
) -> Result<()> {
    let WalletState {
        ledger,
        store,
        address_book,
        best_block,
        version,
        flags,
        ..
    } = state;

    let mut batch = WalletBatch::begin(store)?;
    for txid in txids {
        match ledger.get(txid) {
            Some(record) => batch.write_tx(record)?,
            None => batch.erase_tx(*txid)?,
        }
    }
    for id in key_ids {
        batch.write_key_record(vault, id.clone())?;
    }
    for address in addresses {
        batch.write_address_book(*address, address_book.get(address))?;
    }
    if meta {
        batch.write_version(*version)?;
        batch.write_flags(*flags)?;
        if let Some(best) = best_block {
            batch.write_best_block(best)?;
        }
    }
    batch.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rand_chacha::ChaChaRng;
    use rand_core::SeedableRng;
    use zcash_protocol::{consensus::NetworkType, value::Zatoshis};

    use super::{AddressBookEntry, Wallet, WalletFlags, CURRENT_VERSION};
    use crate::chain::ChainView;
    use crate::config::WalletConfig;
    use crate::error::{Error, ErrorKind};
    use crate::ownership::IsMine;
    use crate::primitives::{PaymentAddress, TransparentAddress, TxOut};
    use crate::scan::DefaultScanner;
    use crate::store::{MemoryStore, RecordKey, WalletStore};
    use crate::testing::{coinbase_tx, MockChain};

    fn config() -> WalletConfig {
        WalletConfig::new(NetworkType::Test)
            .with_keypool_size(2)
            .with_kdf_target(std::time::Duration::from_millis(1))
    }

    fn new_wallet(rng: &mut ChaChaRng) -> Wallet<MemoryStore> {
        Wallet::create(
            "test",
            config(),
            MemoryStore::new(),
            DefaultScanner,
            WalletFlags::empty(),
            0,
            rng,
        )
        .unwrap()
    }

    #[test]
    fn address_book_entry_roundtrip() {
        let entry = AddressBookEntry::new("alice", "send");
        let mut bytes = vec![];
        entry.write(&mut bytes).unwrap();
        assert_eq!(AddressBookEntry::read(&bytes[..]).unwrap(), entry);
    }

    #[test]
    fn create_persists_keys_and_metadata() {
        let mut rng = ChaChaRng::seed_from_u64(0);
        let wallet = new_wallet(&mut rng);
        assert_eq!(wallet.version(), CURRENT_VERSION);
        let store = wallet.close();
        assert!(store.contains(&RecordKey::Version));
        assert!(store.contains(&RecordKey::Flags));
        assert!(store
            .records()
            .unwrap()
            .iter()
            .any(|(k, _)| matches!(k, RecordKey::Vault(_))));
    }

    #[test]
    fn failed_commit_keeps_changes_pending() {
        let mut rng = ChaChaRng::seed_from_u64(1);
        let wallet = new_wallet(&mut rng);
        let address = PaymentAddress::Transparent(TransparentAddress::PublicKeyHash([3; 20]));

        wallet.lock_state().store.fail_next_commit();
        assert_matches!(
            wallet.set_address_book(address, AddressBookEntry::new("bob", "send")),
            Err(Error::Store(_))
        );
        assert!(!wallet
            .lock_state()
            .store
            .contains(&RecordKey::AddressBook(address)));

        // The next write carries the entry that failed to land.
        wallet.flush().unwrap();
        assert!(wallet
            .lock_state()
            .store
            .contains(&RecordKey::AddressBook(address)));
    }

    #[test]
    fn version_only_increases() {
        let mut rng = ChaChaRng::seed_from_u64(2);
        let wallet = new_wallet(&mut rng);
        let err = wallet.upgrade_version(CURRENT_VERSION - 1).unwrap_err();
        assert_matches!(err, Error::VersionDowngrade { .. });
        assert_eq!(err.kind(), ErrorKind::Policy);
        wallet.upgrade_version(CURRENT_VERSION).unwrap();
    }

    #[test]
    fn private_keys_cannot_be_disabled_once_present() {
        let mut rng = ChaChaRng::seed_from_u64(3);
        let wallet = new_wallet(&mut rng);
        assert_matches!(
            wallet.disable_private_keys(),
            Err(Error::CannotDisablePrivateKeys)
        );

        let watch_only: Wallet<MemoryStore> = Wallet::create(
            "watch",
            config(),
            MemoryStore::new(),
            DefaultScanner,
            WalletFlags::DISABLE_PRIVATE_KEYS,
            0,
            &mut rng,
        )
        .unwrap();
        assert!(watch_only
            .flags()
            .contains(WalletFlags::DISABLE_PRIVATE_KEYS));
        assert_matches!(
            watch_only.new_address(0, &mut rng),
            Err(Error::Keys(_))
        );
    }

    #[test]
    fn ignores_unrelated_transactions() {
        let mut rng = ChaChaRng::seed_from_u64(4);
        let wallet = new_wallet(&mut rng);
        let mut chain = MockChain::new();
        let foreign = TransparentAddress::PublicKeyHash([8; 20]).script();
        let tx = coinbase_tx(
            chain.next_height(),
            vec![TxOut::new(Zatoshis::const_from_u64(5000), foreign)],
        );
        let block = chain.push_block(vec![tx.clone()]);
        wallet.on_block_connected(&chain, &block, block.time).unwrap();
        assert!(wallet.transaction(&tx.txid()).is_none());
        assert_eq!(wallet.best_block().map(|b| b.height), chain.tip_height());
    }

    #[test]
    fn new_address_is_mine() {
        let mut rng = ChaChaRng::seed_from_u64(5);
        let wallet = new_wallet(&mut rng);
        let address = wallet.new_address(0, &mut rng).unwrap();
        assert_eq!(
            wallet.is_mine(&PaymentAddress::Transparent(address)),
            IsMine::Spendable
        );
        let sapling = wallet.new_sapling_address(0, &mut rng).unwrap();
        assert_eq!(
            wallet.is_mine(&PaymentAddress::Sapling(sapling)),
            IsMine::Spendable
        );
    }
}
