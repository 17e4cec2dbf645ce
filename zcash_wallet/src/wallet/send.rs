//! Creating, committing and discarding outgoing transactions.

use rand_core::{CryptoRng, RngCore};
use tracing::{info, warn};
use zcash_protocol::TxId;

use crate::chain::ChainView;
use crate::error::Result;
use crate::ledger::{SaplingOutPoint, TxStatus, TxUpdate};
use crate::scan::NoteScanner;
use crate::selection::assembler::{AssembledTransaction, TransactionAssembler, TransactionRequest};
use crate::selection::fees::FeeEstimator;
use crate::signing::{Broadcaster, ShieldedProver};
use crate::store::WalletStore;

use super::{flush, Wallet};

impl<S: WalletStore, N: NoteScanner> Wallet<S, N> {
    /// Selects inputs for `request`, then prices and signs the transaction.
    ///
    /// The wallet is not changed. The result must be passed to either
    /// [`Wallet::commit_transaction`] or [`Wallet::discard_transaction`].
    pub fn create_transaction<C, E, P, R>(
        &self,
        chain: &C,
        estimator: &E,
        prover: &P,
        request: &TransactionRequest,
        now: i64,
        rng: &mut R,
    ) -> Result<AssembledTransaction>
    where
        C: ChainView,
        E: FeeEstimator,
        P: ShieldedProver,
        R: RngCore + CryptoRng,
    {
        let state = self.lock_state();
        let mut vault = self.write_vault();
        let config = if self.avoid_reuse(&state) && !self.config.avoid_reuse {
            self.config.clone().with_avoid_reuse(true)
        } else {
            self.config.clone()
        };
        let assembled = TransactionAssembler::new(&config, chain, estimator, prover)
            .create_transaction(&state.ledger, &mut vault, request, now, rng)?;
        Ok(assembled)
    }

    /// Returns the change key of a transaction that will not be committed.
    pub fn discard_transaction(&self, assembled: AssembledTransaction) {
        if let Some(key) = assembled.change_key {
            self.write_vault().return_key(key);
        }
    }

    /// Records an assembled transaction as sent by the wallet and, if broadcasting is
    /// enabled, submits it to the mempool.
    ///
    /// A broadcast rejection is not an error: the transaction stays in the wallet and
    /// is retried by rebroadcasting until it confirms, expires or is abandoned.
    pub fn commit_transaction<B: Broadcaster>(
        &self,
        assembled: AssembledTransaction,
        broadcaster: &B,
        now: i64,
    ) -> Result<TxId> {
        let mut state = self.lock_state();
        let mut vault = self.write_vault();
        let AssembledTransaction {
            tx,
            fee,
            change_key,
            sapling_change,
            ..
        } = assembled;
        let txid = tx.txid();

        if let Some(key) = change_key {
            vault.keep_key(key);
        }
        let mut notes = self.scanner.scan(&tx, &vault);
        if let Some((n, data)) = sapling_change {
            notes
                .sapling
                .entry(SaplingOutPoint::new(txid, n as u32))
                .or_insert(data);
        }
        state.ledger.add_or_update(
            TxUpdate::new(tx.clone(), TxStatus::Unconfirmed)
                .with_from_me(true)
                .with_notes(notes.sprout, notes.sapling),
            now,
        );
        info!("CommitTransaction {} (fee {})", txid, fee);

        if self.config.broadcast_transactions {
            match broadcaster.broadcast(&tx) {
                Ok(()) => {
                    state.ledger.set_in_mempool(&txid, true);
                    state.ledger.set_last_broadcast(&txid, now);
                }
                Err(e) => warn!("Transaction {} not accepted to the mempool: {}", txid, e),
            }
        }
        flush(&mut state, &mut vault)?;
        Ok(txid)
    }
}
