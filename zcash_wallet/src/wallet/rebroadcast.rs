//! Periodic resubmission of wallet transactions that have not confirmed.

use rand::Rng;
use rand_core::RngCore;
use tracing::{debug, info};
use zcash_protocol::TxId;

use crate::error::Result;
use crate::scan::NoteScanner;
use crate::signing::Broadcaster;
use crate::store::WalletStore;

use super::{flush, Wallet};

/// The longest random delay before the next rebroadcast attempt, in seconds.
const MAX_RESEND_DELAY: i64 = 30 * 60;

/// Only transactions received at least this long before the best block are resent.
const RESEND_AGE: i64 = 5 * 60;

impl<S: WalletStore, N: NoteScanner> Wallet<S, N> {
    /// Resends unconfirmed wallet transactions to the mempool. Returns the ids of the
    /// transactions that were accepted.
    ///
    /// Attempts are spaced by a random delay, the very first call only schedules one,
    /// and nothing is resent until a block newer than the previous attempt arrives.
    pub fn resend_wallet_transactions<B: Broadcaster, R: RngCore>(
        &self,
        broadcaster: &B,
        best_block_time: i64,
        now: i64,
        rng: &mut R,
    ) -> Result<Vec<TxId>> {
        if !self.config.broadcast_transactions {
            return Ok(vec![]);
        }
        let mut state = self.lock_state();
        if now < state.next_resend {
            return Ok(vec![]);
        }
        let first = state.next_resend == 0;
        state.next_resend = (now + rng.gen_range(0..MAX_RESEND_DELAY)).max(1);
        if first {
            debug!("First rebroadcast scheduled for {}", state.next_resend);
            return Ok(vec![]);
        }
        if best_block_time < state.last_resend {
            return Ok(vec![]);
        }
        state.last_resend = now;

        let tip = state.ledger.tip();
        let before = best_block_time - RESEND_AGE;
        let mut candidates = state
            .ledger
            .records()
            .filter(|r| {
                r.depth(tip) == 0
                    && !r.status.is_abandoned()
                    && !r.is_coinbase()
                    && !r.is_expired(tip)
                    && r.time_received <= before
            })
            .map(|r| (r.time_received, r.txid(), r.tx().clone()))
            .collect::<Vec<_>>();
        candidates.sort_by_key(|(time, txid, _)| (*time, *txid));

        let mut relayed = vec![];
        for (_, txid, tx) in candidates {
            match broadcaster.broadcast(&tx) {
                Ok(()) => {
                    state.ledger.set_in_mempool(&txid, true);
                    state.ledger.set_last_broadcast(&txid, now);
                    relayed.push(txid);
                }
                Err(e) => debug!("Rebroadcast of {} rejected: {}", txid, e),
            }
        }
        if !relayed.is_empty() {
            info!("Rebroadcast {} unconfirmed transactions", relayed.len());
        }
        let mut vault = self.write_vault();
        flush(&mut state, &mut vault)?;
        Ok(relayed)
    }
}
