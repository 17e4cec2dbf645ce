//! Rescanning a range of the chain for wallet transactions.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, info_span, warn};
use zcash_protocol::consensus::BlockHeight;

use crate::chain::ChainView;
use crate::error::{Error, Result};
use crate::scan::NoteScanner;
use crate::store::WalletStore;

use super::{flush, Wallet};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RescanStatus {
    Success,
    /// Stopped early by [`Wallet::abort_rescan`].
    Aborted,
    /// At least one block could not be read. The rest of the range was scanned.
    Failure,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RescanResult {
    pub status: RescanStatus,
    /// The highest block that was scanned.
    pub last_scanned: Option<BlockHeight>,
    /// The highest block that could not be read.
    pub last_failed: Option<BlockHeight>,
}

/// Clears the in-progress flag when the rescan ends, however it ends.
struct Reserved<'a>(&'a AtomicBool);

impl Drop for Reserved<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<S: WalletStore, N: NoteScanner> Wallet<S, N> {
    /// Scans blocks `start..=stop` (or up to the tip) for transactions concerning the
    /// wallet, rebuilding the witnesses of notes confirmed in that range.
    ///
    /// The state lock is released between blocks, so chain events and queries can
    /// proceed while a long rescan runs.
    pub fn rescan<C: ChainView>(
        &self,
        chain: &C,
        start: BlockHeight,
        stop: Option<BlockHeight>,
        now: i64,
    ) -> Result<RescanResult> {
        if self.rescanning.swap(true, Ordering::SeqCst) {
            return Err(Error::RescanInProgress);
        }
        let _reserved = Reserved(&self.rescanning);
        self.abort_rescan.store(false, Ordering::SeqCst);

        let mut result = RescanResult {
            status: RescanStatus::Success,
            last_scanned: None,
            last_failed: None,
        };
        let Some(stop) = stop.or_else(|| chain.tip_height()) else {
            return Ok(result);
        };

        let span = info_span!("rescan", start = u32::from(start), stop = u32::from(stop));
        let _enter = span.enter();
        info!("Rescanning wallet {}", self.name);

        {
            let mut state = self.lock_state();
            let vault = self.read_vault();
            state.ledger.set_tip(chain.tip_height());
            let engine = state.witnesses;
            engine.clear_from(&mut state.ledger, start);
            let report = engine.rebuild_before(&mut state.ledger, &vault, chain, start);
            if !report.unavailable.is_empty() {
                result.last_failed = report.unavailable.last().copied();
                result.status = RescanStatus::Failure;
            }
        }

        let mut height = start;
        while height <= stop {
            if self.abort_rescan.load(Ordering::SeqCst) {
                info!("Rescan aborted at block {}", u32::from(height));
                result.status = RescanStatus::Aborted;
                break;
            }
            match chain.block_at_height(height) {
                Some(block) => {
                    let mut guard = self.lock_state();
                    let mut vault = self.write_vault();
                    let report = self.apply_block(&mut guard, &mut vault, chain, &block, now);
                    if !report.unavailable.is_empty() {
                        result.last_failed = report.unavailable.last().copied();
                        result.status = RescanStatus::Failure;
                    }
                    result.last_scanned = Some(height);
                }
                None => {
                    warn!("Rescan could not read block {}", u32::from(height));
                    result.last_failed = Some(height);
                    result.status = RescanStatus::Failure;
                }
            }
            height = height + 1;
        }

        {
            let mut state = self.lock_state();
            let mut vault = self.write_vault();
            flush(&mut state, &mut vault)?;
        }
        info!("Rescan finished: {:?}", result);
        Ok(result)
    }

    /// Asks a running rescan to stop before its next block.
    pub fn abort_rescan(&self) {
        self.abort_rescan.store(true, Ordering::SeqCst);
    }

    pub fn is_rescanning(&self) -> bool {
        self.rescanning.load(Ordering::SeqCst)
    }
}
