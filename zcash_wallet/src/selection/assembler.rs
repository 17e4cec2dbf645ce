//! Building, pricing and signing new transactions.
//!
//! [`TransactionAssembler::create_transaction`] funds a [`TransactionRequest`] either
//! from transparent coins or from Sapling notes. The fee is found iteratively: each
//! candidate transaction is sized with placeholder signatures and proofs, and the loop
//! repeats with the fee that size requires until the selected inputs cover it.

use rand::{seq::SliceRandom, Rng};
use rand_core::{CryptoRng, RngCore};
use tracing::{debug, info};
use zcash_protocol::{consensus::BlockHeight, value::Zatoshis};
use zcash_wallet_keys::{keypool::ReservedKey, transparent::KeyChain, KeyVault};

use crate::chain::ChainView;
use crate::config::WalletConfig;
use crate::ledger::{CoinQuery, NoteRef, SaplingNoteData, WalletLedger};
use crate::ownership::{IsMine, Ownership};
use crate::primitives::{
    transaction::{
        OutputDescription, SpendDescription, OUTPUT_DESCRIPTION_SIZE, SEQUENCE_FINAL,
        SPEND_DESCRIPTION_SIZE,
    },
    OutPoint, PaymentAddress, Script, Transaction, TxIn, TxOut,
};
use crate::signing::{
    shielded_sighash, DummySigner, LegacySighash, SaplingOutput, SaplingSpend, ShieldedProver,
    TransactionSigner, VaultSigner,
};
use crate::tree::node_bytes;

use super::fees::{
    discard_rate, dust_threshold, is_dust, minimum_fee_rate, required_fee_rate,
    sapling_dust_threshold, FeeEstimator, FeeRate,
};
use super::{
    eligibility_tiers, group_outputs, select_coins, CandidateCoin, CoinSelectionParams,
    InputCoin, Selection, SelectionError, SigningFailure, MAX_STANDARD_TX_SIZE, MIN_FINAL_CHANGE,
    P2PKH_INPUT_SIZE,
};

/// Anti-fee-sniping locktimes are only set while the tip is younger than this.
const MAX_ANTI_FEE_SNIPING_TIP_AGE: i64 = 8 * 60 * 60;

/// The memo field of a note carrying no memo.
pub const EMPTY_MEMO: [u8; 512] = {
    let mut memo = [0; 512];
    memo[0] = 0xf6;
    memo
};

/// A single recipient of a new transaction.
#[derive(Clone, Debug)]
pub struct Payment {
    pub recipient: PaymentAddress,
    pub amount: Zatoshis,
    /// Only used for shielded recipients.
    pub memo: Option<[u8; 512]>,
    /// Whether this output bears a share of the fee.
    pub subtract_fee: bool,
}

impl Payment {
    pub fn new(recipient: PaymentAddress, amount: Zatoshis) -> Self {
        Payment {
            recipient,
            amount,
            memo: None,
            subtract_fee: false,
        }
    }

    pub fn with_memo(mut self, memo: [u8; 512]) -> Self {
        self.memo = Some(memo);
        self
    }

    pub fn subtracting_fee(mut self) -> Self {
        self.subtract_fee = true;
        self
    }
}

/// Which pool pays for a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FundingSource {
    Transparent,
    Sapling,
}

#[derive(Clone, Debug)]
pub struct TransactionRequest {
    pub payments: Vec<Payment>,
    pub source: FundingSource,
    /// Where change goes among the outputs of the funding pool: the transparent
    /// outputs, or the Sapling outputs when funded from notes. Random when unset.
    pub change_position: Option<usize>,
    /// Overrides the configured confirmation target for fee estimation.
    pub confirm_target: Option<u32>,
    pub min_depth: u32,
}

impl TransactionRequest {
    pub fn new(payments: Vec<Payment>) -> Self {
        TransactionRequest {
            payments,
            source: FundingSource::Transparent,
            change_position: None,
            confirm_target: None,
            min_depth: 0,
        }
    }

    pub fn from_sapling(mut self) -> Self {
        self.source = FundingSource::Sapling;
        self
    }

    pub fn with_change_position(mut self, position: usize) -> Self {
        self.change_position = Some(position);
        self
    }

    pub fn with_confirm_target(mut self, target: u32) -> Self {
        self.confirm_target = Some(target);
        self
    }

    pub fn with_min_depth(mut self, min_depth: u32) -> Self {
        self.min_depth = min_depth;
        self
    }

    fn total(&self) -> Result<u64, SelectionError> {
        self.payments
            .iter()
            .try_fold(Zatoshis::ZERO, |acc, p| acc + p.amount)
            .map(|total| total.into_u64())
            .ok_or(SelectionError::InvalidAmount)
    }

    fn subtract_fee_outputs(&self) -> bool {
        self.payments.iter().any(|p| p.subtract_fee)
    }
}

/// A signed transaction ready to be committed to the wallet.
#[derive(Debug)]
pub struct AssembledTransaction {
    pub tx: Transaction,
    pub fee: u64,
    /// The index of the change output in `tx.vout`, or in `tx.shielded_outputs` when
    /// the transaction was funded from Sapling notes.
    pub change_position: Option<usize>,
    pub spent_coins: Vec<OutPoint>,
    pub spent_notes: Vec<NoteRef>,
    /// The keypool key paying transparent change. Must be kept once the transaction is
    /// committed, or returned if it is discarded.
    pub change_key: Option<ReservedKey>,
    /// The Sapling change note, so that it can be recorded without trial decryption.
    pub sapling_change: Option<(usize, SaplingNoteData)>,
}

struct PaymentOutputs {
    transparent: Vec<TxOut>,
    sapling: Vec<SaplingOutput>,
}

impl PaymentOutputs {
    fn sapling_value(&self) -> u64 {
        self.sapling.iter().map(|o| o.value).sum()
    }
}

/// Assembles transactions against a fixed view of the chain and fee market.
pub struct TransactionAssembler<'a, C, E, P> {
    config: &'a WalletConfig,
    chain: &'a C,
    estimator: &'a E,
    prover: &'a P,
}

impl<'a, C: ChainView, E: FeeEstimator, P: ShieldedProver> TransactionAssembler<'a, C, E, P> {
    pub fn new(config: &'a WalletConfig, chain: &'a C, estimator: &'a E, prover: &'a P) -> Self {
        TransactionAssembler {
            config,
            chain,
            estimator,
            prover,
        }
    }

    /// Selects inputs for `request`, prices the transaction and signs it.
    ///
    /// Nothing in the ledger changes. A change key is reserved from `vault` for
    /// transparent funding and is returned to the pool unless the result uses it.
    pub fn create_transaction<R: RngCore + CryptoRng>(
        &self,
        ledger: &WalletLedger,
        vault: &mut KeyVault,
        request: &TransactionRequest,
        now: i64,
        rng: &mut R,
    ) -> Result<AssembledTransaction, SelectionError> {
        self.validate(request)?;
        match request.source {
            FundingSource::Transparent => {
                let change_key = vault
                    .reserve_key(KeyChain::Internal, self.config.keypool_size, now, rng)
                    .map_err(keypool_error)?;
                let change_script = Script::p2pkh(change_key.key_id().as_bytes());
                match self.fund_transparent(ledger, vault, request, &change_script, now, rng) {
                    Ok(mut assembled) => {
                        if assembled.change_position.is_some() {
                            assembled.change_key = Some(change_key);
                        } else {
                            vault.return_key(change_key);
                        }
                        Ok(assembled)
                    }
                    Err(e) => {
                        vault.return_key(change_key);
                        Err(e)
                    }
                }
            }
            FundingSource::Sapling => self.fund_sapling(ledger, vault, request, now, rng),
        }
    }

    fn validate(&self, request: &TransactionRequest) -> Result<(), SelectionError> {
        if request.payments.is_empty() {
            return Err(SelectionError::InvalidAmount);
        }
        for payment in &request.payments {
            if payment.amount == Zatoshis::ZERO {
                return Err(SelectionError::InvalidAmount);
            }
            if matches!(payment.recipient, PaymentAddress::Sprout(_)) {
                return Err(SelectionError::UnsupportedRecipient);
            }
        }
        request.total()?;
        let change_pool_outputs = request
            .payments
            .iter()
            .filter(|p| match request.source {
                FundingSource::Transparent => {
                    matches!(p.recipient, PaymentAddress::Transparent(_))
                }
                FundingSource::Sapling => matches!(p.recipient, PaymentAddress::Sapling(_)),
            })
            .count();
        if request.change_position.is_some_and(|pos| pos > change_pool_outputs) {
            return Err(SelectionError::ChangeIndexOutOfRange);
        }
        Ok(())
    }

    /// The outputs paying each recipient, with `fee` shared among those that subtract
    /// it. The first such output also bears the remainder.
    fn payment_outputs<R: RngCore>(
        &self,
        payments: &[Payment],
        fee: u64,
        rng: &mut R,
    ) -> Result<PaymentOutputs, SelectionError> {
        let subtracting = payments.iter().filter(|p| p.subtract_fee).count() as u64;
        let mut outputs = PaymentOutputs {
            transparent: vec![],
            sapling: vec![],
        };
        let mut first = true;
        for (i, payment) in payments.iter().enumerate() {
            let mut value = payment.amount.into_u64();
            if payment.subtract_fee {
                let mut share = fee / subtracting;
                if first {
                    share += fee % subtracting;
                    first = false;
                }
                value = value.checked_sub(share).ok_or(SelectionError::DustOutput(i))?;
            }
            match payment.recipient {
                PaymentAddress::Transparent(addr) => {
                    let value = Zatoshis::from_u64(value).map_err(|_| SelectionError::InvalidAmount)?;
                    let txout = TxOut::new(value, addr.script());
                    if is_dust(&txout, self.config.dust_relay_fee) {
                        return Err(SelectionError::DustOutput(i));
                    }
                    outputs.transparent.push(txout);
                }
                PaymentAddress::Sapling(to) => {
                    if value == 0 {
                        return Err(SelectionError::DustOutput(i));
                    }
                    let mut rseed = [0; 32];
                    rng.fill_bytes(&mut rseed);
                    outputs.sapling.push(SaplingOutput {
                        to,
                        value,
                        rseed,
                        memo: payment.memo.unwrap_or(EMPTY_MEMO),
                    });
                }
                PaymentAddress::Sprout(_) => return Err(SelectionError::UnsupportedRecipient),
            }
        }
        Ok(outputs)
    }

    /// The current tip height, or a height somewhat before it, so that transactions
    /// created now cannot be mined in a reorganization that rewrites history.
    fn lock_time<R: RngCore>(&self, now: i64, rng: &mut R) -> u32 {
        let Some(tip) = self.chain.tip_height() else {
            return 0;
        };
        let current = !self.chain.is_initial_sync()
            && self
                .chain
                .tip_time()
                .is_some_and(|time| time >= now - MAX_ANTI_FEE_SNIPING_TIP_AGE);
        if !current {
            return 0;
        }
        let mut height = u32::from(tip);
        if rng.gen_range(0..10) == 0 {
            height = height.saturating_sub(rng.gen_range(0..100));
        }
        height
    }

    fn expiry_height(&self) -> BlockHeight {
        let next = self
            .chain
            .tip_height()
            .map_or(BlockHeight::from_u32(0), |tip| tip + 1);
        next + self.config.expiry_delta
    }

    fn insufficient<O: Ownership>(
        &self,
        ledger: &WalletLedger,
        owner: &O,
        available: u64,
        required: u64,
    ) -> SelectionError {
        if available < required && available + immature_value(ledger, owner) >= required {
            SelectionError::InsufficientMatureFunds
        } else {
            SelectionError::InsufficientFunds {
                available,
                required,
            }
        }
    }

    /// The rate expected in the long run, against which spending inputs now is judged.
    fn long_term_fee_rate(&self, fee_rate: FeeRate) -> FeeRate {
        self.estimator
            .estimate(self.estimator.max_target())
            .unwrap_or(fee_rate)
            .max(required_fee_rate(self.config))
    }

    fn check_fee_cap(&self, fee: u64) -> Result<(), SelectionError> {
        let max = self.config.max_tx_fee.into_u64();
        if fee > max {
            Err(SelectionError::FeeExceedsMaximum { fee, max })
        } else {
            Ok(())
        }
    }

    fn fund_transparent<R: RngCore>(
        &self,
        ledger: &WalletLedger,
        vault: &KeyVault,
        request: &TransactionRequest,
        change_script: &Script,
        now: i64,
        rng: &mut R,
    ) -> Result<AssembledTransaction, SelectionError> {
        let config = self.config;
        let fee_rate = minimum_fee_rate(config, self.estimator, request.confirm_target)?;
        let discard = discard_rate(config, self.estimator);
        let long_term = self.long_term_fee_rate(fee_rate);

        let query = CoinQuery {
            min_depth: request.min_depth,
            avoid_reuse: config.avoid_reuse,
            spend_zero_conf_change: config.spend_zero_conf_change,
            ..CoinQuery::default()
        };
        let coins = ledger
            .available_coins(vault, &query)
            .into_iter()
            .filter(|c| c.spendable)
            .collect::<Vec<_>>();
        let available: u64 = coins.iter().map(|c| c.txout.value.into_u64()).sum();
        let candidates = coins
            .into_iter()
            .map(|c| {
                let (ancestors, descendants) = if c.depth == 0 {
                    self.chain.mempool_ancestry(&c.outpoint.txid)
                } else {
                    (0, 0)
                };
                CandidateCoin {
                    coin: InputCoin::new(c.outpoint, c.txout),
                    depth: c.depth,
                    from_me: c.from_me,
                    ancestors,
                    descendants,
                }
            })
            .collect();
        let groups = group_outputs(candidates, !config.avoid_partial_spends);
        let tiers = eligibility_tiers(config);

        let lock_time = self.lock_time(now, rng);
        let expiry_height = self.expiry_height();
        let total = request.total()?;
        let subtract_fee_outputs = request.subtract_fee_outputs();

        let change_prototype = TxOut::new(Zatoshis::ZERO, change_script.clone());
        let change_output_size = change_prototype.serialized_size();
        let mut params = CoinSelectionParams {
            use_bnb: !subtract_fee_outputs,
            change_output_size,
            change_spend_size: P2PKH_INPUT_SIZE,
            effective_fee: fee_rate,
            long_term_fee: long_term,
            discard_rate: discard,
            tx_noinputs_size: 0,
            subtract_fee_outputs,
        };

        let mut fee = 0u64;
        let mut pick_new_inputs = true;
        let mut previous: Option<Selection> = None;
        let (mut tx, selected, sapling_outputs, change_position) = loop {
            let outputs = self.payment_outputs(&request.payments, fee, rng)?;
            let value_to_select = if subtract_fee_outputs { total } else { total + fee };

            let mut tx = Transaction {
                vout: outputs.transparent.clone(),
                lock_time,
                expiry_height,
                value_balance: -(outputs.sapling_value() as i64),
                shielded_outputs: vec![OutputDescription::dummy(); outputs.sapling.len()],
                ..Transaction::default()
            };

            let selected = match previous.take() {
                Some(selection) if !pick_new_inputs => selection,
                _ => {
                    params.tx_noinputs_size = tx.serialized_size();
                    match select_coins(value_to_select, &groups, &tiers, &params, rng) {
                        Some(selection) => selection,
                        // Branch-and-bound only ever runs on the first pass.
                        None if params.use_bnb => {
                            params.use_bnb = false;
                            continue;
                        }
                        None => {
                            return Err(self.insufficient(ledger, vault, available, value_to_select))
                        }
                    }
                }
            };

            let change = selected.value.checked_sub(value_to_select).ok_or(
                SelectionError::InsufficientFunds {
                    available,
                    required: value_to_select,
                },
            )?;
            let mut change_position = None;
            if change > 0 {
                let change_out = TxOut::new(
                    Zatoshis::from_u64(change).map_err(|_| SelectionError::InvalidAmount)?,
                    change_script.clone(),
                );
                if selected.bnb_used || is_dust(&change_out, discard) {
                    fee += change;
                } else {
                    let position = match request.change_position {
                        Some(position) => position,
                        None => rng.gen_range(0..=tx.vout.len()),
                    };
                    tx.vout.insert(position, change_out);
                    change_position = Some(position);
                }
            }

            let inputs = transparent_inputs(&selected);
            tx.vin = inputs.iter().map(|(outpoint, _)| spending_input(*outpoint)).collect();
            let size = estimated_size(&tx, &inputs)?;
            let fee_needed = fee_rate.fee(size);
            debug!(
                "Fee needed for {} bytes is {}, {} included",
                size, fee_needed, fee
            );

            if fee >= fee_needed {
                // Without change, a large enough excess is better spent on a change
                // output than on fees. Only try this once.
                if change_position.is_none()
                    && !subtract_fee_outputs
                    && !selected.bnb_used
                    && pick_new_inputs
                {
                    let fee_with_change = fee_rate.fee(size + change_output_size + 2);
                    if fee >= fee_with_change + dust_threshold(&change_prototype, discard) {
                        pick_new_inputs = false;
                        fee = fee_with_change;
                        previous = Some(selected);
                        continue;
                    }
                }
                if let Some(position) = change_position {
                    if fee > fee_needed && !subtract_fee_outputs {
                        let change = &mut tx.vout[position];
                        change.value = (change.value + zats(fee - fee_needed)?)
                            .ok_or(SelectionError::InvalidAmount)?;
                        fee = fee_needed;
                    }
                }
                break (tx, selected, outputs.sapling, change_position);
            } else if !pick_new_inputs {
                return Err(SelectionError::ChangeCalculationFailed);
            }

            if let Some(position) = change_position {
                if !subtract_fee_outputs {
                    let additional = fee_needed - fee;
                    let change_value = tx.vout[position].value.into_u64();
                    if change_value >= MIN_FINAL_CHANGE + additional {
                        tx.vout[position].value = zats(change_value - additional)?;
                        fee = fee_needed;
                        break (tx, selected, outputs.sapling, change_position);
                    }
                }
            }

            if subtract_fee_outputs {
                pick_new_inputs = false;
            }
            fee = fee_needed;
            params.use_bnb = false;
            previous = Some(selected);
        };

        self.check_fee_cap(fee)?;
        let mut coins = transparent_inputs(&selected);
        if config.reject_long_chains {
            for (outpoint, _) in &coins {
                let (ancestors, descendants) = self.chain.mempool_ancestry(&outpoint.txid);
                if ancestors + 1 > config.max_ancestors || descendants + 1 > config.max_descendants
                {
                    return Err(SelectionError::TooLongMempoolChain);
                }
            }
        }

        coins.shuffle(rng);
        tx.vin = coins.iter().map(|(outpoint, _)| spending_input(*outpoint)).collect();
        tx.shielded_outputs = sapling_outputs
            .iter()
            .map(|output| self.prover.prove_output(output))
            .collect::<Result<_, _>>()?;
        if !tx.shielded_outputs.is_empty() {
            tx.binding_sig = self.prover.binding_signature(&tx, &shielded_sighash(&tx))?;
        }

        let signer = VaultSigner::new(vault, LegacySighash);
        for (i, (_, txout)) in coins.iter().enumerate() {
            tx.vin[i].script_sig = signer.sign_input(&tx, i, txout)?;
        }

        info!(
            "Created transaction {} spending {} coins with fee {}",
            tx.txid(),
            coins.len(),
            fee
        );
        Ok(AssembledTransaction {
            tx,
            fee,
            change_position,
            spent_coins: coins.iter().map(|(outpoint, _)| *outpoint).collect(),
            spent_notes: vec![],
            change_key: None,
            sapling_change: None,
        })
    }

    fn fund_sapling<R: RngCore>(
        &self,
        ledger: &WalletLedger,
        vault: &KeyVault,
        request: &TransactionRequest,
        now: i64,
        rng: &mut R,
    ) -> Result<AssembledTransaction, SelectionError> {
        let config = self.config;
        let fee_rate = minimum_fee_rate(config, self.estimator, request.confirm_target)?;
        let discard = discard_rate(config, self.estimator);
        let long_term = self.long_term_fee_rate(fee_rate);

        let query = CoinQuery {
            min_depth: request.min_depth.max(1),
            spend_zero_conf_change: config.spend_zero_conf_change,
            ..CoinQuery::default()
        };
        let candidates = ledger
            .available_notes(vault, &query)
            .into_iter()
            .filter_map(|n| match n.note {
                NoteRef::Sapling(op) if n.spendable => Some(CandidateCoin {
                    coin: InputCoin::sapling(op, n.value),
                    depth: n.depth,
                    from_me: n.from_me,
                    ancestors: 0,
                    descendants: 0,
                }),
                _ => None,
            })
            .collect::<Vec<_>>();
        let available: u64 = candidates.iter().map(|c| c.coin.value()).sum();
        let groups = group_outputs(candidates, true);
        let tiers = eligibility_tiers(config);

        let lock_time = self.lock_time(now, rng);
        let expiry_height = self.expiry_height();
        let total = request.total()?;
        let subtract_fee_outputs = request.subtract_fee_outputs();

        // Change smaller than the cost of creating and later spending it goes to fees.
        let dust = sapling_dust_threshold(discard);
        let mut params = CoinSelectionParams {
            use_bnb: !subtract_fee_outputs,
            change_output_size: OUTPUT_DESCRIPTION_SIZE,
            change_spend_size: SPEND_DESCRIPTION_SIZE,
            effective_fee: fee_rate,
            long_term_fee: long_term,
            discard_rate: discard,
            tx_noinputs_size: 0,
            subtract_fee_outputs,
        };

        let mut fee = 0u64;
        let (selected, outputs, change) = loop {
            let outputs = self.payment_outputs(&request.payments, fee, rng)?;
            let target = if subtract_fee_outputs { total } else { total + fee };

            let unfunded = Transaction {
                vout: outputs.transparent.clone(),
                shielded_outputs: vec![OutputDescription::dummy(); outputs.sapling.len()],
                ..Transaction::default()
            };
            params.tx_noinputs_size = unfunded.serialized_size();
            let selected = match select_coins(target, &groups, &tiers, &params, rng) {
                Some(selection) => selection,
                None if params.use_bnb => {
                    params.use_bnb = false;
                    continue;
                }
                None => {
                    return Err(SelectionError::InsufficientFunds {
                        available,
                        required: target,
                    })
                }
            };

            let excess = selected.value.checked_sub(target).ok_or(
                SelectionError::InsufficientFunds {
                    available,
                    required: target,
                },
            )?;
            let (mut change, mut fee_paid) = if selected.bnb_used || excess < dust {
                (0, fee + excess)
            } else {
                (excess, fee)
            };

            let sized = Transaction {
                shielded_spends: vec![SpendDescription::dummy(); selected.coins.len()],
                shielded_outputs: vec![
                    OutputDescription::dummy();
                    outputs.sapling.len() + usize::from(change > 0)
                ],
                ..unfunded
            };
            let size = sized.serialized_size();
            if size > MAX_STANDARD_TX_SIZE {
                return Err(SelectionError::TransactionTooLarge);
            }
            let fee_needed = fee_rate.fee(size);
            debug!(
                "Fee needed for {} bytes is {}, {} included",
                size, fee_needed, fee_paid
            );

            if fee_paid >= fee_needed {
                if change > 0 && !subtract_fee_outputs {
                    change += fee_paid - fee_needed;
                    fee_paid = fee_needed;
                }
                fee = fee_paid;
                break (selected, outputs, change);
            }
            if change > 0 && !subtract_fee_outputs && change >= dust + (fee_needed - fee_paid) {
                change -= fee_needed - fee_paid;
                fee = fee_needed;
                break (selected, outputs, change);
            }
            fee = fee_needed;
            params.use_bnb = false;
        };
        self.check_fee_cap(fee)?;

        let mut tx = Transaction {
            vout: outputs.transparent,
            lock_time,
            expiry_height,
            ..Transaction::default()
        };

        let mut notes = selected
            .coins
            .iter()
            .filter_map(InputCoin::sapling_note)
            .copied()
            .collect::<Vec<_>>();
        notes.shuffle(rng);
        let mut change_ivk = None;
        for op in &notes {
            let unwitnessed = || SigningFailure::UnwitnessedNote(format!("{:?}", op));
            let data = ledger
                .get(&op.txid)
                .and_then(|record| record.sapling_notes.get(op))
                .ok_or_else(unwitnessed)?;
            let witness = data.witnesses.newest().ok_or_else(unwitnessed)?;
            let nullifier = data.nullifier.ok_or_else(unwitnessed)?;
            let note = data.note().ok_or_else(unwitnessed)?;
            let extsk = vault
                .sapling_spending_key(&data.ivk)
                .map_err(SigningFailure::from)?;
            let spend = SaplingSpend {
                extsk,
                note,
                witness,
                anchor: node_bytes(&witness.root()),
                nullifier,
            };
            tx.shielded_spends.push(self.prover.prove_spend(&spend)?);
            if change_ivk.is_none() {
                change_ivk = Some(data.ivk);
            }
        }

        let mut sapling_outputs = outputs.sapling;
        let mut change_position = None;
        let mut sapling_change = None;
        if change > 0 {
            let ivk = change_ivk.ok_or(SelectionError::ChangeCalculationFailed)?;
            let vk = vault.sapling_viewing_key(&ivk).ok_or_else(|| {
                SigningFailure::MissingKey(format!("Sapling viewing key {}", ivk))
            })?;
            let mut rseed = [0; 32];
            rng.fill_bytes(&mut rseed);
            let output = SaplingOutput {
                to: vk.default_address(),
                value: change,
                rseed,
                memo: EMPTY_MEMO,
            };
            let position = match request.change_position {
                Some(position) => position,
                None => rng.gen_range(0..=sapling_outputs.len()),
            };
            sapling_change = Some((position, SaplingNoteData::from_note(ivk, &output.note())));
            sapling_outputs.insert(position, output);
            change_position = Some(position);
        }

        let sapling_out: u64 = sapling_outputs.iter().map(|o| o.value).sum();
        tx.value_balance = selected.value as i64 - sapling_out as i64;
        tx.shielded_outputs = sapling_outputs
            .iter()
            .map(|output| self.prover.prove_output(output))
            .collect::<Result<_, _>>()?;
        tx.binding_sig = self.prover.binding_signature(&tx, &shielded_sighash(&tx))?;

        info!(
            "Created transaction {} spending {} Sapling notes with fee {}",
            tx.txid(),
            notes.len(),
            fee
        );
        Ok(AssembledTransaction {
            tx,
            fee,
            change_position,
            spent_coins: vec![],
            spent_notes: notes.into_iter().map(NoteRef::Sapling).collect(),
            change_key: None,
            sapling_change,
        })
    }
}

fn zats(value: u64) -> Result<Zatoshis, SelectionError> {
    Zatoshis::from_u64(value).map_err(|_| SelectionError::InvalidAmount)
}

fn keypool_error(e: zcash_wallet_keys::Error) -> SelectionError {
    match e {
        zcash_wallet_keys::Error::KeypoolExhausted => SelectionError::KeypoolExhausted,
        e => SelectionError::SigningFailed(e.into()),
    }
}

/// The transparent coins of a selection with the outputs they spend.
fn transparent_inputs(selection: &Selection) -> Vec<(OutPoint, TxOut)> {
    selection
        .coins
        .iter()
        .filter_map(|coin| coin.transparent())
        .map(|(outpoint, txout)| (*outpoint, txout.clone()))
        .collect()
}

fn spending_input(outpoint: OutPoint) -> TxIn {
    let mut txin = TxIn::new(outpoint);
    txin.sequence = SEQUENCE_FINAL - 1;
    txin
}

/// The size of `tx` once every input carries a maximum-size signature.
fn estimated_size(tx: &Transaction, coins: &[(OutPoint, TxOut)]) -> Result<usize, SelectionError> {
    let mut sized = tx.clone();
    for (i, (_, txout)) in coins.iter().enumerate() {
        sized.vin[i].script_sig = DummySigner.sign_input(tx, i, txout)?;
    }
    let size = sized.serialized_size();
    if size > MAX_STANDARD_TX_SIZE {
        return Err(SelectionError::TransactionTooLarge);
    }
    Ok(size)
}

/// Value in the wallet's unspent coinbase outputs that have not yet matured.
fn immature_value<O: Ownership>(ledger: &WalletLedger, owner: &O) -> u64 {
    let mut value = 0;
    for record in ledger.records() {
        if record.depth(ledger.tip()) <= 0
            || !record.is_immature_coinbase(ledger.tip(), ledger.coinbase_maturity())
        {
            continue;
        }
        let txid = record.txid();
        for (n, txout) in record.tx().vout.iter().enumerate() {
            if owner.is_mine_script(&txout.script_pubkey) == IsMine::Spendable
                && !ledger.is_spent(&OutPoint::new(txid, n as u32))
            {
                value += txout.value.into_u64();
            }
        }
    }
    value
}
