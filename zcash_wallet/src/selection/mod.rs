//! Choosing wallet outputs to fund a transaction.
//!
//! Candidate coins are first gathered into [`OutputGroup`]s, so that outputs paying the
//! same destination can be spent together. Selection then walks a sequence of
//! [`CoinEligibilityFilter`] tiers from most to least conservative, and within each tier
//! tries branch-and-bound for a changeless solution before falling back to the
//! knapsack solver.

use std::collections::BTreeMap;

use rand_core::RngCore;
use tracing::trace;

use crate::config::{WalletConfig, CENT};
use crate::ledger::SaplingOutPoint;
use crate::primitives::{transaction::SPEND_DESCRIPTION_SIZE, OutPoint, Script, TxOut};

pub mod assembler;
pub mod bnb;
pub mod fees;
pub mod knapsack;

use fees::FeeRate;

/// The serialized size of an input spending a P2PKH output with a compressed key.
pub const P2PKH_INPUT_SIZE: usize = 148;

/// The serialized size of a P2PKH output.
pub const P2PKH_OUTPUT_SIZE: usize = 34;

/// The target amount of change the knapsack solver aims to leave.
pub const MIN_CHANGE: u64 = CENT;

/// Change is never reduced below this amount to pay additional fee.
pub const MIN_FINAL_CHANGE: u64 = MIN_CHANGE / 2;

/// The largest number of outputs grouped together for a single destination.
pub const OUTPUT_GROUP_MAX_ENTRIES: usize = 10;

/// The largest transaction the wallet will create.
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;

/// Why a transaction could not be signed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SigningFailure {
    #[error("Wallet is locked")]
    Locked,
    #[error("Missing key for {0}")]
    MissingKey(String),
    #[error("Unsupported script {0}")]
    UnsupportedScript(String),
    #[error("Note {0} has no witness or nullifier")]
    UnwitnessedNote(String),
    #[error("Proving failed: {0}")]
    Prover(String),
    #[error("Key vault refused to sign: {0}")]
    Keys(String),
}

impl From<zcash_wallet_keys::Error> for SigningFailure {
    fn from(e: zcash_wallet_keys::Error) -> Self {
        match e {
            zcash_wallet_keys::Error::Locked => SigningFailure::Locked,
            zcash_wallet_keys::Error::KeyNotFound(subject) => {
                SigningFailure::MissingKey(subject.to_string())
            }
            e => SigningFailure::Keys(e.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("Insufficient funds: {available} available, {required} required")]
    InsufficientFunds { available: u64, required: u64 },
    #[error("Insufficient funds: the remaining funds are immature coinbase outputs")]
    InsufficientMatureFunds,
    #[error("Transaction amounts must be positive")]
    InvalidAmount,
    #[error("Output {0} would be dust")]
    DustOutput(usize),
    #[error("Fee estimation failed and no fallback fee is configured")]
    FeeEstimationFailed,
    #[error("Transaction fee and change calculation failed")]
    ChangeCalculationFailed,
    #[error("Signing transaction failed: {0}")]
    SigningFailed(#[from] SigningFailure),
    #[error("Transaction too large")]
    TransactionTooLarge,
    #[error("Fee {fee} exceeds the maximum of {max}")]
    FeeExceedsMaximum { fee: u64, max: u64 },
    #[error("Change index out of range")]
    ChangeIndexOutOfRange,
    #[error("Transaction has too long of a mempool chain")]
    TooLongMempoolChain,
    #[error("Sprout outputs can no longer be created")]
    UnsupportedRecipient,
    #[error("Keypool ran out, please refill first")]
    KeypoolExhausted,
}

/// Minimum confirmation and mempool ancestry requirements for spending a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoinEligibilityFilter {
    /// Required depth for outputs of our own transactions.
    pub conf_mine: u32,
    /// Required depth for outputs received from others.
    pub conf_theirs: u32,
    pub max_ancestors: usize,
    pub max_descendants: usize,
}

impl CoinEligibilityFilter {
    pub const fn new(conf_mine: u32, conf_theirs: u32, max_ancestors: usize) -> Self {
        CoinEligibilityFilter {
            conf_mine,
            conf_theirs,
            max_ancestors,
            max_descendants: max_ancestors,
        }
    }

    pub const fn with_descendants(mut self, max_descendants: usize) -> Self {
        self.max_descendants = max_descendants;
        self
    }
}

/// The filters to try, in order, for the given configuration.
pub fn eligibility_tiers(config: &WalletConfig) -> Vec<CoinEligibilityFilter> {
    let anc = config.max_ancestors;
    let desc = config.max_descendants;
    let mut tiers = vec![
        CoinEligibilityFilter::new(1, 6, 0),
        CoinEligibilityFilter::new(1, 1, 0),
    ];
    if config.spend_zero_conf_change {
        tiers.push(CoinEligibilityFilter::new(0, 1, 2));
        tiers.push(
            CoinEligibilityFilter::new(0, 1, 4.min(anc / 3)).with_descendants(4.min(desc / 3)),
        );
        tiers.push(CoinEligibilityFilter::new(0, 1, anc / 2).with_descendants(desc / 2));
        tiers.push(
            CoinEligibilityFilter::new(0, 1, anc.saturating_sub(1))
                .with_descendants(desc.saturating_sub(1)),
        );
        if !config.reject_long_chains {
            tiers.push(CoinEligibilityFilter::new(0, 1, usize::MAX));
        }
    }
    tiers
}

/// What a selected input spends.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputSource {
    Transparent { outpoint: OutPoint, txout: TxOut },
    Sapling(SaplingOutPoint),
}

/// A spendable coin or note together with the size of the input that would spend it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InputCoin {
    pub source: InputSource,
    value: u64,
    pub input_bytes: usize,
}

impl InputCoin {
    pub fn new(outpoint: OutPoint, txout: TxOut) -> Self {
        InputCoin {
            value: txout.value.into_u64(),
            source: InputSource::Transparent { outpoint, txout },
            input_bytes: P2PKH_INPUT_SIZE,
        }
    }

    pub fn sapling(note: SaplingOutPoint, value: u64) -> Self {
        InputCoin {
            source: InputSource::Sapling(note),
            value,
            input_bytes: SPEND_DESCRIPTION_SIZE,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn transparent(&self) -> Option<(&OutPoint, &TxOut)> {
        match &self.source {
            InputSource::Transparent { outpoint, txout } => Some((outpoint, txout)),
            InputSource::Sapling(_) => None,
        }
    }

    pub fn sapling_note(&self) -> Option<&SaplingOutPoint> {
        match &self.source {
            InputSource::Sapling(note) => Some(note),
            InputSource::Transparent { .. } => None,
        }
    }

    /// The script that links this coin to others paying the same destination. Notes
    /// have none.
    fn destination(&self) -> Option<&Script> {
        self.transparent().map(|(_, txout)| &txout.script_pubkey)
    }
}

/// Coins that are selected or skipped together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputGroup {
    pub coins: Vec<InputCoin>,
    /// Whether every coin in the group is an output of our own transaction.
    pub from_me: bool,
    pub value: u64,
    /// The smallest depth of any coin in the group.
    pub depth: u32,
    pub ancestors: usize,
    pub descendants: usize,
    pub effective_value: i64,
    pub fee: i64,
    pub long_term_fee: i64,
}

impl Default for OutputGroup {
    fn default() -> Self {
        OutputGroup {
            coins: vec![],
            from_me: true,
            value: 0,
            depth: u32::MAX,
            ancestors: 0,
            descendants: 0,
            effective_value: 0,
            fee: 0,
            long_term_fee: 0,
        }
    }
}

impl OutputGroup {
    pub fn insert(
        &mut self,
        coin: InputCoin,
        depth: u32,
        from_me: bool,
        ancestors: usize,
        descendants: usize,
    ) {
        self.value += coin.value();
        self.effective_value += coin.value() as i64;
        self.from_me &= from_me;
        self.depth = self.depth.min(depth);
        // Ancestors of different coins may overlap, so summing may overcount.
        self.ancestors += ancestors;
        self.descendants = self.descendants.max(descendants);
        self.coins.push(coin);
    }

    pub fn eligible_for(&self, filter: &CoinEligibilityFilter) -> bool {
        let required = if self.from_me {
            filter.conf_mine
        } else {
            filter.conf_theirs
        };
        self.depth >= required
            && self.ancestors <= filter.max_ancestors
            && self.descendants <= filter.max_descendants
    }

    /// Recomputes the fee-adjusted values of the group at the given rates, discarding
    /// coins that cost more to spend than they are worth.
    fn with_effective_values(&self, params: &CoinSelectionParams) -> OutputGroup {
        let mut group = OutputGroup {
            coins: vec![],
            value: 0,
            effective_value: 0,
            fee: 0,
            long_term_fee: 0,
            ..self.clone()
        };
        for coin in &self.coins {
            let fee = params.effective_fee.fee(coin.input_bytes) as i64;
            let effective_value = coin.value() as i64 - fee;
            if effective_value <= 0 {
                continue;
            }
            group.fee += fee;
            group.long_term_fee += params.long_term_fee.fee(coin.input_bytes) as i64;
            group.effective_value += if params.subtract_fee_outputs {
                coin.value() as i64
            } else {
                effective_value
            };
            group.value += coin.value();
            group.coins.push(coin.clone());
        }
        group
    }
}

/// A coin under consideration for a new transaction.
#[derive(Clone, Debug)]
pub struct CandidateCoin {
    pub coin: InputCoin,
    pub depth: u32,
    pub from_me: bool,
    pub ancestors: usize,
    pub descendants: usize,
}

/// Groups candidates by destination, or one group per coin when `separate_coins`.
/// Coins without a destination always form their own groups.
pub fn group_outputs(candidates: Vec<CandidateCoin>, separate_coins: bool) -> Vec<OutputGroup> {
    let mut groups = vec![];
    let mut by_destination: BTreeMap<Script, OutputGroup> = BTreeMap::new();
    for c in candidates {
        let destination = match c.coin.destination() {
            Some(script) if !separate_coins => script.clone(),
            _ => {
                let mut group = OutputGroup::default();
                group.insert(c.coin, c.depth, c.from_me, c.ancestors, c.descendants);
                groups.push(group);
                continue;
            }
        };
        let group = by_destination.entry(destination.clone()).or_default();
        if group.coins.len() >= OUTPUT_GROUP_MAX_ENTRIES {
            if let Some(full) = by_destination.remove(&destination) {
                groups.push(full);
            }
        }
        by_destination
            .entry(destination)
            .or_default()
            .insert(c.coin, c.depth, c.from_me, c.ancestors, c.descendants);
    }
    groups.extend(by_destination.into_values());
    groups
}

/// Parameters describing the transaction being funded.
#[derive(Clone, Copy, Debug)]
pub struct CoinSelectionParams {
    pub use_bnb: bool,
    pub change_output_size: usize,
    pub change_spend_size: usize,
    pub effective_fee: FeeRate,
    pub long_term_fee: FeeRate,
    pub discard_rate: FeeRate,
    /// The size of the transaction without any inputs.
    pub tx_noinputs_size: usize,
    pub subtract_fee_outputs: bool,
}

/// The coins chosen by a selection algorithm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub coins: Vec<InputCoin>,
    pub value: u64,
    /// Whether branch-and-bound found the solution, in which case no change is made.
    pub bnb_used: bool,
}

impl Selection {
    fn from_groups<'a>(groups: impl IntoIterator<Item = &'a OutputGroup>, bnb_used: bool) -> Self {
        let mut coins = vec![];
        let mut value = 0;
        for group in groups {
            coins.extend(group.coins.iter().cloned());
            value += group.value;
        }
        Selection {
            coins,
            value,
            bnb_used,
        }
    }
}

/// Selects from the groups eligible under `filter`.
pub fn select_coins_min_conf<R: RngCore>(
    target: u64,
    filter: &CoinEligibilityFilter,
    groups: &[OutputGroup],
    params: &CoinSelectionParams,
    rng: &mut R,
) -> Option<Selection> {
    if params.use_bnb {
        let cost_of_change = params.discard_rate.fee(params.change_spend_size)
            + params.effective_fee.fee(params.change_output_size);
        let pool = groups
            .iter()
            .filter(|g| g.eligible_for(filter))
            .map(|g| g.with_effective_values(params))
            .filter(|g| g.effective_value > 0)
            .collect::<Vec<_>>();
        let not_input_fees = params.effective_fee.fee(params.tx_noinputs_size);
        trace!(
            "Branch and bound over {} groups for {} with cost of change {}",
            pool.len(),
            target,
            cost_of_change
        );
        bnb::select_coins_bnb(pool, target, cost_of_change, not_input_fees)
    } else {
        let pool = groups
            .iter()
            .filter(|g| g.eligible_for(filter))
            .cloned()
            .collect::<Vec<_>>();
        knapsack::knapsack_solver(target, pool, rng)
    }
}

/// Tries each tier in turn until one yields a selection.
pub fn select_coins<R: RngCore>(
    target: u64,
    groups: &[OutputGroup],
    tiers: &[CoinEligibilityFilter],
    params: &CoinSelectionParams,
    rng: &mut R,
) -> Option<Selection> {
    tiers
        .iter()
        .find_map(|filter| select_coins_min_conf(target, filter, groups, params, rng))
}
