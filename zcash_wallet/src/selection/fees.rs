//! Fee rates and the fee estimation seam.

use std::fmt;

use crate::config::WalletConfig;
use crate::primitives::{
    transaction::{OUTPUT_DESCRIPTION_SIZE, SPEND_DESCRIPTION_SIZE},
    TxOut,
};

use super::{SelectionError, P2PKH_INPUT_SIZE};

/// A fee rate in zatoshis per 1000 bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FeeRate(u64);

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate(0);

    pub const fn from_per_k(zats_per_k: u64) -> Self {
        FeeRate(zats_per_k)
    }

    /// The rate obtained by paying `fee` for `bytes` bytes.
    pub fn from_fee(fee: u64, bytes: usize) -> Self {
        if bytes == 0 {
            FeeRate(0)
        } else {
            FeeRate(fee.saturating_mul(1000) / bytes as u64)
        }
    }

    pub fn per_k(&self) -> u64 {
        self.0
    }

    /// The fee for a transaction of `bytes` bytes. A non-zero rate never yields a zero
    /// fee for a non-empty transaction.
    pub fn fee(&self, bytes: usize) -> u64 {
        let fee = self.0.saturating_mul(bytes as u64) / 1000;
        if fee == 0 && bytes != 0 && self.0 > 0 {
            1
        } else {
            fee
        }
    }
}

impl fmt::Debug for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeeRate({} zat/kB)", self.0)
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} zat/kB", self.0)
    }
}

/// An external source of fee rate estimates.
pub trait FeeEstimator {
    /// The rate expected to confirm within `confirm_target` blocks, if known.
    fn estimate(&self, confirm_target: u32) -> Option<FeeRate>;

    /// The longest confirmation target this estimator can answer for.
    fn max_target(&self) -> u32 {
        1008
    }
}

/// An estimator with no data, so that configured fallbacks always apply.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoEstimates;

impl FeeEstimator for NoEstimates {
    fn estimate(&self, _: u32) -> Option<FeeRate> {
        None
    }
}

/// A fixed estimate for every target.
#[derive(Clone, Copy, Debug)]
pub struct FixedEstimate(pub FeeRate);

impl FeeEstimator for FixedEstimate {
    fn estimate(&self, _: u32) -> Option<FeeRate> {
        Some(self.0)
    }
}

/// The lowest rate any wallet transaction may pay.
pub fn required_fee_rate(config: &WalletConfig) -> FeeRate {
    config.min_tx_fee.max(config.min_relay_fee)
}

/// The rate to pay for a new transaction.
pub fn minimum_fee_rate<E: FeeEstimator>(
    config: &WalletConfig,
    estimator: &E,
    confirm_target: Option<u32>,
) -> Result<FeeRate, SelectionError> {
    let rate = match config.pay_tx_fee {
        Some(rate) => rate,
        None => match estimator.estimate(confirm_target.unwrap_or(config.confirm_target)) {
            Some(rate) if rate > FeeRate::ZERO => rate,
            _ => config
                .fallback_fee
                .ok_or(SelectionError::FeeEstimationFailed)?,
        },
    };
    Ok(rate.max(required_fee_rate(config)))
}

/// The rate below which it is cheaper to drop change into the fee than to spend it
/// later.
pub fn discard_rate<E: FeeEstimator>(config: &WalletConfig, estimator: &E) -> FeeRate {
    let rate = match estimator.estimate(estimator.max_target()) {
        Some(rate) if rate > FeeRate::ZERO => rate.min(config.discard_fee),
        _ => config.discard_fee,
    };
    rate.max(config.dust_relay_fee)
}

/// The value below which `txout` is uneconomical to spend at `dust_relay_fee`.
pub fn dust_threshold(txout: &TxOut, dust_relay_fee: FeeRate) -> u64 {
    if txout.script_pubkey.is_unspendable() {
        return 0;
    }
    dust_relay_fee.fee(txout.serialized_size() + P2PKH_INPUT_SIZE)
}

pub fn is_dust(txout: &TxOut, dust_relay_fee: FeeRate) -> bool {
    txout.value.into_u64() < dust_threshold(txout, dust_relay_fee)
}

/// The value below which a Sapling change note costs more to create and later spend at
/// `discard_rate` than it is worth.
pub fn sapling_dust_threshold(discard_rate: FeeRate) -> u64 {
    discard_rate.fee(OUTPUT_DESCRIPTION_SIZE + SPEND_DESCRIPTION_SIZE)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use zcash_protocol::{consensus::NetworkType, value::Zatoshis};

    use super::{
        discard_rate, dust_threshold, is_dust, minimum_fee_rate, sapling_dust_threshold, FeeRate,
        FixedEstimate, NoEstimates,
    };
    use crate::{
        config::WalletConfig,
        primitives::{Script, TxOut},
        selection::SelectionError,
    };

    #[test]
    fn fee_rounding() {
        let rate = FeeRate::from_per_k(1000);
        assert_eq!(rate.fee(250), 250);
        assert_eq!(FeeRate::from_per_k(1).fee(10), 1);
        assert_eq!(FeeRate::ZERO.fee(10), 0);
        assert_eq!(FeeRate::from_fee(500, 250), FeeRate::from_per_k(2000));
    }

    #[test]
    fn fee_rate_selection() {
        let config = WalletConfig::new(NetworkType::Test);
        assert_eq!(
            minimum_fee_rate(&config, &NoEstimates, None).unwrap(),
            FeeRate::from_per_k(20_000)
        );
        assert_eq!(
            minimum_fee_rate(&config, &FixedEstimate(FeeRate::from_per_k(10)), None).unwrap(),
            FeeRate::from_per_k(1000)
        );

        let config = config.with_fallback_fee(None);
        assert_matches!(
            minimum_fee_rate(&config, &NoEstimates, None),
            Err(SelectionError::FeeEstimationFailed)
        );
        assert_eq!(discard_rate(&config, &NoEstimates), FeeRate::from_per_k(10_000));
    }

    #[test]
    fn dust() {
        let rate = FeeRate::from_per_k(3000);
        let out = TxOut::new(Zatoshis::const_from_u64(545), Script::p2pkh(&[0; 20]));
        // (34 + 148) * 3
        assert_eq!(dust_threshold(&out, rate), 546);
        assert!(is_dust(&out, rate));
        let out = TxOut::new(Zatoshis::const_from_u64(546), Script::p2pkh(&[0; 20]));
        assert!(!is_dust(&out, rate));

        // (948 + 384) * 10
        assert_eq!(sapling_dust_threshold(FeeRate::from_per_k(10_000)), 13_320);
    }
}
