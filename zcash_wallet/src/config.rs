//! Wallet configuration.

use std::time::Duration;

use zcash_protocol::{consensus::NetworkType, value::Zatoshis};
use zcash_wallet_keys::{crypter::KdfCalibration, keypool::DEFAULT_KEYPOOL_SIZE};

use crate::{
    error::{Error, Result},
    selection::fees::FeeRate,
    COINBASE_MATURITY, WITNESS_CACHE_SIZE,
};

/// One hundredth of a ZEC.
pub const CENT: u64 = 1_000_000;

pub const DEFAULT_ANCESTOR_LIMIT: usize = 25;
pub const DEFAULT_DESCENDANT_LIMIT: usize = 25;
pub const DEFAULT_TX_CONFIRM_TARGET: u32 = 6;
pub const DEFAULT_TX_EXPIRY_DELTA: u32 = 20;

/// Settings controlling wallet behaviour.
#[derive(Clone, Debug)]
pub struct WalletConfig {
    pub network: NetworkType,
    pub keypool_size: usize,
    pub witness_cache_size: usize,
    pub coinbase_maturity: u32,
    /// A fee rate that overrides estimation when set.
    pub pay_tx_fee: Option<FeeRate>,
    /// Lower bound applied to every fee rate.
    pub min_tx_fee: FeeRate,
    /// Used when the estimator has no answer.
    pub fallback_fee: Option<FeeRate>,
    /// Upper bound on the rate at which change may be discarded to fees.
    pub discard_fee: FeeRate,
    pub dust_relay_fee: FeeRate,
    pub min_relay_fee: FeeRate,
    pub max_tx_fee: Zatoshis,
    pub confirm_target: u32,
    pub spend_zero_conf_change: bool,
    pub avoid_partial_spends: bool,
    /// Skips outputs paying destinations that have already been spent from.
    pub avoid_reuse: bool,
    pub reject_long_chains: bool,
    pub max_ancestors: usize,
    pub max_descendants: usize,
    pub expiry_delta: u32,
    pub broadcast_transactions: bool,
    pub kdf_target: Duration,
}

impl Default for WalletConfig {
    fn default() -> Self {
        WalletConfig::new(NetworkType::Main)
    }
}

impl WalletConfig {
    pub fn new(network: NetworkType) -> Self {
        WalletConfig {
            network,
            keypool_size: DEFAULT_KEYPOOL_SIZE,
            witness_cache_size: WITNESS_CACHE_SIZE,
            coinbase_maturity: COINBASE_MATURITY,
            pay_tx_fee: None,
            min_tx_fee: FeeRate::from_per_k(1000),
            fallback_fee: Some(FeeRate::from_per_k(20_000)),
            discard_fee: FeeRate::from_per_k(10_000),
            dust_relay_fee: FeeRate::from_per_k(3000),
            min_relay_fee: FeeRate::from_per_k(1000),
            max_tx_fee: Zatoshis::const_from_u64(10_000_000),
            confirm_target: DEFAULT_TX_CONFIRM_TARGET,
            spend_zero_conf_change: true,
            avoid_partial_spends: false,
            avoid_reuse: false,
            reject_long_chains: false,
            max_ancestors: DEFAULT_ANCESTOR_LIMIT,
            max_descendants: DEFAULT_DESCENDANT_LIMIT,
            expiry_delta: DEFAULT_TX_EXPIRY_DELTA,
            broadcast_transactions: true,
            kdf_target: Duration::from_millis(100),
        }
    }

    pub fn with_keypool_size(mut self, size: usize) -> Self {
        self.keypool_size = size;
        self
    }

    pub fn with_witness_cache_size(mut self, size: usize) -> Self {
        self.witness_cache_size = size;
        self
    }

    pub fn with_pay_tx_fee(mut self, rate: FeeRate) -> Self {
        self.pay_tx_fee = Some(rate);
        self
    }

    pub fn with_fallback_fee(mut self, rate: Option<FeeRate>) -> Self {
        self.fallback_fee = rate;
        self
    }

    pub fn with_spend_zero_conf_change(mut self, enabled: bool) -> Self {
        self.spend_zero_conf_change = enabled;
        self
    }

    pub fn with_avoid_partial_spends(mut self, enabled: bool) -> Self {
        self.avoid_partial_spends = enabled;
        self
    }

    /// Enabling reuse avoidance also forces partial spend avoidance, so that outputs to
    /// a reused destination are spent all at once.
    pub fn with_avoid_reuse(mut self, enabled: bool) -> Self {
        self.avoid_reuse = enabled;
        if enabled {
            self.avoid_partial_spends = true;
        }
        self
    }

    pub fn with_reject_long_chains(mut self, enabled: bool) -> Self {
        self.reject_long_chains = enabled;
        self
    }

    pub fn with_max_tx_fee(mut self, fee: Zatoshis) -> Self {
        self.max_tx_fee = fee;
        self
    }

    pub fn with_broadcast(mut self, enabled: bool) -> Self {
        self.broadcast_transactions = enabled;
        self
    }

    pub fn with_kdf_target(mut self, target: Duration) -> Self {
        self.kdf_target = target;
        self
    }

    /// The passphrase stretching calibration derived from `kdf_target`.
    pub fn kdf_calibration(&self) -> KdfCalibration {
        KdfCalibration::Calibrate {
            target: self.kdf_target,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.witness_cache_size == 0 {
            return Err(Error::InvalidConfig(
                "witness cache size must be at least 1".to_owned(),
            ));
        }
        if self.max_ancestors == 0 || self.max_descendants == 0 {
            return Err(Error::InvalidConfig(
                "mempool chain limits must be at least 1".to_owned(),
            ));
        }
        if self.confirm_target == 0 {
            return Err(Error::InvalidConfig(
                "confirmation target must be at least 1".to_owned(),
            ));
        }
        if let Some(rate) = self.pay_tx_fee {
            if rate.fee(1000) > self.max_tx_fee.into_u64() {
                return Err(Error::InvalidConfig(
                    "pay_tx_fee would exceed max_tx_fee for a 1 kB transaction".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use zcash_protocol::consensus::NetworkType;

    use super::WalletConfig;
    use crate::{error::Error, selection::fees::FeeRate};

    #[test]
    fn defaults_are_valid() {
        let config = WalletConfig::new(NetworkType::Test);
        config.validate().unwrap();
        assert_eq!(config.witness_cache_size, 101);
        assert_eq!(config.keypool_size, 100);
    }

    #[test]
    fn rejects_empty_witness_cache() {
        let config = WalletConfig::new(NetworkType::Test).with_witness_cache_size(0);
        assert_matches!(config.validate(), Err(Error::InvalidConfig(_)));
    }

    #[test]
    fn rejects_pay_fee_above_cap() {
        let config = WalletConfig::new(NetworkType::Test)
            .with_pay_tx_fee(FeeRate::from_per_k(20_000_000));
        assert_matches!(config.validate(), Err(Error::InvalidConfig(_)));
    }
}
