//! Utilities for testing code that depends on a [`KeyVault`].

use rand_core::{CryptoRng, RngCore};
use zcash_protocol::consensus::NetworkType;

use crate::crypter::KdfCalibration;
use crate::hd::HdSeed;
use crate::{KeyVault, VaultConfig};

/// A vault configuration with a negligible passphrase stretching cost.
pub fn fast_vault_config(network: NetworkType) -> VaultConfig {
    VaultConfig::new(network).with_kdf(KdfCalibration::Fixed(1))
}

/// Constructs an unencrypted vault whose transparent and shielded seeds are derived from
/// `seed_byte`, so that repeated runs produce the same keys.
pub fn seeded_vault<R: RngCore + CryptoRng>(
    network: NetworkType,
    seed_byte: u8,
    rng: &mut R,
) -> KeyVault {
    let mut vault = KeyVault::new(fast_vault_config(network));
    vault
        .set_hd_seed(
            HdSeed::from_bytes(vec![seed_byte; 32]).expect("valid seed length"),
            rng,
        )
        .expect("fresh vault accepts a seed");
    vault
        .set_shielded_seed(
            HdSeed::from_bytes(vec![seed_byte.wrapping_add(1); 32]).expect("valid seed length"),
            rng,
        )
        .expect("fresh vault accepts a seed");
    vault
}
