//! *Key custody for a full-node Zcash wallet.*
//!
//! `zcash_wallet_keys` owns all of the spending authority held by a wallet: transparent
//! secp256k1 keys (random or derived along a hardened HD path), Sprout spending keys,
//! and ZIP 32 Sapling extended spending keys. It also implements the passphrase-based
//! encryption that protects this material at rest, and the keypool from which fresh
//! receiving and change keys are issued.
//!
//! The central type is [`KeyVault`]. A vault starts out unencrypted; once a passphrase
//! has been set it moves between the locked and unlocked states and can never be
//! returned to the unencrypted state.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
// Catch documentation errors caused by code changes.
#![deny(rustdoc::broken_intra_doc_links)]

pub mod crypter;
pub mod error;
pub mod hd;
pub mod keypool;
pub mod records;
pub mod sapling_keys;
pub mod sprout;
pub mod transparent;
pub mod vault;

#[cfg(any(test, feature = "test-dependencies"))]
pub mod testing;

pub use error::{Error, Result};
pub use vault::{KeyVault, VaultConfig, VaultState};
