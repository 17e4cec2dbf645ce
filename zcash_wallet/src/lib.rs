//! *A full-node Zcash wallet core.*
//!
//! `zcash_wallet` maintains a node-local view of the value that a set of keys can spend,
//! kept in sync with a chain that can reorganize:
//!
//! - [`ledger`] holds the authoritative set of wallet transactions together with the
//!   indices that relate them: spends by transparent outpoint and by shielded nullifier,
//!   and insertion order. It tracks conflicts and abandonment and computes balances.
//! - [`witness`] keeps a bounded window of incremental Merkle witnesses for every
//!   shielded note the wallet owns, so that spends can be proven without rescanning.
//! - [`selection`] chooses coins and notes to fund new transactions and assembles,
//!   prices and signs them.
//! - [`wallet`] ties these together with a [`zcash_wallet_keys::KeyVault`] behind a
//!   single coarse lock, and reacts to chain events.
//!
//! The chain itself, the persistent store, fee estimation and zero-knowledge proving are
//! all external; the traits in [`chain`], [`store`], [`selection::fees`] and
//! [`signing`] describe what the wallet needs from them.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
// Catch documentation errors caused by code changes.
#![deny(rustdoc::broken_intra_doc_links)]

pub mod chain;
pub mod config;
pub mod error;
pub mod ledger;
pub mod ownership;
pub mod primitives;
pub mod registry;
pub mod scan;
pub mod selection;
pub mod signing;
pub mod store;
pub mod tree;
pub mod wallet;
pub mod witness;

#[cfg(any(test, feature = "test-dependencies"))]
pub mod testing;

pub use error::{Error, ErrorKind, Result};
pub use wallet::Wallet;

/// The number of blocks a coinbase output must be buried under before it can be spent.
pub const COINBASE_MATURITY: u32 = 100;

/// The deepest chain reorganization the wallet is able to recover from without
/// rebuilding note witnesses from scratch.
pub const MAX_REORG_LENGTH: u32 = 100;

/// The number of witnesses retained for each note.
pub const WITNESS_CACHE_SIZE: usize = MAX_REORG_LENGTH as usize + 1;
