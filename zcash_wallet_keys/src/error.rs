//! Error types for key custody operations.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while deriving, storing, encrypting or using keys.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("The key vault is locked")]
    Locked,
    #[error("The key vault is already encrypted")]
    AlreadyEncrypted,
    #[error("The key vault is not encrypted")]
    NotEncrypted,
    #[error("The passphrase entered for wallet decryption was incorrect")]
    IncorrectPassphrase,
    #[error("The key vault is corrupted: {0}")]
    Corrupted(String),
    #[error("Error deriving key: {0}")]
    Derivation(String),
    #[error("No HD seed is available")]
    NoSeed,
    #[error("Key not found: {0}")]
    KeyNotFound(KeySubject),
    #[error("The keypool ran out, please refill it first")]
    KeypoolExhausted,
    #[error("Private keys are disabled for this wallet")]
    PrivateKeysDisabled,
    #[error("Cannot disable private keys on a wallet that already holds them")]
    PrivateKeysPresent,
    #[error("Encryption failure")]
    Crypto,
    #[error("Invalid mnemonic phrase: {0}")]
    Mnemonic(String),
    #[error("Invalid record encoding: {0}")]
    Encoding(#[from] std::io::Error),
}

/// Identifies which kind of key a [`Error::KeyNotFound`] refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySubject {
    Transparent(String),
    Sprout(String),
    Sapling(String),
}

impl fmt::Display for KeySubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySubject::Transparent(id) => write!(f, "transparent key {}", id),
            KeySubject::Sprout(addr) => write!(f, "Sprout spending key for {}", addr),
            KeySubject::Sapling(ivk) => write!(f, "Sapling spending key for ivk {}", ivk),
        }
    }
}

impl From<bip32::Error> for Error {
    fn from(e: bip32::Error) -> Self {
        Error::Derivation(e.to_string())
    }
}

impl From<secp256k1::Error> for Error {
    fn from(e: secp256k1::Error) -> Self {
        Error::Corrupted(format!("invalid secp256k1 key material: {}", e))
    }
}
