//! Error types for wallet operations.

use zcash_protocol::{consensus::BlockHeight, TxId};

use crate::selection::SelectionError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

/// How the caller is expected to react to an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wallet state can no longer be trusted. Reload from backup.
    Fatal,
    /// The operation was refused and nothing was changed.
    Recoverable,
    /// The operation may succeed if retried later.
    Transient,
    /// The operation is not permitted for this wallet.
    Policy,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Key vault error: {0}")]
    Keys(#[from] zcash_wallet_keys::Error),
    #[error("Transaction not found in wallet: {0}")]
    TransactionNotFound(TxId),
    #[error("Transaction {0} is confirmed or in the mempool and cannot be abandoned")]
    CannotAbandon(TxId),
    #[error("Block at height {0} is unavailable")]
    BlockUnavailable(BlockHeight),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Encryption landed only partially in the store: {0}")]
    EncryptionCommitFailed(String),
    #[error("Transaction creation failed: {0}")]
    Selection(#[from] SelectionError),
    #[error("Refusing to downgrade wallet version from {current} to {requested}")]
    VersionDowngrade { current: u32, requested: u32 },
    #[error("Private keys can only be disabled on an empty wallet")]
    CannotDisablePrivateKeys,
    #[error("Wallet {0} is already loaded")]
    WalletAlreadyLoaded(String),
    #[error("Wallet {0} is not loaded")]
    WalletNotLoaded(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("A rescan is already in progress")]
    RescanInProgress,
    #[error("Corrupted record: {0}")]
    CorruptedRecord(String),
    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Keys(e) => match e {
                zcash_wallet_keys::Error::Corrupted(_) => ErrorKind::Fatal,
                zcash_wallet_keys::Error::AlreadyEncrypted
                | zcash_wallet_keys::Error::PrivateKeysDisabled
                | zcash_wallet_keys::Error::PrivateKeysPresent => ErrorKind::Policy,
                _ => ErrorKind::Recoverable,
            },
            Error::EncryptionCommitFailed(_) | Error::CorruptedRecord(_) => ErrorKind::Fatal,
            Error::BlockUnavailable(_)
            | Error::RescanInProgress
            | Error::Store(_)
            | Error::Io(_) => ErrorKind::Transient,
            Error::VersionDowngrade { .. } | Error::CannotDisablePrivateKeys => ErrorKind::Policy,
            Error::TransactionNotFound(_)
            | Error::CannotAbandon(_)
            | Error::Selection(_)
            | Error::WalletAlreadyLoaded(_)
            | Error::WalletNotLoaded(_)
            | Error::InvalidConfig(_) => ErrorKind::Recoverable,
        }
    }

    /// Returns `true` if this error means the vault must be unlocked first.
    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            Error::Keys(zcash_wallet_keys::Error::Locked)
                | Error::Selection(SelectionError::SigningFailed(
                    crate::selection::SigningFailure::Locked
                ))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, ErrorKind};
    use crate::store::StoreError;

    #[test]
    fn kinds() {
        assert_eq!(
            Error::Keys(zcash_wallet_keys::Error::Corrupted("x".into())).kind(),
            ErrorKind::Fatal
        );
        assert_eq!(
            Error::Keys(zcash_wallet_keys::Error::AlreadyEncrypted).kind(),
            ErrorKind::Policy
        );
        assert_eq!(
            Error::Store(StoreError::CommitFailed("disk".into())).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            Error::VersionDowngrade {
                current: 2,
                requested: 1
            }
            .kind(),
            ErrorKind::Policy
        );
        assert!(Error::Keys(zcash_wallet_keys::Error::Locked).is_locked());
    }
}
