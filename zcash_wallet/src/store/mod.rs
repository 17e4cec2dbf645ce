//! The transactional record store underneath a wallet.
//!
//! The wallet never reads from its store after loading. Instead, changed records are
//! collected from the ledger, the vault and the wallet metadata and written in a single
//! batch: everything written between [`WalletStore::begin`] and
//! [`WalletStore::commit`] lands together or not at all. [`WalletBatch`] provides typed
//! helpers for every kind of record over a raw store.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use zcash_protocol::{consensus::BlockHeight, TxId};
use zcash_wallet_keys::{records::VaultRecordId, KeyVault};

use crate::error::Result;
use crate::ledger::TransactionRecord;
use crate::primitives::{BlockHash, PaymentAddress};
use crate::wallet::{AddressBookEntry, WalletFlags};

pub mod memory;

pub use memory::MemoryStore;

const BEST_BLOCK_VERSION: u8 = 1;

/// Identifies a single persisted record.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordKey {
    Transaction(TxId),
    Vault(VaultRecordId),
    AddressBook(PaymentAddress),
    BestBlock,
    Version,
    Flags,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No batch is open")]
    NoBatch,
    #[error("A batch is already open")]
    BatchOpen,
    #[error("Commit failed: {0}")]
    CommitFailed(String),
    #[error("Io Error: {0}")]
    Io(#[from] io::Error),
}

/// A key-value store with atomic batches.
///
/// Writes are only accepted inside a batch. A failed commit leaves the store exactly as
/// it was when the batch began.
pub trait WalletStore {
    fn begin(&mut self) -> std::result::Result<(), StoreError>;

    fn put(&mut self, key: RecordKey, value: Vec<u8>) -> std::result::Result<(), StoreError>;

    fn erase(&mut self, key: RecordKey) -> std::result::Result<(), StoreError>;

    fn commit(&mut self) -> std::result::Result<(), StoreError>;

    /// Discards every write made since [`WalletStore::begin`].
    fn abort(&mut self);

    fn get(&self, key: &RecordKey) -> std::result::Result<Option<Vec<u8>>, StoreError>;

    /// Every committed record.
    fn records(&self) -> std::result::Result<Vec<(RecordKey, Vec<u8>)>, StoreError>;
}

/// The chain position the wallet has processed up to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BestBlock {
    pub height: BlockHeight,
    pub hash: BlockHash,
}

impl BestBlock {
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let version = reader.read_u8()?;
        if version != BEST_BLOCK_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported best block version {}", version),
            ));
        }
        let height = BlockHeight::from_u32(reader.read_u32::<LittleEndian>()?);
        let mut hash = [0; 32];
        reader.read_exact(&mut hash)?;
        Ok(BestBlock {
            height,
            hash: BlockHash(hash),
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(BEST_BLOCK_VERSION)?;
        writer.write_u32::<LittleEndian>(u32::from(self.height))?;
        writer.write_all(&self.hash.0)
    }
}

/// An open batch over a [`WalletStore`]. Dropping it without committing aborts it.
pub struct WalletBatch<'a, S: WalletStore> {
    store: &'a mut S,
    open: bool,
}

impl<'a, S: WalletStore> WalletBatch<'a, S> {
    pub fn begin(store: &'a mut S) -> std::result::Result<Self, StoreError> {
        store.begin()?;
        Ok(WalletBatch { store, open: true })
    }

    pub fn write_tx(&mut self, record: &TransactionRecord) -> Result<()> {
        let mut bytes = vec![];
        record.write(&mut bytes)?;
        self.store
            .put(RecordKey::Transaction(record.txid()), bytes)?;
        Ok(())
    }

    pub fn erase_tx(&mut self, txid: TxId) -> Result<()> {
        self.store.erase(RecordKey::Transaction(txid))?;
        Ok(())
    }

    /// Writes the current state of a vault record, or erases it if the vault no longer
    /// holds it.
    pub fn write_key_record(&mut self, vault: &KeyVault, id: VaultRecordId) -> Result<()> {
        match vault.export_record(&id)? {
            Some(bytes) => self.store.put(RecordKey::Vault(id), bytes)?,
            None => self.store.erase(RecordKey::Vault(id))?,
        }
        Ok(())
    }

    pub fn write_pool_entry(&mut self, vault: &KeyVault, index: u64) -> Result<()> {
        self.write_key_record(vault, VaultRecordId::KeyPool(index))
    }

    pub fn write_address_book(
        &mut self,
        address: PaymentAddress,
        entry: Option<&AddressBookEntry>,
    ) -> Result<()> {
        match entry {
            Some(entry) => {
                let mut bytes = vec![];
                entry.write(&mut bytes)?;
                self.store.put(RecordKey::AddressBook(address), bytes)?;
            }
            None => self.store.erase(RecordKey::AddressBook(address))?,
        }
        Ok(())
    }

    pub fn write_best_block(&mut self, best: &BestBlock) -> Result<()> {
        let mut bytes = vec![];
        best.write(&mut bytes)?;
        self.store.put(RecordKey::BestBlock, bytes)?;
        Ok(())
    }

    pub fn write_version(&mut self, version: u32) -> Result<()> {
        self.store
            .put(RecordKey::Version, version.to_le_bytes().to_vec())?;
        Ok(())
    }

    pub fn write_flags(&mut self, flags: WalletFlags) -> Result<()> {
        self.store
            .put(RecordKey::Flags, flags.bits().to_le_bytes().to_vec())?;
        Ok(())
    }

    pub fn commit(mut self) -> std::result::Result<(), StoreError> {
        self.open = false;
        self.store.commit()
    }

    pub fn abort(mut self) {
        self.open = false;
        self.store.abort();
    }
}

impl<S: WalletStore> Drop for WalletBatch<'_, S> {
    fn drop(&mut self) {
        if self.open {
            self.store.abort();
        }
    }
}

pub(crate) fn read_version(bytes: &[u8]) -> io::Result<u32> {
    let mut reader = bytes;
    reader.read_u32::<LittleEndian>()
}

pub(crate) fn read_flags(bytes: &[u8]) -> io::Result<WalletFlags> {
    let mut reader = bytes;
    Ok(WalletFlags::from_bits_retain(
        reader.read_u64::<LittleEndian>()?,
    ))
}
