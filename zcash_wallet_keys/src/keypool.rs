//! A pool of pre-generated transparent keys.
//!
//! Keys are generated ahead of time so that a backup taken now also covers the next
//! `keypool_size` addresses the wallet hands out. Handing out a key is a two-step
//! process: a key is first *reserved*, and is then either *kept* (removed from the pool
//! for good) or *returned* (made available again) once the caller knows whether it was
//! used.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::transparent::{KeyChain, KeyId};

const KEYPOOL_ENTRY_VERSION: u8 = 1;

/// The default number of keys kept in each chain of the pool.
pub const DEFAULT_KEYPOOL_SIZE: usize = 100;

/// A key sitting in the pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPoolEntry {
    pub time: i64,
    pub pubkey: secp256k1::PublicKey,
    pub chain: KeyChain,
}

impl KeyPoolEntry {
    pub fn key_id(&self) -> KeyId {
        KeyId::from_pubkey(&self.pubkey)
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let _version = reader.read_u8()?;
        let time = reader.read_i64::<LittleEndian>()?;
        let mut pubkey = [0u8; 33];
        reader.read_exact(&mut pubkey)?;
        let pubkey = secp256k1::PublicKey::from_slice(&pubkey)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let chain = match reader.read_u8()? {
            0 => KeyChain::External,
            _ => KeyChain::Internal,
        };
        Ok(KeyPoolEntry {
            time,
            pubkey,
            chain,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(KEYPOOL_ENTRY_VERSION)?;
        writer.write_i64::<LittleEndian>(self.time)?;
        writer.write_all(&self.pubkey.serialize())?;
        writer.write_u8(self.chain.index() as u8)
    }
}

/// A key taken out of the pool that has not yet been kept or returned.
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use = "a reserved key must be kept or returned to the pool"]
pub struct ReservedKey {
    pub index: u64,
    pub pubkey: secp256k1::PublicKey,
    pub chain: KeyChain,
}

impl ReservedKey {
    pub fn key_id(&self) -> KeyId {
        KeyId::from_pubkey(&self.pubkey)
    }
}

#[derive(Clone, Debug, Default)]
pub struct KeyPool {
    entries: BTreeMap<u64, KeyPoolEntry>,
    external: BTreeSet<u64>,
    internal: BTreeSet<u64>,
    reserved: BTreeSet<u64>,
    next_index: u64,
}

impl KeyPool {
    pub fn new() -> Self {
        KeyPool::default()
    }

    fn chain_set(&mut self, chain: KeyChain) -> &mut BTreeSet<u64> {
        match chain {
            KeyChain::External => &mut self.external,
            KeyChain::Internal => &mut self.internal,
        }
    }

    /// Inserts an entry loaded from storage.
    pub fn load(&mut self, index: u64, entry: KeyPoolEntry) {
        self.next_index = self.next_index.max(index + 1);
        self.chain_set(entry.chain).insert(index);
        self.entries.insert(index, entry);
    }

    /// Adds a freshly generated key, returning its pool index.
    pub fn add(&mut self, entry: KeyPoolEntry) -> u64 {
        let index = self.next_index;
        self.load(index, entry);
        index
    }

    pub fn entry(&self, index: u64) -> Option<&KeyPoolEntry> {
        self.entries.get(&index)
    }

    /// The number of unreserved keys available on `chain`.
    pub fn available(&self, chain: KeyChain) -> usize {
        match chain {
            KeyChain::External => self.external.len(),
            KeyChain::Internal => self.internal.len(),
        }
    }

    /// Takes the oldest key on `chain` out of the pool.
    pub fn reserve(&mut self, chain: KeyChain) -> Option<ReservedKey> {
        let index = self.chain_set(chain).pop_first()?;
        self.reserved.insert(index);
        let entry = self.entries.get(&index)?;
        Some(ReservedKey {
            index,
            pubkey: entry.pubkey,
            chain: entry.chain,
        })
    }

    /// Removes a reserved key from the pool permanently. Returns `true` if the entry
    /// existed and must be erased from storage.
    pub fn keep(&mut self, key: &ReservedKey) -> bool {
        self.reserved.remove(&key.index);
        self.entries.remove(&key.index).is_some()
    }

    /// Puts a reserved key back so it can be handed out again.
    pub fn give_back(&mut self, key: &ReservedKey) {
        if self.reserved.remove(&key.index) && self.entries.contains_key(&key.index) {
            self.chain_set(key.chain).insert(key.index);
        }
    }

    /// The creation time of the oldest key in the pool, if any.
    pub fn oldest_time(&self) -> Option<i64> {
        self.external
            .iter()
            .chain(self.internal.iter())
            .filter_map(|i| self.entries.get(i))
            .map(|e| e.time)
            .min()
    }

    pub fn indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.keys().copied()
    }

    pub fn contains_key(&self, key_id: &KeyId) -> bool {
        self.entries.values().any(|e| &e.key_id() == key_id)
    }

    /// Marks every pool key up to and including the one for `key_id` as used, returning
    /// the indices that were removed. Keys handed out by another copy of the same wallet
    /// are detected this way when they appear on chain.
    pub fn mark_used(&mut self, key_id: &KeyId) -> Vec<u64> {
        let found = self
            .entries
            .iter()
            .find(|(_, e)| &e.key_id() == key_id)
            .map(|(i, e)| (*i, e.chain));
        match found {
            Some((index, chain)) => {
                let used: Vec<u64> = self
                    .entries
                    .iter()
                    .filter(|(i, e)| **i <= index && e.chain == chain)
                    .map(|(i, _)| *i)
                    .collect();
                for i in &used {
                    self.entries.remove(i);
                    self.external.remove(i);
                    self.internal.remove(i);
                    self.reserved.remove(i);
                }
                used
            }
            None => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{KeyPool, KeyPoolEntry};
    use crate::transparent::KeyChain;

    fn pubkey(n: u8) -> secp256k1::PublicKey {
        let secp = secp256k1::Secp256k1::new();
        let sk = secp256k1::SecretKey::from_slice(&[n; 32]).unwrap();
        secp256k1::PublicKey::from_secret_key(&secp, &sk)
    }

    fn entry(n: u8, chain: KeyChain) -> KeyPoolEntry {
        KeyPoolEntry {
            time: i64::from(n),
            pubkey: pubkey(n),
            chain,
        }
    }

    #[test]
    fn reserve_keep_and_return() {
        let mut pool = KeyPool::new();
        pool.add(entry(1, KeyChain::External));
        pool.add(entry(2, KeyChain::External));
        pool.add(entry(3, KeyChain::Internal));
        assert_eq!(pool.available(KeyChain::External), 2);

        let first = pool.reserve(KeyChain::External).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(pool.available(KeyChain::External), 1);

        pool.give_back(&first);
        assert_eq!(pool.available(KeyChain::External), 2);

        let again = pool.reserve(KeyChain::External).unwrap();
        assert_eq!(again, first);
        assert!(pool.keep(&again));
        assert!(pool.entry(0).is_none());
        assert_eq!(pool.oldest_time(), Some(2));
    }

    #[test]
    fn mark_used_removes_earlier_keys_on_same_chain() {
        let mut pool = KeyPool::new();
        for n in 1..=4 {
            pool.add(entry(n, KeyChain::External));
        }
        pool.add(entry(9, KeyChain::Internal));

        let removed = pool.mark_used(&entry(3, KeyChain::External).key_id());
        assert_eq!(removed, vec![0, 1, 2]);
        assert_eq!(pool.available(KeyChain::External), 1);
        assert_eq!(pool.available(KeyChain::Internal), 1);
    }

    #[test]
    fn entry_roundtrip() {
        let e = entry(7, KeyChain::Internal);
        let mut bytes = vec![];
        e.write(&mut bytes).unwrap();
        assert_eq!(KeyPoolEntry::read(&bytes[..]).unwrap(), e);
    }
}
