use std::collections::BTreeMap;

use tracing::debug;

use super::{RecordKey, StoreError, WalletStore};

#[derive(Clone, Debug)]
enum PendingWrite {
    Put(RecordKey, Vec<u8>),
    Erase(RecordKey),
}

/// A [`WalletStore`] held entirely in memory.
///
/// Cloning a store copies its committed records, which is how tests "reopen" a wallet.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    records: BTreeMap<RecordKey, Vec<u8>>,
    pending: Option<Vec<PendingWrite>>,
    fail_next_commit: bool,
    commits: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Causes the next commit to fail, discarding its batch.
    pub fn fail_next_commit(&mut self) {
        self.fail_next_commit = true;
    }

    /// The number of batches committed so far.
    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.records.contains_key(key)
    }

    fn pending_mut(&mut self) -> Result<&mut Vec<PendingWrite>, StoreError> {
        self.pending.as_mut().ok_or(StoreError::NoBatch)
    }
}

impl WalletStore for MemoryStore {
    fn begin(&mut self) -> Result<(), StoreError> {
        if self.pending.is_some() {
            return Err(StoreError::BatchOpen);
        }
        self.pending = Some(vec![]);
        Ok(())
    }

    fn put(&mut self, key: RecordKey, value: Vec<u8>) -> Result<(), StoreError> {
        self.pending_mut()?.push(PendingWrite::Put(key, value));
        Ok(())
    }

    fn erase(&mut self, key: RecordKey) -> Result<(), StoreError> {
        self.pending_mut()?.push(PendingWrite::Erase(key));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let writes = self.pending.take().ok_or(StoreError::NoBatch)?;
        if self.fail_next_commit {
            self.fail_next_commit = false;
            return Err(StoreError::CommitFailed(format!(
                "injected failure discarding {} writes",
                writes.len()
            )));
        }
        debug!("Committing {} writes", writes.len());
        for write in writes {
            match write {
                PendingWrite::Put(key, value) => {
                    self.records.insert(key, value);
                }
                PendingWrite::Erase(key) => {
                    self.records.remove(&key);
                }
            }
        }
        self.commits += 1;
        Ok(())
    }

    fn abort(&mut self) {
        self.pending = None;
    }

    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.get(key).cloned())
    }

    fn records(&self) -> Result<Vec<(RecordKey, Vec<u8>)>, StoreError> {
        Ok(self
            .records
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::MemoryStore;
    use crate::store::{RecordKey, StoreError, WalletBatch, WalletStore};
    use crate::wallet::WalletFlags;

    #[test]
    fn writes_require_a_batch() {
        let mut store = MemoryStore::new();
        assert_matches!(
            store.put(RecordKey::Version, vec![1]),
            Err(StoreError::NoBatch)
        );
        store.begin().unwrap();
        assert_matches!(store.begin(), Err(StoreError::BatchOpen));
    }

    #[test]
    fn batch_lands_atomically() {
        let mut store = MemoryStore::new();
        let mut batch = WalletBatch::begin(&mut store).unwrap();
        batch.write_version(3).unwrap();
        batch.write_flags(WalletFlags::AVOID_REUSE).unwrap();
        batch.commit().unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.commits(), 1);

        store.fail_next_commit();
        let mut batch = WalletBatch::begin(&mut store).unwrap();
        batch.write_version(4).unwrap();
        batch.write_best_block(&crate::store::BestBlock {
            height: 7.into(),
            hash: crate::primitives::BlockHash([7; 32]),
        })
        .unwrap();
        assert_matches!(batch.commit(), Err(StoreError::CommitFailed(_)));
        assert_eq!(store.len(), 2);
        assert_eq!(
            store.get(&RecordKey::Version).unwrap(),
            Some(3u32.to_le_bytes().to_vec())
        );

        // The failed batch is closed and a new one can begin.
        store.begin().unwrap();
    }

    #[test]
    fn dropped_batch_aborts() {
        let mut store = MemoryStore::new();
        {
            let mut batch = WalletBatch::begin(&mut store).unwrap();
            batch.write_version(1).unwrap();
        }
        assert!(store.is_empty());
        store.begin().unwrap();
        store.erase(RecordKey::Version).unwrap();
        store.commit().unwrap();
        assert!(!store.contains(&RecordKey::Version));
    }
}
