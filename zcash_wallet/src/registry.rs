//! The set of wallets loaded by a node.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

use crate::error::{Error, Result};
use crate::scan::{DefaultScanner, NoteScanner};
use crate::store::WalletStore;
use crate::wallet::Wallet;

type Callback<S, N> = Box<dyn Fn(&Wallet<S, N>) + Send + Sync>;

/// Loaded wallets by name.
///
/// The registry is owned by the host, which also dispatches chain events to each
/// wallet. Callbacks registered with [`WalletRegistry::on_load`] and
/// [`WalletRegistry::on_unload`] run while the wallet is being added or removed.
pub struct WalletRegistry<S: WalletStore, N: NoteScanner = DefaultScanner> {
    wallets: Mutex<BTreeMap<String, Arc<Wallet<S, N>>>>,
    load_callbacks: Mutex<Vec<Callback<S, N>>>,
    unload_callbacks: Mutex<Vec<Callback<S, N>>>,
}

impl<S: WalletStore, N: NoteScanner> Default for WalletRegistry<S, N> {
    fn default() -> Self {
        WalletRegistry {
            wallets: Mutex::new(BTreeMap::new()),
            load_callbacks: Mutex::new(vec![]),
            unload_callbacks: Mutex::new(vec![]),
        }
    }
}

impl<S: WalletStore, N: NoteScanner> WalletRegistry<S, N> {
    pub fn new() -> Self {
        WalletRegistry::default()
    }

    pub fn on_load(&self, callback: impl Fn(&Wallet<S, N>) + Send + Sync + 'static) {
        self.load_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    pub fn on_unload(&self, callback: impl Fn(&Wallet<S, N>) + Send + Sync + 'static) {
        self.unload_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    /// Registers a loaded wallet under its name.
    pub fn add(&self, wallet: Wallet<S, N>) -> Result<Arc<Wallet<S, N>>> {
        let mut wallets = self.wallets.lock().unwrap_or_else(PoisonError::into_inner);
        if wallets.contains_key(wallet.name()) {
            return Err(Error::WalletAlreadyLoaded(wallet.name().to_owned()));
        }
        let wallet = Arc::new(wallet);
        for callback in self
            .load_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            callback(&wallet);
        }
        wallets.insert(wallet.name().to_owned(), wallet.clone());
        info!("Wallet {} loaded", wallet.name());
        Ok(wallet)
    }

    /// Unregisters a wallet. The wallet is dropped once the last handle to it is.
    pub fn remove(&self, name: &str) -> Result<Arc<Wallet<S, N>>> {
        let wallet = self
            .wallets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| Error::WalletNotLoaded(name.to_owned()))?;
        for callback in self
            .unload_callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            callback(&wallet);
        }
        info!("Wallet {} unloaded", name);
        Ok(wallet)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Wallet<S, N>>> {
        self.wallets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.wallets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Every loaded wallet, in name order.
    pub fn wallets(&self) -> Vec<Arc<Wallet<S, N>>> {
        self.wallets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.wallets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
