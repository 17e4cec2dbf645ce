//! Key issuance, import and export, and passphrase protection.

use rand_core::{CryptoRng, RngCore};
use sapling::zip32::{DiversifiableFullViewingKey, ExtendedSpendingKey};
use secp256k1::SecretKey;
use secrecy::SecretString;
use tracing::{error, info};
use zcash_wallet_keys::{
    error::KeySubject,
    sapling_keys::IvkTag,
    sprout::{SproutPaymentAddress, SproutSpendingKey, SproutViewingKey},
    transparent::{KeyChain, KeyId, KeyMetadata},
    KeyVault,
};

use crate::error::{Error, Result};
use crate::primitives::{Script, TransparentAddress};
use crate::scan::NoteScanner;
use crate::store::WalletStore;

use super::{flush, Wallet, WalletState};

impl<S: WalletStore, N: NoteScanner> Wallet<S, N> {
    /// Runs `f` against the vault, then invalidates cached balances and persists the
    /// changed key records.
    fn with_keys<T>(&self, f: impl FnOnce(&mut KeyVault) -> Result<T>) -> Result<T> {
        let mut state = self.lock_state();
        let mut vault = self.write_vault();
        let result = f(&mut *vault)?;
        state.ledger.invalidate_balances();
        flush(&mut state, &mut vault)?;
        Ok(result)
    }

    /// A fresh receiving address from the external keypool chain.
    pub fn new_address<R: RngCore + CryptoRng>(
        &self,
        now: i64,
        rng: &mut R,
    ) -> Result<TransparentAddress> {
        self.pool_address(KeyChain::External, now, rng)
    }

    /// A fresh address from the internal keypool chain, for change.
    pub fn new_change_address<R: RngCore + CryptoRng>(
        &self,
        now: i64,
        rng: &mut R,
    ) -> Result<TransparentAddress> {
        self.pool_address(KeyChain::Internal, now, rng)
    }

    fn pool_address<R: RngCore + CryptoRng>(
        &self,
        chain: KeyChain,
        now: i64,
        rng: &mut R,
    ) -> Result<TransparentAddress> {
        let target = self.config.keypool_size;
        self.with_keys(|vault| {
            let pubkey = vault.key_from_pool(chain, target, now, rng)?;
            Ok(TransparentAddress::from(KeyId::from_pubkey(&pubkey)))
        })
    }

    /// Derives the next Sapling account and returns its default address.
    pub fn new_sapling_address<R: RngCore + CryptoRng>(
        &self,
        now: i64,
        rng: &mut R,
    ) -> Result<sapling::PaymentAddress> {
        self.with_keys(|vault| {
            let tag = vault.generate_sapling_key(now, rng)?;
            default_sapling_address(vault, &tag)
        })
    }

    pub fn new_sprout_address<R: RngCore + CryptoRng>(
        &self,
        now: i64,
        rng: &mut R,
    ) -> Result<SproutPaymentAddress> {
        self.with_keys(|vault| Ok(vault.generate_sprout_key(now, rng)?))
    }

    /// Refills the keypool to the configured size. Returns the number of keys added.
    pub fn top_up_keypool<R: RngCore + CryptoRng>(&self, now: i64, rng: &mut R) -> Result<usize> {
        let target = self.config.keypool_size;
        self.with_keys(|vault| Ok(vault.top_up_keypool(target, now, rng)?))
    }

    pub fn keypool_available(&self, chain: KeyChain) -> usize {
        self.read_vault().keypool_available(chain)
    }

    pub fn keypool_oldest_time(&self) -> Option<i64> {
        self.read_vault().keypool_oldest_time()
    }

    //
    // Import
    //

    /// Imports a transparent secret key. Transactions paying it are only found by a
    /// subsequent rescan.
    pub fn import_transparent_key<R: RngCore + CryptoRng>(
        &self,
        secret: SecretKey,
        now: i64,
        rng: &mut R,
    ) -> Result<TransparentAddress> {
        self.with_keys(|vault| {
            let pubkey = vault.add_transparent_key(secret, KeyMetadata::new(now), rng)?;
            Ok(TransparentAddress::from(KeyId::from_pubkey(&pubkey)))
        })
    }

    /// Watches outputs paying `script` without being able to spend them.
    pub fn import_watch_script(&self, script: Script) -> Result<()> {
        self.with_keys(|vault| {
            vault.add_watch_script(script.0);
            Ok(())
        })
    }

    pub fn import_sprout_spending_key<R: RngCore + CryptoRng>(
        &self,
        sk: SproutSpendingKey,
        now: i64,
        rng: &mut R,
    ) -> Result<SproutPaymentAddress> {
        self.with_keys(|vault| Ok(vault.add_sprout_spending_key(sk, KeyMetadata::new(now), rng)?))
    }

    pub fn import_sprout_viewing_key(
        &self,
        vk: SproutViewingKey,
        now: i64,
    ) -> Result<SproutPaymentAddress> {
        self.with_keys(|vault| Ok(vault.add_sprout_viewing_key(vk, KeyMetadata::new(now))))
    }

    pub fn import_sapling_spending_key<R: RngCore + CryptoRng>(
        &self,
        extsk: ExtendedSpendingKey,
        now: i64,
        rng: &mut R,
    ) -> Result<sapling::PaymentAddress> {
        self.with_keys(|vault| {
            let tag = vault.add_sapling_spending_key(extsk, KeyMetadata::new(now), rng)?;
            default_sapling_address(vault, &tag)
        })
    }

    pub fn import_sapling_viewing_key(
        &self,
        dfvk: DiversifiableFullViewingKey,
        now: i64,
    ) -> Result<sapling::PaymentAddress> {
        self.with_keys(|vault| {
            let tag = vault.add_sapling_viewing_key(dfvk, KeyMetadata::new(now));
            default_sapling_address(vault, &tag)
        })
    }

    //
    // Export
    //

    pub fn export_transparent_key(&self, address: &TransparentAddress) -> Result<SecretKey> {
        let key_id = address
            .key_id()
            .ok_or_else(|| key_not_found(KeySubject::Transparent(format!("{:?}", address))))?;
        Ok(self.read_vault().transparent_secret(&key_id)?)
    }

    pub fn export_sprout_spending_key(
        &self,
        address: &SproutPaymentAddress,
    ) -> Result<SproutSpendingKey> {
        Ok(self.read_vault().sprout_spending_key(address)?)
    }

    pub fn export_sapling_spending_key(
        &self,
        address: &sapling::PaymentAddress,
    ) -> Result<ExtendedSpendingKey> {
        let vault = self.read_vault();
        let tag = vault
            .sapling_ivk_for_address(&address.to_bytes())
            .ok_or_else(|| key_not_found(KeySubject::Sapling(hex::encode(address.to_bytes()))))?;
        Ok(vault.sapling_spending_key(&tag)?)
    }

    pub fn export_sapling_viewing_key(
        &self,
        address: &sapling::PaymentAddress,
    ) -> Result<DiversifiableFullViewingKey> {
        let vault = self.read_vault();
        vault
            .sapling_ivk_for_address(&address.to_bytes())
            .and_then(|tag| vault.sapling_viewing_key(&tag))
            .map(|vk| vk.dfvk().clone())
            .ok_or_else(|| key_not_found(KeySubject::Sapling(hex::encode(address.to_bytes()))))
    }

    //
    // Encryption
    //

    pub fn is_crypted(&self) -> bool {
        self.read_vault().is_crypted()
    }

    pub fn is_locked(&self) -> bool {
        self.read_vault().is_locked()
    }

    /// Encrypts the wallet under `passphrase` and leaves it locked.
    ///
    /// The keypool is discarded and the transparent seed replaced, so that no key
    /// whose secret was ever stored unencrypted is handed out afterwards. If the
    /// encrypted records cannot be written the wallet must be considered corrupt.
    pub fn encrypt<R: RngCore + CryptoRng>(
        &self,
        passphrase: &SecretString,
        now: i64,
        rng: &mut R,
    ) -> Result<()> {
        let mut state = self.lock_state();
        let mut vault = self.write_vault();

        vault.encrypt(passphrase, rng)?;
        vault.unlock(passphrase)?;
        vault.reset_keypool();
        if vault.has_hd_seed() {
            vault.generate_hd_seed(rng)?;
        }
        vault.top_up_keypool(self.config.keypool_size, now, rng)?;
        vault.lock()?;

        if let Err(e) = flush(&mut state, &mut vault) {
            error!("Encryption of wallet {} only partially written: {}", self.name, e);
            return Err(Error::EncryptionCommitFailed(e.to_string()));
        }
        info!("Encrypted wallet {}", self.name);
        Ok(())
    }

    /// Unlocks the vault and derives any nullifiers that required spending keys.
    pub fn unlock(&self, passphrase: &SecretString) -> Result<()> {
        let mut guard = self.lock_state();
        let mut vault = self.write_vault();
        vault.unlock(passphrase)?;
        let state: &mut WalletState<S> = &mut guard;
        let engine = state.witnesses;
        engine.update_nullifiers(&mut state.ledger, &vault);
        flush(state, &mut vault)
    }

    pub fn lock(&self) -> Result<()> {
        Ok(self.write_vault().lock()?)
    }

    pub fn change_passphrase<R: RngCore + CryptoRng>(
        &self,
        old: &SecretString,
        new: &SecretString,
        rng: &mut R,
    ) -> Result<()> {
        let mut state = self.lock_state();
        let mut vault = self.write_vault();
        vault.change_passphrase(old, new, rng)?;
        flush(&mut state, &mut vault)
    }
}

fn key_not_found(subject: KeySubject) -> Error {
    Error::Keys(zcash_wallet_keys::Error::KeyNotFound(subject))
}

fn default_sapling_address(vault: &KeyVault, tag: &IvkTag) -> Result<sapling::PaymentAddress> {
    vault
        .sapling_viewing_key(tag)
        .map(|vk| vk.default_address())
        .ok_or_else(|| key_not_found(KeySubject::Sapling(tag.to_string())))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rand_chacha::ChaChaRng;
    use rand_core::SeedableRng;
    use secrecy::SecretString;
    use zcash_protocol::consensus::NetworkType;
    use zcash_wallet_keys::transparent::KeyChain;

    use crate::config::WalletConfig;
    use crate::error::{Error, ErrorKind};
    use crate::ownership::IsMine;
    use crate::primitives::PaymentAddress;
    use crate::scan::DefaultScanner;
    use crate::store::MemoryStore;
    use crate::wallet::{Wallet, WalletFlags};

    fn wallet(rng: &mut ChaChaRng) -> Wallet<MemoryStore> {
        Wallet::create(
            "keys",
            WalletConfig::new(NetworkType::Test)
                .with_keypool_size(3)
                .with_kdf_target(std::time::Duration::from_millis(1)),
            MemoryStore::new(),
            DefaultScanner,
            WalletFlags::empty(),
            0,
            rng,
        )
        .unwrap()
    }

    #[test]
    fn pool_addresses_come_from_the_right_chain() {
        let mut rng = ChaChaRng::seed_from_u64(10);
        let wallet = wallet(&mut rng);
        assert_eq!(wallet.keypool_available(KeyChain::External), 3);
        let a = wallet.new_address(1, &mut rng).unwrap();
        let b = wallet.new_change_address(1, &mut rng).unwrap();
        assert_ne!(a, b);
        assert_eq!(wallet.keypool_available(KeyChain::External), 2);
        assert_eq!(wallet.keypool_available(KeyChain::Internal), 2);
        assert_eq!(wallet.top_up_keypool(1, &mut rng).unwrap(), 2);
    }

    #[test]
    fn transparent_key_export_matches_import() {
        let mut rng = ChaChaRng::seed_from_u64(11);
        let wallet = wallet(&mut rng);
        let secret = secp256k1::SecretKey::from_slice(&[7; 32]).unwrap();
        let address = wallet.import_transparent_key(secret, 0, &mut rng).unwrap();
        assert_eq!(
            wallet.is_mine(&PaymentAddress::Transparent(address)),
            IsMine::Spendable
        );
        assert_eq!(wallet.export_transparent_key(&address).unwrap(), secret);
    }

    #[test]
    fn encryption_locks_and_unlocks() {
        let mut rng = ChaChaRng::seed_from_u64(12);
        let wallet = wallet(&mut rng);
        let address = wallet.new_address(0, &mut rng).unwrap();
        let passphrase = SecretString::new("correct horse".into());

        wallet.encrypt(&passphrase, 0, &mut rng).unwrap();
        assert!(wallet.is_crypted());
        assert!(wallet.is_locked());
        let err = wallet.export_transparent_key(&address).unwrap_err();
        assert!(err.is_locked());

        let err = wallet.encrypt(&passphrase, 0, &mut rng).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Policy);

        assert_matches!(
            wallet.unlock(&SecretString::new("wrong".into())),
            Err(Error::Keys(zcash_wallet_keys::Error::IncorrectPassphrase))
        );
        wallet.unlock(&passphrase).unwrap();
        wallet.export_transparent_key(&address).unwrap();

        let renewed = SecretString::new("battery staple".into());
        wallet.change_passphrase(&passphrase, &renewed, &mut rng).unwrap();
        wallet.lock().unwrap();
        wallet.unlock(&renewed).unwrap();
    }

    #[test]
    fn encryption_failure_is_fatal() {
        let mut rng = ChaChaRng::seed_from_u64(13);
        let wallet = wallet(&mut rng);
        wallet.lock_state().store.fail_next_commit();
        let err = wallet
            .encrypt(&SecretString::new("pass".into()), 0, &mut rng)
            .unwrap_err();
        assert_matches!(err, Error::EncryptionCommitFailed(_));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn sapling_viewing_key_is_watch_only() {
        let mut rng = ChaChaRng::seed_from_u64(14);
        let spender = wallet(&mut rng);
        let address = spender.new_sapling_address(0, &mut rng).unwrap();
        let dfvk = spender.export_sapling_viewing_key(&address).unwrap();

        let watcher = wallet(&mut rng);
        let imported = watcher.import_sapling_viewing_key(dfvk, 0).unwrap();
        assert_eq!(imported, address);
        assert_eq!(
            watcher.is_mine(&PaymentAddress::Sapling(address)),
            IsMine::WatchOnly
        );
    }
}
