//! The key vault.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};
use rand_core::{CryptoRng, RngCore};
use sapling::zip32::{DiversifiableFullViewingKey, ExtendedSpendingKey};
use secp256k1::{ecdsa, All, Message, PublicKey, Secp256k1, SecretKey};
use secrecy::SecretString;
use zcash_encoding::Vector;
use zcash_protocol::consensus::NetworkType;
use zeroize::Zeroizing;

use crate::crypter::{CryptedSecret, KdfCalibration, KeyingMaterial, MasterKeyRecord};
use crate::error::{Error, KeySubject, Result};
use crate::hd::{self, HdChain, HdSeed};
use crate::keypool::{KeyPool, KeyPoolEntry, ReservedKey};
use crate::records::{SeedKind, VaultRecordId};
use crate::sapling_keys::{IvkTag, SaplingViewingKey};
use crate::sprout::{SproutPaymentAddress, SproutSpendingKey, SproutViewingKey};
use crate::transparent::{KeyChain, KeyId, KeyMetadata};

const KEY_RECORD_VERSION: u8 = 1;

/// Configuration for a [`KeyVault`].
#[derive(Clone, Debug)]
pub struct VaultConfig {
    pub network: NetworkType,
    /// How expensive passphrase stretching should be.
    pub kdf: KdfCalibration,
}

impl VaultConfig {
    pub fn new(network: NetworkType) -> Self {
        VaultConfig {
            network,
            kdf: KdfCalibration::default(),
        }
    }

    pub fn with_kdf(mut self, kdf: KdfCalibration) -> Self {
        self.kdf = kdf;
        self
    }
}

/// The encryption state of a vault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VaultState {
    /// Secrets are held in plaintext.
    Unencrypted,
    /// Secrets are encrypted and the master key is not in memory.
    Locked,
    /// Secrets are encrypted and the master key is available.
    Unlocked,
}

/// Conversion of secret values to and from the bytes that get sealed.
trait SecretEncoding: Sized {
    fn encode_secret(&self) -> Zeroizing<Vec<u8>>;
    fn decode_secret(bytes: &[u8]) -> Result<Self>;
}

impl SecretEncoding for SecretKey {
    fn encode_secret(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret_bytes().to_vec())
    }

    fn decode_secret(bytes: &[u8]) -> Result<Self> {
        Ok(SecretKey::from_slice(bytes)?)
    }
}

impl SecretEncoding for SproutSpendingKey {
    fn encode_secret(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.to_bytes().to_vec())
    }

    fn decode_secret(bytes: &[u8]) -> Result<Self> {
        <[u8; 32]>::try_from(bytes)
            .ok()
            .and_then(SproutSpendingKey::from_bytes)
            .ok_or_else(|| Error::Corrupted("invalid Sprout spending key".to_owned()))
    }
}

impl SecretEncoding for ExtendedSpendingKey {
    fn encode_secret(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.to_bytes().to_vec())
    }

    fn decode_secret(bytes: &[u8]) -> Result<Self> {
        ExtendedSpendingKey::from_bytes(bytes)
            .map_err(|_| Error::Corrupted("invalid Sapling extended spending key".to_owned()))
    }
}

impl SecretEncoding for HdSeed {
    fn encode_secret(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.expose().to_vec())
    }

    fn decode_secret(bytes: &[u8]) -> Result<Self> {
        HdSeed::from_bytes(bytes.to_vec())
    }
}

/// A secret either held in plaintext or sealed under the master key.
enum Custody<T> {
    Plain(T),
    Crypted(CryptedSecret),
}

impl<T: SecretEncoding> Custody<T> {
    fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        match reader.read_u8()? {
            0 => {
                let bytes = Zeroizing::new(Vector::read(&mut reader, |r| r.read_u8())?);
                T::decode_secret(&bytes)
                    .map(Custody::Plain)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            }
            _ => CryptedSecret::read(&mut reader).map(Custody::Crypted),
        }
    }

    fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        match self {
            Custody::Plain(secret) => {
                writer.write_u8(0)?;
                Vector::write(&mut writer, &secret.encode_secret()[..], |w, b| w.write_u8(*b))
            }
            Custody::Crypted(sealed) => {
                writer.write_u8(1)?;
                sealed.write(&mut writer)
            }
        }
    }
}

struct TransparentEntry {
    pubkey: PublicKey,
    secret: Custody<SecretKey>,
    meta: KeyMetadata,
}

struct SproutEntry {
    viewing_key: SproutViewingKey,
    spending_key: Option<Custody<SproutSpendingKey>>,
    meta: KeyMetadata,
}

struct SaplingEntry {
    viewing_key: SaplingViewingKey,
    spending_key: Option<Custody<ExtendedSpendingKey>>,
    meta: KeyMetadata,
}

struct MasterKeys {
    records: BTreeMap<u32, MasterKeyRecord>,
    unlocked: Option<KeyingMaterial>,
    thoroughly_checked: bool,
}

fn option_read<R: Read, T>(
    mut reader: R,
    f: impl FnOnce(&mut R) -> io::Result<T>,
) -> io::Result<Option<T>> {
    match reader.read_u8()? {
        0 => Ok(None),
        _ => f(&mut reader).map(Some),
    }
}

fn seed_aad(kind: SeedKind) -> &'static [u8] {
    match kind {
        SeedKind::Transparent => b"hdseed:transparent",
        SeedKind::Shielded => b"hdseed:shielded",
    }
}

fn random_secret_key<R: RngCore + CryptoRng>(rng: &mut R) -> SecretKey {
    loop {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut bytes[..]);
        if let Ok(sk) = SecretKey::from_slice(&bytes[..]) {
            return sk;
        }
    }
}

/// Custody of all key material belonging to one wallet.
pub struct KeyVault {
    config: VaultConfig,
    secp: Secp256k1<All>,
    master: Option<MasterKeys>,
    transparent: BTreeMap<KeyId, TransparentEntry>,
    watch_scripts: BTreeSet<Vec<u8>>,
    sprout: BTreeMap<SproutPaymentAddress, SproutEntry>,
    sapling: BTreeMap<IvkTag, SaplingEntry>,
    sapling_addresses: BTreeMap<[u8; 43], IvkTag>,
    seeds: BTreeMap<SeedKind, Custody<HdSeed>>,
    hd_chain: Option<HdChain>,
    keypool: KeyPool,
    private_keys_disabled: bool,
    dirty: BTreeSet<VaultRecordId>,
}

impl KeyVault {
    pub fn new(config: VaultConfig) -> Self {
        KeyVault {
            config,
            secp: Secp256k1::new(),
            master: None,
            transparent: BTreeMap::new(),
            watch_scripts: BTreeSet::new(),
            sprout: BTreeMap::new(),
            sapling: BTreeMap::new(),
            sapling_addresses: BTreeMap::new(),
            seeds: BTreeMap::new(),
            hd_chain: None,
            keypool: KeyPool::new(),
            private_keys_disabled: false,
            dirty: BTreeSet::new(),
        }
    }

    pub fn network(&self) -> NetworkType {
        self.config.network
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    pub fn state(&self) -> VaultState {
        match &self.master {
            None => VaultState::Unencrypted,
            Some(m) if m.unlocked.is_some() => VaultState::Unlocked,
            Some(_) => VaultState::Locked,
        }
    }

    pub fn is_crypted(&self) -> bool {
        self.master.is_some()
    }

    pub fn is_locked(&self) -> bool {
        self.state() == VaultState::Locked
    }

    /// Returns the master key, `None` for an unencrypted vault, or an error if locked.
    fn master_key(&self) -> Result<Option<&KeyingMaterial>> {
        match &self.master {
            None => Ok(None),
            Some(m) => m.unlocked.as_ref().map(Some).ok_or(Error::Locked),
        }
    }

    fn seal<T: SecretEncoding, R: RngCore + CryptoRng>(
        &self,
        secret: T,
        aad: &[u8],
        rng: &mut R,
    ) -> Result<Custody<T>> {
        match self.master_key()? {
            None => Ok(Custody::Plain(secret)),
            Some(key) => {
                CryptedSecret::seal(key, aad, &secret.encode_secret(), rng).map(Custody::Crypted)
            }
        }
    }

    fn open<T: SecretEncoding + Clone>(&self, custody: &Custody<T>, aad: &[u8]) -> Result<T> {
        match custody {
            Custody::Plain(secret) => Ok(secret.clone()),
            Custody::Crypted(sealed) => {
                let key = self.master_key()?.ok_or_else(|| {
                    Error::Corrupted("encrypted secret in an unencrypted vault".to_owned())
                })?;
                let bytes = sealed.open(key, aad).map_err(|_| {
                    Error::Corrupted("secret does not decrypt under the master key".to_owned())
                })?;
                T::decode_secret(&bytes)
            }
        }
    }

    fn check_private_keys_allowed(&self) -> Result<()> {
        if self.private_keys_disabled {
            Err(Error::PrivateKeysDisabled)
        } else {
            Ok(())
        }
    }

    /// Returns the identifiers of every record changed since the last call.
    pub fn take_dirty(&mut self) -> BTreeSet<VaultRecordId> {
        std::mem::take(&mut self.dirty)
    }

    /// Returns records to the changed set after they failed to reach storage.
    pub fn restore_dirty(&mut self, ids: BTreeSet<VaultRecordId>) {
        self.dirty.extend(ids);
    }

    //
    // Wallet flags
    //

    pub fn private_keys_disabled(&self) -> bool {
        self.private_keys_disabled
    }

    /// Turns this into a watch-only vault. Only permitted while it holds no secrets.
    pub fn disable_private_keys(&mut self) -> Result<()> {
        let has_secrets = !self.transparent.is_empty()
            || !self.seeds.is_empty()
            || self.sprout.values().any(|e| e.spending_key.is_some())
            || self.sapling.values().any(|e| e.spending_key.is_some());
        if has_secrets {
            return Err(Error::PrivateKeysPresent);
        }
        self.private_keys_disabled = true;
        Ok(())
    }

    //
    // HD seeds
    //

    /// Installs the seed from which transparent keys are derived, resetting the
    /// derivation counters.
    pub fn set_hd_seed<R: RngCore + CryptoRng>(&mut self, seed: HdSeed, rng: &mut R) -> Result<()> {
        self.check_private_keys_allowed()?;
        let fp = seed.fingerprint()?;
        let custody = self.seal(seed, seed_aad(SeedKind::Transparent), rng)?;
        let shielded_seed_fp = self.hd_chain.as_ref().and_then(|c| c.shielded_seed_fp);
        let sapling_account_counter = self
            .hd_chain
            .as_ref()
            .map_or(0, |c| c.sapling_account_counter);

        self.seeds.insert(SeedKind::Transparent, custody);
        self.hd_chain = Some(HdChain {
            shielded_seed_fp,
            sapling_account_counter,
            ..HdChain::new(fp)
        });
        self.dirty.insert(VaultRecordId::HdSeed(SeedKind::Transparent));
        self.dirty.insert(VaultRecordId::HdChain);
        tracing::info!("Installed new transparent HD seed");
        Ok(())
    }

    pub fn generate_hd_seed<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<()> {
        let seed = HdSeed::random(rng);
        self.set_hd_seed(seed, rng)
    }

    /// Installs the seed from which Sapling accounts are derived.
    pub fn set_shielded_seed<R: RngCore + CryptoRng>(
        &mut self,
        seed: HdSeed,
        rng: &mut R,
    ) -> Result<()> {
        self.check_private_keys_allowed()?;
        let fp = seed.fingerprint()?;
        let custody = self.seal(seed, seed_aad(SeedKind::Shielded), rng)?;
        self.seeds.insert(SeedKind::Shielded, custody);
        let chain = self.hd_chain.get_or_insert_with(|| HdChain::new([0; 32]));
        chain.shielded_seed_fp = Some(fp);
        chain.sapling_account_counter = 0;
        self.dirty.insert(VaultRecordId::HdSeed(SeedKind::Shielded));
        self.dirty.insert(VaultRecordId::HdChain);
        Ok(())
    }

    /// Generates a BIP 39 mnemonic, installs the seed it encodes as the shielded seed,
    /// and returns the phrase so that it can be shown to the user once.
    pub fn generate_shielded_mnemonic<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
    ) -> Result<SecretString> {
        let (phrase, seed) = HdSeed::generate_mnemonic(rng);
        self.set_shielded_seed(seed, rng)?;
        Ok(phrase)
    }

    pub fn has_hd_seed(&self) -> bool {
        self.seeds.contains_key(&SeedKind::Transparent)
    }

    pub fn has_shielded_seed(&self) -> bool {
        self.seeds.contains_key(&SeedKind::Shielded)
    }

    pub fn hd_chain(&self) -> Option<&HdChain> {
        self.hd_chain.as_ref()
    }

    fn seed(&self, kind: SeedKind) -> Result<HdSeed> {
        let custody = self.seeds.get(&kind).ok_or(Error::NoSeed)?;
        self.open(custody, seed_aad(kind))
    }

    //
    // Transparent keys
    //

    /// Adds a transparent secret key, encrypting it if the vault is encrypted.
    pub fn add_transparent_key<R: RngCore + CryptoRng>(
        &mut self,
        secret: SecretKey,
        meta: KeyMetadata,
        rng: &mut R,
    ) -> Result<PublicKey> {
        self.check_private_keys_allowed()?;
        let pubkey = PublicKey::from_secret_key(&self.secp, &secret);
        let custody = self.seal(secret, &pubkey.serialize(), rng)?;
        let key_id = KeyId::from_pubkey(&pubkey);
        self.transparent.insert(
            key_id,
            TransparentEntry {
                pubkey,
                secret: custody,
                meta,
            },
        );
        self.dirty.insert(VaultRecordId::TransparentKey(key_id));
        Ok(pubkey)
    }

    /// Generates a new transparent key, deriving it from the HD seed when one is set.
    pub fn generate_transparent_key<R: RngCore + CryptoRng>(
        &mut self,
        chain: KeyChain,
        now: i64,
        rng: &mut R,
    ) -> Result<PublicKey> {
        self.check_private_keys_allowed()?;
        if !self.has_hd_seed() {
            let secret = random_secret_key(rng);
            return self.add_transparent_key(secret, KeyMetadata::new(now), rng);
        }

        let seed = self.seed(SeedKind::Transparent)?;
        let mut hd_chain = self.hd_chain.clone().ok_or(Error::NoSeed)?;
        // Skip over indices already in use, which happens after a seed is re-imported.
        let derived = loop {
            let index = hd_chain.next_index(chain)?;
            let derived = hd::derive_transparent(&self.secp, &seed, chain, index)?;
            let pubkey = PublicKey::from_secret_key(&self.secp, &derived.secret);
            if !self.transparent.contains_key(&KeyId::from_pubkey(&pubkey)) {
                break derived;
            }
        };

        let meta = KeyMetadata {
            create_time: now,
            hd_keypath: Some(derived.keypath),
            seed_fp: Some(hd_chain.seed_fp),
            master_fingerprint: Some(derived.master_fingerprint),
        };
        let pubkey = self.add_transparent_key(derived.secret, meta, rng)?;
        self.hd_chain = Some(hd_chain);
        self.dirty.insert(VaultRecordId::HdChain);
        Ok(pubkey)
    }

    pub fn have_transparent_key(&self, key_id: &KeyId) -> bool {
        self.transparent.contains_key(key_id)
    }

    pub fn transparent_pubkey(&self, key_id: &KeyId) -> Option<PublicKey> {
        self.transparent.get(key_id).map(|e| e.pubkey)
    }

    pub fn transparent_key_ids(&self) -> impl Iterator<Item = &KeyId> {
        self.transparent.keys()
    }

    pub fn key_metadata(&self, key_id: &KeyId) -> Option<&KeyMetadata> {
        self.transparent.get(key_id).map(|e| &e.meta)
    }

    /// Recovers the secret key for `key_id`, checking it against the stored public key.
    pub fn transparent_secret(&self, key_id: &KeyId) -> Result<SecretKey> {
        let entry = self
            .transparent
            .get(key_id)
            .ok_or_else(|| Error::KeyNotFound(KeySubject::Transparent(key_id.to_string())))?;
        let secret = self.open(&entry.secret, &entry.pubkey.serialize())?;
        if PublicKey::from_secret_key(&self.secp, &secret) != entry.pubkey {
            return Err(Error::Corrupted(format!(
                "secret for {} does not match its public key",
                key_id
            )));
        }
        Ok(secret)
    }

    /// Produces a DER-encoded ECDSA signature over `digest` with the key for `key_id`.
    pub fn sign_digest(&self, key_id: &KeyId, digest: &[u8; 32]) -> Result<Vec<u8>> {
        let secret = self.transparent_secret(key_id)?;
        let sig = self
            .secp
            .sign_ecdsa(&Message::from_digest(*digest), &secret);
        Ok(sig.serialize_der().to_vec())
    }

    /// Checks a DER-encoded signature over `digest` against `pubkey`.
    pub fn verify_digest(&self, pubkey: &PublicKey, digest: &[u8; 32], der: &[u8]) -> bool {
        ecdsa::Signature::from_der(der)
            .map(|sig| {
                self.secp
                    .verify_ecdsa(&Message::from_digest(*digest), &sig, pubkey)
                    .is_ok()
            })
            .unwrap_or(false)
    }

    /// Tracks a script without holding any key able to spend it.
    pub fn add_watch_script(&mut self, script: Vec<u8>) {
        if self.watch_scripts.insert(script.clone()) {
            self.dirty.insert(VaultRecordId::WatchScript(script));
        }
    }

    pub fn have_watch_script(&self, script: &[u8]) -> bool {
        self.watch_scripts.contains(script)
    }

    //
    // Keypool
    //

    /// Generates keys until each chain holds at least `target` unreserved keys.
    /// Returns the number of keys generated.
    pub fn top_up_keypool<R: RngCore + CryptoRng>(
        &mut self,
        target: usize,
        now: i64,
        rng: &mut R,
    ) -> Result<usize> {
        if self.private_keys_disabled {
            return Ok(0);
        }
        let mut generated = 0;
        for chain in [KeyChain::External, KeyChain::Internal] {
            while self.keypool.available(chain) < target {
                let pubkey = self.generate_transparent_key(chain, now, rng)?;
                let index = self.keypool.add(KeyPoolEntry {
                    time: now,
                    pubkey,
                    chain,
                });
                self.dirty.insert(VaultRecordId::KeyPool(index));
                generated += 1;
            }
        }
        if generated > 0 {
            tracing::debug!("keypool added {} keys", generated);
        }
        Ok(generated)
    }

    /// Reserves a key from the pool, topping the pool up first if it is empty and the
    /// vault is able to generate keys.
    pub fn reserve_key<R: RngCore + CryptoRng>(
        &mut self,
        chain: KeyChain,
        target: usize,
        now: i64,
        rng: &mut R,
    ) -> Result<ReservedKey> {
        if self.keypool.available(chain) == 0 {
            match self.top_up_keypool(target.max(1), now, rng) {
                Ok(_) | Err(Error::Locked) => (),
                Err(e) => return Err(e),
            }
        }
        self.keypool.reserve(chain).ok_or(Error::KeypoolExhausted)
    }

    /// Removes a reserved key from the pool permanently.
    pub fn keep_key(&mut self, key: ReservedKey) {
        if self.keypool.keep(&key) {
            self.dirty.insert(VaultRecordId::KeyPool(key.index));
        }
    }

    /// Makes a reserved key available again.
    pub fn return_key(&mut self, key: ReservedKey) {
        self.keypool.give_back(&key);
    }

    /// Reserves and immediately keeps a key.
    pub fn key_from_pool<R: RngCore + CryptoRng>(
        &mut self,
        chain: KeyChain,
        target: usize,
        now: i64,
        rng: &mut R,
    ) -> Result<PublicKey> {
        let reserved = self.reserve_key(chain, target, now, rng)?;
        let pubkey = reserved.pubkey;
        self.keep_key(reserved);
        Ok(pubkey)
    }

    /// Discards every pool entry. Used after encryption so that keys generated from the
    /// old, unencrypted seed are never handed out.
    pub fn reset_keypool(&mut self) {
        for index in self.keypool.indices().collect::<Vec<_>>() {
            self.dirty.insert(VaultRecordId::KeyPool(index));
        }
        self.keypool = KeyPool::new();
    }

    pub fn keypool_available(&self, chain: KeyChain) -> usize {
        self.keypool.available(chain)
    }

    pub fn keypool_oldest_time(&self) -> Option<i64> {
        self.keypool.oldest_time()
    }

    /// Removes pool keys made redundant by `key_id` having been seen in use.
    pub fn mark_key_used(&mut self, key_id: &KeyId) {
        for index in self.keypool.mark_used(key_id) {
            tracing::debug!("keypool index {} marked used by {}", index, key_id);
            self.dirty.insert(VaultRecordId::KeyPool(index));
        }
    }

    //
    // Sprout keys
    //

    pub fn add_sprout_spending_key<R: RngCore + CryptoRng>(
        &mut self,
        sk: SproutSpendingKey,
        meta: KeyMetadata,
        rng: &mut R,
    ) -> Result<SproutPaymentAddress> {
        self.check_private_keys_allowed()?;
        let viewing_key = sk.viewing_key();
        let addr = viewing_key.address();
        let custody = self.seal(sk, &addr.to_bytes(), rng)?;
        self.sprout.insert(
            addr,
            SproutEntry {
                viewing_key,
                spending_key: Some(custody),
                meta,
            },
        );
        self.dirty.insert(VaultRecordId::SproutKey(addr));
        Ok(addr)
    }

    pub fn generate_sprout_key<R: RngCore + CryptoRng>(
        &mut self,
        now: i64,
        rng: &mut R,
    ) -> Result<SproutPaymentAddress> {
        let sk = SproutSpendingKey::random(rng);
        self.add_sprout_spending_key(sk, KeyMetadata::new(now), rng)
    }

    /// Adds a viewing key. An existing spending key for the same address is kept.
    pub fn add_sprout_viewing_key(
        &mut self,
        viewing_key: SproutViewingKey,
        meta: KeyMetadata,
    ) -> SproutPaymentAddress {
        let addr = viewing_key.address();
        self.sprout.entry(addr).or_insert_with(|| SproutEntry {
            viewing_key,
            spending_key: None,
            meta,
        });
        self.dirty.insert(VaultRecordId::SproutKey(addr));
        addr
    }

    pub fn sprout_viewing_keys(
        &self,
    ) -> impl Iterator<Item = (&SproutPaymentAddress, &SproutViewingKey)> {
        self.sprout.iter().map(|(a, e)| (a, &e.viewing_key))
    }

    pub fn sprout_viewing_key(&self, addr: &SproutPaymentAddress) -> Option<&SproutViewingKey> {
        self.sprout.get(addr).map(|e| &e.viewing_key)
    }

    pub fn have_sprout_spending_key(&self, addr: &SproutPaymentAddress) -> bool {
        self.sprout
            .get(addr)
            .is_some_and(|e| e.spending_key.is_some())
    }

    pub fn sprout_spending_key(&self, addr: &SproutPaymentAddress) -> Result<SproutSpendingKey> {
        let custody = self
            .sprout
            .get(addr)
            .and_then(|e| e.spending_key.as_ref())
            .ok_or_else(|| Error::KeyNotFound(KeySubject::Sprout(addr.to_string())))?;
        let sk = self.open(custody, &addr.to_bytes())?;
        if &sk.address() != addr {
            return Err(Error::Corrupted(format!(
                "Sprout spending key for {} does not match its address",
                addr
            )));
        }
        Ok(sk)
    }

    /// Computes a Sprout nullifier. This needs the spending key, so it fails while the
    /// vault is locked.
    pub fn sprout_nullifier(&self, addr: &SproutPaymentAddress, rho: &[u8; 32]) -> Result<[u8; 32]> {
        self.sprout_spending_key(addr).map(|sk| sk.nullifier(rho))
    }

    //
    // Sapling keys
    //

    fn insert_sapling(
        &mut self,
        viewing_key: SaplingViewingKey,
        spending_key: Option<Custody<ExtendedSpendingKey>>,
        meta: KeyMetadata,
    ) -> IvkTag {
        let tag = viewing_key.tag();
        let default_address = viewing_key.default_address().to_bytes();
        match self.sapling.get_mut(&tag) {
            Some(existing) if spending_key.is_some() => existing.spending_key = spending_key,
            Some(_) => (),
            None => {
                self.sapling.insert(
                    tag,
                    SaplingEntry {
                        viewing_key,
                        spending_key,
                        meta,
                    },
                );
            }
        }
        self.dirty.insert(VaultRecordId::SaplingKey(tag));
        self.add_sapling_address(default_address, tag);
        tag
    }

    pub fn add_sapling_spending_key<R: RngCore + CryptoRng>(
        &mut self,
        extsk: ExtendedSpendingKey,
        meta: KeyMetadata,
        rng: &mut R,
    ) -> Result<IvkTag> {
        self.check_private_keys_allowed()?;
        let viewing_key = SaplingViewingKey::new(extsk.to_diversifiable_full_viewing_key());
        let custody = self.seal(extsk, &viewing_key.to_bytes(), rng)?;
        Ok(self.insert_sapling(viewing_key, Some(custody), meta))
    }

    pub fn add_sapling_viewing_key(
        &mut self,
        dfvk: DiversifiableFullViewingKey,
        meta: KeyMetadata,
    ) -> IvkTag {
        self.insert_sapling(SaplingViewingKey::new(dfvk), None, meta)
    }

    /// Derives the next Sapling account from the shielded seed.
    pub fn generate_sapling_key<R: RngCore + CryptoRng>(
        &mut self,
        now: i64,
        rng: &mut R,
    ) -> Result<IvkTag> {
        self.check_private_keys_allowed()?;
        let seed = self.seed(SeedKind::Shielded)?;
        let mut hd_chain = self.hd_chain.clone().ok_or(Error::NoSeed)?;
        let (extsk, keypath) = loop {
            let account = hd_chain.next_sapling_account()?;
            let (extsk, keypath) = hd::derive_sapling(&self.config.network, &seed, account)?;
            let tag = SaplingViewingKey::new(extsk.to_diversifiable_full_viewing_key()).tag();
            if !self.sapling.contains_key(&tag) {
                break (extsk, keypath);
            }
        };
        let meta = KeyMetadata {
            create_time: now,
            hd_keypath: Some(keypath),
            seed_fp: hd_chain.shielded_seed_fp,
            master_fingerprint: None,
        };
        let tag = self.add_sapling_spending_key(extsk, meta, rng)?;
        self.hd_chain = Some(hd_chain);
        self.dirty.insert(VaultRecordId::HdChain);
        Ok(tag)
    }

    /// Records that `address` belongs to the key identified by `tag`.
    pub fn add_sapling_address(&mut self, address: [u8; 43], tag: IvkTag) {
        if self.sapling_addresses.insert(address, tag) != Some(tag) {
            self.dirty.insert(VaultRecordId::SaplingAddress(address));
        }
    }

    pub fn sapling_ivk_for_address(&self, address: &[u8; 43]) -> Option<IvkTag> {
        self.sapling_addresses.get(address).copied()
    }

    pub fn sapling_viewing_keys(&self) -> impl Iterator<Item = &SaplingViewingKey> {
        self.sapling.values().map(|e| &e.viewing_key)
    }

    pub fn sapling_viewing_key(&self, tag: &IvkTag) -> Option<&SaplingViewingKey> {
        self.sapling.get(tag).map(|e| &e.viewing_key)
    }

    pub fn have_sapling_spending_key(&self, tag: &IvkTag) -> bool {
        self.sapling
            .get(tag)
            .is_some_and(|e| e.spending_key.is_some())
    }

    pub fn sapling_spending_key(&self, tag: &IvkTag) -> Result<ExtendedSpendingKey> {
        let entry = self
            .sapling
            .get(tag)
            .ok_or_else(|| Error::KeyNotFound(KeySubject::Sapling(tag.to_string())))?;
        let custody = entry
            .spending_key
            .as_ref()
            .ok_or_else(|| Error::KeyNotFound(KeySubject::Sapling(tag.to_string())))?;
        let aad = entry.viewing_key.to_bytes();
        let extsk = self.open(custody, &aad)?;
        if extsk.to_diversifiable_full_viewing_key().to_bytes() != aad {
            return Err(Error::Corrupted(format!(
                "Sapling spending key for {} does not match its viewing key",
                tag
            )));
        }
        Ok(extsk)
    }

    //
    // Encryption
    //

    /// Encrypts every secret in the vault under a new master key protected by
    /// `passphrase`. The vault is left locked.
    ///
    /// All ciphertexts are produced before any entry is replaced, so a failure leaves
    /// the vault exactly as it was.
    pub fn encrypt<R: RngCore + CryptoRng>(
        &mut self,
        passphrase: &SecretString,
        rng: &mut R,
    ) -> Result<()> {
        if self.master.is_some() {
            return Err(Error::AlreadyEncrypted);
        }

        let mut master = Zeroizing::new([0u8; 32]);
        rng.fill_bytes(&mut master[..]);
        let record = MasterKeyRecord::wrap(&master, passphrase, self.config.kdf, rng)?;

        let seal = |secret: &[u8], aad: &[u8], rng: &mut R| {
            CryptedSecret::seal(&master, aad, secret, rng)
        };

        let mut transparent = Vec::with_capacity(self.transparent.len());
        for (key_id, entry) in &self.transparent {
            if let Custody::Plain(secret) = &entry.secret {
                let sealed = seal(&secret.encode_secret(), &entry.pubkey.serialize(), rng)?;
                transparent.push((*key_id, sealed));
            }
        }
        let mut sprout = Vec::new();
        for (addr, entry) in &self.sprout {
            if let Some(Custody::Plain(sk)) = &entry.spending_key {
                sprout.push((*addr, seal(&sk.encode_secret(), &addr.to_bytes(), rng)?));
            }
        }
        let mut sapling = Vec::new();
        for (tag, entry) in &self.sapling {
            if let Some(Custody::Plain(extsk)) = &entry.spending_key {
                let aad = entry.viewing_key.to_bytes();
                sapling.push((*tag, seal(&extsk.encode_secret(), &aad, rng)?));
            }
        }
        let mut seeds = Vec::new();
        for (kind, custody) in &self.seeds {
            if let Custody::Plain(seed) = custody {
                seeds.push((*kind, seal(&seed.encode_secret(), seed_aad(*kind), rng)?));
            }
        }

        for (key_id, sealed) in transparent {
            if let Some(entry) = self.transparent.get_mut(&key_id) {
                entry.secret = Custody::Crypted(sealed);
                self.dirty.insert(VaultRecordId::TransparentKey(key_id));
            }
        }
        for (addr, sealed) in sprout {
            if let Some(entry) = self.sprout.get_mut(&addr) {
                entry.spending_key = Some(Custody::Crypted(sealed));
                self.dirty.insert(VaultRecordId::SproutKey(addr));
            }
        }
        for (tag, sealed) in sapling {
            if let Some(entry) = self.sapling.get_mut(&tag) {
                entry.spending_key = Some(Custody::Crypted(sealed));
                self.dirty.insert(VaultRecordId::SaplingKey(tag));
            }
        }
        for (kind, sealed) in seeds {
            self.seeds.insert(kind, Custody::Crypted(sealed));
            self.dirty.insert(VaultRecordId::HdSeed(kind));
        }

        self.master = Some(MasterKeys {
            records: BTreeMap::from([(1, record)]),
            unlocked: None,
            thoroughly_checked: true,
        });
        self.dirty.insert(VaultRecordId::MasterKey(1));
        tracing::info!("Encrypted key vault");
        Ok(())
    }

    /// Checks that every sealed secret opens under `master` and matches its public
    /// counterpart. Returns whether the key is correct; a key that opens some secrets
    /// but not others means the vault is corrupted.
    fn check_master_key(&self, master: &KeyingMaterial, thorough: bool) -> Result<bool> {
        let mut pass = false;
        let mut fail = false;

        let mut check = |ok: bool| {
            if ok {
                pass = true;
            } else {
                fail = true;
            }
        };

        for entry in self.transparent.values() {
            if let Custody::Crypted(sealed) = &entry.secret {
                let ok = sealed
                    .open(master, &entry.pubkey.serialize())
                    .ok()
                    .and_then(|b| SecretKey::decode_secret(&b).ok())
                    .is_some_and(|sk| PublicKey::from_secret_key(&self.secp, &sk) == entry.pubkey);
                check(ok);
                if !thorough {
                    break;
                }
            }
        }
        for (addr, entry) in &self.sprout {
            if let Some(Custody::Crypted(sealed)) = &entry.spending_key {
                let ok = sealed
                    .open(master, &addr.to_bytes())
                    .ok()
                    .and_then(|b| SproutSpendingKey::decode_secret(&b).ok())
                    .is_some_and(|sk| &sk.address() == addr);
                check(ok);
            }
        }
        for entry in self.sapling.values() {
            if let Some(Custody::Crypted(sealed)) = &entry.spending_key {
                let aad = entry.viewing_key.to_bytes();
                let ok = sealed
                    .open(master, &aad)
                    .ok()
                    .and_then(|b| ExtendedSpendingKey::decode_secret(&b).ok())
                    .is_some_and(|k| k.to_diversifiable_full_viewing_key().to_bytes() == aad);
                check(ok);
            }
        }
        for (kind, custody) in &self.seeds {
            if let Custody::Crypted(sealed) = custody {
                check(sealed.open(master, seed_aad(*kind)).is_ok());
            }
        }

        if pass && fail {
            tracing::error!("The wallet is probably corrupted: some keys decrypt but not all");
            return Err(Error::Corrupted(
                "some keys decrypt but not all".to_owned(),
            ));
        }
        Ok(!fail)
    }

    /// Unlocks the vault with `passphrase`.
    pub fn unlock(&mut self, passphrase: &SecretString) -> Result<()> {
        let masters = self.master.as_ref().ok_or(Error::NotEncrypted)?;
        let thorough = !masters.thoroughly_checked;

        let mut candidates = Vec::new();
        for record in masters.records.values() {
            match record.unwrap_key(passphrase) {
                Ok(key) => candidates.push(key),
                Err(Error::IncorrectPassphrase) => continue,
                Err(e) => return Err(e),
            }
        }

        for key in candidates {
            if self.check_master_key(&key, thorough)? {
                if let Some(m) = self.master.as_mut() {
                    m.unlocked = Some(key);
                    m.thoroughly_checked = true;
                }
                return Ok(());
            }
        }
        Err(Error::IncorrectPassphrase)
    }

    /// Discards the unwrapped master key. Wrapped material is unaffected.
    pub fn lock(&mut self) -> Result<()> {
        let master = self.master.as_mut().ok_or(Error::NotEncrypted)?;
        master.unlocked = None;
        Ok(())
    }

    /// Re-wraps the master key under `new`. The lock state is preserved.
    pub fn change_passphrase<R: RngCore + CryptoRng>(
        &mut self,
        old: &SecretString,
        new: &SecretString,
        rng: &mut R,
    ) -> Result<()> {
        let was_locked = self.is_locked();
        self.unlock(old)?;

        let kdf = self.config.kdf;
        let master = self.master.as_mut().ok_or(Error::NotEncrypted)?;
        let key = master.unlocked.clone().ok_or(Error::Locked)?;
        let mut rewrapped = Vec::new();
        for (id, record) in &master.records {
            if record.unwrap_key(old).is_ok() {
                rewrapped.push((*id, MasterKeyRecord::wrap(&key, new, kdf, rng)?));
            }
        }
        for (id, record) in rewrapped {
            master.records.insert(id, record);
            self.dirty.insert(VaultRecordId::MasterKey(id));
        }
        if was_locked {
            master.unlocked = None;
        }
        Ok(())
    }

    //
    // Persistence
    //

    /// Every record currently making up the vault.
    pub fn all_record_ids(&self) -> Vec<VaultRecordId> {
        let mut ids = vec![];
        if let Some(m) = &self.master {
            ids.extend(m.records.keys().map(|id| VaultRecordId::MasterKey(*id)));
        }
        ids.extend(self.transparent.keys().map(|k| VaultRecordId::TransparentKey(*k)));
        ids.extend(
            self.watch_scripts
                .iter()
                .map(|s| VaultRecordId::WatchScript(s.clone())),
        );
        ids.extend(self.sprout.keys().map(|a| VaultRecordId::SproutKey(*a)));
        ids.extend(self.sapling.keys().map(|t| VaultRecordId::SaplingKey(*t)));
        ids.extend(
            self.sapling_addresses
                .keys()
                .map(|a| VaultRecordId::SaplingAddress(*a)),
        );
        ids.extend(self.seeds.keys().map(|k| VaultRecordId::HdSeed(*k)));
        if self.hd_chain.is_some() {
            ids.push(VaultRecordId::HdChain);
        }
        ids.extend(self.keypool.indices().map(VaultRecordId::KeyPool));
        ids
    }

    /// Serializes the record identified by `id`, or returns `None` if it no longer
    /// exists and should be erased.
    pub fn export_record(&self, id: &VaultRecordId) -> Result<Option<Vec<u8>>> {
        let mut out = vec![];
        match id {
            VaultRecordId::MasterKey(n) => {
                match self.master.as_ref().and_then(|m| m.records.get(n)) {
                    Some(record) => record.write(&mut out)?,
                    None => return Ok(None),
                }
            }
            VaultRecordId::TransparentKey(key_id) => match self.transparent.get(key_id) {
                Some(entry) => {
                    out.write_u8(KEY_RECORD_VERSION)?;
                    out.write_all(&entry.pubkey.serialize())?;
                    entry.secret.write(&mut out)?;
                    entry.meta.write(&mut out)?;
                }
                None => return Ok(None),
            },
            VaultRecordId::WatchScript(script) => {
                if !self.watch_scripts.contains(script) {
                    return Ok(None);
                }
                out.write_u8(KEY_RECORD_VERSION)?;
            }
            VaultRecordId::SproutKey(addr) => match self.sprout.get(addr) {
                Some(entry) => {
                    out.write_u8(KEY_RECORD_VERSION)?;
                    out.write_all(&entry.viewing_key.to_bytes())?;
                    match &entry.spending_key {
                        Some(custody) => {
                            out.write_u8(1)?;
                            custody.write(&mut out)?;
                        }
                        None => out.write_u8(0)?,
                    }
                    entry.meta.write(&mut out)?;
                }
                None => return Ok(None),
            },
            VaultRecordId::SaplingKey(tag) => match self.sapling.get(tag) {
                Some(entry) => {
                    out.write_u8(KEY_RECORD_VERSION)?;
                    out.write_all(&entry.viewing_key.to_bytes())?;
                    match &entry.spending_key {
                        Some(custody) => {
                            out.write_u8(1)?;
                            custody.write(&mut out)?;
                        }
                        None => out.write_u8(0)?,
                    }
                    entry.meta.write(&mut out)?;
                }
                None => return Ok(None),
            },
            VaultRecordId::SaplingAddress(addr) => match self.sapling_addresses.get(addr) {
                Some(tag) => {
                    out.write_u8(KEY_RECORD_VERSION)?;
                    out.write_all(tag.as_bytes())?;
                }
                None => return Ok(None),
            },
            VaultRecordId::HdSeed(kind) => match self.seeds.get(kind) {
                Some(custody) => {
                    out.write_u8(KEY_RECORD_VERSION)?;
                    custody.write(&mut out)?;
                }
                None => return Ok(None),
            },
            VaultRecordId::HdChain => match &self.hd_chain {
                Some(chain) => chain.write(&mut out)?,
                None => return Ok(None),
            },
            VaultRecordId::KeyPool(index) => match self.keypool.entry(*index) {
                Some(entry) => entry.write(&mut out)?,
                None => return Ok(None),
            },
        }
        Ok(Some(out))
    }

    /// Restores a record previously produced by [`KeyVault::export_record`].
    pub fn load_record(&mut self, id: &VaultRecordId, bytes: &[u8]) -> Result<()> {
        let mut reader = bytes;
        match id {
            VaultRecordId::MasterKey(n) => {
                let record = MasterKeyRecord::read(&mut reader)?;
                self.master
                    .get_or_insert_with(|| MasterKeys {
                        records: BTreeMap::new(),
                        unlocked: None,
                        thoroughly_checked: false,
                    })
                    .records
                    .insert(*n, record);
            }
            VaultRecordId::TransparentKey(key_id) => {
                let _version = reader.read_u8()?;
                let mut pubkey = [0u8; 33];
                reader.read_exact(&mut pubkey)?;
                let pubkey = PublicKey::from_slice(&pubkey)?;
                if &KeyId::from_pubkey(&pubkey) != key_id {
                    return Err(Error::Corrupted(format!(
                        "key record {} holds a different public key",
                        key_id
                    )));
                }
                let secret = Custody::read(&mut reader)?;
                let meta = KeyMetadata::read(&mut reader)?;
                self.transparent.insert(
                    *key_id,
                    TransparentEntry {
                        pubkey,
                        secret,
                        meta,
                    },
                );
            }
            VaultRecordId::WatchScript(script) => {
                self.watch_scripts.insert(script.clone());
            }
            VaultRecordId::SproutKey(addr) => {
                let _version = reader.read_u8()?;
                let mut vk = [0u8; 64];
                reader.read_exact(&mut vk)?;
                let viewing_key = SproutViewingKey::from_bytes(&vk);
                if &viewing_key.address() != addr {
                    return Err(Error::Corrupted(format!(
                        "Sprout key record for {} holds a different viewing key",
                        addr
                    )));
                }
                let spending_key = option_read(&mut reader, |r| Custody::read(r))?;
                let meta = KeyMetadata::read(&mut reader)?;
                self.sprout.insert(
                    *addr,
                    SproutEntry {
                        viewing_key,
                        spending_key,
                        meta,
                    },
                );
            }
            VaultRecordId::SaplingKey(tag) => {
                let _version = reader.read_u8()?;
                let mut vk = [0u8; 128];
                reader.read_exact(&mut vk)?;
                let viewing_key = SaplingViewingKey::from_bytes(&vk).ok_or_else(|| {
                    Error::Corrupted("invalid Sapling full viewing key".to_owned())
                })?;
                if &viewing_key.tag() != tag {
                    return Err(Error::Corrupted(format!(
                        "Sapling key record for {} holds a different viewing key",
                        tag
                    )));
                }
                let spending_key = option_read(&mut reader, |r| Custody::read(r))?;
                let meta = KeyMetadata::read(&mut reader)?;
                self.sapling.insert(
                    *tag,
                    SaplingEntry {
                        viewing_key,
                        spending_key,
                        meta,
                    },
                );
            }
            VaultRecordId::SaplingAddress(addr) => {
                let _version = reader.read_u8()?;
                let mut tag = [0u8; 32];
                reader.read_exact(&mut tag)?;
                self.sapling_addresses.insert(*addr, IvkTag::from_bytes(tag));
            }
            VaultRecordId::HdSeed(kind) => {
                let _version = reader.read_u8()?;
                self.seeds.insert(*kind, Custody::read(&mut reader)?);
            }
            VaultRecordId::HdChain => {
                self.hd_chain = Some(HdChain::read(&mut reader)?);
            }
            VaultRecordId::KeyPool(index) => {
                self.keypool.load(*index, KeyPoolEntry::read(&mut reader)?);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rand_chacha::ChaChaRng;
    use rand_core::SeedableRng;
    use secrecy::SecretString;
    use zcash_protocol::consensus::NetworkType;

    use super::{KeyVault, VaultConfig, VaultState};
    use crate::crypter::KdfCalibration;
    use crate::error::Error;
    use crate::hd::HdSeed;
    use crate::transparent::{KeyChain, KeyId};

    fn vault() -> KeyVault {
        KeyVault::new(VaultConfig::new(NetworkType::Test).with_kdf(KdfCalibration::Fixed(10)))
    }

    fn pass(s: &str) -> SecretString {
        SecretString::new(s.to_owned())
    }

    fn populated(rng: &mut ChaChaRng) -> KeyVault {
        let mut v = vault();
        v.set_hd_seed(HdSeed::from_bytes(vec![7u8; 32]).unwrap(), rng)
            .unwrap();
        v.set_shielded_seed(HdSeed::from_bytes(vec![8u8; 32]).unwrap(), rng)
            .unwrap();
        v.generate_transparent_key(KeyChain::External, 1, rng).unwrap();
        v.generate_sprout_key(1, rng).unwrap();
        v.generate_sapling_key(1, rng).unwrap();
        v
    }

    #[test]
    fn hd_keys_record_their_path() {
        let mut rng = ChaChaRng::seed_from_u64(0);
        let mut v = vault();
        v.set_hd_seed(HdSeed::from_bytes(vec![1u8; 32]).unwrap(), &mut rng)
            .unwrap();
        let a = v
            .generate_transparent_key(KeyChain::External, 10, &mut rng)
            .unwrap();
        let b = v
            .generate_transparent_key(KeyChain::Internal, 10, &mut rng)
            .unwrap();
        let meta_a = v.key_metadata(&KeyId::from_pubkey(&a)).unwrap();
        let meta_b = v.key_metadata(&KeyId::from_pubkey(&b)).unwrap();
        assert_eq!(meta_a.hd_keypath.as_deref(), Some("m/0'/0'/0'"));
        assert_eq!(meta_b.hd_keypath.as_deref(), Some("m/0'/1'/0'"));
        assert_eq!(meta_a.seed_fp, meta_b.seed_fp);
        assert!(meta_a.master_fingerprint.is_some());
    }

    #[test]
    fn encryption_state_machine() {
        let mut rng = ChaChaRng::seed_from_u64(1);
        let mut v = populated(&mut rng);
        let key_id = *v.transparent_key_ids().next().unwrap();
        let before = v.transparent_secret(&key_id).unwrap();
        assert_eq!(v.state(), VaultState::Unencrypted);
        assert_matches!(v.lock(), Err(Error::NotEncrypted));

        v.encrypt(&pass("pw"), &mut rng).unwrap();
        assert_eq!(v.state(), VaultState::Locked);
        assert_matches!(v.transparent_secret(&key_id), Err(Error::Locked));
        assert_matches!(v.encrypt(&pass("pw"), &mut rng), Err(Error::AlreadyEncrypted));

        assert_matches!(v.unlock(&pass("nope")), Err(Error::IncorrectPassphrase));
        v.unlock(&pass("pw")).unwrap();
        assert_eq!(v.state(), VaultState::Unlocked);
        assert_eq!(v.transparent_secret(&key_id).unwrap(), before);

        v.lock().unwrap();
        assert!(v.is_locked());
        assert_matches!(
            v.generate_transparent_key(KeyChain::External, 2, &mut rng),
            Err(Error::Locked)
        );
    }

    #[test]
    fn change_passphrase_preserves_lock_state() {
        let mut rng = ChaChaRng::seed_from_u64(2);
        let mut v = populated(&mut rng);
        v.encrypt(&pass("old"), &mut rng).unwrap();
        v.change_passphrase(&pass("old"), &pass("new"), &mut rng)
            .unwrap();
        assert!(v.is_locked());
        assert_matches!(v.unlock(&pass("old")), Err(Error::IncorrectPassphrase));
        v.unlock(&pass("new")).unwrap();
    }

    #[test]
    fn keys_added_while_unlocked_are_encrypted() {
        let mut rng = ChaChaRng::seed_from_u64(3);
        let mut v = populated(&mut rng);
        v.encrypt(&pass("pw"), &mut rng).unwrap();
        v.unlock(&pass("pw")).unwrap();
        let pubkey = v
            .generate_transparent_key(KeyChain::External, 5, &mut rng)
            .unwrap();
        v.lock().unwrap();

        let key_id = KeyId::from_pubkey(&pubkey);
        let record = v
            .export_record(&crate::records::VaultRecordId::TransparentKey(key_id))
            .unwrap()
            .unwrap();
        // version, pubkey, then the custody tag: 1 means sealed.
        assert_eq!(record[34], 1);
    }

    #[test]
    fn records_roundtrip_through_export() {
        let mut rng = ChaChaRng::seed_from_u64(4);
        let mut v = populated(&mut rng);
        v.top_up_keypool(3, 9, &mut rng).unwrap();
        v.encrypt(&pass("pw"), &mut rng).unwrap();

        let mut restored = vault();
        for id in v.all_record_ids() {
            let bytes = v.export_record(&id).unwrap().unwrap();
            restored.load_record(&id, &bytes).unwrap();
        }
        assert_eq!(restored.state(), VaultState::Locked);
        assert_eq!(restored.keypool_available(KeyChain::External), 3);
        restored.unlock(&pass("pw")).unwrap();
        for key_id in v.transparent_key_ids() {
            assert!(restored.transparent_secret(key_id).is_ok());
        }
        assert_eq!(restored.hd_chain(), v.hd_chain());
    }

    #[test]
    fn keypool_reserve_tops_up_and_returns() {
        let mut rng = ChaChaRng::seed_from_u64(5);
        let mut v = populated(&mut rng);
        let reserved = v
            .reserve_key(KeyChain::Internal, 2, 0, &mut rng)
            .unwrap();
        assert_eq!(v.keypool_available(KeyChain::Internal), 1);
        v.return_key(reserved);
        assert_eq!(v.keypool_available(KeyChain::Internal), 2);

        v.encrypt(&pass("pw"), &mut rng).unwrap();
        // Drain the pool while locked.
        for _ in 0..2 {
            let k = v.reserve_key(KeyChain::Internal, 2, 0, &mut rng).unwrap();
            v.keep_key(k);
        }
        assert_matches!(
            v.reserve_key(KeyChain::Internal, 2, 0, &mut rng),
            Err(Error::KeypoolExhausted)
        );
    }

    #[test]
    fn sign_and_verify() {
        let mut rng = ChaChaRng::seed_from_u64(6);
        let mut v = populated(&mut rng);
        let key_id = *v.transparent_key_ids().next().unwrap();
        let pubkey = v.transparent_pubkey(&key_id).unwrap();
        let sig = v.sign_digest(&key_id, &[9u8; 32]).unwrap();
        assert!(v.verify_digest(&pubkey, &[9u8; 32], &sig));
        assert!(!v.verify_digest(&pubkey, &[8u8; 32], &sig));
    }

    #[test]
    fn private_keys_cannot_be_disabled_after_creation() {
        let mut rng = ChaChaRng::seed_from_u64(7);
        let mut v = populated(&mut rng);
        assert_matches!(v.disable_private_keys(), Err(Error::PrivateKeysPresent));

        let mut empty = vault();
        empty.disable_private_keys().unwrap();
        assert_matches!(
            empty.generate_sprout_key(0, &mut rng),
            Err(Error::PrivateKeysDisabled)
        );
    }

    #[test]
    fn sprout_nullifier_requires_unlocked_vault() {
        let mut rng = ChaChaRng::seed_from_u64(8);
        let mut v = populated(&mut rng);
        let addr = *v.sprout_viewing_keys().next().unwrap().0;
        let nf = v.sprout_nullifier(&addr, &[1; 32]).unwrap();
        v.encrypt(&pass("pw"), &mut rng).unwrap();
        assert_matches!(v.sprout_nullifier(&addr, &[1; 32]), Err(Error::Locked));
        v.unlock(&pass("pw")).unwrap();
        assert_eq!(v.sprout_nullifier(&addr, &[1; 32]).unwrap(), nf);
    }
}
