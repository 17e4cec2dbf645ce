//! Hierarchical deterministic derivation.
//!
//! Transparent keys follow the fixed hardened scheme `m/0'/<chain>'/<index>'`, where
//! chain `0'` issues receiving keys and chain `1'` issues change keys. Sapling keys are
//! derived from a separate seed along the ZIP 32 path `m/32'/<coin_type>'/<account>'`.

use std::io::{self, Read, Write};

use bip0039::{English, Mnemonic};
use bip32::{ChildNumber, ExtendedPrivateKey};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand_core::{CryptoRng, RngCore};
use sapling::zip32::ExtendedSpendingKey;
use secrecy::{ExposeSecret, SecretString, SecretVec};
use zcash_protocol::consensus::NetworkConstants;
use zip32::{fingerprint::SeedFingerprint, AccountId, ChildIndex};

use crate::error::{Error, Result};
use crate::transparent::{hash160, KeyChain};

const HD_CHAIN_VERSION: u8 = 2;

/// The length of freshly generated seeds.
pub const SEED_LENGTH: usize = 32;

/// Seed material from which a derivation tree is rooted.
pub struct HdSeed(SecretVec<u8>);

impl HdSeed {
    /// Wraps existing seed bytes.
    ///
    /// Seeds must be between 32 and 252 bytes long, the range accepted by ZIP 32 seed
    /// fingerprinting.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if !(32..=252).contains(&bytes.len()) {
            return Err(Error::Derivation(format!(
                "seed length {} is outside the range 32..=252",
                bytes.len()
            )));
        }
        Ok(HdSeed(SecretVec::new(bytes)))
    }

    /// Samples a fresh random seed.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = vec![0u8; SEED_LENGTH];
        rng.fill_bytes(&mut bytes);
        HdSeed(SecretVec::new(bytes))
    }

    /// Generates a new BIP 39 mnemonic and the seed it encodes.
    pub fn generate_mnemonic<R: RngCore + CryptoRng>(rng: &mut R) -> (SecretString, Self) {
        let mut entropy = vec![0u8; 32];
        loop {
            rng.fill_bytes(&mut entropy);
            // 32 bytes is a valid BIP 39 entropy length, so this only fails on
            // pathological randomness.
            if let Ok(mnemonic) = Mnemonic::<English>::from_entropy(entropy.clone()) {
                let seed = mnemonic.to_seed("");
                let phrase = SecretString::new(mnemonic.phrase().to_owned());
                return (phrase, HdSeed(SecretVec::new(seed.to_vec())));
            }
        }
    }

    /// Recovers the seed encoded by a BIP 39 mnemonic phrase.
    pub fn from_mnemonic(phrase: &SecretString) -> Result<Self> {
        let mnemonic = Mnemonic::<English>::from_phrase(phrase.expose_secret().trim())
            .map_err(|e| Error::Mnemonic(e.to_string()))?;
        Ok(HdSeed(SecretVec::new(mnemonic.to_seed("").to_vec())))
    }

    pub fn expose(&self) -> &[u8] {
        self.0.expose_secret()
    }

    /// The ZIP 32 seed fingerprint, used to link derived keys back to their seed.
    pub fn fingerprint(&self) -> Result<[u8; 32]> {
        SeedFingerprint::from_seed(self.expose())
            .map(|fp| fp.to_bytes())
            .ok_or_else(|| Error::Derivation("seed cannot be fingerprinted".to_owned()))
    }
}

impl Clone for HdSeed {
    fn clone(&self) -> Self {
        HdSeed(SecretVec::new(self.expose().to_vec()))
    }
}

impl std::fmt::Debug for HdSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HdSeed(..)")
    }
}

/// A transparent key derived from an [`HdSeed`], with its provenance.
pub struct DerivedKey {
    pub secret: secp256k1::SecretKey,
    pub keypath: String,
    pub master_fingerprint: [u8; 4],
}

fn master_key(seed: &HdSeed) -> Result<ExtendedPrivateKey<secp256k1::SecretKey>> {
    Ok(ExtendedPrivateKey::new(seed.expose())?)
}

/// The first four bytes of the HASH160 of the master public key for `seed`.
pub fn master_fingerprint<C: secp256k1::Signing>(
    secp: &secp256k1::Secp256k1<C>,
    seed: &HdSeed,
) -> Result<[u8; 4]> {
    let master = master_key(seed)?;
    let pubkey = secp256k1::PublicKey::from_secret_key(secp, master.private_key());
    let mut fp = [0u8; 4];
    fp.copy_from_slice(&hash160(&pubkey.serialize())[..4]);
    Ok(fp)
}

/// Derives the transparent key at `m/0'/<chain>'/<index>'`.
pub fn derive_transparent<C: secp256k1::Signing>(
    secp: &secp256k1::Secp256k1<C>,
    seed: &HdSeed,
    chain: KeyChain,
    index: u32,
) -> Result<DerivedKey> {
    let master_fingerprint = master_fingerprint(secp, seed)?;
    let secret = master_key(seed)?
        .derive_child(ChildNumber::new(0, true)?)?
        .derive_child(ChildNumber::new(chain.index(), true)?)?
        .derive_child(ChildNumber::new(index, true)?)
        .map(|k| *k.private_key())?;

    Ok(DerivedKey {
        secret,
        keypath: format!("m/0'/{}'/{}'", chain.index(), index),
        master_fingerprint,
    })
}

/// Derives the Sapling extended spending key at `m/32'/<coin_type>'/<account>'`.
pub fn derive_sapling<N: NetworkConstants>(
    network: &N,
    seed: &HdSeed,
    account: u32,
) -> Result<(ExtendedSpendingKey, String)> {
    let account = AccountId::try_from(account)
        .map_err(|_| Error::Derivation(format!("invalid account index {}", account)))?;
    let extsk = ExtendedSpendingKey::from_path(
        &ExtendedSpendingKey::master(seed.expose()),
        &[
            ChildIndex::hardened(32),
            ChildIndex::hardened(network.coin_type()),
            account.into(),
        ],
    );
    let keypath = format!("m/32'/{}'/{}'", network.coin_type(), u32::from(account));
    Ok((extsk, keypath))
}

/// Counters tracking how far each derivation chain has been walked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HdChain {
    /// Fingerprint of the transparent seed.
    pub seed_fp: [u8; 32],
    pub external_counter: u32,
    pub internal_counter: u32,
    /// Fingerprint of the shielded seed, once one has been set.
    pub shielded_seed_fp: Option<[u8; 32]>,
    pub sapling_account_counter: u32,
}

impl HdChain {
    pub fn new(seed_fp: [u8; 32]) -> Self {
        HdChain {
            seed_fp,
            external_counter: 0,
            internal_counter: 0,
            shielded_seed_fp: None,
            sapling_account_counter: 0,
        }
    }

    /// Returns the next unused index on `chain`, advancing the counter.
    pub fn next_index(&mut self, chain: KeyChain) -> Result<u32> {
        let counter = match chain {
            KeyChain::External => &mut self.external_counter,
            KeyChain::Internal => &mut self.internal_counter,
        };
        if *counter >= (1 << 31) {
            return Err(Error::Derivation("HD chain exhausted".to_owned()));
        }
        let index = *counter;
        *counter += 1;
        Ok(index)
    }

    pub fn next_sapling_account(&mut self) -> Result<u32> {
        if self.sapling_account_counter >= (1 << 31) {
            return Err(Error::Derivation("Sapling account space exhausted".to_owned()));
        }
        let account = self.sapling_account_counter;
        self.sapling_account_counter += 1;
        Ok(account)
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let version = reader.read_u8()?;
        let mut seed_fp = [0u8; 32];
        reader.read_exact(&mut seed_fp)?;
        let external_counter = reader.read_u32::<LittleEndian>()?;
        let internal_counter = if version >= 2 {
            reader.read_u32::<LittleEndian>()?
        } else {
            0
        };
        let (shielded_seed_fp, sapling_account_counter) = if version >= 2 {
            let fp = match reader.read_u8()? {
                0 => None,
                _ => {
                    let mut fp = [0u8; 32];
                    reader.read_exact(&mut fp)?;
                    Some(fp)
                }
            };
            (fp, reader.read_u32::<LittleEndian>()?)
        } else {
            (None, 0)
        };
        Ok(HdChain {
            seed_fp,
            external_counter,
            internal_counter,
            shielded_seed_fp,
            sapling_account_counter,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(HD_CHAIN_VERSION)?;
        writer.write_all(&self.seed_fp)?;
        writer.write_u32::<LittleEndian>(self.external_counter)?;
        writer.write_u32::<LittleEndian>(self.internal_counter)?;
        match &self.shielded_seed_fp {
            Some(fp) => {
                writer.write_u8(1)?;
                writer.write_all(fp)?;
            }
            None => writer.write_u8(0)?,
        }
        writer.write_u32::<LittleEndian>(self.sapling_account_counter)
    }
}

#[cfg(test)]
mod tests {
    use zcash_protocol::consensus::NetworkType;

    use super::{derive_sapling, derive_transparent, HdChain, HdSeed};
    use crate::transparent::KeyChain;

    fn seed() -> HdSeed {
        HdSeed::from_bytes((0u8..32).collect()).unwrap()
    }

    #[test]
    fn short_seeds_are_rejected() {
        assert!(HdSeed::from_bytes(vec![0u8; 16]).is_err());
    }

    #[test]
    fn transparent_chains_are_distinct() {
        let secp = secp256k1::Secp256k1::new();
        let external = derive_transparent(&secp, &seed(), KeyChain::External, 0).unwrap();
        let internal = derive_transparent(&secp, &seed(), KeyChain::Internal, 0).unwrap();
        let again = derive_transparent(&secp, &seed(), KeyChain::External, 0).unwrap();

        assert_eq!(external.keypath, "m/0'/0'/0'");
        assert_eq!(internal.keypath, "m/0'/1'/0'");
        assert_eq!(external.secret, again.secret);
        assert_ne!(external.secret, internal.secret);
        assert_eq!(external.master_fingerprint, internal.master_fingerprint);
    }

    #[test]
    fn sapling_accounts_are_distinct() {
        let (a0, path0) = derive_sapling(&NetworkType::Test, &seed(), 0).unwrap();
        let (a1, _) = derive_sapling(&NetworkType::Test, &seed(), 1).unwrap();
        assert_eq!(path0, "m/32'/1'/0'");
        assert_ne!(a0.to_bytes(), a1.to_bytes());
    }

    #[test]
    fn hd_chain_counters_advance() {
        let mut chain = HdChain::new([1; 32]);
        assert_eq!(chain.next_index(KeyChain::External).unwrap(), 0);
        assert_eq!(chain.next_index(KeyChain::External).unwrap(), 1);
        assert_eq!(chain.next_index(KeyChain::Internal).unwrap(), 0);
        assert_eq!(chain.next_sapling_account().unwrap(), 0);

        let mut bytes = vec![];
        chain.write(&mut bytes).unwrap();
        assert_eq!(HdChain::read(&bytes[..]).unwrap(), chain);
    }

    #[test]
    fn mnemonic_roundtrip() {
        use rand_core::SeedableRng;
        let mut rng = rand_chacha::ChaChaRng::seed_from_u64(5);
        let (phrase, seed) = HdSeed::generate_mnemonic(&mut rng);
        let recovered = HdSeed::from_mnemonic(&phrase).unwrap();
        assert_eq!(seed.expose(), recovered.expose());
        assert_eq!(seed.expose().len(), 64);
    }
}
