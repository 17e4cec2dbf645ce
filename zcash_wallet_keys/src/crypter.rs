//! Passphrase stretching and authenticated encryption of key material.
//!
//! Every secret held by an encrypted vault is sealed with ChaCha20-Poly1305 under a
//! random 32-byte master key. The master key itself is sealed under a key stretched
//! from the user's passphrase by iterated SHA-512, in the manner of OpenSSL's
//! `EVP_BytesToKey`. The iteration count is calibrated when the passphrase is set so
//! that stretching takes roughly [`KdfCalibration::target`] on the current machine,
//! and is then persisted alongside the wrapped master key.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand_core::{CryptoRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha512};
use zcash_encoding::Vector;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

pub const WALLET_CRYPTO_KEY_SIZE: usize = 32;
pub const WALLET_CRYPTO_SALT_SIZE: usize = 8;
pub const WALLET_CRYPTO_NONCE_SIZE: usize = 12;

/// The lower bound applied to calibrated iteration counts.
pub const MIN_DERIVE_ITERATIONS: u32 = 25_000;

const MASTER_KEY_RECORD_VERSION: u8 = 1;
const CRYPTED_SECRET_VERSION: u8 = 1;

/// An unwrapped symmetric key. Zeroed on drop.
pub type KeyingMaterial = Zeroizing<[u8; WALLET_CRYPTO_KEY_SIZE]>;

/// The passphrase stretching function used by a [`MasterKeyRecord`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DerivationMethod {
    /// `EVP_BytesToKey`-style iterated SHA-512.
    Sha512Iterated,
}

impl DerivationMethod {
    fn code(self) -> u32 {
        match self {
            DerivationMethod::Sha512Iterated => 0,
        }
    }

    fn from_code(code: u32) -> io::Result<Self> {
        match code {
            0 => Ok(DerivationMethod::Sha512Iterated),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown key derivation method {}", other),
            )),
        }
    }
}

/// Controls how many stretching iterations are used when a passphrase is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KdfCalibration {
    /// Measure the local machine and pick an iteration count that costs about `target`.
    Calibrate { target: Duration },
    /// Use exactly this many iterations.
    Fixed(u32),
}

impl KdfCalibration {
    /// The wall-clock cost aimed for when calibrating.
    pub fn target(&self) -> Option<Duration> {
        match self {
            KdfCalibration::Calibrate { target } => Some(*target),
            KdfCalibration::Fixed(_) => None,
        }
    }
}

impl Default for KdfCalibration {
    fn default() -> Self {
        KdfCalibration::Calibrate {
            target: Duration::from_millis(100),
        }
    }
}

/// Stretches `passphrase` with `salt` into a wrapping key.
pub fn stretch_passphrase(
    passphrase: &SecretString,
    salt: &[u8; WALLET_CRYPTO_SALT_SIZE],
    iterations: u32,
) -> KeyingMaterial {
    let mut hasher = Sha512::new();
    hasher.update(passphrase.expose_secret().as_bytes());
    hasher.update(salt);
    let mut digest = Zeroizing::new([0u8; 64]);
    digest.copy_from_slice(&hasher.finalize());
    for _ in 1..iterations.max(1) {
        let next = Sha512::digest(&digest[..]);
        digest.copy_from_slice(&next);
    }

    let mut key = Zeroizing::new([0u8; WALLET_CRYPTO_KEY_SIZE]);
    key.copy_from_slice(&digest[..WALLET_CRYPTO_KEY_SIZE]);
    key
}

/// Picks an iteration count so that [`stretch_passphrase`] costs roughly `target`.
///
/// Two measurements are taken and averaged; the result never drops below
/// [`MIN_DERIVE_ITERATIONS`].
pub fn calibrate_iterations(
    passphrase: &SecretString,
    salt: &[u8; WALLET_CRYPTO_SALT_SIZE],
    target: Duration,
) -> u32 {
    let target_ms = target.as_secs_f64() * 1000.0;
    let elapsed_ms = |iterations: u32| {
        let start = Instant::now();
        let _ = stretch_passphrase(passphrase, salt, iterations);
        (start.elapsed().as_secs_f64() * 1000.0).max(1.0)
    };

    let trial = MIN_DERIVE_ITERATIONS;
    let first = (f64::from(trial) * target_ms / elapsed_ms(trial)) as u32;
    let first = first.max(MIN_DERIVE_ITERATIONS);
    let second = (f64::from(first) * target_ms / elapsed_ms(first)) as u32;

    ((u64::from(first) + u64::from(second)) / 2)
        .try_into()
        .unwrap_or(u32::MAX)
        .max(MIN_DERIVE_ITERATIONS)
}

/// A secret sealed under some symmetric key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CryptedSecret {
    nonce: [u8; WALLET_CRYPTO_NONCE_SIZE],
    ciphertext: Vec<u8>,
}

impl CryptedSecret {
    /// Seals `plaintext`, binding it to `aad` (typically the public identifier of the
    /// key being protected, so that ciphertexts cannot be swapped between entries).
    pub fn seal<R: RngCore + CryptoRng>(
        key: &[u8; WALLET_CRYPTO_KEY_SIZE],
        aad: &[u8],
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<Self> {
        let mut nonce = [0u8; WALLET_CRYPTO_NONCE_SIZE];
        rng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| Error::Crypto)?;
        Ok(CryptedSecret { nonce, ciphertext })
    }

    /// Opens the sealed secret. Fails if the key or the associated data are wrong.
    pub fn open(
        &self,
        key: &[u8; WALLET_CRYPTO_KEY_SIZE],
        aad: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt(
                Nonce::from_slice(&self.nonce),
                Payload {
                    msg: &self.ciphertext,
                    aad,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| Error::Crypto)
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let version = reader.read_u8()?;
        if version != CRYPTED_SECRET_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported crypted secret version {}", version),
            ));
        }
        let mut nonce = [0u8; WALLET_CRYPTO_NONCE_SIZE];
        reader.read_exact(&mut nonce)?;
        let ciphertext = Vector::read(&mut reader, |r| r.read_u8())?;
        Ok(CryptedSecret { nonce, ciphertext })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(CRYPTED_SECRET_VERSION)?;
        writer.write_all(&self.nonce)?;
        Vector::write(&mut writer, &self.ciphertext, |w, b| w.write_u8(*b))
    }
}

/// A master key wrapped under a passphrase-derived key, together with the parameters
/// needed to re-derive that key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterKeyRecord {
    sealed: CryptedSecret,
    salt: [u8; WALLET_CRYPTO_SALT_SIZE],
    method: DerivationMethod,
    iterations: u32,
}

impl MasterKeyRecord {
    /// Wraps `master` under `passphrase`, calibrating the iteration count as requested.
    pub fn wrap<R: RngCore + CryptoRng>(
        master: &[u8; WALLET_CRYPTO_KEY_SIZE],
        passphrase: &SecretString,
        calibration: KdfCalibration,
        rng: &mut R,
    ) -> Result<Self> {
        let mut salt = [0u8; WALLET_CRYPTO_SALT_SIZE];
        rng.fill_bytes(&mut salt);
        let iterations = match calibration {
            KdfCalibration::Calibrate { target } => calibrate_iterations(passphrase, &salt, target),
            KdfCalibration::Fixed(n) => n.max(1),
        };
        let wrapping_key = stretch_passphrase(passphrase, &salt, iterations);
        let sealed = CryptedSecret::seal(&wrapping_key, &salt, master, rng)?;

        Ok(MasterKeyRecord {
            sealed,
            salt,
            method: DerivationMethod::Sha512Iterated,
            iterations,
        })
    }

    /// Recovers the master key. Any failure is reported as an incorrect passphrase.
    pub fn unwrap_key(&self, passphrase: &SecretString) -> Result<KeyingMaterial> {
        let wrapping_key = match self.method {
            DerivationMethod::Sha512Iterated => {
                stretch_passphrase(passphrase, &self.salt, self.iterations)
            }
        };
        let plaintext = self
            .sealed
            .open(&wrapping_key, &self.salt)
            .map_err(|_| Error::IncorrectPassphrase)?;
        if plaintext.len() != WALLET_CRYPTO_KEY_SIZE {
            return Err(Error::Corrupted("master key has the wrong length".to_owned()));
        }
        let mut master = Zeroizing::new([0u8; WALLET_CRYPTO_KEY_SIZE]);
        master.copy_from_slice(&plaintext);
        Ok(master)
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn method(&self) -> DerivationMethod {
        self.method
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let version = reader.read_u8()?;
        if version != MASTER_KEY_RECORD_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported master key record version {}", version),
            ));
        }
        let sealed = CryptedSecret::read(&mut reader)?;
        let mut salt = [0u8; WALLET_CRYPTO_SALT_SIZE];
        reader.read_exact(&mut salt)?;
        let method = DerivationMethod::from_code(reader.read_u32::<LittleEndian>()?)?;
        let iterations = reader.read_u32::<LittleEndian>()?;
        Ok(MasterKeyRecord {
            sealed,
            salt,
            method,
            iterations,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(MASTER_KEY_RECORD_VERSION)?;
        self.sealed.write(&mut writer)?;
        writer.write_all(&self.salt)?;
        writer.write_u32::<LittleEndian>(self.method.code())?;
        writer.write_u32::<LittleEndian>(self.iterations)
    }
}
