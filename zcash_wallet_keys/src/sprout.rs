//! Sprout key components.
//!
//! A Sprout spending key `a_sk` is a 252-bit string. The paying key, the transmission
//! key and note nullifiers are all derived from it with pseudo-random functions built
//! on the SHA-256 compression function, as defined in section 5.4.2 of the protocol
//! specification.

use std::cmp::Ordering;
use std::fmt;

use rand_core::{CryptoRng, RngCore};
use sha2::digest::generic_array::GenericArray;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// The SHA-256 compression function applied to a single 512-bit block, without padding.
pub fn sha256_compress(block: &[u8; 64]) -> [u8; 32] {
    let mut state = SHA256_IV;
    sha2::compress256(&mut state, &[*GenericArray::from_slice(block)]);

    let mut out = [0u8; 32];
    for (chunk, word) in out.chunks_exact_mut(4).zip(state.iter()) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    out
}

/// `PRF^addr_{a_sk}(t)`.
fn prf_addr(a_sk: &[u8; 32], t: u8) -> [u8; 32] {
    let mut block = [0u8; 64];
    block[..32].copy_from_slice(a_sk);
    block[0] |= 0b1100_0000;
    block[32] = t;
    sha256_compress(&block)
}

/// `PRF^nf_{a_sk}(rho)`.
fn prf_nf(a_sk: &[u8; 32], rho: &[u8; 32]) -> [u8; 32] {
    let mut block = [0u8; 64];
    block[..32].copy_from_slice(a_sk);
    block[0] |= 0b1110_0000;
    block[32..].copy_from_slice(rho);
    sha256_compress(&block)
}

fn clamp_curve25519(mut key: [u8; 32]) -> [u8; 32] {
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
    key
}

/// A Sprout spending key `a_sk`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SproutSpendingKey([u8; 32]);

impl SproutSpendingKey {
    /// Samples a fresh spending key.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        bytes[0] &= 0x0f;
        SproutSpendingKey(bytes)
    }

    /// Parses a spending key, rejecting encodings with any of the top four bits set.
    pub fn from_bytes(bytes: [u8; 32]) -> Option<Self> {
        ((bytes[0] & 0xf0) == 0).then_some(SproutSpendingKey(bytes))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn viewing_key(&self) -> SproutViewingKey {
        SproutViewingKey {
            a_pk: prf_addr(&self.0, 0),
            sk_enc: clamp_curve25519(prf_addr(&self.0, 1)),
        }
    }

    pub fn address(&self) -> SproutPaymentAddress {
        self.viewing_key().address()
    }

    /// The nullifier revealed when spending a note with the given `rho`.
    pub fn nullifier(&self, rho: &[u8; 32]) -> [u8; 32] {
        prf_nf(&self.0, rho)
    }
}

impl fmt::Debug for SproutSpendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SproutSpendingKey(..)")
    }
}

/// A Sprout incoming viewing key: the paying key together with the receiving key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SproutViewingKey {
    a_pk: [u8; 32],
    sk_enc: [u8; 32],
}

impl SproutViewingKey {
    pub fn from_parts(a_pk: [u8; 32], sk_enc: [u8; 32]) -> Self {
        SproutViewingKey {
            a_pk,
            sk_enc: clamp_curve25519(sk_enc),
        }
    }

    pub fn address(&self) -> SproutPaymentAddress {
        let pk_enc = PublicKey::from(&StaticSecret::from(self.sk_enc));
        SproutPaymentAddress {
            a_pk: self.a_pk,
            pk_enc: pk_enc.to_bytes(),
        }
    }

    pub fn a_pk(&self) -> &[u8; 32] {
        &self.a_pk
    }

    pub fn sk_enc(&self) -> &[u8; 32] {
        &self.sk_enc
    }

    /// The X25519 shared secret between this key and an ephemeral public key.
    pub fn shared_secret(&self, epk: &[u8; 32]) -> [u8; 32] {
        StaticSecret::from(self.sk_enc)
            .diffie_hellman(&PublicKey::from(*epk))
            .to_bytes()
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.a_pk);
        out[32..].copy_from_slice(&self.sk_enc);
        out
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        let mut a_pk = [0u8; 32];
        let mut sk_enc = [0u8; 32];
        a_pk.copy_from_slice(&bytes[..32]);
        sk_enc.copy_from_slice(&bytes[32..]);
        SproutViewingKey::from_parts(a_pk, sk_enc)
    }
}

impl fmt::Debug for SproutViewingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SproutViewingKey")
            .field("a_pk", &hex::encode(self.a_pk))
            .finish_non_exhaustive()
    }
}

/// A Sprout shielded payment address `(a_pk, pk_enc)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SproutPaymentAddress {
    pub a_pk: [u8; 32],
    pub pk_enc: [u8; 32],
}

impl SproutPaymentAddress {
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.a_pk);
        out[32..].copy_from_slice(&self.pk_enc);
        out
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        let mut a_pk = [0u8; 32];
        let mut pk_enc = [0u8; 32];
        a_pk.copy_from_slice(&bytes[..32]);
        pk_enc.copy_from_slice(&bytes[32..]);
        SproutPaymentAddress { a_pk, pk_enc }
    }
}

impl PartialOrd for SproutPaymentAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SproutPaymentAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.a_pk
            .cmp(&other.a_pk)
            .then_with(|| self.pk_enc.cmp(&other.pk_enc))
    }
}

impl fmt::Debug for SproutPaymentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SproutPaymentAddress")
            .field("a_pk", &hex::encode(self.a_pk))
            .field("pk_enc", &hex::encode(self.pk_enc))
            .finish()
    }
}

impl fmt::Display for SproutPaymentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.a_pk[..8]))
    }
}
