//! Detection of shielded notes addressed to the wallet's viewing keys.

use std::collections::BTreeMap;

use blake2b_simd::Params as Blake2bParams;
use byteorder::{ByteOrder, LittleEndian};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use sapling::note_encryption::{try_sapling_note_decryption, SaplingDomain, Zip212Enforcement};
use sha2::{Digest, Sha256};
use zcash_note_encryption::{EphemeralKeyBytes, ShieldedOutput, ENC_CIPHERTEXT_SIZE};
use zcash_wallet_keys::{sprout::SproutViewingKey, KeyVault};

use crate::ledger::{JsOutPoint, SaplingNoteData, SaplingOutPoint, SproutNoteData};
use crate::primitives::{transaction::OutputDescription, Transaction};

/// The length of a decrypted Sprout note plaintext.
pub const SPROUT_PLAINTEXT_SIZE: usize = 1 + 8 + 32 + 32 + 512;

const SPROUT_NOTE_LEAD_BYTE: u8 = 0x00;

/// Notes found in a single transaction.
#[derive(Clone, Debug, Default)]
pub struct DetectedNotes {
    pub sprout: BTreeMap<JsOutPoint, SproutNoteData>,
    pub sapling: BTreeMap<SaplingOutPoint, SaplingNoteData>,
}

impl DetectedNotes {
    pub fn is_empty(&self) -> bool {
        self.sprout.is_empty() && self.sapling.is_empty()
    }
}

/// Finds the notes in a transaction that the vault's viewing keys can decrypt.
pub trait NoteScanner {
    fn scan(&self, tx: &Transaction, vault: &KeyVault) -> DetectedNotes;
}

/// Trial-decrypts every shielded output against every viewing key in the vault.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultScanner;

impl NoteScanner for DefaultScanner {
    fn scan(&self, tx: &Transaction, vault: &KeyVault) -> DetectedNotes {
        let txid = tx.txid();
        let mut detected = DetectedNotes::default();

        if !tx.joinsplits.is_empty() {
            let viewing_keys = vault.sprout_viewing_keys().collect::<Vec<_>>();
            for (js_index, js) in tx.joinsplits.iter().enumerate() {
                let h_sig = h_sig(&js.random_seed, &js.nullifiers, &tx.joinsplit_pubkey);
                for n in 0..2u8 {
                    for (address, vk) in &viewing_keys {
                        let Some((value, rho, r)) = try_sprout_decryption(
                            vk,
                            &h_sig,
                            &js.ephemeral_key,
                            &js.ciphertexts[n as usize],
                            n,
                        ) else {
                            continue;
                        };
                        if sprout_commitment(vk.a_pk(), value, &rho, &r) != js.commitments[n as usize] {
                            continue;
                        }
                        detected.sprout.insert(
                            JsOutPoint::new(txid, js_index as u32, n),
                            SproutNoteData::new(**address, value, rho, r),
                        );
                        break;
                    }
                }
            }
        }

        if !tx.shielded_outputs.is_empty() {
            let keys = vault
                .sapling_viewing_keys()
                .map(|vk| (vk.tag(), vk.prepared_ivk()))
                .collect::<Vec<_>>();
            for (n, output) in tx.shielded_outputs.iter().enumerate() {
                let output = OutputRef(output);
                for (tag, ivk) in &keys {
                    if let Some((note, _, _)) =
                        try_sapling_note_decryption(ivk, &output, Zip212Enforcement::GracePeriod)
                    {
                        detected.sapling.insert(
                            SaplingOutPoint::new(txid, n as u32),
                            SaplingNoteData::from_note(*tag, &note),
                        );
                        break;
                    }
                }
            }
        }

        detected
    }
}

struct OutputRef<'a>(&'a OutputDescription);

impl ShieldedOutput<SaplingDomain, ENC_CIPHERTEXT_SIZE> for OutputRef<'_> {
    fn ephemeral_key(&self) -> EphemeralKeyBytes {
        EphemeralKeyBytes(self.0.ephemeral_key)
    }

    fn cmstar_bytes(&self) -> <SaplingDomain as zcash_note_encryption::Domain>::ExtractedCommitmentBytes {
        self.0.cmu
    }

    fn enc_ciphertext(&self) -> &[u8; ENC_CIPHERTEXT_SIZE] {
        &self.0.enc_ciphertext
    }
}

/// The JoinSplit signature hash binding a description to its transaction.
pub fn h_sig(random_seed: &[u8; 32], nullifiers: &[[u8; 32]; 2], joinsplit_pubkey: &[u8; 32]) -> [u8; 32] {
    let hash = Blake2bParams::new()
        .hash_length(32)
        .personal(b"ZcashComputehSig")
        .to_state()
        .update(random_seed)
        .update(&nullifiers[0])
        .update(&nullifiers[1])
        .update(joinsplit_pubkey)
        .finalize();
    let mut out = [0; 32];
    out.copy_from_slice(hash.as_bytes());
    out
}

/// Derives the symmetric key for output `n` of a JoinSplit.
pub fn sprout_kdf(h_sig: &[u8; 32], dh: &[u8; 32], epk: &[u8; 32], pk_enc: &[u8; 32], n: u8) -> [u8; 32] {
    let mut personal = [0u8; 16];
    personal[..8].copy_from_slice(b"ZcashKDF");
    personal[8] = n;

    let hash = Blake2bParams::new()
        .hash_length(32)
        .personal(&personal)
        .to_state()
        .update(h_sig)
        .update(dh)
        .update(epk)
        .update(pk_enc)
        .finalize();
    let mut out = [0; 32];
    out.copy_from_slice(hash.as_bytes());
    out
}

/// The commitment to a Sprout note.
pub fn sprout_commitment(a_pk: &[u8; 32], value: u64, rho: &[u8; 32], r: &[u8; 32]) -> [u8; 32] {
    let mut value_bytes = [0; 8];
    LittleEndian::write_u64(&mut value_bytes, value);
    Sha256::new()
        .chain_update([0xb0])
        .chain_update(a_pk)
        .chain_update(value_bytes)
        .chain_update(rho)
        .chain_update(r)
        .finalize()
        .into()
}

fn try_sprout_decryption(
    vk: &SproutViewingKey,
    h_sig: &[u8; 32],
    epk: &[u8; 32],
    ciphertext: &[u8],
    n: u8,
) -> Option<(u64, [u8; 32], [u8; 32])> {
    let dh = vk.shared_secret(epk);
    let pk_enc = vk.address().pk_enc;
    let key = sprout_kdf(h_sig, &dh, epk, &pk_enc, n);
    let plaintext = ChaCha20Poly1305::new(Key::from_slice(&key))
        .decrypt(Nonce::from_slice(&[0; 12]), ciphertext)
        .ok()?;
    if plaintext.len() != SPROUT_PLAINTEXT_SIZE || plaintext[0] != SPROUT_NOTE_LEAD_BYTE {
        return None;
    }
    let value = LittleEndian::read_u64(&plaintext[1..9]);
    let mut rho = [0; 32];
    rho.copy_from_slice(&plaintext[9..41]);
    let mut r = [0; 32];
    r.copy_from_slice(&plaintext[41..73]);
    Some((value, rho, r))
}

#[cfg(test)]
mod tests {
    use chacha20poly1305::{
        aead::{Aead, KeyInit},
        ChaCha20Poly1305, Key, Nonce,
    };
    use rand_chacha::ChaChaRng;
    use rand_core::SeedableRng;
    use x25519_dalek::{PublicKey, StaticSecret};
    use zcash_protocol::consensus::NetworkType;
    use zcash_wallet_keys::{sprout::SproutPaymentAddress, testing::seeded_vault};

    use super::{h_sig, sprout_commitment, sprout_kdf, DefaultScanner, NoteScanner};
    use crate::primitives::{transaction::JsDescription, Transaction};

    fn encrypt_to(
        address: &SproutPaymentAddress,
        tx: &Transaction,
        js: &mut JsDescription,
        n: u8,
        value: u64,
    ) {
        let esk = StaticSecret::from([42; 32]);
        let epk = PublicKey::from(&esk).to_bytes();
        let dh = esk
            .diffie_hellman(&PublicKey::from(address.pk_enc))
            .to_bytes();
        js.ephemeral_key = epk;
        let h_sig = h_sig(&js.random_seed, &js.nullifiers, &tx.joinsplit_pubkey);
        let key = sprout_kdf(&h_sig, &dh, &epk, &address.pk_enc, n);

        let rho = [n + 1; 32];
        let r = [n + 2; 32];
        let mut plaintext = vec![0x00];
        plaintext.extend_from_slice(&value.to_le_bytes());
        plaintext.extend_from_slice(&rho);
        plaintext.extend_from_slice(&r);
        plaintext.extend_from_slice(&[0; 512]);
        let ciphertext = ChaCha20Poly1305::new(Key::from_slice(&key))
            .encrypt(Nonce::from_slice(&[0; 12]), &plaintext[..])
            .unwrap();
        js.ciphertexts[n as usize].copy_from_slice(&ciphertext);
        js.commitments[n as usize] = sprout_commitment(&address.a_pk, value, &rho, &r);
    }

    #[test]
    fn detects_sprout_note() {
        let mut rng = ChaChaRng::seed_from_u64(0);
        let mut vault = seeded_vault(NetworkType::Test, 3, &mut rng);
        let address = vault.generate_sprout_key(0, &mut rng).unwrap();

        let mut tx = Transaction {
            joinsplit_pubkey: [5; 32],
            ..Default::default()
        };
        let mut js = JsDescription::default();
        js.random_seed = [6; 32];
        js.nullifiers = [[7; 32], [8; 32]];
        encrypt_to(&address, &tx, &mut js, 1, 12_345);
        tx.joinsplits.push(js);

        let detected = DefaultScanner.scan(&tx, &vault);
        assert_eq!(detected.sprout.len(), 1);
        let (op, note) = detected.sprout.iter().next().unwrap();
        assert_eq!(op.js, 0);
        assert_eq!(op.n, 1);
        assert_eq!(note.value, 12_345);
        assert_eq!(note.address, address);
        assert!(detected.sapling.is_empty());
    }

    #[test]
    fn ignores_foreign_note() {
        let mut rng = ChaChaRng::seed_from_u64(1);
        let mut vault = seeded_vault(NetworkType::Test, 3, &mut rng);
        vault.generate_sprout_key(0, &mut rng).unwrap();

        let mut other = seeded_vault(NetworkType::Test, 4, &mut rng);
        let foreign = other.generate_sprout_key(0, &mut rng).unwrap();

        let mut tx = Transaction::default();
        let mut js = JsDescription::default();
        encrypt_to(&foreign, &tx, &mut js, 0, 99);
        tx.joinsplits.push(js);

        assert!(DefaultScanner.scan(&tx, &vault).is_empty());
        assert_eq!(DefaultScanner.scan(&tx, &other).sprout.len(), 1);
    }
}
