//! Seams for producing signatures, proofs and for handing transactions to the network.

use sha2::{Digest, Sha256};
use zcash_protocol::value::Zatoshis;
use zcash_wallet_keys::{transparent::KeyId, KeyVault};

use crate::primitives::{
    transaction::{OutputDescription, SpendDescription},
    Script, Transaction, TransparentAddress, TxOut,
};
use crate::selection::SigningFailure;
use crate::tree::SaplingWitness;

/// The only signature hash type the wallet produces.
pub const SIGHASH_ALL: u8 = 0x01;

/// The length of a DER signature with its hash type byte, at most.
pub const MAX_SIGNATURE_SIZE: usize = 72;

/// Computes the digest a transparent input's signature commits to.
pub trait SignatureHasher {
    fn signature_hash(
        &self,
        tx: &Transaction,
        input: usize,
        script_code: &Script,
        amount: Zatoshis,
    ) -> [u8; 32];
}

/// `SIGHASH_ALL` over the transaction with every script_sig cleared except the signed
/// input's, which is replaced by its script code.
#[derive(Clone, Copy, Debug, Default)]
pub struct LegacySighash;

impl SignatureHasher for LegacySighash {
    fn signature_hash(
        &self,
        tx: &Transaction,
        input: usize,
        script_code: &Script,
        _amount: Zatoshis,
    ) -> [u8; 32] {
        let mut copy = tx.clone();
        for (i, txin) in copy.vin.iter_mut().enumerate() {
            txin.script_sig = if i == input {
                script_code.clone()
            } else {
                Script::default()
            };
        }
        let mut preimage = copy.to_bytes();
        preimage.extend_from_slice(&u32::from(SIGHASH_ALL).to_le_bytes());
        Sha256::digest(Sha256::digest(&preimage)).into()
    }
}

/// Produces the script_sig for a transparent input.
pub trait TransactionSigner {
    fn sign_input(
        &self,
        tx: &Transaction,
        input: usize,
        prev: &TxOut,
    ) -> Result<Script, SigningFailure>;
}

/// Signs P2PKH inputs with keys held by a [`KeyVault`].
pub struct VaultSigner<'a, H> {
    vault: &'a KeyVault,
    hasher: H,
}

impl<'a, H: SignatureHasher> VaultSigner<'a, H> {
    pub fn new(vault: &'a KeyVault, hasher: H) -> Self {
        VaultSigner { vault, hasher }
    }
}

impl<H: SignatureHasher> TransactionSigner for VaultSigner<'_, H> {
    fn sign_input(
        &self,
        tx: &Transaction,
        input: usize,
        prev: &TxOut,
    ) -> Result<Script, SigningFailure> {
        let Some(TransparentAddress::PublicKeyHash(hash)) = prev.script_pubkey.address() else {
            return Err(SigningFailure::UnsupportedScript(format!(
                "{:?}",
                prev.script_pubkey
            )));
        };
        let key_id = KeyId::from_bytes(hash);
        let pubkey = self
            .vault
            .transparent_pubkey(&key_id)
            .ok_or_else(|| SigningFailure::MissingKey(key_id.to_string()))?;
        let digest = self
            .hasher
            .signature_hash(tx, input, &prev.script_pubkey, prev.value);
        let mut sig = self.vault.sign_digest(&key_id, &digest)?;
        sig.push(SIGHASH_ALL);
        Ok(Script::default()
            .push_data(&sig)
            .push_data(&pubkey.serialize()))
    }
}

/// Produces maximum-size placeholder signatures, for estimating transaction size.
#[derive(Clone, Copy, Debug, Default)]
pub struct DummySigner;

impl TransactionSigner for DummySigner {
    fn sign_input(&self, _: &Transaction, _: usize, _: &TxOut) -> Result<Script, SigningFailure> {
        Ok(Script::default()
            .push_data(&[0; MAX_SIGNATURE_SIZE])
            .push_data(&[0; 33]))
    }
}

/// Everything needed to prove a Sapling spend.
pub struct SaplingSpend<'a> {
    pub extsk: sapling::zip32::ExtendedSpendingKey,
    pub note: sapling::Note,
    pub witness: &'a SaplingWitness,
    pub anchor: [u8; 32],
    pub nullifier: [u8; 32],
}

/// A Sapling output to be created.
#[derive(Clone, Debug)]
pub struct SaplingOutput {
    pub to: sapling::PaymentAddress,
    pub value: u64,
    pub rseed: [u8; 32],
    pub memo: [u8; 512],
}

impl SaplingOutput {
    pub fn note(&self) -> sapling::Note {
        self.to.create_note(
            sapling::value::NoteValue::from_raw(self.value),
            sapling::Rseed::AfterZip212(self.rseed),
        )
    }
}

/// Creates the zero-knowledge parts of Sapling spends and outputs.
pub trait ShieldedProver {
    fn prove_spend(&self, spend: &SaplingSpend<'_>) -> Result<SpendDescription, SigningFailure>;

    fn prove_output(&self, output: &SaplingOutput) -> Result<OutputDescription, SigningFailure>;

    /// Computes the binding signature over `sighash` for the completed transaction.
    fn binding_signature(
        &self,
        tx: &Transaction,
        sighash: &[u8; 32],
    ) -> Result<[u8; 64], SigningFailure>;
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("Transaction rejected: {0}")]
pub struct BroadcastError(pub String);

/// Submits transactions to the node's mempool and relays them.
pub trait Broadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<(), BroadcastError>;
}

/// The digest signed by the Sapling binding and spend authorization signatures.
pub fn shielded_sighash(tx: &Transaction) -> [u8; 32] {
    let mut copy = tx.clone();
    for txin in copy.vin.iter_mut() {
        txin.script_sig = Script::default();
    }
    for spend in copy.shielded_spends.iter_mut() {
        spend.spend_auth_sig = [0; 64];
    }
    copy.binding_sig = [0; 64];
    Sha256::digest(Sha256::digest(copy.to_bytes())).into()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rand_chacha::ChaChaRng;
    use rand_core::SeedableRng;
    use secrecy::SecretString;
    use zcash_protocol::{consensus::NetworkType, value::Zatoshis, TxId};
    use zcash_wallet_keys::{
        testing::seeded_vault,
        transparent::{KeyChain, KeyId},
    };

    use super::{DummySigner, LegacySighash, SignatureHasher, TransactionSigner, VaultSigner};
    use crate::primitives::{OutPoint, Script, Transaction, TxIn, TxOut};
    use crate::selection::{SigningFailure, P2PKH_INPUT_SIZE};

    fn spend(prev: &TxOut) -> Transaction {
        Transaction {
            vin: vec![TxIn::new(OutPoint::new(TxId::from_bytes([1; 32]), 0))],
            vout: vec![prev.clone()],
            ..Default::default()
        }
    }

    #[test]
    fn vault_signature_verifies() {
        let mut rng = ChaChaRng::seed_from_u64(0);
        let mut vault = seeded_vault(NetworkType::Test, 2, &mut rng);
        let pubkey = vault
            .generate_transparent_key(KeyChain::External, 0, &mut rng)
            .unwrap();
        let prev = TxOut::new(
            Zatoshis::const_from_u64(5000),
            Script::p2pkh(KeyId::from_pubkey(&pubkey).as_bytes()),
        );
        let tx = spend(&prev);

        let script_sig = VaultSigner::new(&vault, LegacySighash)
            .sign_input(&tx, 0, &prev)
            .unwrap();
        let sig_len = script_sig.0[0] as usize;
        let der = &script_sig.0[1..sig_len];
        assert_eq!(script_sig.0[sig_len], 0x01);
        assert_eq!(&script_sig.0[sig_len + 2..], &pubkey.serialize()[..]);

        let digest = LegacySighash.signature_hash(&tx, 0, &prev.script_pubkey, prev.value);
        assert!(vault.verify_digest(&pubkey, &digest, der));
    }

    #[test]
    fn locked_vault_cannot_sign() {
        let mut rng = ChaChaRng::seed_from_u64(1);
        let mut vault = seeded_vault(NetworkType::Test, 2, &mut rng);
        let pubkey = vault
            .generate_transparent_key(KeyChain::External, 0, &mut rng)
            .unwrap();
        vault
            .encrypt(&SecretString::new("hunter2".into()), &mut rng)
            .unwrap();
        let prev = TxOut::new(
            Zatoshis::const_from_u64(5000),
            Script::p2pkh(KeyId::from_pubkey(&pubkey).as_bytes()),
        );
        assert_matches!(
            VaultSigner::new(&vault, LegacySighash).sign_input(&spend(&prev), 0, &prev),
            Err(SigningFailure::Locked)
        );

        let foreign = TxOut::new(Zatoshis::const_from_u64(5000), Script::p2pkh(&[9; 20]));
        assert_matches!(
            VaultSigner::new(&vault, LegacySighash).sign_input(&spend(&foreign), 0, &foreign),
            Err(SigningFailure::MissingKey(_))
        );
    }

    #[test]
    fn dummy_signature_matches_input_size_estimate() {
        let prev = TxOut::new(Zatoshis::const_from_u64(1), Script::p2pkh(&[0; 20]));
        let mut tx = spend(&prev);
        let unsigned = tx.serialized_size();
        tx.vin[0].script_sig = DummySigner.sign_input(&tx, 0, &prev).unwrap();
        // The empty script_sig already contributed its length byte and the outpoint.
        assert_eq!(tx.serialized_size() - unsigned, P2PKH_INPUT_SIZE - 41);
    }
}
