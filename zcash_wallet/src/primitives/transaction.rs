//! The transaction format tracked by the wallet.
//!
//! This is a version 4 (Sapling) shaped transaction carrying transparent inputs and
//! outputs, Sprout JoinSplits and Sapling spends and outputs. Its serialization is
//! canonical, and the transaction id is the double SHA-256 of that serialization.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha256};
use zcash_encoding::{CompactSize, Vector};
use zcash_protocol::{consensus::BlockHeight, value::Zatoshis, TxId};

use super::script::Script;

const OVERWINTER_FLAG: u32 = 1 << 31;
pub const SAPLING_TX_VERSION: u32 = 4;
pub const SAPLING_VERSION_GROUP_ID: u32 = 0x892F_2085;

pub const GROTH_PROOF_SIZE: usize = 192;
pub const SPROUT_CIPHERTEXT_SIZE: usize = 601;
pub const SAPLING_ENC_CIPHERTEXT_SIZE: usize = 580;
pub const SAPLING_OUT_CIPHERTEXT_SIZE: usize = 80;

/// The serialized size of a [`SpendDescription`].
pub const SPEND_DESCRIPTION_SIZE: usize = 4 * 32 + GROTH_PROOF_SIZE + 64;

/// The serialized size of an [`OutputDescription`].
pub const OUTPUT_DESCRIPTION_SIZE: usize =
    3 * 32 + SAPLING_ENC_CIPHERTEXT_SIZE + SAPLING_OUT_CIPHERTEXT_SIZE + GROTH_PROOF_SIZE;

/// Sequence number that disables locktime for an input.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// A reference to a transparent output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutPoint {
    pub txid: TxId,
    pub n: u32,
}

impl OutPoint {
    pub fn new(txid: TxId, n: u32) -> Self {
        OutPoint { txid, n }
    }

    /// The outpoint referenced by the single input of a coinbase transaction.
    pub fn null() -> Self {
        OutPoint {
            txid: TxId::from_bytes([0; 32]),
            n: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.n == u32::MAX && self.txid.as_ref() == &[0u8; 32]
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let txid = TxId::read(&mut reader)?;
        let n = reader.read_u32::<LittleEndian>()?;
        Ok(OutPoint { txid, n })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        self.txid.write(&mut writer)?;
        writer.write_u32::<LittleEndian>(self.n)
    }
}

/// A revealed nullifier, tagged with the shielded pool it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Nullifier {
    Sprout([u8; 32]),
    Sapling([u8; 32]),
}

impl Nullifier {
    pub fn as_bytes(&self) -> &[u8; 32] {
        match self {
            Nullifier::Sprout(nf) | Nullifier::Sapling(nf) => nf,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Script,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint) -> Self {
        TxIn {
            prevout,
            script_sig: Script::default(),
            sequence: SEQUENCE_FINAL,
        }
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let prevout = OutPoint::read(&mut reader)?;
        let script_sig = Script::read(&mut reader)?;
        let sequence = reader.read_u32::<LittleEndian>()?;
        Ok(TxIn {
            prevout,
            script_sig,
            sequence,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        self.prevout.write(&mut writer)?;
        self.script_sig.write(&mut writer)?;
        writer.write_u32::<LittleEndian>(self.sequence)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: Zatoshis,
    pub script_pubkey: Script,
}

impl TxOut {
    pub fn new(value: Zatoshis, script_pubkey: Script) -> Self {
        TxOut {
            value,
            script_pubkey,
        }
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let value = Zatoshis::from_u64(reader.read_u64::<LittleEndian>()?)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "value out of range"))?;
        let script_pubkey = Script::read(&mut reader)?;
        Ok(TxOut {
            value,
            script_pubkey,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.value.into_u64())?;
        self.script_pubkey.write(&mut writer)
    }

    pub fn serialized_size(&self) -> usize {
        8 + compact_size_len(self.script_pubkey.0.len()) + self.script_pubkey.0.len()
    }
}

/// A Sprout JoinSplit description with a Groth16 proof.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsDescription {
    pub vpub_old: u64,
    pub vpub_new: u64,
    pub anchor: [u8; 32],
    pub nullifiers: [[u8; 32]; 2],
    pub commitments: [[u8; 32]; 2],
    pub ephemeral_key: [u8; 32],
    pub random_seed: [u8; 32],
    pub macs: [[u8; 32]; 2],
    pub proof: [u8; GROTH_PROOF_SIZE],
    pub ciphertexts: [[u8; SPROUT_CIPHERTEXT_SIZE]; 2],
}

fn read_array<R: Read, const N: usize>(mut reader: R) -> io::Result<[u8; N]> {
    let mut bytes = [0u8; N];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

impl Default for JsDescription {
    fn default() -> Self {
        JsDescription {
            vpub_old: 0,
            vpub_new: 0,
            anchor: [0; 32],
            nullifiers: [[0; 32]; 2],
            commitments: [[0; 32]; 2],
            ephemeral_key: [0; 32],
            random_seed: [0; 32],
            macs: [[0; 32]; 2],
            proof: [0; GROTH_PROOF_SIZE],
            ciphertexts: [[0; SPROUT_CIPHERTEXT_SIZE]; 2],
        }
    }
}

impl JsDescription {
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let vpub_old = reader.read_u64::<LittleEndian>()?;
        let vpub_new = reader.read_u64::<LittleEndian>()?;
        let anchor = read_array(&mut reader)?;
        let nullifiers = [read_array(&mut reader)?, read_array(&mut reader)?];
        let commitments = [read_array(&mut reader)?, read_array(&mut reader)?];
        let ephemeral_key = read_array(&mut reader)?;
        let random_seed = read_array(&mut reader)?;
        let macs = [read_array(&mut reader)?, read_array(&mut reader)?];
        let proof = read_array(&mut reader)?;
        let ciphertexts = [read_array(&mut reader)?, read_array(&mut reader)?];
        Ok(JsDescription {
            vpub_old,
            vpub_new,
            anchor,
            nullifiers,
            commitments,
            ephemeral_key,
            random_seed,
            macs,
            proof,
            ciphertexts,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.vpub_old)?;
        writer.write_u64::<LittleEndian>(self.vpub_new)?;
        writer.write_all(&self.anchor)?;
        for nf in &self.nullifiers {
            writer.write_all(nf)?;
        }
        for cm in &self.commitments {
            writer.write_all(cm)?;
        }
        writer.write_all(&self.ephemeral_key)?;
        writer.write_all(&self.random_seed)?;
        for mac in &self.macs {
            writer.write_all(mac)?;
        }
        writer.write_all(&self.proof)?;
        for ct in &self.ciphertexts {
            writer.write_all(ct)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpendDescription {
    pub cv: [u8; 32],
    pub anchor: [u8; 32],
    pub nullifier: [u8; 32],
    pub rk: [u8; 32],
    pub zkproof: [u8; GROTH_PROOF_SIZE],
    pub spend_auth_sig: [u8; 64],
}

impl SpendDescription {
    /// A placeholder of the correct size, used while estimating fees.
    pub fn dummy() -> Self {
        SpendDescription {
            cv: [0; 32],
            anchor: [0; 32],
            nullifier: [0; 32],
            rk: [0; 32],
            zkproof: [0; GROTH_PROOF_SIZE],
            spend_auth_sig: [0; 64],
        }
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(SpendDescription {
            cv: read_array(&mut reader)?,
            anchor: read_array(&mut reader)?,
            nullifier: read_array(&mut reader)?,
            rk: read_array(&mut reader)?,
            zkproof: read_array(&mut reader)?,
            spend_auth_sig: read_array(&mut reader)?,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.cv)?;
        writer.write_all(&self.anchor)?;
        writer.write_all(&self.nullifier)?;
        writer.write_all(&self.rk)?;
        writer.write_all(&self.zkproof)?;
        writer.write_all(&self.spend_auth_sig)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputDescription {
    pub cv: [u8; 32],
    pub cmu: [u8; 32],
    pub ephemeral_key: [u8; 32],
    pub enc_ciphertext: [u8; SAPLING_ENC_CIPHERTEXT_SIZE],
    pub out_ciphertext: [u8; SAPLING_OUT_CIPHERTEXT_SIZE],
    pub zkproof: [u8; GROTH_PROOF_SIZE],
}

impl OutputDescription {
    /// A placeholder of the correct size, used while estimating fees.
    pub fn dummy() -> Self {
        OutputDescription {
            cv: [0; 32],
            cmu: [0; 32],
            ephemeral_key: [0; 32],
            enc_ciphertext: [0; SAPLING_ENC_CIPHERTEXT_SIZE],
            out_ciphertext: [0; SAPLING_OUT_CIPHERTEXT_SIZE],
            zkproof: [0; GROTH_PROOF_SIZE],
        }
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(OutputDescription {
            cv: read_array(&mut reader)?,
            cmu: read_array(&mut reader)?,
            ephemeral_key: read_array(&mut reader)?,
            enc_ciphertext: read_array(&mut reader)?,
            out_ciphertext: read_array(&mut reader)?,
            zkproof: read_array(&mut reader)?,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(&self.cv)?;
        writer.write_all(&self.cmu)?;
        writer.write_all(&self.ephemeral_key)?;
        writer.write_all(&self.enc_ciphertext)?;
        writer.write_all(&self.out_ciphertext)?;
        writer.write_all(&self.zkproof)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
    pub expiry_height: BlockHeight,
    /// The net value leaving the Sapling pool.
    pub value_balance: i64,
    pub shielded_spends: Vec<SpendDescription>,
    pub shielded_outputs: Vec<OutputDescription>,
    pub joinsplits: Vec<JsDescription>,
    pub joinsplit_pubkey: [u8; 32],
    pub joinsplit_sig: [u8; 64],
    pub binding_sig: [u8; 64],
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction {
            version: SAPLING_TX_VERSION,
            vin: vec![],
            vout: vec![],
            lock_time: 0,
            expiry_height: BlockHeight::from_u32(0),
            value_balance: 0,
            shielded_spends: vec![],
            shielded_outputs: vec![],
            joinsplits: vec![],
            joinsplit_pubkey: [0; 32],
            joinsplit_sig: [0; 64],
            binding_sig: [0; 64],
        }
    }
}

impl Transaction {
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let header = reader.read_u32::<LittleEndian>()?;
        if header & OVERWINTER_FLAG == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "transaction is not overwintered",
            ));
        }
        let version = header & !OVERWINTER_FLAG;
        let version_group_id = reader.read_u32::<LittleEndian>()?;
        if version != SAPLING_TX_VERSION || version_group_id != SAPLING_VERSION_GROUP_ID {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported transaction version {}", version),
            ));
        }

        let vin = Vector::read(&mut reader, |r| TxIn::read(r))?;
        let vout = Vector::read(&mut reader, |r| TxOut::read(r))?;
        let lock_time = reader.read_u32::<LittleEndian>()?;
        let expiry_height = BlockHeight::from_u32(reader.read_u32::<LittleEndian>()?);
        let value_balance = reader.read_i64::<LittleEndian>()?;
        let shielded_spends = Vector::read(&mut reader, |r| SpendDescription::read(r))?;
        let shielded_outputs = Vector::read(&mut reader, |r| OutputDescription::read(r))?;
        let joinsplits = Vector::read(&mut reader, |r| JsDescription::read(r))?;
        let (joinsplit_pubkey, joinsplit_sig) = if joinsplits.is_empty() {
            ([0; 32], [0; 64])
        } else {
            (read_array(&mut reader)?, read_array(&mut reader)?)
        };
        let binding_sig = if shielded_spends.is_empty() && shielded_outputs.is_empty() {
            [0; 64]
        } else {
            read_array(&mut reader)?
        };

        Ok(Transaction {
            version,
            vin,
            vout,
            lock_time,
            expiry_height,
            value_balance,
            shielded_spends,
            shielded_outputs,
            joinsplits,
            joinsplit_pubkey,
            joinsplit_sig,
            binding_sig,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.version | OVERWINTER_FLAG)?;
        writer.write_u32::<LittleEndian>(SAPLING_VERSION_GROUP_ID)?;
        Vector::write(&mut writer, &self.vin, |w, e| e.write(w))?;
        Vector::write(&mut writer, &self.vout, |w, e| e.write(w))?;
        writer.write_u32::<LittleEndian>(self.lock_time)?;
        writer.write_u32::<LittleEndian>(u32::from(self.expiry_height))?;
        writer.write_i64::<LittleEndian>(self.value_balance)?;
        Vector::write(&mut writer, &self.shielded_spends, |w, e| e.write(w))?;
        Vector::write(&mut writer, &self.shielded_outputs, |w, e| e.write(w))?;
        Vector::write(&mut writer, &self.joinsplits, |w, e| e.write(w))?;
        if !self.joinsplits.is_empty() {
            writer.write_all(&self.joinsplit_pubkey)?;
            writer.write_all(&self.joinsplit_sig)?;
        }
        if !(self.shielded_spends.is_empty() && self.shielded_outputs.is_empty()) {
            writer.write_all(&self.binding_sig)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![];
        // Writing to a Vec cannot fail.
        let _ = self.write(&mut bytes);
        bytes
    }

    pub fn txid(&self) -> TxId {
        let first = Sha256::digest(self.to_bytes());
        TxId::from_bytes(Sha256::digest(first).into())
    }

    pub fn serialized_size(&self) -> usize {
        self.to_bytes().len()
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    /// Whether this transaction can no longer be mined in a block at `height`.
    pub fn is_expired(&self, height: BlockHeight) -> bool {
        u32::from(self.expiry_height) != 0 && !self.is_coinbase() && height > self.expiry_height
    }

    pub fn value_out(&self) -> u64 {
        self.vout.iter().map(|o| o.value.into_u64()).sum()
    }

    pub fn sprout_nullifiers(&self) -> impl Iterator<Item = [u8; 32]> + '_ {
        self.joinsplits.iter().flat_map(|js| js.nullifiers)
    }

    pub fn sapling_nullifiers(&self) -> impl Iterator<Item = [u8; 32]> + '_ {
        self.shielded_spends.iter().map(|s| s.nullifier)
    }

    /// Every nullifier revealed by this transaction, in both shielded pools.
    pub fn nullifiers(&self) -> impl Iterator<Item = Nullifier> + '_ {
        self.sprout_nullifiers()
            .map(Nullifier::Sprout)
            .chain(self.sapling_nullifiers().map(Nullifier::Sapling))
    }

    pub fn has_shielded_components(&self) -> bool {
        !(self.joinsplits.is_empty()
            && self.shielded_spends.is_empty()
            && self.shielded_outputs.is_empty())
    }
}

/// The length of the CompactSize encoding of `n`.
pub fn compact_size_len(n: usize) -> usize {
    let mut buf = vec![];
    // Writing to a Vec cannot fail.
    let _ = CompactSize::write(&mut buf, n);
    buf.len()
}
