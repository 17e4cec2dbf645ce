//! Shielded notes owned by the wallet, and the witnesses kept for them.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use incrementalmerkletree::witness::IncrementalWitness;
use zcash_encoding::{Optional, Vector};
use zcash_primitives::merkle_tree::HashSer;
use zcash_protocol::{consensus::BlockHeight, TxId};
use zcash_wallet_keys::{sapling_keys::IvkTag, sprout::SproutPaymentAddress};

use crate::tree::{read_witness, write_witness, SproutNode, SAPLING_TREE_DEPTH, SPROUT_TREE_DEPTH};

const NOTE_DATA_VERSION: u8 = 1;

/// Identifies output `n` of JoinSplit `js` in a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JsOutPoint {
    pub txid: TxId,
    pub js: u32,
    pub n: u8,
}

impl JsOutPoint {
    pub fn new(txid: TxId, js: u32, n: u8) -> Self {
        JsOutPoint { txid, js, n }
    }

    /// The position of this note's commitment among the transaction's Sprout
    /// commitments.
    pub fn commitment_index(&self) -> usize {
        self.js as usize * 2 + self.n as usize
    }
}

/// Identifies Sapling output `n` of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SaplingOutPoint {
    pub txid: TxId,
    pub n: u32,
}

impl SaplingOutPoint {
    pub fn new(txid: TxId, n: u32) -> Self {
        SaplingOutPoint { txid, n }
    }
}

/// A reference to a note from either pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NoteRef {
    Sprout(JsOutPoint),
    Sapling(SaplingOutPoint),
}

impl NoteRef {
    pub fn txid(&self) -> TxId {
        match self {
            NoteRef::Sprout(op) => op.txid,
            NoteRef::Sapling(op) => op.txid,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WitnessState {
    /// No witness is held.
    Unwitnessed,
    /// Witnesses were rebuilt or extended, but the newest root has not yet been checked
    /// against the chain.
    PartiallyValidated,
    /// The newest witness root matches the final tree root of its block.
    Validated,
}

/// The most recent witnesses of a single note. The front of the deque is the newest.
#[derive(Clone, Debug)]
pub struct WitnessCache<H, const DEPTH: u8> {
    witnesses: VecDeque<IncrementalWitness<H, DEPTH>>,
    height: Option<BlockHeight>,
    state: WitnessState,
}

impl<H, const DEPTH: u8> Default for WitnessCache<H, DEPTH> {
    fn default() -> Self {
        WitnessCache {
            witnesses: VecDeque::new(),
            height: None,
            state: WitnessState::Unwitnessed,
        }
    }
}

impl<H, const DEPTH: u8> WitnessCache<H, DEPTH> {
    pub fn is_empty(&self) -> bool {
        self.witnesses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.witnesses.len()
    }

    pub fn newest(&self) -> Option<&IncrementalWitness<H, DEPTH>> {
        self.witnesses.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IncrementalWitness<H, DEPTH>> {
        self.witnesses.iter()
    }

    /// The height of the block the newest witness is current as of.
    pub fn height(&self) -> Option<BlockHeight> {
        self.height
    }

    pub fn state(&self) -> WitnessState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: WitnessState) {
        self.state = state;
    }

    /// Adds a new front witness current as of `height`, evicting from the back so that
    /// at most `limit` witnesses are retained.
    pub(crate) fn push(
        &mut self,
        witness: IncrementalWitness<H, DEPTH>,
        height: BlockHeight,
        limit: usize,
    ) {
        self.witnesses.push_front(witness);
        self.witnesses.truncate(limit.max(1));
        self.height = Some(height);
    }

    /// Steps back one block. Returns `false` if no witness remained and the cache was
    /// cleared.
    pub(crate) fn pop(&mut self) -> bool {
        if self.witnesses.len() > 1 {
            self.witnesses.pop_front();
            self.height = self.height.map(|h| h - 1);
            true
        } else {
            self.clear();
            false
        }
    }

    pub(crate) fn clear(&mut self) {
        self.witnesses.clear();
        self.height = None;
        self.state = WitnessState::Unwitnessed;
    }
}

impl<H: HashSer + Clone, const DEPTH: u8> WitnessCache<H, DEPTH> {
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let state = match reader.read_u8()? {
            0 => WitnessState::Unwitnessed,
            1 => WitnessState::PartiallyValidated,
            2 => WitnessState::Validated,
            s => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown witness state {}", s),
                ))
            }
        };
        let height = Optional::read(&mut reader, |r| {
            r.read_u32::<LittleEndian>().map(BlockHeight::from_u32)
        })?;
        let witnesses = Vector::read(&mut reader, |r| read_witness(r))?;
        Ok(WitnessCache {
            witnesses: witnesses.into(),
            height,
            state,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(match self.state {
            WitnessState::Unwitnessed => 0,
            WitnessState::PartiallyValidated => 1,
            WitnessState::Validated => 2,
        })?;
        Optional::write(&mut writer, self.height, |w, h| {
            w.write_u32::<LittleEndian>(u32::from(h))
        })?;
        let witnesses = self.witnesses.iter().collect::<Vec<_>>();
        Vector::write(&mut writer, &witnesses, |w, wit| write_witness(*wit, w))
    }
}

/// A Sprout note received by the wallet.
#[derive(Clone, Debug)]
pub struct SproutNoteData {
    pub address: SproutPaymentAddress,
    pub value: u64,
    pub rho: [u8; 32],
    pub r: [u8; 32],
    pub nullifier: Option<[u8; 32]>,
    pub witnesses: WitnessCache<SproutNode, SPROUT_TREE_DEPTH>,
}

impl SproutNoteData {
    pub fn new(address: SproutPaymentAddress, value: u64, rho: [u8; 32], r: [u8; 32]) -> Self {
        SproutNoteData {
            address,
            value,
            rho,
            r,
            nullifier: None,
            witnesses: WitnessCache::default(),
        }
    }

    /// Whether `other` describes the same note, ignoring derived state.
    pub fn same_note(&self, other: &Self) -> bool {
        self.address == other.address
            && self.value == other.value
            && self.rho == other.rho
            && self.r == other.r
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        check_version(&mut reader)?;
        let mut addr = [0; 64];
        reader.read_exact(&mut addr)?;
        let value = reader.read_u64::<LittleEndian>()?;
        let rho = read_32(&mut reader)?;
        let r = read_32(&mut reader)?;
        let nullifier = Optional::read(&mut reader, |r| read_32(r))?;
        let witnesses = WitnessCache::read(&mut reader)?;
        Ok(SproutNoteData {
            address: SproutPaymentAddress::from_bytes(&addr),
            value,
            rho,
            r,
            nullifier,
            witnesses,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(NOTE_DATA_VERSION)?;
        writer.write_all(&self.address.to_bytes())?;
        writer.write_u64::<LittleEndian>(self.value)?;
        writer.write_all(&self.rho)?;
        writer.write_all(&self.r)?;
        Optional::write(&mut writer, self.nullifier, |w, nf| w.write_all(&nf))?;
        self.witnesses.write(&mut writer)
    }
}

/// The note commitment randomness of a Sapling note, in its encoded form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoteRseed {
    BeforeZip212([u8; 32]),
    AfterZip212([u8; 32]),
}

impl NoteRseed {
    pub fn from_rseed(rseed: &sapling::Rseed) -> Self {
        match rseed {
            sapling::Rseed::BeforeZip212(rcm) => NoteRseed::BeforeZip212(rcm.to_bytes()),
            sapling::Rseed::AfterZip212(bytes) => NoteRseed::AfterZip212(*bytes),
        }
    }

    pub fn to_rseed(&self) -> Option<sapling::Rseed> {
        match self {
            NoteRseed::BeforeZip212(bytes) => {
                Option::from(jubjub::Fr::from_bytes(bytes)).map(sapling::Rseed::BeforeZip212)
            }
            NoteRseed::AfterZip212(bytes) => Some(sapling::Rseed::AfterZip212(*bytes)),
        }
    }
}

/// A Sapling note received by the wallet.
#[derive(Clone, Debug)]
pub struct SaplingNoteData {
    /// The incoming viewing key that decrypted this note.
    pub ivk: IvkTag,
    pub recipient: sapling::PaymentAddress,
    pub value: u64,
    pub rseed: NoteRseed,
    pub nullifier: Option<[u8; 32]>,
    pub witnesses: WitnessCache<sapling::Node, SAPLING_TREE_DEPTH>,
}

impl SaplingNoteData {
    pub fn new(
        ivk: IvkTag,
        recipient: sapling::PaymentAddress,
        value: u64,
        rseed: NoteRseed,
    ) -> Self {
        SaplingNoteData {
            ivk,
            recipient,
            value,
            rseed,
            nullifier: None,
            witnesses: WitnessCache::default(),
        }
    }

    pub fn from_note(ivk: IvkTag, note: &sapling::Note) -> Self {
        SaplingNoteData::new(
            ivk,
            note.recipient(),
            note.value().inner(),
            NoteRseed::from_rseed(note.rseed()),
        )
    }

    pub fn note(&self) -> Option<sapling::Note> {
        self.rseed.to_rseed().map(|rseed| {
            sapling::Note::from_parts(
                self.recipient,
                sapling::value::NoteValue::from_raw(self.value),
                rseed,
            )
        })
    }

    pub fn same_note(&self, other: &Self) -> bool {
        self.ivk == other.ivk
            && self.recipient == other.recipient
            && self.value == other.value
            && self.rseed == other.rseed
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        check_version(&mut reader)?;
        let ivk = IvkTag::from_bytes(read_32(&mut reader)?);
        let mut addr = [0; 43];
        reader.read_exact(&mut addr)?;
        let recipient = sapling::PaymentAddress::from_bytes(&addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid recipient"))?;
        let value = reader.read_u64::<LittleEndian>()?;
        let rseed = match reader.read_u8()? {
            0 => NoteRseed::BeforeZip212(read_32(&mut reader)?),
            1 => NoteRseed::AfterZip212(read_32(&mut reader)?),
            t => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown rseed type {}", t),
                ))
            }
        };
        let nullifier = Optional::read(&mut reader, |r| read_32(r))?;
        let witnesses = WitnessCache::read(&mut reader)?;
        Ok(SaplingNoteData {
            ivk,
            recipient,
            value,
            rseed,
            nullifier,
            witnesses,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(NOTE_DATA_VERSION)?;
        writer.write_all(self.ivk.as_bytes())?;
        writer.write_all(&self.recipient.to_bytes())?;
        writer.write_u64::<LittleEndian>(self.value)?;
        match &self.rseed {
            NoteRseed::BeforeZip212(bytes) => {
                writer.write_u8(0)?;
                writer.write_all(bytes)?;
            }
            NoteRseed::AfterZip212(bytes) => {
                writer.write_u8(1)?;
                writer.write_all(bytes)?;
            }
        }
        Optional::write(&mut writer, self.nullifier, |w, nf| w.write_all(&nf))?;
        self.witnesses.write(&mut writer)
    }
}

fn check_version<R: Read>(mut reader: R) -> io::Result<()> {
    let version = reader.read_u8()?;
    if version > NOTE_DATA_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported note data version {}", version),
        ));
    }
    Ok(())
}

fn read_32<R: Read>(mut reader: R) -> io::Result<[u8; 32]> {
    let mut bytes = [0; 32];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use incrementalmerkletree::{frontier::CommitmentTree, witness::IncrementalWitness};
    use zcash_protocol::consensus::BlockHeight;
    use zcash_wallet_keys::sprout::SproutPaymentAddress;

    use super::{SproutNoteData, WitnessCache, WitnessState};
    use crate::tree::{SproutCommitmentTree, SproutNode, SPROUT_TREE_DEPTH};

    fn witness(leaves: u8) -> IncrementalWitness<SproutNode, SPROUT_TREE_DEPTH> {
        let mut tree: SproutCommitmentTree = CommitmentTree::empty();
        for i in 0..leaves {
            tree.append(SproutNode::from_bytes([i; 32])).unwrap();
        }
        IncrementalWitness::from_tree(tree).unwrap()
    }

    #[test]
    fn cache_is_bounded() {
        let mut cache: WitnessCache<SproutNode, SPROUT_TREE_DEPTH> = WitnessCache::default();
        for h in 1..=5u32 {
            cache.push(witness(h as u8), BlockHeight::from_u32(h), 3);
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.height(), Some(BlockHeight::from_u32(5)));

        assert!(cache.pop());
        assert!(cache.pop());
        assert_eq!(cache.height(), Some(BlockHeight::from_u32(3)));
        assert!(!cache.pop());
        assert!(cache.is_empty());
        assert_eq!(cache.state(), WitnessState::Unwitnessed);
    }

    #[test]
    fn sprout_note_roundtrip() {
        let mut note =
            SproutNoteData::new(SproutPaymentAddress::from_bytes(&[4; 64]), 77, [1; 32], [2; 32]);
        note.nullifier = Some([9; 32]);
        note.witnesses
            .push(witness(3), BlockHeight::from_u32(10), 101);
        note.witnesses.set_state(WitnessState::Validated);

        let mut bytes = vec![];
        note.write(&mut bytes).unwrap();
        let decoded = SproutNoteData::read(&bytes[..]).unwrap();
        assert!(decoded.same_note(&note));
        assert_eq!(decoded.nullifier, note.nullifier);
        assert_eq!(decoded.witnesses.len(), 1);
        assert_eq!(decoded.witnesses.state(), WitnessState::Validated);
        assert_eq!(
            decoded.witnesses.newest().map(|w| w.root()),
            note.witnesses.newest().map(|w| w.root())
        );
    }
}
