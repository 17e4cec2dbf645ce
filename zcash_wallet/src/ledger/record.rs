//! The wallet's record of a single transaction.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use zcash_encoding::{Optional, Vector};
use zcash_protocol::{consensus::BlockHeight, TxId};

use crate::chain::depth_at;
use crate::primitives::{BlockHash, Transaction};

use super::notes::{JsOutPoint, SaplingNoteData, SaplingOutPoint, SproutNoteData};

const RECORD_VERSION: u8 = 2;

/// Metadata key recording the transaction that replaced this one in the mempool.
pub const REPLACED_BY_TXID: &str = "replaced_by_txid";
/// Metadata key for a user supplied comment.
pub const COMMENT: &str = "comment";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Unconfirmed,
    Confirmed {
        block: BlockHash,
        height: BlockHeight,
        index: u32,
    },
    /// A block at `height` contains a transaction that double-spends this one.
    Conflicted {
        block: BlockHash,
        height: BlockHeight,
    },
    Abandoned,
}

impl TxStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, TxStatus::Confirmed { .. })
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self, TxStatus::Abandoned)
    }

    pub fn block(&self) -> Option<BlockHash> {
        match self {
            TxStatus::Confirmed { block, .. } | TxStatus::Conflicted { block, .. } => Some(*block),
            _ => None,
        }
    }

    fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let read_hash = |r: &mut R| {
            let mut hash = [0; 32];
            r.read_exact(&mut hash).map(|_| BlockHash(hash))
        };
        match reader.read_u8()? {
            0 => Ok(TxStatus::Unconfirmed),
            1 => {
                let block = read_hash(&mut reader)?;
                let height = BlockHeight::from_u32(reader.read_u32::<LittleEndian>()?);
                let index = reader.read_u32::<LittleEndian>()?;
                Ok(TxStatus::Confirmed {
                    block,
                    height,
                    index,
                })
            }
            2 => {
                let block = read_hash(&mut reader)?;
                let height = BlockHeight::from_u32(reader.read_u32::<LittleEndian>()?);
                Ok(TxStatus::Conflicted { block, height })
            }
            3 => Ok(TxStatus::Abandoned),
            s => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown transaction status {}", s),
            )),
        }
    }

    fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        match self {
            TxStatus::Unconfirmed => writer.write_u8(0),
            TxStatus::Confirmed {
                block,
                height,
                index,
            } => {
                writer.write_u8(1)?;
                writer.write_all(&block.0)?;
                writer.write_u32::<LittleEndian>(u32::from(*height))?;
                writer.write_u32::<LittleEndian>(*index)
            }
            TxStatus::Conflicted { block, height } => {
                writer.write_u8(2)?;
                writer.write_all(&block.0)?;
                writer.write_u32::<LittleEndian>(u32::from(*height))
            }
            TxStatus::Abandoned => writer.write_u8(3),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TransactionRecord {
    tx: Transaction,
    txid: TxId,
    pub status: TxStatus,
    pub time_received: i64,
    pub time_smart: i64,
    pub order_pos: u64,
    pub from_me: bool,
    /// Not persisted; refreshed from the node's mempool.
    pub in_mempool: bool,
    pub metadata: BTreeMap<String, String>,
    pub last_broadcast: Option<i64>,
    pub sprout_notes: BTreeMap<JsOutPoint, SproutNoteData>,
    pub sapling_notes: BTreeMap<SaplingOutPoint, SaplingNoteData>,
}

impl TransactionRecord {
    pub fn new(tx: Transaction, status: TxStatus) -> Self {
        let txid = tx.txid();
        TransactionRecord {
            tx,
            txid,
            status,
            time_received: 0,
            time_smart: 0,
            order_pos: 0,
            from_me: false,
            in_mempool: false,
            metadata: BTreeMap::new(),
            last_broadcast: None,
            sprout_notes: BTreeMap::new(),
            sapling_notes: BTreeMap::new(),
        }
    }

    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    pub fn txid(&self) -> TxId {
        self.txid
    }

    /// The number of confirmations. Negative when the record conflicts with a block in
    /// the active chain, zero for unconfirmed and abandoned records.
    pub fn depth(&self, tip: Option<BlockHeight>) -> i64 {
        match self.status {
            TxStatus::Confirmed { height, .. } => i64::from(depth_at(tip, height)),
            TxStatus::Conflicted { height, .. } => -i64::from(depth_at(tip, height)),
            TxStatus::Unconfirmed | TxStatus::Abandoned => 0,
        }
    }

    pub fn height(&self) -> Option<BlockHeight> {
        match self.status {
            TxStatus::Confirmed { height, .. } => Some(height),
            _ => None,
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.tx.is_coinbase()
    }

    /// Blocks until a coinbase record's outputs may be spent.
    pub fn blocks_to_maturity(&self, tip: Option<BlockHeight>, maturity: u32) -> u32 {
        if !self.is_coinbase() {
            return 0;
        }
        let depth = self.depth(tip).max(0);
        (i64::from(maturity) + 1 - depth).max(0) as u32
    }

    pub fn is_immature_coinbase(&self, tip: Option<BlockHeight>, maturity: u32) -> bool {
        self.blocks_to_maturity(tip, maturity) > 0
    }

    /// Whether this record can no longer be mined in the block after `tip`.
    pub fn is_expired(&self, tip: Option<BlockHeight>) -> bool {
        match tip {
            Some(tip) => self.depth(Some(tip)) == 0 && self.tx.is_expired(tip + 1),
            None => false,
        }
    }

    pub fn has_notes(&self) -> bool {
        !(self.sprout_notes.is_empty() && self.sapling_notes.is_empty())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let version = reader.read_u8()?;
        if version == 0 || version > RECORD_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported transaction record version {}", version),
            ));
        }
        let tx_bytes = Vector::read(&mut reader, |r| r.read_u8())?;
        let tx = Transaction::read(&tx_bytes[..])?;
        let status = TxStatus::read(&mut reader)?;
        let time_received = reader.read_i64::<LittleEndian>()?;
        let time_smart = reader.read_i64::<LittleEndian>()?;
        let order_pos = reader.read_u64::<LittleEndian>()?;
        let from_me = reader.read_u8()? != 0;
        // Version 1 records predate metadata and broadcast tracking.
        let (metadata, last_broadcast) = if version >= 2 {
            let entries = Vector::read(&mut reader, |r| {
                let key = read_string(&mut *r)?;
                let value = read_string(&mut *r)?;
                Ok((key, value))
            })?;
            let last_broadcast = Optional::read(&mut reader, |r| r.read_i64::<LittleEndian>())?;
            (entries.into_iter().collect(), last_broadcast)
        } else {
            (BTreeMap::new(), None)
        };
        let sprout_notes = Vector::read(&mut reader, |r| {
            let js = r.read_u32::<LittleEndian>()?;
            let n = r.read_u8()?;
            let data = SproutNoteData::read(&mut *r)?;
            Ok((js, n, data))
        })?;
        let sapling_notes = Vector::read(&mut reader, |r| {
            let n = r.read_u32::<LittleEndian>()?;
            let data = SaplingNoteData::read(&mut *r)?;
            Ok((n, data))
        })?;

        let mut record = TransactionRecord::new(tx, status);
        let txid = record.txid;
        record.time_received = time_received;
        record.time_smart = time_smart;
        record.order_pos = order_pos;
        record.from_me = from_me;
        record.metadata = metadata;
        record.last_broadcast = last_broadcast;
        record.sprout_notes = sprout_notes
            .into_iter()
            .map(|(js, n, data)| (JsOutPoint::new(txid, js, n), data))
            .collect();
        record.sapling_notes = sapling_notes
            .into_iter()
            .map(|(n, data)| (SaplingOutPoint::new(txid, n), data))
            .collect();
        Ok(record)
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(RECORD_VERSION)?;
        Vector::write(&mut writer, &self.tx.to_bytes(), |w, b| w.write_u8(*b))?;
        self.status.write(&mut writer)?;
        writer.write_i64::<LittleEndian>(self.time_received)?;
        writer.write_i64::<LittleEndian>(self.time_smart)?;
        writer.write_u64::<LittleEndian>(self.order_pos)?;
        writer.write_u8(u8::from(self.from_me))?;
        let metadata = self.metadata.iter().collect::<Vec<_>>();
        Vector::write(&mut writer, &metadata, |w, (k, v)| {
            write_string(&mut *w, k)?;
            write_string(&mut *w, v)
        })?;
        Optional::write(&mut writer, self.last_broadcast, |w, t| {
            w.write_i64::<LittleEndian>(t)
        })?;
        let sprout_notes = self.sprout_notes.iter().collect::<Vec<_>>();
        Vector::write(&mut writer, &sprout_notes, |w, (op, data)| {
            w.write_u32::<LittleEndian>(op.js)?;
            w.write_u8(op.n)?;
            data.write(&mut *w)
        })?;
        let sapling_notes = self.sapling_notes.iter().collect::<Vec<_>>();
        Vector::write(&mut writer, &sapling_notes, |w, (op, data)| {
            w.write_u32::<LittleEndian>(op.n)?;
            data.write(&mut *w)
        })
    }
}

fn read_string<R: Read>(mut reader: R) -> io::Result<String> {
    let bytes = Vector::read(&mut reader, |r| r.read_u8())?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn write_string<W: Write>(mut writer: W, s: &str) -> io::Result<()> {
    Vector::write(&mut writer, s.as_bytes(), |w, b| w.write_u8(*b))
}
