//! Identifiers for the persistent records a [`KeyVault`](crate::KeyVault) is made of.
//!
//! The vault does not talk to storage itself. Instead it tracks which of its records
//! have changed since they were last collected, and callers serialize those records
//! into whatever store they use.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use zcash_encoding::Vector;

use crate::sapling_keys::IvkTag;
use crate::sprout::SproutPaymentAddress;
use crate::transparent::KeyId;

/// Which derivation tree a seed roots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SeedKind {
    Transparent,
    Shielded,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VaultRecordId {
    MasterKey(u32),
    TransparentKey(KeyId),
    WatchScript(Vec<u8>),
    SproutKey(SproutPaymentAddress),
    SaplingKey(IvkTag),
    SaplingAddress([u8; 43]),
    HdSeed(SeedKind),
    HdChain,
    KeyPool(u64),
}

impl VaultRecordId {
    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        match reader.read_u8()? {
            0 => Ok(VaultRecordId::MasterKey(reader.read_u32::<LittleEndian>()?)),
            1 => {
                let mut id = [0u8; 20];
                reader.read_exact(&mut id)?;
                Ok(VaultRecordId::TransparentKey(KeyId::from_bytes(id)))
            }
            2 => Ok(VaultRecordId::WatchScript(Vector::read(&mut reader, |r| {
                r.read_u8()
            })?)),
            3 => {
                let mut addr = [0u8; 64];
                reader.read_exact(&mut addr)?;
                Ok(VaultRecordId::SproutKey(SproutPaymentAddress::from_bytes(
                    &addr,
                )))
            }
            4 => {
                let mut ivk = [0u8; 32];
                reader.read_exact(&mut ivk)?;
                Ok(VaultRecordId::SaplingKey(IvkTag::from_bytes(ivk)))
            }
            5 => {
                let mut addr = [0u8; 43];
                reader.read_exact(&mut addr)?;
                Ok(VaultRecordId::SaplingAddress(addr))
            }
            6 => match reader.read_u8()? {
                0 => Ok(VaultRecordId::HdSeed(SeedKind::Transparent)),
                _ => Ok(VaultRecordId::HdSeed(SeedKind::Shielded)),
            },
            7 => Ok(VaultRecordId::HdChain),
            8 => Ok(VaultRecordId::KeyPool(reader.read_u64::<LittleEndian>()?)),
            tag => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown vault record tag {}", tag),
            )),
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        match self {
            VaultRecordId::MasterKey(id) => {
                writer.write_u8(0)?;
                writer.write_u32::<LittleEndian>(*id)
            }
            VaultRecordId::TransparentKey(id) => {
                writer.write_u8(1)?;
                writer.write_all(id.as_bytes())
            }
            VaultRecordId::WatchScript(script) => {
                writer.write_u8(2)?;
                Vector::write(&mut writer, script, |w, b| w.write_u8(*b))
            }
            VaultRecordId::SproutKey(addr) => {
                writer.write_u8(3)?;
                writer.write_all(&addr.to_bytes())
            }
            VaultRecordId::SaplingKey(ivk) => {
                writer.write_u8(4)?;
                writer.write_all(ivk.as_bytes())
            }
            VaultRecordId::SaplingAddress(addr) => {
                writer.write_u8(5)?;
                writer.write_all(addr)
            }
            VaultRecordId::HdSeed(kind) => {
                writer.write_u8(6)?;
                writer.write_u8(match kind {
                    SeedKind::Transparent => 0,
                    SeedKind::Shielded => 1,
                })
            }
            VaultRecordId::HdChain => writer.write_u8(7),
            VaultRecordId::KeyPool(index) => {
                writer.write_u8(8)?;
                writer.write_u64::<LittleEndian>(*index)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SeedKind, VaultRecordId};
    use crate::sapling_keys::IvkTag;
    use crate::transparent::KeyId;

    #[test]
    fn ids_roundtrip() {
        let ids = [
            VaultRecordId::MasterKey(1),
            VaultRecordId::TransparentKey(KeyId::from_bytes([3; 20])),
            VaultRecordId::WatchScript(vec![0x76, 0xa9]),
            VaultRecordId::SaplingKey(IvkTag::from_bytes([4; 32])),
            VaultRecordId::SaplingAddress([5; 43]),
            VaultRecordId::HdSeed(SeedKind::Shielded),
            VaultRecordId::HdChain,
            VaultRecordId::KeyPool(77),
        ];
        for id in ids {
            let mut bytes = vec![];
            id.write(&mut bytes).unwrap();
            assert_eq!(VaultRecordId::read(&bytes[..]).unwrap(), id);
        }
    }
}
