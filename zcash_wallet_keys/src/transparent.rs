//! Transparent (secp256k1) key identifiers and metadata.

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use zcash_encoding::Vector;

const KEY_METADATA_VERSION: u8 = 2;

/// `RIPEMD160(SHA256(data))`.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(Sha256::digest(data)));
    out
}

/// The HASH160 of a compressed secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyId([u8; 20]);

impl KeyId {
    pub fn from_pubkey(pubkey: &secp256k1::PublicKey) -> Self {
        KeyId(hash160(&pubkey.serialize()))
    }

    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        KeyId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KeyId").field(&hex::encode(self.0)).finish()
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// The two transparent derivation chains below the account node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyChain {
    /// Receiving addresses handed out to counterparties.
    External,
    /// Change addresses.
    Internal,
}

impl KeyChain {
    pub fn index(self) -> u32 {
        match self {
            KeyChain::External => 0,
            KeyChain::Internal => 1,
        }
    }

    pub fn is_internal(self) -> bool {
        matches!(self, KeyChain::Internal)
    }
}

/// Information recorded about a key when it is created or imported.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyMetadata {
    /// Seconds since the epoch at which the key was created, or 0 if unknown.
    pub create_time: i64,
    /// The derivation path of an HD key, e.g. `m/0'/1'/7'`.
    pub hd_keypath: Option<String>,
    /// The fingerprint of the seed an HD key was derived from.
    pub seed_fp: Option<[u8; 32]>,
    /// The first four bytes of the HASH160 of the master public key.
    pub master_fingerprint: Option<[u8; 4]>,
}

impl KeyMetadata {
    pub fn new(create_time: i64) -> Self {
        KeyMetadata {
            create_time,
            ..Default::default()
        }
    }

    pub fn is_hd(&self) -> bool {
        self.hd_keypath.is_some()
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let version = reader.read_u8()?;
        let create_time = reader.read_i64::<LittleEndian>()?;
        if version < 2 {
            // Version 1 records predate HD derivation.
            return Ok(KeyMetadata::new(create_time));
        }

        let keypath = Vector::read(&mut reader, |r| r.read_u8())?;
        let hd_keypath = if keypath.is_empty() {
            None
        } else {
            Some(String::from_utf8(keypath).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, e.utf8_error())
            })?)
        };
        let seed_fp = match reader.read_u8()? {
            0 => None,
            _ => {
                let mut fp = [0u8; 32];
                reader.read_exact(&mut fp)?;
                Some(fp)
            }
        };
        let master_fingerprint = match reader.read_u8()? {
            0 => None,
            _ => {
                let mut fp = [0u8; 4];
                reader.read_exact(&mut fp)?;
                Some(fp)
            }
        };

        Ok(KeyMetadata {
            create_time,
            hd_keypath,
            seed_fp,
            master_fingerprint,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(KEY_METADATA_VERSION)?;
        writer.write_i64::<LittleEndian>(self.create_time)?;
        let keypath = self.hd_keypath.as_deref().unwrap_or("").as_bytes();
        Vector::write(&mut writer, keypath, |w, b| w.write_u8(*b))?;
        match &self.seed_fp {
            Some(fp) => {
                writer.write_u8(1)?;
                writer.write_all(fp)?;
            }
            None => writer.write_u8(0)?,
        }
        match &self.master_fingerprint {
            Some(fp) => {
                writer.write_u8(1)?;
                writer.write_all(fp)
            }
            None => writer.write_u8(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{hash160, KeyMetadata};

    #[test]
    fn hash160_of_empty_input() {
        assert_eq!(
            hex::encode(hash160(b"")),
            "b472a266d0bd89c13706a4132ccfb16f7c3b9fcb"
        );
    }

    #[test]
    fn version_one_metadata_upgrades() {
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&1_600_000_000i64.to_le_bytes());
        let meta = KeyMetadata::read(&bytes[..]).unwrap();
        assert_eq!(meta, KeyMetadata::new(1_600_000_000));
        assert!(!meta.is_hd());
    }

    #[test]
    fn hd_metadata_roundtrip() {
        let meta = KeyMetadata {
            create_time: 42,
            hd_keypath: Some("m/0'/1'/3'".to_owned()),
            seed_fp: Some([5u8; 32]),
            master_fingerprint: Some([1, 2, 3, 4]),
        };
        let mut bytes = vec![];
        meta.write(&mut bytes).unwrap();
        assert_eq!(KeyMetadata::read(&bytes[..]).unwrap(), meta);
    }
}
