//! Transparent scripts, limited to the standard templates the wallet produces and
//! recognizes.

use std::fmt;
use std::io::{self, Read, Write};

use zcash_encoding::Vector;

use super::address::TransparentAddress;

pub const OP_DUP: u8 = 0x76;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_RETURN: u8 = 0x6a;
const PUSH_20: u8 = 0x14;

#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Script(pub Vec<u8>);

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Script").field(&hex::encode(&self.0)).finish()
    }
}

impl Script {
    pub fn p2pkh(hash: &[u8; 20]) -> Self {
        let mut s = Vec::with_capacity(25);
        s.extend_from_slice(&[OP_DUP, OP_HASH160, PUSH_20]);
        s.extend_from_slice(hash);
        s.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        Script(s)
    }

    pub fn p2sh(hash: &[u8; 20]) -> Self {
        let mut s = Vec::with_capacity(23);
        s.extend_from_slice(&[OP_HASH160, PUSH_20]);
        s.extend_from_slice(hash);
        s.push(OP_EQUAL);
        Script(s)
    }

    /// Appends a minimal data push of `data`, which must be shorter than 76 bytes.
    pub fn push_data(mut self, data: &[u8]) -> Self {
        debug_assert!(data.len() < 0x4c);
        self.0.push(data.len() as u8);
        self.0.extend_from_slice(data);
        self
    }

    /// Returns the address this script pays to, if it is a standard template.
    pub fn address(&self) -> Option<TransparentAddress> {
        let s = &self.0;
        if s.len() == 25
            && s[0..3] == [OP_DUP, OP_HASH160, PUSH_20]
            && s[23..25] == [OP_EQUALVERIFY, OP_CHECKSIG]
        {
            let mut hash = [0; 20];
            hash.copy_from_slice(&s[3..23]);
            Some(TransparentAddress::PublicKeyHash(hash))
        } else if s.len() == 23 && s[0..2] == [OP_HASH160, PUSH_20] && s[22] == OP_EQUAL {
            let mut hash = [0; 20];
            hash.copy_from_slice(&s[2..22]);
            Some(TransparentAddress::ScriptHash(hash))
        } else {
            None
        }
    }

    pub fn is_unspendable(&self) -> bool {
        self.0.first() == Some(&OP_RETURN)
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let script = Vector::read(&mut reader, |r| {
            let mut bytes = [0; 1];
            r.read_exact(&mut bytes).map(|_| bytes[0])
        })?;
        Ok(Script(script))
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        Vector::write(&mut writer, &self.0, |w, e| w.write_all(&[*e]))
    }
}
