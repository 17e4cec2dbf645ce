use std::cmp::Ordering;
use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};
use zcash_wallet_keys::{sprout::SproutPaymentAddress, transparent::KeyId};

use super::script::Script;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransparentAddress {
    PublicKeyHash([u8; 20]),
    ScriptHash([u8; 20]),
}

impl TransparentAddress {
    pub fn script(&self) -> Script {
        match self {
            TransparentAddress::PublicKeyHash(hash) => Script::p2pkh(hash),
            TransparentAddress::ScriptHash(hash) => Script::p2sh(hash),
        }
    }

    pub fn key_id(&self) -> Option<KeyId> {
        match self {
            TransparentAddress::PublicKeyHash(hash) => Some(KeyId::from_bytes(*hash)),
            TransparentAddress::ScriptHash(_) => None,
        }
    }
}

impl From<KeyId> for TransparentAddress {
    fn from(key_id: KeyId) -> Self {
        TransparentAddress::PublicKeyHash(*key_id.as_bytes())
    }
}

/// Any destination the wallet can pay to or receive at.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PaymentAddress {
    Transparent(TransparentAddress),
    Sprout(SproutPaymentAddress),
    Sapling(sapling::PaymentAddress),
}

impl PaymentAddress {
    fn tag(&self) -> u8 {
        match self {
            PaymentAddress::Transparent(TransparentAddress::PublicKeyHash(_)) => 0,
            PaymentAddress::Transparent(TransparentAddress::ScriptHash(_)) => 1,
            PaymentAddress::Sprout(_) => 2,
            PaymentAddress::Sapling(_) => 3,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            PaymentAddress::Transparent(
                TransparentAddress::PublicKeyHash(h) | TransparentAddress::ScriptHash(h),
            ) => h.to_vec(),
            PaymentAddress::Sprout(addr) => addr.to_bytes().to_vec(),
            PaymentAddress::Sapling(addr) => addr.to_bytes().to_vec(),
        }
    }

    pub fn is_shielded(&self) -> bool {
        !matches!(self, PaymentAddress::Transparent(_))
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        fn array<R: Read, const N: usize>(mut reader: R) -> io::Result<[u8; N]> {
            let mut bytes = [0; N];
            reader.read_exact(&mut bytes)?;
            Ok(bytes)
        }

        match reader.read_u8()? {
            0 => Ok(PaymentAddress::Transparent(
                TransparentAddress::PublicKeyHash(array(&mut reader)?),
            )),
            1 => Ok(PaymentAddress::Transparent(TransparentAddress::ScriptHash(
                array(&mut reader)?,
            ))),
            2 => Ok(PaymentAddress::Sprout(SproutPaymentAddress::from_bytes(
                &array(&mut reader)?,
            ))),
            3 => sapling::PaymentAddress::from_bytes(&array(&mut reader)?)
                .map(PaymentAddress::Sapling)
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "invalid Sapling address")
                }),
            t => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown address type {}", t),
            )),
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u8(self.tag())?;
        writer.write_all(&self.payload())
    }
}

impl PartialOrd for PaymentAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PaymentAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tag()
            .cmp(&other.tag())
            .then_with(|| self.payload().cmp(&other.payload()))
    }
}

impl fmt::Debug for PaymentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentAddress::Transparent(addr) => f.debug_tuple("Transparent").field(addr).finish(),
            PaymentAddress::Sprout(addr) => f.debug_tuple("Sprout").field(addr).finish(),
            PaymentAddress::Sapling(addr) => f
                .debug_tuple("Sapling")
                .field(&hex::encode(addr.to_bytes()))
                .finish(),
        }
    }
}

impl From<TransparentAddress> for PaymentAddress {
    fn from(addr: TransparentAddress) -> Self {
        PaymentAddress::Transparent(addr)
    }
}

impl From<SproutPaymentAddress> for PaymentAddress {
    fn from(addr: SproutPaymentAddress) -> Self {
        PaymentAddress::Sprout(addr)
    }
}

impl From<sapling::PaymentAddress> for PaymentAddress {
    fn from(addr: sapling::PaymentAddress) -> Self {
        PaymentAddress::Sapling(addr)
    }
}
