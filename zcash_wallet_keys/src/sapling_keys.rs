//! Sapling viewing material held by the vault.

use std::fmt;

use sapling::{
    keys::NullifierDerivingKey, note_encryption::PreparedIncomingViewingKey,
    zip32::DiversifiableFullViewingKey, PaymentAddress, SaplingIvk,
};
use zip32::Scope;

/// The canonical encoding of a Sapling incoming viewing key, used as a map key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IvkTag([u8; 32]);

impl IvkTag {
    pub fn from_ivk(ivk: &SaplingIvk) -> Self {
        IvkTag(ivk.to_repr())
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        IvkTag(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for IvkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IvkTag").field(&hex::encode(self.0)).finish()
    }
}

impl fmt::Display for IvkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Everything derivable from a Sapling full viewing key that the wallet needs while
/// scanning and tracking notes.
#[derive(Clone)]
pub struct SaplingViewingKey {
    dfvk: DiversifiableFullViewingKey,
    ivk: SaplingIvk,
}

impl SaplingViewingKey {
    pub fn new(dfvk: DiversifiableFullViewingKey) -> Self {
        let ivk = dfvk.to_ivk(Scope::External);
        SaplingViewingKey { dfvk, ivk }
    }

    pub fn dfvk(&self) -> &DiversifiableFullViewingKey {
        &self.dfvk
    }

    pub fn ivk(&self) -> &SaplingIvk {
        &self.ivk
    }

    pub fn tag(&self) -> IvkTag {
        IvkTag::from_ivk(&self.ivk)
    }

    pub fn prepared_ivk(&self) -> PreparedIncomingViewingKey {
        PreparedIncomingViewingKey::new(&self.ivk)
    }

    pub fn nk(&self) -> NullifierDerivingKey {
        self.dfvk.to_nk(Scope::External)
    }

    pub fn default_address(&self) -> PaymentAddress {
        self.dfvk.default_address().1
    }

    pub fn to_bytes(&self) -> [u8; 128] {
        self.dfvk.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8; 128]) -> Option<Self> {
        DiversifiableFullViewingKey::from_bytes(bytes).map(SaplingViewingKey::new)
    }
}

impl fmt::Debug for SaplingViewingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaplingViewingKey")
            .field("ivk", &self.tag())
            .finish_non_exhaustive()
    }
}
