//! Deciding which outputs and notes belong to the wallet.

use zcash_wallet_keys::{sapling_keys::IvkTag, sprout::SproutPaymentAddress, KeyVault};

use crate::primitives::{Script, TransparentAddress};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsMine {
    No,
    /// Visible to the wallet, but it holds no key able to spend it.
    WatchOnly,
    Spendable,
}

impl IsMine {
    pub fn is_mine(self) -> bool {
        self != IsMine::No
    }

    pub fn matches(self, filter: OwnershipFilter) -> bool {
        match (self, filter) {
            (IsMine::No, _) => false,
            (_, OwnershipFilter::All) => true,
            (IsMine::Spendable, OwnershipFilter::Spendable) => true,
            (IsMine::WatchOnly, OwnershipFilter::WatchOnly) => true,
            _ => false,
        }
    }
}

/// Which kinds of owned value a query should include.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnershipFilter {
    Spendable,
    WatchOnly,
    All,
}

pub trait Ownership {
    fn is_mine_script(&self, script: &Script) -> IsMine;

    fn sprout_ownership(&self, address: &SproutPaymentAddress) -> IsMine;

    fn sapling_ownership(&self, ivk: &IvkTag) -> IsMine;
}

impl Ownership for KeyVault {
    fn is_mine_script(&self, script: &Script) -> IsMine {
        if let Some(TransparentAddress::PublicKeyHash(hash)) = script.address() {
            let key_id = zcash_wallet_keys::transparent::KeyId::from_bytes(hash);
            if self.have_transparent_key(&key_id) && !self.private_keys_disabled() {
                return IsMine::Spendable;
            }
        }
        if self.have_watch_script(&script.0) {
            IsMine::WatchOnly
        } else {
            IsMine::No
        }
    }

    fn sprout_ownership(&self, address: &SproutPaymentAddress) -> IsMine {
        if self.have_sprout_spending_key(address) {
            IsMine::Spendable
        } else if self.sprout_viewing_key(address).is_some() {
            IsMine::WatchOnly
        } else {
            IsMine::No
        }
    }

    fn sapling_ownership(&self, ivk: &IvkTag) -> IsMine {
        if self.have_sapling_spending_key(ivk) {
            IsMine::Spendable
        } else if self.sapling_viewing_key(ivk).is_some() {
            IsMine::WatchOnly
        } else {
            IsMine::No
        }
    }
}

#[cfg(test)]
mod tests {
    use rand_chacha::ChaChaRng;
    use rand_core::SeedableRng;
    use zcash_protocol::consensus::NetworkType;
    use zcash_wallet_keys::{testing::seeded_vault, transparent::KeyId, transparent::KeyChain};

    use super::{IsMine, Ownership, OwnershipFilter};
    use crate::primitives::Script;

    #[test]
    fn transparent_ownership() {
        let mut rng = ChaChaRng::seed_from_u64(0);
        let mut vault = seeded_vault(NetworkType::Test, 1, &mut rng);
        let pubkey = vault
            .generate_transparent_key(KeyChain::External, 0, &mut rng)
            .unwrap();
        let mine = Script::p2pkh(KeyId::from_pubkey(&pubkey).as_bytes());
        assert_eq!(vault.is_mine_script(&mine), IsMine::Spendable);

        let watched = Script::p2sh(&[4; 20]);
        assert_eq!(vault.is_mine_script(&watched), IsMine::No);
        vault.add_watch_script(watched.0.clone());
        assert_eq!(vault.is_mine_script(&watched), IsMine::WatchOnly);

        assert!(IsMine::WatchOnly.matches(OwnershipFilter::All));
        assert!(!IsMine::WatchOnly.matches(OwnershipFilter::Spendable));
    }
}
