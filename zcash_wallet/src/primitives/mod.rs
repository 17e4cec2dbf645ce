//! The chain data structures consumed by the wallet.

pub mod address;
pub mod block;
pub mod script;
pub mod transaction;

pub use address::{PaymentAddress, TransparentAddress};
pub use block::{Block, BlockHash};
pub use script::Script;
pub use transaction::{Nullifier, OutPoint, Transaction, TxIn, TxOut};
