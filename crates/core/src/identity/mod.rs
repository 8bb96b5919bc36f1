pub mod identity;
pub mod keypair;
pub mod router_id;

pub use identity::{Identity, IdentityError};
pub use keypair::{KeyPair, KeyPairError, PublicKey};
pub use router_id::RouterId;
