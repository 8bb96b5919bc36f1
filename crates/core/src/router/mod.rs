pub mod contact;
pub mod nodedb;
pub mod peer_db;
pub mod rc_lookup;

pub use contact::{ContactError, RouterContact, Signature};
pub use nodedb::NodeDb;
pub use peer_db::{PeerDb, PeerStats};
pub use rc_lookup::{LookupResult, RcLookupHandler};
