pub mod dht;
pub mod handlers;
pub mod identity;
pub mod link;
pub mod path;
pub mod router;
pub mod service;
pub mod util;

pub use identity::{Identity, KeyPair, PublicKey, RouterId};
pub use link::{LinkManager, SessionMaker};
pub use router::{NodeDb, PeerDb, RcLookupHandler, RouterContact};
pub use service::{Address, ConvoTag, Endpoint, IntroSet, OutboundContext};
