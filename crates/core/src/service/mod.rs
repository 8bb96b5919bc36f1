pub mod address;
pub mod auth;
pub mod endpoint;
pub mod introset;
pub mod lookup;
pub mod outbound_context;
pub mod protocol;

pub use address::{Address, AddressError, ConvoTag};
pub use auth::{AuthPolicy, AuthResult};
pub use endpoint::{Endpoint, EndpointConfig, FrameTransport, PacketHandler};
pub use introset::{EncryptedIntroSet, IntroSet, IntroSetError, Introduction};
pub use outbound_context::{ContextState, OutboundContext};
pub use protocol::{ProtocolFrame, ProtocolMessage, ProtocolType};
