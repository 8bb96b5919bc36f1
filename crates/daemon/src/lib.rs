/// VeilNet daemon library
///
/// Wires the core routing subsystem into a runnable node: the embedding
/// context, component wiring, the RPC bridge to the chain daemon, and the
/// status API.

pub mod api;
pub mod context;
pub mod freerange;
pub mod router;
pub mod rpc;

pub use context::Context;
pub use freerange::detect_free_range;
pub use router::Router;
pub use rpc::{ChainRpc, RpcBridge};
