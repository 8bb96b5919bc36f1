/// Bridge to the blockchain daemon
///
/// Consumes the external service-node RPC: the router whitelist feeds the
/// RC lookup handler, LNS names resolve for the endpoint, pings carry our
/// version, and peer-stats requests are answered from the peer db. The
/// wire channel is behind the ChainRpc trait; HttpChainRpc is the JSON-RPC
/// implementation the router wires up from `rpc_url`.

use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use veilnet_common::config::tick::RPC_PING_INTERVAL;
use veilnet_core::identity::RouterId;
use veilnet_core::router::peer_db::PeerStats;
use veilnet_core::service::endpoint::NameResolver;
use veilnet_core::service::Address;
use veilnet_core::{PeerDb, RcLookupHandler};

/// Daemon version triple carried in pings
pub const VERSION: (u16, u16, u16) = (0, 2, 0);

/// Service-node list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeListResponse {
    /// Top block hash the list was computed at
    pub block_hash: String,

    /// When true and `routers` is absent, nothing changed since our last
    /// poll
    pub unchanged: bool,

    pub routers: Option<Vec<String>>,
}

/// The external RPC surface we consume
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Fetch the active service-node list
    ///
    /// `have_hash` is the block hash of our cached list; the node may
    /// answer `unchanged` against it.
    async fn get_service_node_list(&self, have_hash: &str) -> Option<NodeListResponse>;

    /// Ping with our version triple
    async fn ping(&self, version: (u16, u16, u16)) -> bool;

    /// Resolve an LNS name to a service address
    async fn lns_resolve(&self, name: &str) -> Option<Address>;
}

/// Periodic bridge driving whitelist refresh and pings
pub struct RpcBridge {
    rpc: Arc<dyn ChainRpc>,
    rc_lookup: RcLookupHandler,
    peer_db: Arc<PeerDb>,

    /// Block hash our cached whitelist was computed at
    last_block_hash: Mutex<String>,
}

impl RpcBridge {
    pub fn new(rpc: Arc<dyn ChainRpc>, rc_lookup: RcLookupHandler, peer_db: Arc<PeerDb>) -> Self {
        Self {
            rpc,
            rc_lookup,
            peer_db,
            last_block_hash: Mutex::new(String::new()),
        }
    }

    /// Run the ping + whitelist poll loop until the task is aborted
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(RPC_PING_INTERVAL);
        loop {
            interval.tick().await;
            if !self.rpc.ping(VERSION).await {
                debug!("rpc ping failed, chain daemon unreachable");
                continue;
            }
            self.update_service_node_list().await;
        }
    }

    /// Poll the node list and feed the whitelist on change
    pub async fn update_service_node_list(&self) {
        let have_hash = self.last_block_hash.lock().await.clone();
        let Some(response) = self.rpc.get_service_node_list(&have_hash).await else {
            debug!("service node list unavailable");
            return;
        };

        if response.unchanged && response.routers.is_none() {
            // nothing changed; a silent return matches the node's contract
            if response.block_hash != have_hash && !have_hash.is_empty() {
                // the chain moved under us (daemon restarted); force a full
                // list on the next poll by clearing our hash
                warn!("block hash changed on unchanged response, cache dirty");
                self.last_block_hash.lock().await.clear();
            }
            return;
        }

        let Some(routers) = response.routers else {
            return;
        };

        let parsed: Vec<RouterId> = routers
            .iter()
            .filter_map(|hex| match RouterId::from_hex(hex) {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(router = %hex, "bad router in node list: {}", e);
                    None
                }
            })
            .collect();

        self.rc_lookup.set_router_whitelist(&parsed);
        *self.last_block_hash.lock().await = response.block_hash;
        info!(count = parsed.len(), "whitelist refreshed from chain");
    }

    /// Answer a get_peer_stats request from the peer db
    pub async fn get_peer_stats(&self, routers: &[RouterId]) -> Vec<(RouterId, PeerStats)> {
        self.peer_db.get_many(routers).await
    }

    /// Binary-encode a peer-stats reply
    pub async fn encode_peer_stats(&self, routers: &[RouterId]) -> Vec<u8> {
        let stats = self.get_peer_stats(routers).await;
        bincode::serialize(&stats).unwrap_or_default()
    }
}

/// NameResolver adapter so the endpoint's LNS cache can use the bridge
pub struct RpcNameResolver {
    pub rpc: Arc<dyn ChainRpc>,
}

#[async_trait]
impl NameResolver for RpcNameResolver {
    async fn resolve(&self, name: &str) -> Option<Address> {
        self.rpc.lns_resolve(name).await
    }
}

/// JSON-RPC client for the chain daemon
pub struct HttpChainRpc {
    http: reqwest::Client,
    url: String,
}

impl HttpChainRpc {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }

    /// POST one JSON-RPC call and return its `result`
    async fn call(&self, method: &str, params: serde_json::Value) -> Option<serde_json::Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": method,
            "params": params,
        });
        let response = match self.http.post(&self.url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(method, "rpc request failed: {}", e);
                return None;
            }
        };
        let value: serde_json::Value = match response.json().await {
            Ok(value) => value,
            Err(e) => {
                debug!(method, "rpc response unreadable: {}", e);
                return None;
            }
        };
        if let Some(error) = value.get("error") {
            debug!(method, "rpc error: {}", error);
            return None;
        }
        value.get("result").cloned()
    }
}

#[async_trait]
impl ChainRpc for HttpChainRpc {
    async fn get_service_node_list(&self, have_hash: &str) -> Option<NodeListResponse> {
        let params = json!({
            "poll_block_hash": have_hash,
            "fields": { "pubkey_ed25519": true, "active": true },
        });
        let result = self.call("get_service_nodes", params).await?;
        parse_node_list(&result)
    }

    async fn ping(&self, version: (u16, u16, u16)) -> bool {
        let params = json!({ "version": [version.0, version.1, version.2] });
        self.call("veilnet_ping", params).await.is_some()
    }

    async fn lns_resolve(&self, name: &str) -> Option<Address> {
        let name = name.trim().trim_end_matches('.').to_lowercase();
        let name_hash = blake3::hash(name.as_bytes());
        let params = json!({
            "type": 2,
            "name_hash": hex::encode(name_hash.as_bytes()),
        });
        let result = self.call("lns_resolve", params).await?;
        let encrypted = result.get("encrypted_value")?.as_str()?;
        let nonce = result.get("nonce")?.as_str()?;
        decrypt_lns_value(&name, encrypted, nonce)
    }
}

/// Parse a `get_service_nodes` result into the list response
fn parse_node_list(result: &serde_json::Value) -> Option<NodeListResponse> {
    let block_hash = result.get("block_hash")?.as_str()?.to_string();
    let unchanged = result
        .get("unchanged")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let routers = result.get("service_node_states").map(|states| {
        states
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| {
                        entry
                            .get("active")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(true)
                    })
                    .filter_map(|entry| entry.get("pubkey_ed25519"))
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    });

    Some(NodeListResponse {
        block_hash,
        unchanged,
        routers,
    })
}

/// Open a sealed LNS record with the key its name derives
fn decrypt_lns_value(name: &str, encrypted_hex: &str, nonce_hex: &str) -> Option<Address> {
    let ciphertext = hex::decode(encrypted_hex).ok()?;
    let nonce = hex::decode(nonce_hex).ok()?;
    if nonce.len() != 24 {
        return None;
    }

    let key = lns_seal_key(name);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
        .ok()?;

    let bytes: [u8; 32] = plaintext.try_into().ok()?;
    Some(Address::from_bytes(bytes))
}

fn lns_seal_key(name: &str) -> [u8; 32] {
    blake3::derive_key("veilnet lns seal v1", name.as_bytes())
}
