//! Peer configuration and the per-message handler seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PeerError;
use crate::handshake::Negotiated;
use crate::message::{InvItem, NetworkMessage, RejectCode};
use crate::peer::Peer;
use crate::{PROTOCOL_VERSION, REJECT_PROTOCOL_VERSION};

/// Collaborator callback that reports the newest locally known block height
/// (advertised in our version message).
pub type BestHeightFn = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Collaborator callback that maps a configured host address to the routable
/// network address to advertise. Returns `None` when resolution fails, in
/// which case the configured address is advertised as-is.
pub type AddressResolverFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Application callbacks invoked by the input pump, one per message type.
///
/// Every method has a no-op default, so implementors register only the
/// messages they care about. Handlers run on the input pump task and are
/// bracketed for the stall monitor, so a slow handler extends pending
/// response deadlines instead of producing false stall positives.
///
/// `on_read`/`on_write` are advisory observability hooks for external
/// metrics and logging; they never affect control flow.
#[async_trait]
pub trait MessageHandlers: Send + Sync {
    async fn on_version(&self, _peer: &Peer, _version: &Negotiated) {}
    async fn on_verack(&self, _peer: &Peer) {}
    async fn on_ping(&self, _peer: &Peer, _nonce: u64) {}
    async fn on_pong(&self, _peer: &Peer, _nonce: u64) {}
    async fn on_getaddr(&self, _peer: &Peer) {}
    async fn on_addr(&self, _peer: &Peer, _addresses: &[String]) {}
    async fn on_inv(&self, _peer: &Peer, _items: &[InvItem]) {}
    async fn on_getdata(&self, _peer: &Peer, _items: &[InvItem]) {}
    async fn on_notfound(&self, _peer: &Peer, _items: &[InvItem]) {}
    async fn on_tx(&self, _peer: &Peer, _raw: &[u8]) {}
    async fn on_reject(&self, _peer: &Peer, _command: &str, _code: RejectCode, _reason: &str) {}
    async fn on_filter_load(&self, _peer: &Peer, _filter: &[u8]) {}
    async fn on_filter_add(&self, _peer: &Peer, _data: &[u8]) {}
    async fn on_filter_clear(&self, _peer: &Peer) {}
    async fn on_fee_filter(&self, _peer: &Peer, _min_fee_rate: u64) {}

    fn on_read(&self, _bytes: usize, _message: Option<&NetworkMessage>, _error: Option<&PeerError>) {
    }
    fn on_write(&self, _bytes: usize, _message: &NetworkMessage, _error: Option<&PeerError>) {}
}

/// Handler set that ignores everything.
pub struct NoopHandlers;

#[async_trait]
impl MessageHandlers for NoopHandlers {}

/// Immutable per-peer configuration.
#[derive(Clone)]
pub struct PeerConfig {
    /// Local protocol version ceiling; negotiation settles on
    /// `min(protocol_version, remote advertised)`.
    pub protocol_version: u32,
    /// Feature-specific version floor. Remotes below it are rejected as
    /// obsolete before the absolute `MIN_PROTOCOL_VERSION` check.
    pub min_protocol_version: u32,
    /// Service bits advertised in our version message.
    pub services: u64,
    pub user_agent_name: String,
    pub user_agent_version: String,
    /// Our best routable address, advertised in the version message.
    pub local_address: String,
    /// Anonymizing proxy, if any. When set, the advertised local address is
    /// masked to an unroutable placeholder so the proxy is not leaked.
    pub proxy: Option<String>,
    /// Optional resolver from the configured local address to the routable
    /// one to advertise.
    pub resolve_address: Option<AddressResolverFn>,
    /// Advertise that we do not want transaction relay.
    pub disable_relay: bool,

    pub handlers: Arc<dyn MessageHandlers>,
    pub best_height: BestHeightFn,

    /// Bound on the whole version exchange, both directions.
    pub negotiate_timeout: Duration,
    /// Max quiet time on the read side before the peer is dropped.
    pub idle_timeout: Duration,
    pub stall_tick_interval: Duration,
    pub stall_response_timeout: Duration,
    /// Flush interval for queued inventory advertisements.
    pub trickle_interval: Duration,
    pub ping_interval: Duration,
    /// Maximum inventory items packed into a single inv message.
    pub max_inv_per_batch: usize,
    pub known_inventory_capacity: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            min_protocol_version: REJECT_PROTOCOL_VERSION,
            services: 0,
            user_agent_name: "emberd".to_string(),
            user_agent_version: env!("CARGO_PKG_VERSION").to_string(),
            local_address: "0.0.0.0:0".to_string(),
            proxy: None,
            resolve_address: None,
            disable_relay: false,
            handlers: Arc::new(NoopHandlers),
            best_height: Arc::new(|| 0),
            negotiate_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(5 * 60),
            stall_tick_interval: Duration::from_secs(15),
            stall_response_timeout: Duration::from_secs(30),
            trickle_interval: Duration::from_secs(10),
            ping_interval: Duration::from_secs(2 * 60),
            max_inv_per_batch: 1000,
            known_inventory_capacity: 1000,
        }
    }
}

impl PeerConfig {
    /// Full user agent string, e.g. `/emberd:0.4.2/`.
    pub fn user_agent(&self) -> String {
        format!("/{}:{}/", self.user_agent_name, self.user_agent_version)
    }

    /// Address to advertise as our own: masked when traffic goes through an
    /// anonymizing proxy, resolved through the configured resolver otherwise.
    pub fn advertised_address(&self) -> String {
        if self.proxy.is_some() {
            return "0.0.0.0:0".to_string();
        }
        if let Some(resolve) = &self.resolve_address {
            if let Some(resolved) = resolve(&self.local_address) {
                return resolved;
            }
        }
        self.local_address.clone()
    }
}
