//! Per-connection peer protocol engine for the Ember network.
//!
//! Each [`Peer`](peer::Peer) owns exactly one connection to a remote node.
//! After a synchronous version handshake it runs four cooperating tasks —
//! input pump, output pump, outbound queue multiplexer and stall monitor —
//! that communicate only through channels and two narrow locks. Everything
//! above this layer (consensus, mempool, address management, reconnect
//! policy) lives in external collaborators.

pub mod cache;
pub mod config;
pub mod error;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod queue;
pub mod stall;
pub mod wire;

pub use cache::{RecencySet, SentNonces};
pub use config::{MessageHandlers, NoopHandlers, PeerConfig};
pub use error::PeerError;
pub use handshake::Negotiated;
pub use message::{InvItem, InvKind, NetworkMessage, RejectCode};
pub use peer::{Direction, Peer, PeerSnapshot};
pub use queue::OutboundMessage;

/// Highest protocol version this node speaks. Negotiation settles on
/// `min(local ceiling, remote advertised)`.
pub const PROTOCOL_VERSION: u32 = 70013;

/// Absolute floor: versions below this predate ping nonces and cannot be
/// spoken to at all.
pub const MIN_PROTOCOL_VERSION: u32 = 60001;

/// First protocol version that understands reject messages. Used as the
/// default feature-specific floor in [`PeerConfig`](config::PeerConfig).
pub const REJECT_PROTOCOL_VERSION: u32 = 70002;
