//! Version negotiation.
//!
//! The outbound side sends its version message first and then reads the
//! remote's; the inbound side does the reverse. The whole exchange, both
//! directions, runs under a single timeout. A connection is never promoted
//! to "connected" unless negotiation succeeds.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::cache::SentNonces;
use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::message::{NetworkMessage, RejectCode};
use crate::peer::Direction;
use crate::wire;
use crate::MIN_PROTOCOL_VERSION;

/// Everything learned about the remote during a successful handshake.
#[derive(Debug, Clone)]
pub struct Negotiated {
    /// `min(local ceiling, remote advertised)`.
    pub protocol_version: u32,
    /// Version the remote actually advertised.
    pub advertised_version: u32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: u64,
    /// Remote wall-clock timestamp minus ours at receive time.
    pub time_offset: i64,
    /// Remote asked us not to relay transactions to it.
    pub disable_relay: bool,
}

/// Handshake result plus the bytes it moved, folded into peer statistics.
pub struct HandshakeOutcome {
    pub negotiated: Negotiated,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Run the version exchange for `direction` against the given transport
/// halves. Fails without side effects beyond best-effort reject messages.
pub async fn negotiate<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    addr: &str,
    cfg: &PeerConfig,
    sent_nonces: &SentNonces,
) -> Result<HandshakeOutcome, PeerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match timeout(
        cfg.negotiate_timeout,
        exchange(reader, writer, direction, addr, cfg, sent_nonces),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!("⏰ Version negotiation with {} timed out", addr);
            Err(PeerError::NegotiateTimeout)
        }
    }
}

async fn exchange<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    addr: &str,
    cfg: &PeerConfig,
    sent_nonces: &SentNonces,
) -> Result<HandshakeOutcome, PeerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sent = 0u64;
    let mut received = 0u64;

    match direction {
        Direction::Outbound => {
            sent += write_local_version(writer, addr, cfg, sent_nonces).await? as u64;
            let negotiated =
                read_remote_version(reader, writer, cfg, sent_nonces, &mut sent, &mut received)
                    .await?;
            Ok(HandshakeOutcome {
                negotiated,
                bytes_sent: sent,
                bytes_received: received,
            })
        }
        Direction::Inbound => {
            let negotiated =
                read_remote_version(reader, writer, cfg, sent_nonces, &mut sent, &mut received)
                    .await?;
            sent += write_local_version(writer, addr, cfg, sent_nonces).await? as u64;
            Ok(HandshakeOutcome {
                negotiated,
                bytes_sent: sent,
                bytes_received: received,
            })
        }
    }
}

async fn write_local_version<W>(
    writer: &mut W,
    addr: &str,
    cfg: &PeerConfig,
    sent_nonces: &SentNonces,
) -> Result<usize, PeerError>
where
    W: AsyncWrite + Unpin,
{
    // The nonce is registered process-wide before it hits the wire so a
    // looped-back connection is caught no matter which peer instance
    // receives it.
    let nonce = sent_nonces.next_nonce();

    let version = NetworkMessage::Version {
        protocol_version: cfg.protocol_version,
        services: cfg.services,
        timestamp: chrono::Utc::now().timestamp(),
        recv_addr: addr.to_string(),
        from_addr: cfg.advertised_address(),
        nonce,
        user_agent: cfg.user_agent(),
        start_height: (cfg.best_height)(),
        disable_relay: cfg.disable_relay,
    };

    debug!(
        "🤝 Sending version to {} (agent: {}, height: {})",
        addr,
        cfg.user_agent(),
        (cfg.best_height)()
    );
    wire::write_message(writer, &version).await
}

async fn read_remote_version<R, W>(
    reader: &mut R,
    writer: &mut W,
    cfg: &PeerConfig,
    sent_nonces: &SentNonces,
    sent: &mut u64,
    received: &mut u64,
) -> Result<Negotiated, PeerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (message, n) = match wire::read_message(reader).await? {
        Some(frame) => frame,
        None => {
            return Err(PeerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during version exchange",
            )))
        }
    };
    *received += n as u64;

    let NetworkMessage::Version {
        protocol_version,
        services,
        timestamp,
        nonce,
        user_agent,
        start_height,
        disable_relay,
        ..
    } = message
    else {
        // A version message must precede all others.
        let command = message.command();
        let reject = NetworkMessage::reject(
            command,
            RejectCode::Malformed,
            "a version message must precede all others",
        );
        if let Ok(n) = wire::write_message(writer, &reject).await {
            *sent += n as u64;
        }
        return Err(PeerError::NoVersionFirst(command));
    };

    // Self-connection check comes first: no reject, just abort.
    if sent_nonces.contains(nonce) {
        warn!("🔁 Disconnecting peer connected to self");
        return Err(PeerError::SelfConnection(nonce));
    }

    // Feature-specific floor, then the absolute one. Both obsolete.
    for minimum in [cfg.min_protocol_version, MIN_PROTOCOL_VERSION] {
        if protocol_version < minimum {
            let reason = format!(
                "protocol version must be {} or greater",
                minimum
            );
            let reject = NetworkMessage::reject("version", RejectCode::Obsolete, &reason);
            if let Ok(n) = wire::write_message(writer, &reject).await {
                *sent += n as u64;
            }
            warn!(
                "🚫 Rejecting obsolete peer: advertised version {} < {}",
                protocol_version, minimum
            );
            return Err(PeerError::ProtocolTooOld {
                advertised: protocol_version,
                minimum,
            });
        }
    }

    let negotiated = Negotiated {
        protocol_version: cfg.protocol_version.min(protocol_version),
        advertised_version: protocol_version,
        services,
        user_agent,
        start_height,
        time_offset: timestamp - chrono::Utc::now().timestamp(),
        disable_relay,
    };

    debug!(
        "✅ Negotiated protocol version {} (remote advertised {})",
        negotiated.protocol_version, negotiated.advertised_version
    );

    Ok(negotiated)
}
