use std::io::ErrorKind;
use thiserror::Error;

use crate::wire::MAX_FRAME_SIZE;

/// Errors produced by the peer engine.
///
/// Negotiation failures surface synchronously from `Peer::associate` and
/// always happen before any background task starts. Steady-state transport
/// errors are classified with [`PeerError::is_expected_disconnect`] and
/// [`PeerError::is_malformed`]; nothing at this layer is retried.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("connected to self (nonce {0:#018x} echoed back)")]
    SelfConnection(u64),

    #[error("protocol version {advertised} below minimum {minimum}")]
    ProtocolTooOld { advertised: u32, minimum: u32 },

    #[error("duplicate version message")]
    DuplicateVersion,

    #[error("expected version message, got {0}")]
    NoVersionFirst(&'static str),

    #[error("version negotiation timed out")]
    NegotiateTimeout,

    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(u32),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    /// True for failures that are a normal part of a connection ending:
    /// the remote closed cleanly or the transport was torn down under us.
    /// These are logged quietly; everything else is unexpected.
    pub fn is_expected_disconnect(&self) -> bool {
        match self {
            PeerError::Io(e) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected
            ),
            _ => false,
        }
    }

    /// True when the remote sent bytes we could frame but not decode, or an
    /// oversized frame. Warrants a best-effort reject before teardown.
    pub fn is_malformed(&self) -> bool {
        matches!(self, PeerError::Malformed(_) | PeerError::FrameTooLarge(_))
    }
}
