//! P2P wire messages consumed and produced by the peer engine.
//!
//! Payloads the engine does not inspect (transactions, filter contents)
//! stay opaque byte vectors; only command names and the listed fields drive
//! control flow.

use serde::{Deserialize, Serialize};

/// Type tag of an inventory vector.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvKind {
    Tx,
    Block,
}

/// A typed content identifier advertised between peers for relay.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvItem {
    pub kind: InvKind,
    pub hash: [u8; 32],
}

impl InvItem {
    pub fn new(kind: InvKind, hash: [u8; 32]) -> Self {
        Self { kind, hash }
    }

    /// Short hash prefix for log lines.
    pub fn short_hash(&self) -> String {
        hex::encode(&self.hash[..8])
    }
}

/// Reason codes carried by reject messages.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Malformed,
    Obsolete,
    Duplicate,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum NetworkMessage {
    Version {
        protocol_version: u32,
        services: u64,
        timestamp: i64,
        /// Remote address as we see it.
        recv_addr: String,
        /// Our own best routable address, masked when behind a proxy.
        from_addr: String,
        /// Random nonce for self-connection detection.
        nonce: u64,
        user_agent: String,
        start_height: u64,
        disable_relay: bool,
    },
    Verack,
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    GetAddr,
    Addr(Vec<String>),
    Inv(Vec<InvItem>),
    GetData(Vec<InvItem>),
    NotFound(Vec<InvItem>),
    /// Raw serialized transaction; validation happens upstream.
    Tx(Vec<u8>),
    Reject {
        /// Command the rejection refers to.
        message: String,
        code: RejectCode,
        reason: String,
    },
    FilterLoad(Vec<u8>),
    FilterAdd(Vec<u8>),
    FilterClear,
    FeeFilter(u64),
}

impl NetworkMessage {
    /// Wire command name (for logging and stall bookkeeping).
    pub fn command(&self) -> &'static str {
        match self {
            NetworkMessage::Version { .. } => "version",
            NetworkMessage::Verack => "verack",
            NetworkMessage::Ping { .. } => "ping",
            NetworkMessage::Pong { .. } => "pong",
            NetworkMessage::GetAddr => "getaddr",
            NetworkMessage::Addr(_) => "addr",
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::NotFound(_) => "notfound",
            NetworkMessage::Tx(_) => "tx",
            NetworkMessage::Reject { .. } => "reject",
            NetworkMessage::FilterLoad(_) => "filterload",
            NetworkMessage::FilterAdd(_) => "filteradd",
            NetworkMessage::FilterClear => "filterclear",
            NetworkMessage::FeeFilter(_) => "feefilter",
        }
    }

    /// Build a reject for `command` with the given code and reason.
    pub fn reject(command: &str, code: RejectCode, reason: impl Into<String>) -> Self {
        NetworkMessage::Reject {
            message: command.to_string(),
            code,
            reason: reason.into(),
        }
    }
}

/// Reply commands an outgoing command expects, used by the stall monitor to
/// register response deadlines. Keep-alive pings are deliberately absent:
/// they may legitimately queue behind a backlog.
pub fn expected_responses(command: &str) -> &'static [&'static str] {
    match command {
        "getdata" => &["tx", "notfound"],
        _ => &[],
    }
}

/// Commands that satisfy each other's pending deadlines. A getdata is
/// answered by either the data itself or a notfound, so receiving one
/// member clears the whole class.
pub fn response_class(command: &str) -> &'static [&'static str] {
    match command {
        "tx" | "notfound" => &["tx", "notfound"],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_getdata_expects_data_or_notfound() {
        assert_eq!(expected_responses("getdata"), &["tx", "notfound"]);
        assert!(expected_responses("ping").is_empty());
        assert!(expected_responses("inv").is_empty());
    }

    #[test]
    fn test_response_class_is_symmetric() {
        assert_eq!(response_class("tx"), response_class("notfound"));
        assert!(response_class("addr").is_empty());
    }

    #[test]
    fn test_command_names() {
        let msg = NetworkMessage::GetData(vec![InvItem::new(InvKind::Tx, [0u8; 32])]);
        assert_eq!(msg.command(), "getdata");
        assert_eq!(NetworkMessage::Verack.command(), "verack");
        assert_eq!(
            NetworkMessage::reject("version", RejectCode::Duplicate, "dup").command(),
            "reject"
        );
    }
}
