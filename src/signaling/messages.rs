use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{OutboundMessage, PeerId, SignalingError};

/// Messages sent from client to server.
///
/// In relay and status messages `peer_id` is the target peer. The sender is
/// always taken from the sending connection's attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Announce this connection's identity to the room
    #[serde(rename = "join")]
    Join { peer_id: PeerId, user_name: String },

    /// Forward a session description to one peer
    #[serde(rename = "relaySDP")]
    RelaySdp {
        peer_id: PeerId,
        #[serde(default)]
        session_description: Value,
    },

    /// Forward an ICE candidate to one peer
    #[serde(rename = "relayICE")]
    RelayIce {
        peer_id: PeerId,
        #[serde(default)]
        ice_candidate: Value,
    },

    /// Forward mute/video state to one peer
    #[serde(rename = "peerStatus")]
    PeerStatus {
        peer_id: PeerId,
        #[serde(default)]
        status: Value,
    },

    /// Leave the room
    #[serde(rename = "leave")]
    Leave,

    /// Any `type` this server does not know about
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Messages sent from server to client.
///
/// `peer_id` is the originating peer, derived from its attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// A peer is present; `should_create_offer` tells the receiver whether it
    /// initiates negotiation with that peer
    #[serde(rename = "addPeer")]
    AddPeer {
        peer_id: PeerId,
        user_name: String,
        should_create_offer: bool,
    },

    #[serde(rename = "removePeer")]
    RemovePeer { peer_id: PeerId },

    #[serde(rename = "sessionDescription")]
    SessionDescription {
        peer_id: PeerId,
        session_description: Value,
    },

    #[serde(rename = "iceCandidate")]
    IceCandidate { peer_id: PeerId, ice_candidate: Value },

    #[serde(rename = "peerStatus")]
    PeerStatus { peer_id: PeerId, status: Value },
}

impl ServerMessage {
    /// Serialize once so the frame can be shared across a fan-out.
    pub fn to_outbound(&self) -> Result<OutboundMessage, SignalingError> {
        Ok(OutboundMessage::from(serde_json::to_string(self)?))
    }
}
