//! WebSocket signaling coordinator for WebRTC peers

mod actor;
mod connection;
mod coordinator;
mod messages;
mod server;
mod types;

pub use actor::{RoomHandle, RoomRouterHandle};
pub use connection::{ConnectionHandle, ConnectionSet};
pub use coordinator::SignalingCoordinator;
pub use messages::{ClientMessage, ServerMessage};
pub use server::{DEFAULT_SIGNALING_PORT, HEALTH_PATH, SignalingServer};
pub use types::{
    Attachment, ConnectionId, Outbound, OutboundMessage, PeerId, RoomId, SignalingError,
};
