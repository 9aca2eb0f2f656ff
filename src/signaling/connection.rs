use std::collections::BTreeMap;
use std::collections::btree_map;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use super::types::{Attachment, ConnectionId, Outbound, OutboundMessage, SignalingError};

static NEXT_JOIN_STAMP: AtomicU64 = AtomicU64::new(1);

/// One open connection as the room sees it: the writer channel plus the
/// serialized identity attached to it.
///
/// The attachment is kept as JSON text rather than a live struct so that the
/// only per-connection state is something that could be handed back by a
/// host that evicts and rebuilds the coordinator.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
    attachment: Option<String>,
    /// Increases with every attachment set, process-wide
    join_stamp: Option<u64>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id,
            tx,
            attachment: None,
            join_stamp: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, msg: OutboundMessage) -> Result<(), SignalingError> {
        self.tx
            .send(Outbound::Text(msg))
            .map_err(|_| SignalingError::PeerGone)
    }

    /// Ask the writer to close the socket. A writer that is already gone is
    /// treated as closed.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn serialize_attachment(&mut self, attachment: &Attachment) -> Result<(), SignalingError> {
        self.attachment = Some(serde_json::to_string(attachment)?);
        self.join_stamp = Some(NEXT_JOIN_STAMP.fetch_add(1, Ordering::Relaxed));
        Ok(())
    }

    /// When the current attachment was set, relative to other connections.
    pub fn join_stamp(&self) -> Option<u64> {
        self.join_stamp
    }

    /// Re-read the identity. Unreadable attachments count as absent.
    pub fn deserialize_attachment(&self) -> Option<Attachment> {
        let raw = self.attachment.as_deref()?;
        match serde_json::from_str(raw) {
            Ok(attachment) => Some(attachment),
            Err(e) => {
                debug!("Discarding unreadable attachment on {}: {}", self.id, e);
                None
            }
        }
    }

    pub fn clear_attachment(&mut self) -> Option<Attachment> {
        let attachment = self.deserialize_attachment();
        self.attachment = None;
        self.join_stamp = None;
        attachment
    }
}

/// The live connections of one room, keyed and ordered by [`ConnectionId`].
///
/// This is transport bookkeeping only. Who is in the room is always computed
/// by walking it and reading each handle's attachment.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    connections: BTreeMap<ConnectionId, ConnectionHandle>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, handle: ConnectionHandle) {
        self.connections.insert(handle.id(), handle);
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionHandle> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ConnectionHandle> {
        self.connections.get_mut(&id)
    }

    pub fn iter(&self) -> btree_map::Values<'_, ConnectionId, ConnectionHandle> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
