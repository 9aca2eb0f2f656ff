use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::connection::{ConnectionHandle, ConnectionSet};
use super::coordinator::SignalingCoordinator;
use super::messages::ClientMessage;
use super::types::{ConnectionId, Outbound, RoomId, SignalingError};

const ROUTER_MAILBOX: usize = 1024;

/// Commands sent to the room router actor
pub(crate) enum RouterCommand {
    Attach {
        room: RoomId,
        conn: ConnectionId,
        tx: mpsc::UnboundedSender<Outbound>,
        reply: oneshot::Sender<Result<RoomHandle, SignalingError>>,
    },
    /// Sent by a room actor whose last connection is gone. `opened` is how
    /// many `Open`s it had processed at that point.
    Release { room: RoomId, opened: u64 },
    RoomCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Commands sent to one room's actor
pub(crate) enum RoomCommand {
    Open {
        conn: ConnectionId,
        tx: mpsc::UnboundedSender<Outbound>,
    },
    Message {
        conn: ConnectionId,
        msg: ClientMessage,
    },
    Close {
        conn: ConnectionId,
    },
    Shutdown,
}

struct RoomEntry {
    handle: RoomHandle,
    /// `Open`s forwarded to this room so far
    opened: u64,
}

pub(crate) async fn router_actor(
    mut rx: mpsc::Receiver<RouterCommand>,
    self_tx: mpsc::Sender<RouterCommand>,
) {
    let mut rooms: HashMap<RoomId, RoomEntry> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RouterCommand::Attach {
                room,
                conn,
                tx,
                reply,
            } => {
                let result = attach(&mut rooms, &self_tx, room, conn, tx);
                let _ = reply.send(result);
            }

            RouterCommand::Release { room, opened } => {
                let idle = rooms
                    .get(&room)
                    .is_some_and(|entry| entry.opened == opened);
                if idle {
                    if let Some(entry) = rooms.remove(&room) {
                        let _ = entry.handle.tx.send(RoomCommand::Shutdown);
                    }
                    info!("Room {} removed (empty)", room);
                } else {
                    debug!("Room {} has a connection in flight, keeping it", room);
                }
            }

            RouterCommand::RoomCount { reply } => {
                let _ = reply.send(rooms.len());
            }
        }
    }
}

fn attach(
    rooms: &mut HashMap<RoomId, RoomEntry>,
    router_tx: &mpsc::Sender<RouterCommand>,
    room: RoomId,
    conn: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
) -> Result<RoomHandle, SignalingError> {
    let mut open = RoomCommand::Open { conn, tx };

    // A room actor only stops after the router has dropped it, so a failed
    // send here means it died some other way. Replace it once.
    for _ in 0..2 {
        let entry = rooms
            .entry(room.clone())
            .or_insert_with(|| spawn_room(room.clone(), router_tx.clone()));

        match entry.handle.tx.send(open) {
            Ok(()) => {
                entry.opened += 1;
                return Ok(entry.handle.clone());
            }
            Err(mpsc::error::SendError(cmd)) => {
                warn!("Room {} actor is gone, recreating", room);
                rooms.remove(&room);
                open = cmd;
            }
        }
    }

    Err(SignalingError::RoomClosed(room))
}

fn spawn_room(room: RoomId, router_tx: mpsc::Sender<RouterCommand>) -> RoomEntry {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(room_actor(room.clone(), rx, router_tx));
    info!("Room {} created", room);

    RoomEntry {
        handle: RoomHandle { room, tx },
        opened: 0,
    }
}

/// One task per room. Commands are handled strictly one at a time and each
/// one runs to completion before the next is read.
pub(crate) async fn room_actor(
    room: RoomId,
    mut rx: mpsc::UnboundedReceiver<RoomCommand>,
    router_tx: mpsc::Sender<RouterCommand>,
) {
    let mut conns = ConnectionSet::new();
    let mut opened: u64 = 0;
    let mut released_at: Option<u64> = None;

    while let Some(cmd) = rx.recv().await {
        // rebuilt per event: nothing but the connection set carries over
        let coordinator = SignalingCoordinator::new(&room);

        match cmd {
            RoomCommand::Open { conn, tx } => {
                opened += 1;
                coordinator.on_open(&mut conns, ConnectionHandle::new(conn, tx));
            }
            RoomCommand::Message { conn, msg } => {
                coordinator.on_message(&mut conns, conn, msg);
            }
            RoomCommand::Close { conn } => {
                coordinator.on_close(&mut conns, conn);
            }
            RoomCommand::Shutdown => {
                if conns.is_empty() {
                    break;
                }
                continue;
            }
        }

        if conns.is_empty() && released_at != Some(opened) {
            released_at = Some(opened);
            let release = RouterCommand::Release {
                room: room.clone(),
                opened,
            };
            if router_tx.send(release).await.is_err() {
                break;
            }
        }
    }

    debug!("Room {} actor stopped", room);
}

/// Handle to one room's actor, held by each of its connections
#[derive(Clone)]
pub struct RoomHandle {
    room: RoomId,
    pub(crate) tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Forward a parsed client message
    pub fn dispatch(&self, conn: ConnectionId, msg: ClientMessage) -> Result<(), SignalingError> {
        self.tx
            .send(RoomCommand::Message { conn, msg })
            .map_err(|_| SignalingError::RoomClosed(self.room.clone()))
    }

    /// Report that the transport for `conn` has closed or failed
    pub fn close(&self, conn: ConnectionId) {
        let _ = self.tx.send(RoomCommand::Close { conn });
    }
}

/// Handle to communicate with the room router actor
#[derive(Clone)]
pub struct RoomRouterHandle {
    pub(crate) tx: mpsc::Sender<RouterCommand>,
}

impl Default for RoomRouterHandle {
    fn default() -> Self {
        Self::spawn()
    }
}

impl RoomRouterHandle {
    /// Start the router actor. Must be called inside a tokio runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<RouterCommand>(ROUTER_MAILBOX);
        tokio::spawn(router_actor(rx, tx.clone()));
        Self { tx }
    }

    /// Hand a connection to the room's coordinator, creating the room if needed
    pub async fn attach(
        &self,
        room: RoomId,
        conn: ConnectionId,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Result<RoomHandle, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::Attach {
                room,
                conn,
                tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SignalingError::Internal("router channel closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("router channel closed".to_string()))?
    }

    /// Number of rooms with at least one open connection
    pub async fn room_count(&self) -> Result<usize, SignalingError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RouterCommand::RoomCount { reply: reply_tx })
            .await
            .map_err(|_| SignalingError::Internal("router channel closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| SignalingError::Internal("router channel closed".to_string()))
    }
}
