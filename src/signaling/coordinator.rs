//! Join/leave/relay protocol for a single room.
//!
//! [`SignalingCoordinator`] holds nothing but the room id it logs under. Every
//! handler walks the room's [`ConnectionSet`] and re-reads attachments to find
//! out who is present, so a coordinator can be dropped and rebuilt between any
//! two events without changing behavior.

use serde_json::Value;
use tracing::{debug, info, warn};

use super::connection::{ConnectionHandle, ConnectionSet};
use super::messages::{ClientMessage, ServerMessage};
use super::types::{Attachment, ConnectionId, OutboundMessage, PeerId, RoomId};

pub struct SignalingCoordinator<'a> {
    room: &'a RoomId,
}

impl<'a> SignalingCoordinator<'a> {
    pub fn new(room: &'a RoomId) -> Self {
        Self { room }
    }

    /// Take ownership of a freshly upgraded connection. It starts unjoined.
    pub fn on_open(&self, conns: &mut ConnectionSet, handle: ConnectionHandle) {
        info!("Connection {} opened in room {}", handle.id(), self.room);
        conns.accept(handle);
    }

    pub fn on_message(&self, conns: &mut ConnectionSet, from: ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::Join { peer_id, user_name } => {
                self.join(conns, from, peer_id, user_name)
            }
            ClientMessage::RelaySdp {
                peer_id,
                session_description,
            } => self.relay_sdp(conns, from, &peer_id, session_description),
            ClientMessage::RelayIce {
                peer_id,
                ice_candidate,
            } => self.relay_ice(conns, from, &peer_id, ice_candidate),
            ClientMessage::PeerStatus { peer_id, status } => {
                self.peer_status(conns, from, &peer_id, status)
            }
            ClientMessage::Leave => self.leave(conns, from),
            ClientMessage::Unknown => {
                debug!("Ignoring unknown message type from {}", from);
            }
        }
    }

    /// Attach an identity to `from` and introduce it to everyone already here.
    ///
    /// The newcomer is told to create the offer towards each existing peer and
    /// each existing peer is told to wait, so exactly one side of every pair
    /// initiates.
    pub fn join(
        &self,
        conns: &mut ConnectionSet,
        from: ConnectionId,
        peer_id: PeerId,
        user_name: String,
    ) {
        let Some(conn) = conns.get(from) else {
            debug!("Join from unknown connection {}", from);
            return;
        };
        if let Some(existing) = conn.deserialize_attachment() {
            debug!(
                "Ignoring repeated join on {} (already {})",
                from, existing.peer_id
            );
            return;
        }

        let present: Vec<(ConnectionId, Attachment)> = roster(conns).collect();
        if present.iter().any(|(_, peer)| peer.peer_id == peer_id) {
            warn!(
                "Peer id {} joined room {} twice; routing follows the latest join",
                peer_id, self.room
            );
        }

        let attachment = Attachment { peer_id, user_name };
        let Some(conn) = conns.get_mut(from) else {
            return;
        };
        if let Err(e) = conn.serialize_attachment(&attachment) {
            warn!("Failed to attach identity to {}: {}", from, e);
            return;
        }

        info!(
            "Peer {} ({}) joined room {} with {} other peer(s)",
            attachment.peer_id,
            attachment.user_name,
            self.room,
            present.len()
        );

        let announce = ServerMessage::AddPeer {
            peer_id: attachment.peer_id.clone(),
            user_name: attachment.user_name.clone(),
            should_create_offer: false,
        };
        let Some(announce) = encode(&announce) else {
            return;
        };

        let Some(joiner) = conns.get(from) else {
            return;
        };
        for (id, peer) in present {
            let introduce = ServerMessage::AddPeer {
                peer_id: peer.peer_id,
                user_name: peer.user_name,
                should_create_offer: true,
            };
            if let Some(msg) = encode(&introduce) {
                deliver(joiner, msg);
            }
            if let Some(existing) = conns.get(id) {
                deliver(existing, announce.clone());
            }
        }
    }

    pub fn relay_sdp(
        &self,
        conns: &ConnectionSet,
        from: ConnectionId,
        target: &PeerId,
        session_description: Value,
    ) {
        self.relay(conns, from, target, |peer_id| {
            ServerMessage::SessionDescription {
                peer_id,
                session_description,
            }
        });
    }

    pub fn relay_ice(
        &self,
        conns: &ConnectionSet,
        from: ConnectionId,
        target: &PeerId,
        ice_candidate: Value,
    ) {
        self.relay(conns, from, target, |peer_id| ServerMessage::IceCandidate {
            peer_id,
            ice_candidate,
        });
    }

    pub fn peer_status(
        &self,
        conns: &ConnectionSet,
        from: ConnectionId,
        target: &PeerId,
        status: Value,
    ) {
        self.relay(conns, from, target, |peer_id| ServerMessage::PeerStatus {
            peer_id,
            status,
        });
    }

    /// Explicit leave: detach, tell the others, then close the socket.
    /// A connection that never joined (or already left) is left untouched.
    pub fn leave(&self, conns: &mut ConnectionSet, from: ConnectionId) {
        if let Some(handle) = self.depart(conns, from) {
            handle.close();
        }
    }

    /// Transport close or error. Always forgets the connection.
    pub fn on_close(&self, conns: &mut ConnectionSet, from: ConnectionId) {
        self.depart(conns, from);
        if conns.remove(from).is_some() {
            info!("Connection {} closed in room {}", from, self.room);
        }
    }

    fn depart(&self, conns: &mut ConnectionSet, from: ConnectionId) -> Option<ConnectionHandle> {
        let attachment = conns.get_mut(from)?.clear_attachment()?;
        let handle = conns.remove(from)?;

        info!("Peer {} left room {}", attachment.peer_id, self.room);

        let removed = ServerMessage::RemovePeer {
            peer_id: attachment.peer_id,
        };
        if let Some(msg) = encode(&removed) {
            for (id, _) in roster(conns) {
                if let Some(peer) = conns.get(id) {
                    deliver(peer, msg.clone());
                }
            }
        }
        Some(handle)
    }

    fn relay(
        &self,
        conns: &ConnectionSet,
        from: ConnectionId,
        target: &PeerId,
        build: impl FnOnce(PeerId) -> ServerMessage,
    ) {
        let Some(sender) = conns.get(from).and_then(ConnectionHandle::deserialize_attachment)
        else {
            debug!("Dropping relay from unjoined connection {}", from);
            return;
        };
        let Some(recipient) = find_peer(conns, target) else {
            debug!(
                "Dropping relay from {} to absent peer {} in room {}",
                sender.peer_id, target, self.room
            );
            return;
        };
        if let Some(msg) = encode(&build(sender.peer_id)) {
            deliver(recipient, msg);
        }
    }
}

/// Every joined connection with its identity, in open order.
fn roster(conns: &ConnectionSet) -> impl Iterator<Item = (ConnectionId, Attachment)> + '_ {
    conns
        .iter()
        .filter_map(|conn| conn.deserialize_attachment().map(|a| (conn.id(), a)))
}

/// The connection that most recently joined as `peer_id`.
fn find_peer<'c>(conns: &'c ConnectionSet, peer_id: &PeerId) -> Option<&'c ConnectionHandle> {
    conns
        .iter()
        .filter(|conn| {
            conn.deserialize_attachment()
                .is_some_and(|attachment| &attachment.peer_id == peer_id)
        })
        .max_by_key(|conn| conn.join_stamp())
}

fn encode(msg: &ServerMessage) -> Option<OutboundMessage> {
    match msg.to_outbound() {
        Ok(outbound) => Some(outbound),
        Err(e) => {
            warn!("Failed to encode outbound message: {}", e);
            None
        }
    }
}

// a failed recipient never stops delivery to the rest
fn deliver(conn: &ConnectionHandle, msg: OutboundMessage) {
    if conn.is_closed() {
        debug!("Skipping closed connection {}", conn.id());
        return;
    }
    if let Err(e) = conn.send(msg) {
        debug!("Send to {} failed: {}", conn.id(), e);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::signaling::types::Outbound;

    struct Client {
        id: ConnectionId,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Client {
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(item) = self.rx.try_recv() {
                if let Outbound::Text(msg) = item {
                    out.push(serde_json::from_str(msg.as_str()).unwrap());
                }
            }
            out
        }

        fn closed(&mut self) -> bool {
            let mut closed = false;
            while let Ok(item) = self.rx.try_recv() {
                closed |= item == Outbound::Close;
            }
            closed
        }
    }

    fn room() -> RoomId {
        RoomId::from("R1")
    }

    fn open(conns: &mut ConnectionSet) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ConnectionId::generate();
        SignalingCoordinator::new(&room()).on_open(conns, ConnectionHandle::new(id, tx));
        Client { id, rx }
    }

    fn send(conns: &mut ConnectionSet, client: &Client, json: serde_json::Value) {
        let msg = ClientMessage::parse(&json.to_string()).unwrap();
        SignalingCoordinator::new(&room()).on_message(conns, client.id, msg);
    }

    fn join(conns: &mut ConnectionSet, client: &Client, peer_id: &str, user_name: &str) {
        send(
            conns,
            client,
            json!({"type": "join", "peerId": peer_id, "userName": user_name}),
        );
    }

    fn add_peer(peer_id: &str, user_name: &str, should_create_offer: bool) -> ServerMessage {
        ServerMessage::AddPeer {
            peer_id: PeerId::from(peer_id),
            user_name: user_name.to_string(),
            should_create_offer,
        }
    }

    #[test]
    fn first_joiner_receives_nothing() {
        let mut conns = ConnectionSet::new();
        let mut x = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");
        assert!(x.drain().is_empty());
    }

    #[test]
    fn two_peer_scenario() {
        let mut conns = ConnectionSet::new();
        let mut x = open(&mut conns);
        let mut y = open(&mut conns);

        join(&mut conns, &x, "p1", "Alice");
        join(&mut conns, &y, "p2", "Bob");
        assert_eq!(x.drain(), vec![add_peer("p2", "Bob", false)]);
        assert_eq!(y.drain(), vec![add_peer("p1", "Alice", true)]);

        let sdp = json!({"type": "offer", "sdp": "v=0"});
        send(
            &mut conns,
            &y,
            json!({"type": "relaySDP", "peerId": "p1", "sessionDescription": sdp}),
        );
        assert_eq!(
            x.drain(),
            vec![ServerMessage::SessionDescription {
                peer_id: PeerId::from("p2"),
                session_description: sdp.clone(),
            }]
        );

        send(&mut conns, &x, json!({"type": "leave"}));
        assert_eq!(
            y.drain(),
            vec![ServerMessage::RemovePeer {
                peer_id: PeerId::from("p1")
            }]
        );
        assert!(x.closed());

        send(
            &mut conns,
            &y,
            json!({"type": "relaySDP", "peerId": "p1", "sessionDescription": sdp}),
        );
        assert!(x.drain().is_empty());
        assert!(y.drain().is_empty());
    }

    #[test]
    fn joiner_offers_to_every_existing_peer() {
        let mut conns = ConnectionSet::new();
        let mut existing: Vec<Client> = (0..3).map(|_| open(&mut conns)).collect();
        for (i, client) in existing.iter().enumerate() {
            join(&mut conns, client, &format!("p{i}"), &format!("user{i}"));
        }
        for client in &mut existing {
            client.drain();
        }

        let mut newcomer = open(&mut conns);
        join(&mut conns, &newcomer, "new", "Newcomer");

        let received = newcomer.drain();
        assert_eq!(
            received,
            vec![
                add_peer("p0", "user0", true),
                add_peer("p1", "user1", true),
                add_peer("p2", "user2", true),
            ]
        );
        for client in &mut existing {
            assert_eq!(client.drain(), vec![add_peer("new", "Newcomer", false)]);
        }
    }

    #[test]
    fn unjoined_connections_are_not_introduced() {
        let mut conns = ConnectionSet::new();
        let mut lurker = open(&mut conns);
        let mut x = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");
        assert!(lurker.drain().is_empty());
        assert!(x.drain().is_empty());
    }

    #[test]
    fn relay_ice_and_status_carry_sender_identity() {
        let mut conns = ConnectionSet::new();
        let mut x = open(&mut conns);
        let mut y = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");
        join(&mut conns, &y, "p2", "Bob");
        x.drain();
        y.drain();

        send(
            &mut conns,
            &x,
            json!({"type": "relayICE", "peerId": "p2", "iceCandidate": {"candidate": "c1"}, "from": "p9"}),
        );
        send(
            &mut conns,
            &x,
            json!({"type": "peerStatus", "peerId": "p2", "status": {"isMuted": true}}),
        );
        assert_eq!(
            y.drain(),
            vec![
                ServerMessage::IceCandidate {
                    peer_id: PeerId::from("p1"),
                    ice_candidate: json!({"candidate": "c1"}),
                },
                ServerMessage::PeerStatus {
                    peer_id: PeerId::from("p1"),
                    status: json!({"isMuted": true}),
                },
            ]
        );
        assert!(x.drain().is_empty());
    }

    #[test]
    fn relay_to_absent_peer_is_silent() {
        let mut conns = ConnectionSet::new();
        let mut x = open(&mut conns);
        let mut y = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");
        join(&mut conns, &y, "p2", "Bob");
        x.drain();
        y.drain();

        send(
            &mut conns,
            &x,
            json!({"type": "relaySDP", "peerId": "ghost", "sessionDescription": {}}),
        );
        send(
            &mut conns,
            &x,
            json!({"type": "peerStatus", "peerId": "ghost", "status": {}}),
        );
        assert!(x.drain().is_empty());
        assert!(y.drain().is_empty());
    }

    #[test]
    fn relay_before_join_is_silent() {
        let mut conns = ConnectionSet::new();
        let lurker = open(&mut conns);
        let mut x = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");

        send(
            &mut conns,
            &lurker,
            json!({"type": "relayICE", "peerId": "p1", "iceCandidate": "c"}),
        );
        assert!(x.drain().is_empty());
    }

    #[test]
    fn repeated_join_is_ignored() {
        let mut conns = ConnectionSet::new();
        let mut x = open(&mut conns);
        let mut y = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");
        join(&mut conns, &y, "p2", "Bob");
        x.drain();
        y.drain();

        join(&mut conns, &y, "p3", "Mallory");
        assert!(x.drain().is_empty());
        assert_eq!(
            conns.get(y.id).unwrap().deserialize_attachment().unwrap().peer_id,
            PeerId::from("p2")
        );
    }

    #[test]
    fn duplicate_peer_id_routes_to_latest_join() {
        let mut conns = ConnectionSet::new();
        let mut first = open(&mut conns);
        let mut second = open(&mut conns);
        let sender = open(&mut conns);
        join(&mut conns, &first, "dup", "One");
        join(&mut conns, &second, "dup", "Two");
        join(&mut conns, &sender, "p9", "Sender");
        first.drain();
        second.drain();

        send(
            &mut conns,
            &sender,
            json!({"type": "relaySDP", "peerId": "dup", "sessionDescription": "s"}),
        );
        assert!(first.drain().is_empty());
        assert_eq!(second.drain().len(), 1);
    }

    #[test]
    fn duplicate_peer_id_follows_join_order_not_open_order() {
        let mut conns = ConnectionSet::new();
        let mut opened_first = open(&mut conns);
        let mut opened_second = open(&mut conns);
        let sender = open(&mut conns);
        join(&mut conns, &opened_second, "dup", "Early");
        join(&mut conns, &opened_first, "dup", "Late");
        join(&mut conns, &sender, "p9", "Sender");
        opened_first.drain();
        opened_second.drain();

        send(
            &mut conns,
            &sender,
            json!({"type": "relaySDP", "peerId": "dup", "sessionDescription": "s"}),
        );
        assert_eq!(
            opened_first.drain(),
            vec![ServerMessage::SessionDescription {
                peer_id: PeerId::from("p9"),
                session_description: json!("s"),
            }]
        );
        assert!(opened_second.drain().is_empty());

        // once the latest joiner leaves, the earlier one is reachable again
        let room = room();
        SignalingCoordinator::new(&room).leave(&mut conns, opened_first.id);
        send(
            &mut conns,
            &sender,
            json!({"type": "relayICE", "peerId": "dup", "iceCandidate": "c"}),
        );
        assert_eq!(opened_second.drain().len(), 2);
    }

    #[test]
    fn leave_broadcasts_once_and_is_idempotent() {
        let mut conns = ConnectionSet::new();
        let mut x = open(&mut conns);
        let mut y = open(&mut conns);
        let mut z = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");
        join(&mut conns, &y, "p2", "Bob");
        join(&mut conns, &z, "p3", "Carol");
        x.drain();
        y.drain();
        z.drain();

        let room = room();
        let coordinator = SignalingCoordinator::new(&room);
        coordinator.leave(&mut conns, x.id);
        coordinator.leave(&mut conns, x.id);
        coordinator.on_close(&mut conns, x.id);

        let removed = vec![ServerMessage::RemovePeer {
            peer_id: PeerId::from("p1"),
        }];
        assert_eq!(y.drain(), removed);
        assert_eq!(z.drain(), removed);
        assert!(conns.get(x.id).is_none());
        assert_eq!(conns.len(), 2);
    }

    #[test]
    fn leave_without_join_is_noop() {
        let mut conns = ConnectionSet::new();
        let mut lurker = open(&mut conns);
        let mut x = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");

        send(&mut conns, &lurker, json!({"type": "leave"}));
        assert!(!lurker.closed());
        assert!(x.drain().is_empty());
        assert_eq!(conns.len(), 2);
    }

    #[test]
    fn close_of_joined_connection_notifies_others() {
        let mut conns = ConnectionSet::new();
        let x = open(&mut conns);
        let mut y = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");
        join(&mut conns, &y, "p2", "Bob");
        y.drain();

        SignalingCoordinator::new(&room()).on_close(&mut conns, x.id);
        assert_eq!(
            y.drain(),
            vec![ServerMessage::RemovePeer {
                peer_id: PeerId::from("p1")
            }]
        );
        assert_eq!(conns.len(), 1);
    }

    #[test]
    fn close_of_unjoined_connection_is_quiet() {
        let mut conns = ConnectionSet::new();
        let lurker = open(&mut conns);
        let mut x = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");

        SignalingCoordinator::new(&room()).on_close(&mut conns, lurker.id);
        assert!(x.drain().is_empty());
        assert_eq!(conns.len(), 1);
    }

    #[test]
    fn failed_recipient_does_not_block_broadcast() {
        let mut conns = ConnectionSet::new();
        let x = open(&mut conns);
        let y = open(&mut conns);
        let mut z = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");
        join(&mut conns, &y, "p2", "Bob");
        join(&mut conns, &z, "p3", "Carol");
        z.drain();

        drop(y);
        SignalingCoordinator::new(&room()).leave(&mut conns, x.id);
        assert_eq!(
            z.drain(),
            vec![ServerMessage::RemovePeer {
                peer_id: PeerId::from("p1")
            }]
        );
    }

    #[test]
    fn failed_recipient_does_not_block_introductions() {
        let mut conns = ConnectionSet::new();
        let x = open(&mut conns);
        let y = open(&mut conns);
        let mut z = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");
        join(&mut conns, &y, "p2", "Bob");
        join(&mut conns, &z, "p3", "Carol");
        z.drain();

        drop(x);
        let mut newcomer = open(&mut conns);
        join(&mut conns, &newcomer, "p4", "Dave");

        assert_eq!(
            newcomer.drain(),
            vec![
                add_peer("p1", "Alice", true),
                add_peer("p2", "Bob", true),
                add_peer("p3", "Carol", true),
            ]
        );
        assert_eq!(z.drain(), vec![add_peer("p4", "Dave", false)]);
        drop(y);
    }

    #[test]
    fn roster_is_rebuilt_from_attachments_only() {
        let mut conns = ConnectionSet::new();
        let x = open(&mut conns);
        let mut y = open(&mut conns);
        join(&mut conns, &x, "p1", "Alice");

        // simulate an identity restored onto a handle by the host
        conns
            .get_mut(y.id)
            .unwrap()
            .serialize_attachment(&Attachment {
                peer_id: PeerId::from("p2"),
                user_name: "Bob".to_string(),
            })
            .unwrap();

        send(
            &mut conns,
            &x,
            json!({"type": "relayICE", "peerId": "p2", "iceCandidate": "c"}),
        );
        assert_eq!(
            y.drain(),
            vec![ServerMessage::IceCandidate {
                peer_id: PeerId::from("p1"),
                ice_candidate: json!("c"),
            }]
        );
    }
}
