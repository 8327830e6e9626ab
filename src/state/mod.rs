pub mod presence;
pub mod registry;
pub mod rooms;

pub use presence::PresenceChange;
pub use registry::ConnectionRegistry;
pub use rooms::RoomMembership;

use std::collections::HashMap;
use std::sync::Arc;

use hyper_tungstenite::tungstenite::Message;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::protocol::ServerEvent;
use crate::{ConnId, RoomId, UserId};

pub type WebSocketSender = mpsc::UnboundedSender<Message>;

/// Live state of the real-time layer. Registry and rooms are only mutated through
/// `attach`/`detach` and the room calls made by the dispatcher.
/// Single-process: nothing here is shared across instances.
pub struct ServerState {
    pub registry: ConnectionRegistry,
    pub rooms: RoomMembership,
    /// Map of conn_id -> WebSocket sender (for fan-out)
    senders: HashMap<ConnId, WebSocketSender>,
}

pub type SharedState = Arc<Mutex<ServerState>>;

/// What a connection left behind when it was detached.
#[derive(Debug, Default)]
pub struct Detached {
    pub rooms: Vec<RoomId>,
    pub offline: Option<UserId>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            rooms: RoomMembership::new(),
            senders: HashMap::new(),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Registers an authenticated connection and its outbound channel.
    pub fn attach(&mut self, conn_id: &ConnId, user_id: &UserId, sender: WebSocketSender) -> Option<PresenceChange> {
        self.senders.insert(conn_id.clone(), sender);
        self.registry
            .register(conn_id, user_id)
            .then(|| PresenceChange::Online(user_id.clone()))
    }

    /// Removes a connection from the senders, every room and the registry.
    pub fn detach(&mut self, conn_id: &ConnId) -> Detached {
        self.senders.remove(conn_id);
        let rooms = self.rooms.remove_connection(conn_id);
        let offline = self.registry.unregister(conn_id);
        Detached { rooms, offline }
    }

    pub fn send_to(&self, conn_id: &str, event: &ServerEvent) -> bool {
        let Ok(frame) = event.to_frame() else {
            return false;
        };
        self.send_frame(conn_id, frame)
    }

    fn send_frame(&self, conn_id: &str, frame: Message) -> bool {
        match self.senders.get(conn_id) {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Sends `event` to every member of `room_id` except `except`. Returns how many
    /// connections it was queued for.
    pub fn broadcast_to_room(&self, room_id: &str, event: &ServerEvent, except: Option<&str>) -> usize {
        let members = self.rooms.members_of(room_id);
        if members.is_empty() {
            return 0;
        }

        let Ok(frame) = event.to_frame() else {
            warn!("Failed to serialize event for room {}", room_id);
            return 0;
        };

        let mut delivered = 0;
        for conn_id in members.iter().filter(|c| Some(c.as_str()) != except) {
            if self.send_frame(conn_id, frame.clone()) {
                delivered += 1;
            }
        }
        debug!("Fan-out to room {}: {} of {} connections", room_id, delivered, members.len());
        delivered
    }

    /// Sends `event` to every live connection of `user_id`.
    pub fn emit_to_user(&self, user_id: &str, event: &ServerEvent) -> usize {
        let conns = self.registry.connections_for(user_id);
        if conns.is_empty() {
            return 0;
        }
        let Ok(frame) = event.to_frame() else {
            return 0;
        };
        conns
            .iter()
            .filter(|c| self.send_frame(c, frame.clone()))
            .count()
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(Message::Text(text)) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[test]
    fn broadcast_skips_excluded_connection() {
        let mut st = ServerState::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        st.attach(&"c1".into(), &"u1".into(), tx1);
        st.attach(&"c2".into(), &"u2".into(), tx2);
        st.rooms.join(&"c1".into(), &"conv-1".into());
        st.rooms.join(&"c2".into(), &"conv-1".into());

        let ev = ServerEvent::UserOffline { user_id: "u3".into() };
        assert_eq!(st.broadcast_to_room("conv-1", &ev, Some("c1")), 1);
        assert!(frames(&mut rx1).is_empty());
        assert_eq!(frames(&mut rx2), vec![ev]);
    }

    #[test]
    fn detach_reports_rooms_and_offline_user() {
        let mut st = ServerState::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(
            st.attach(&"c1".into(), &"u1".into(), tx.clone()),
            Some(PresenceChange::Online("u1".into()))
        );
        assert_eq!(st.attach(&"c2".into(), &"u1".into(), tx), None);
        st.rooms.join(&"c1".into(), &"conv-1".into());

        let first = st.detach(&"c1".into());
        assert_eq!(first.rooms, vec!["conv-1".to_string()]);
        assert_eq!(first.offline, None);

        let second = st.detach(&"c2".into());
        assert!(second.rooms.is_empty());
        assert_eq!(second.offline, Some("u1".into()));
        assert!(!st.registry.is_online("u1"));
    }

    #[test]
    fn emit_to_user_reaches_every_tab() {
        let mut st = ServerState::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        st.attach(&"a1".into(), &"alice".into(), tx1);
        st.attach(&"a2".into(), &"alice".into(), tx2);

        let ev = ServerEvent::UserOffline { user_id: "bob".into() };
        assert_eq!(st.emit_to_user("alice", &ev), 2);
        assert_eq!(frames(&mut rx1).len(), 1);
        assert_eq!(frames(&mut rx2).len(), 1);
        assert_eq!(st.emit_to_user("nobody", &ev), 0);
    }
}
