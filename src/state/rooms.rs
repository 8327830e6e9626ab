use std::collections::{HashMap, HashSet};

use crate::{ConnId, RoomId};

/// Conversation rooms (room-scoped broadcast groups).
/// Both indexes drop their entry once it becomes empty.
#[derive(Debug, Default)]
pub struct RoomMembership {
    rooms: HashMap<RoomId, HashSet<ConnId>>,
    conn_rooms: HashMap<ConnId, HashSet<RoomId>>,
}

impl RoomMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the connection was already a member.
    pub fn join(&mut self, conn_id: &ConnId, room_id: &RoomId) -> bool {
        let added = self
            .rooms
            .entry(room_id.clone())
            .or_insert_with(HashSet::new)
            .insert(conn_id.clone());
        self.conn_rooms
            .entry(conn_id.clone())
            .or_insert_with(HashSet::new)
            .insert(room_id.clone());
        added
    }

    /// Returns false if the connection was not a member.
    pub fn leave(&mut self, conn_id: &ConnId, room_id: &RoomId) -> bool {
        let removed = match self.rooms.get_mut(room_id) {
            Some(members) => {
                let removed = members.remove(conn_id);
                if members.is_empty() {
                    self.rooms.remove(room_id);
                }
                removed
            }
            None => false,
        };

        if let Some(joined) = self.conn_rooms.get_mut(conn_id) {
            joined.remove(room_id);
            if joined.is_empty() {
                self.conn_rooms.remove(conn_id);
            }
        }
        removed
    }

    pub fn members_of(&self, room_id: &str) -> Vec<ConnId> {
        self.rooms
            .get(room_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, conn_id: &str, room_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .map_or(false, |members| members.contains(conn_id))
    }

    pub fn rooms_of(&self, conn_id: &str) -> Vec<RoomId> {
        self.conn_rooms
            .get(conn_id)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops the connection from every room. Returns the rooms it was in.
    pub fn remove_connection(&mut self, conn_id: &ConnId) -> Vec<RoomId> {
        let Some(joined) = self.conn_rooms.remove(conn_id) else {
            return Vec::new();
        };

        for room_id in joined.iter() {
            if let Some(members) = self.rooms.get_mut(room_id) {
                members.remove(conn_id);
                if members.is_empty() {
                    self.rooms.remove(room_id);
                }
            }
        }
        joined.into_iter().collect()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
