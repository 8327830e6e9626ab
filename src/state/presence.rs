use log::info;

use super::ServerState;
use crate::protocol::ServerEvent;
use crate::{RoomId, UserId};

/// Online/offline transition derived from a registry mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Online(UserId),
    Offline(UserId),
}

impl ServerState {
    /// Announces a presence transition.
    ///
    /// Offline is broadcast as `user_offline` to the rooms the user's last
    /// connection was in. Coming online is only logged: a fresh connection
    /// has not joined any room yet, so there is no audience to tell.
    pub fn announce_presence(&self, change: &PresenceChange, rooms: &[RoomId]) -> usize {
        match change {
            PresenceChange::Online(user_id) => {
                info!("User {} is online", user_id);
                0
            }
            PresenceChange::Offline(user_id) => {
                info!("User {} is offline", user_id);
                let event = ServerEvent::UserOffline {
                    user_id: user_id.clone(),
                };
                rooms
                    .iter()
                    .map(|room_id| self.broadcast_to_room(room_id, &event, None))
                    .sum()
            }
        }
    }
}
