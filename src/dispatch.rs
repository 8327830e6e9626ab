use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::directory::{Directory, DirectoryError, UserProfile};
use crate::protocol::{ClientEvent, RelayedMessage, ServerEvent};
use crate::state::{PresenceChange, ServerState, SharedState, WebSocketSender};
use crate::{ConnId, RoomId};

/// An admitted connection and the identity its handshake resolved to.
#[derive(Debug, Clone)]
pub struct Session {
    pub conn_id: ConnId,
    pub user: UserProfile,
}

/// Why an inbound event was dropped. Never sent back to the client.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("event without a conversation id")]
    MissingConversation,
    #[error("user {user_id} is not a participant of conversation {conversation_id}")]
    NotParticipant { user_id: String, conversation_id: RoomId },
    #[error("connection {conn_id} has not joined conversation {conversation_id}")]
    NotInRoom { conn_id: ConnId, conversation_id: RoomId },
    #[error("participant lookup failed: {0}")]
    Directory(#[from] DirectoryError),
}

/// Event dispatcher and lifecycle for the real-time layer.
#[derive(Clone)]
pub struct Realtime {
    state: SharedState,
    directory: Arc<dyn Directory>,
}

impl Realtime {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            state: ServerState::shared(),
            directory,
        }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Registers a connection that already passed the handshake gate.
    pub async fn connect(&self, user: UserProfile, sender: WebSocketSender) -> Session {
        let conn_id: ConnId = uuid::Uuid::new_v4().to_string();
        let mut st = self.state.lock().await;
        if let Some(change) = st.attach(&conn_id, &user.id, sender) {
            st.announce_presence(&change, &[]);
        }
        info!("User connected: {}, connection {}", user.id, conn_id);
        Session { conn_id, user }
    }

    /// Decodes and dispatches one text frame. Failures are logged and dropped.
    pub async fn handle_text(&self, session: &Session, text: &str) {
        let result = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.dispatch(session, event).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Dropped event from connection {}: {}", session.conn_id, e);
        }
    }

    pub async fn dispatch(&self, session: &Session, event: ClientEvent) -> Result<(), DispatchError> {
        match event {
            ClientEvent::JoinConversation(conversation_id) => {
                let conversation_id = require_conversation(conversation_id)?;
                // Participant check runs outside the state lock.
                if !self
                    .directory
                    .is_participant(&conversation_id, &session.user.id)
                    .await?
                {
                    return Err(DispatchError::NotParticipant {
                        user_id: session.user.id.clone(),
                        conversation_id,
                    });
                }

                let mut st = self.state.lock().await;
                // The connection may have closed while the lookup was in flight.
                if st.registry.user_of(&session.conn_id).is_none() {
                    return Ok(());
                }
                st.rooms.join(&session.conn_id, &conversation_id);
                info!("User {} joined conversation: {}", session.user.id, conversation_id);
                Ok(())
            }
            ClientEvent::LeaveConversation(conversation_id) => {
                let conversation_id = require_conversation(conversation_id)?;
                let mut st = self.state.lock().await;
                if st.rooms.leave(&session.conn_id, &conversation_id) {
                    info!("User {} left conversation: {}", session.user.id, conversation_id);
                }
                Ok(())
            }
            ClientEvent::NewMessage(payload) => {
                let conversation_id = require_conversation(payload.conversation_id.clone())?;
                let event = ServerEvent::ReceiveMessage(RelayedMessage::new(payload, &session.user));
                let st = self.state.lock().await;
                require_member(&st, session, &conversation_id)?;
                let n = st.broadcast_to_room(&conversation_id, &event, None);
                debug!("Relayed message from {} to {} connections", session.user.id, n);
                Ok(())
            }
            ClientEvent::Typing(payload) => {
                let conversation_id = require_conversation(payload.conversation_id)?;
                let event = ServerEvent::UserTyping {
                    user_id: session.user.id.clone(),
                    first_name: session.user.first_name.clone(),
                    conversation_id: conversation_id.clone(),
                };
                let st = self.state.lock().await;
                require_member(&st, session, &conversation_id)?;
                st.broadcast_to_room(&conversation_id, &event, Some(&session.conn_id));
                Ok(())
            }
            ClientEvent::StopTyping(payload) => {
                let conversation_id = require_conversation(payload.conversation_id)?;
                let event = ServerEvent::UserStopTyping {
                    user_id: session.user.id.clone(),
                    conversation_id: conversation_id.clone(),
                };
                let st = self.state.lock().await;
                require_member(&st, session, &conversation_id)?;
                st.broadcast_to_room(&conversation_id, &event, Some(&session.conn_id));
                Ok(())
            }
        }
    }

    /// Lifecycle cleanup: drops the connection everywhere, tells each room it was in
    /// that the user stopped typing, and announces offline if it was the last one.
    pub async fn disconnect(&self, session: &Session) {
        let mut st = self.state.lock().await;
        let detached = st.detach(&session.conn_id);

        for room_id in detached.rooms.iter() {
            let stop = ServerEvent::UserStopTyping {
                user_id: session.user.id.clone(),
                conversation_id: room_id.clone(),
            };
            st.broadcast_to_room(room_id, &stop, None);
        }

        if let Some(user_id) = detached.offline {
            st.announce_presence(&PresenceChange::Offline(user_id), &detached.rooms);
        }
        info!("User disconnected: {}, connection {}", session.user.id, session.conn_id);
    }

    // ============================================
    // Utilities for the rest of the backend
    // ============================================

    pub async fn is_user_online(&self, user_id: &str) -> bool {
        self.state.lock().await.registry.is_online(user_id)
    }

    pub async fn user_connections(&self, user_id: &str) -> Vec<ConnId> {
        self.state.lock().await.registry.connections_for(user_id)
    }

    pub async fn emit_to_user(&self, user_id: &str, event: &ServerEvent) -> usize {
        self.state.lock().await.emit_to_user(user_id, event)
    }

    pub async fn emit_to_conversation(&self, conversation_id: &str, event: &ServerEvent) -> usize {
        self.state.lock().await.broadcast_to_room(conversation_id, event, None)
    }

    pub async fn conversation_members(&self, conversation_id: &str) -> Vec<ConnId> {
        self.state.lock().await.rooms.members_of(conversation_id)
    }
}

/// Conversation ids are opaque; only a blank id is rejected.
fn require_conversation(conversation_id: RoomId) -> Result<RoomId, DispatchError> {
    if conversation_id.trim().is_empty() {
        return Err(DispatchError::MissingConversation);
    }
    Ok(conversation_id)
}

/// Room traffic is only accepted from connections that joined the room, which
/// already required the participant check.
fn require_member(st: &ServerState, session: &Session, conversation_id: &str) -> Result<(), DispatchError> {
    if st.rooms.is_member(&session.conn_id, conversation_id) {
        return Ok(());
    }
    Err(DispatchError::NotInRoom {
        conn_id: session.conn_id.clone(),
        conversation_id: conversation_id.to_string(),
    })
}
