use hyper_tungstenite::tungstenite::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::directory::UserProfile;
use crate::{RoomId, UserId};

// ============================================
// WebSocket Conversation Events
// ============================================
//
// Every frame is a JSON text frame: {"event": "<name>", "data": <payload>}

/// Events sent by clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Payload is the bare conversation id.
    JoinConversation(RoomId),
    LeaveConversation(RoomId),
    NewMessage(MessagePayload),
    Typing(TypingPayload),
    StopTyping(TypingPayload),
}

/// A chat message as sent by a client; everything besides the conversation id is opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "conversationId")]
    pub conversation_id: RoomId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingPayload {
    #[serde(rename = "conversationId")]
    pub conversation_id: RoomId,
}

/// Events sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage(RelayedMessage),
    #[serde(rename_all = "camelCase")]
    UserTyping {
        user_id: UserId,
        first_name: String,
        conversation_id: RoomId,
    },
    #[serde(rename_all = "camelCase")]
    UserStopTyping {
        user_id: UserId,
        conversation_id: RoomId,
    },
    #[serde(rename_all = "camelCase")]
    UserOffline { user_id: UserId },
}

/// The client's payload plus the sender identity taken from the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayedMessage {
    #[serde(rename = "conversationId")]
    pub conversation_id: RoomId,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub sender: UserProfile,
}

impl RelayedMessage {
    /// Attaches `sender`; a client-supplied `sender` field is discarded.
    pub fn new(payload: MessagePayload, sender: &UserProfile) -> Self {
        let mut fields = payload.fields;
        fields.remove("sender");
        Self {
            conversation_id: payload.conversation_id,
            fields,
            sender: sender.clone(),
        }
    }
}

impl ServerEvent {
    pub fn to_frame(&self) -> Result<Message, serde_json::Error> {
        serde_json::to_string(self).map(Message::Text)
    }
}
