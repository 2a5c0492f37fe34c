//! Wire frame types for the `PQChat` relay protocol.
//!
//! Frames are JSON objects carried in WebSocket text messages. Every frame
//! has a `type` tag plus type-specific fields; the two enums here split the
//! protocol by direction ([`ClientFrame`] inbound to the relay,
//! [`ServerFrame`] outbound to clients). Key material and ciphertexts cross
//! the wire as arrays of integers 0-255; encrypted message bodies are opaque
//! JSON values the relay never inspects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The inbound text did not parse as a known frame.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// A frame could not be serialized to JSON.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Frames sent by clients to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Registers the connection under a client id.
    ///
    /// Must precede any other frame. When `client_id` is absent the relay
    /// generates a short random id. The key field keeps the `kyberPublicKey`
    /// wire name the original clients send; the relay treats it as opaque
    /// bytes.
    Register {
        /// Client-chosen identifier, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        /// Public key material, re-broadcast verbatim to room peers.
        #[serde(default)]
        kyber_public_key: Vec<u8>,
    },

    /// Joins a named room, implicitly leaving any current room.
    JoinRoom {
        /// Target room identifier; rooms are created on first join.
        room_id: String,
        /// Proof of knowledge of the room password. Any non-empty string is
        /// accepted (see the relay's documented weak-auth behavior).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
    },

    /// Asks the relay to forward key-encapsulation material to one client.
    KeyExchange {
        /// Client id of the recipient.
        recipient_id: String,
        /// Public key or ciphertext bytes, forwarded untouched.
        #[serde(default)]
        public_key: Vec<u8>,
    },

    /// A batch of per-recipient encrypted payloads to route point-to-point.
    Message {
        /// Room the conversation belongs to. Routing is by recipient id;
        /// the room id is informational.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        /// One entry per recipient.
        messages: Vec<MessageEntry>,
        /// Sender-supplied timestamp, forwarded verbatim.
        #[serde(default)]
        timestamp: Value,
    },
}

/// One recipient's slice of an outbound `message` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEntry {
    /// Client id of the recipient.
    pub recipient_id: String,
    /// Opaque encrypted body; the relay never decodes its structure.
    pub encrypted_data: Value,
}

/// Frames sent by the relay to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Acknowledges registration with the resolved client id.
    Registered {
        /// The id this connection is now known by.
        client_id: String,
    },

    /// Confirms a room join with the full post-join member list.
    RoomJoined {
        /// The room that was joined.
        room_id: String,
        /// All current members, the joiner included.
        users: Vec<RoomUser>,
    },

    /// Tells existing members that a new client joined their room.
    UserJoined {
        /// Id of the new member.
        user_id: String,
        /// The new member's public key material.
        public_key: Vec<u8>,
    },

    /// Tells remaining members that a client left their room.
    UserLeft {
        /// Id of the departed member.
        user_id: String,
    },

    /// Forwarded key-encapsulation material from another client.
    KeyExchange {
        /// Id of the originating client.
        sender_id: String,
        /// Public key or ciphertext bytes, forwarded untouched.
        public_key: Vec<u8>,
    },

    /// A forwarded encrypted payload.
    Message {
        /// Id of the originating client.
        sender_id: String,
        /// Opaque encrypted body.
        encrypted_data: Value,
        /// Timestamp as supplied by the sender.
        timestamp: Value,
        /// The sender's public key material.
        public_key: Vec<u8>,
    },

    /// Reports a per-frame error; the connection stays open.
    Error {
        /// Human-readable error description.
        message: String,
    },
}

/// A room member entry in a `room_joined` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUser {
    /// The member's client id.
    pub id: String,
    /// The member's public key material.
    pub public_key: Vec<u8>,
}

/// Decodes an inbound client frame from WebSocket text.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the text is not valid JSON or does
/// not match any known frame shape.
pub fn decode_client(text: &str) -> Result<ClientFrame, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Encodes a server frame as WebSocket text.
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the frame cannot be serialized.
pub fn encode_server(frame: &ServerFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a client frame as WebSocket text (client-side and test use).
///
/// # Errors
///
/// Returns [`CodecError::Serialization`] if the frame cannot be serialized.
pub fn encode_client(frame: &ClientFrame) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a server frame from WebSocket text (client-side and test use).
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] if the text does not match any known
/// frame shape.
pub fn decode_server(text: &str) -> Result<ServerFrame, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
}
