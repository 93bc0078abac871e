use serde::{Deserialize, Serialize};

use crate::types::{ClientToken, PairingCode};

/// Descriptor handed back after an upload lands. The client augments this
/// with its own key material before posting it as a file message; the
/// server never sees or stores the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub download_url: String,
}

/// A message as posted by a client. The file variant's metadata is relayed
/// as an opaque JSON object so client-side fields (encryption key, IV, ...)
/// pass through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    Text { content: String },
    File { metadata: serde_json::Value },
}

impl MessageBody {
    /// Size in bytes of the variant payload, for validation.
    pub fn payload_len(&self) -> usize {
        match self {
            MessageBody::Text { content } => content.len(),
            MessageBody::File { metadata } => metadata.to_string().len(),
        }
    }
}

/// A message after the server stamped it: sender identity plus a
/// per-session monotonic millisecond timestamp. This is both the history
/// entry and the broadcast payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(flatten)]
    pub body: MessageBody,
    pub sender: ClientToken,
    pub timestamp: i64,
}

/// Client-to-server frames on the event channel.
/// Wire form: `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinRoom {
        code: PairingCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_token: Option<ClientToken>,
    },
    SendMessage {
        match_code: PairingCode,
        client_token: ClientToken,
        message: MessageBody,
    },
}

/// Server-to-client frames on the event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
#[serde(rename_all_fields = "camelCase")]
pub enum ServerEvent {
    SessionJoined {
        client_token: ClientToken,
        history: Vec<StoredMessage>,
    },
    ReceiveMessage(StoredMessage),
    UserConnected,
    UserDisconnected,
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_room_wire_shape() {
        let frame: ClientEvent =
            serde_json::from_str(r#"{"event":"joinRoom","data":{"code":"abc123"}}"#).unwrap();
        match frame {
            ClientEvent::JoinRoom { code, client_token } => {
                assert_eq!(code.as_str(), "ABC123");
                assert!(client_token.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_send_message_roundtrip() {
        let frame = ClientEvent::SendMessage {
            match_code: PairingCode::parse("XYZ789").unwrap(),
            client_token: ClientToken::new(),
            message: MessageBody::Text {
                content: "hi".to_string(),
            },
        };

        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""event":"sendMessage""#));
        assert!(json.contains(r#""matchCode":"XYZ789""#));
        assert!(json.contains(r#""type":"text""#));

        let restored: ClientEvent = serde_json::from_str(&json).unwrap();
        if let (
            ClientEvent::SendMessage { message: orig, .. },
            ClientEvent::SendMessage { message: rest, .. },
        ) = (&frame, &restored)
        {
            assert_eq!(orig.payload_len(), rest.payload_len());
        } else {
            panic!("frame variant mismatch");
        }
    }

    #[test]
    fn test_stored_message_flattens_body() {
        let stored = StoredMessage {
            body: MessageBody::Text {
                content: "hello".to_string(),
            },
            sender: ClientToken::new(),
            timestamp: 1_700_000_000_000,
        };

        let value = serde_json::to_value(&stored).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["content"], "hello");
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_file_metadata_passes_through_opaquely() {
        let raw = r#"{"type":"file","metadata":{"name":"x.bin","encryptionKey":"deadbeef"}}"#;
        let body: MessageBody = serde_json::from_str(raw).unwrap();
        match &body {
            MessageBody::File { metadata } => {
                assert_eq!(metadata["encryptionKey"], "deadbeef");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_unit_events_omit_data() {
        let json = serde_json::to_string(&ServerEvent::UserConnected).unwrap();
        assert_eq!(json, r#"{"event":"userConnected"}"#);
    }
}
