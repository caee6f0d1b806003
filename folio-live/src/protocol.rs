//! Wire formats for the notification pipeline.
//!
//! ```text
//!  relay ──BrokerFrame::Publish{topic, SignedChange JSON}──► broker
//!  broker ──BrokerFrame::Message{topic, SignedChange JSON}──► fan-out
//!  fan-out ──LiveMessage JSON text frame──► browser
//! ```
//!
//! Broker frames are bincode-encoded. The envelope inside is JSON so it can
//! be produced and checked by anything that holds the shared key:
//!
//! `{"entity","op","id","ownerId","emittedAt","authTag"}`
//!
//! `authTag` is hex HMAC-SHA256 over the JSON serialization of the change
//! event without the tag.

use folio_store::{ChangeEvent, ChangeOp, EntityKind};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

// ─── Signed envelope ──────────────────────────────────────────────────

/// A change event as published on the broker topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedChange {
    #[serde(flatten)]
    pub event: ChangeEvent,
    pub auth_tag: String,
}

impl SignedChange {
    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Signs and verifies relay envelopes with a shared key.
#[derive(Clone)]
pub struct ChangeSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for ChangeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSigner").finish_non_exhaustive()
    }
}

impl ChangeSigner {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: key.as_ref().to_vec(),
        }
    }

    fn mac(&self, event: &ChangeEvent) -> Result<HmacSha256, ProtocolError> {
        let body =
            serde_json::to_vec(event).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        mac.update(&body);
        Ok(mac)
    }

    pub fn sign(&self, event: &ChangeEvent) -> Result<SignedChange, ProtocolError> {
        let tag = self.mac(event)?.finalize().into_bytes();
        Ok(SignedChange {
            event: event.clone(),
            auth_tag: hex::encode(tag),
        })
    }

    /// Check the tag in constant time and return the event.
    pub fn verify(&self, signed: &SignedChange) -> Result<ChangeEvent, ProtocolError> {
        let tag = hex::decode(&signed.auth_tag).map_err(|_| ProtocolError::BadSignature)?;
        self.mac(&signed.event)?
            .verify_slice(&tag)
            .map_err(|_| ProtocolError::BadSignature)?;
        Ok(signed.event.clone())
    }

    /// Parse and verify a raw envelope.
    pub fn open(&self, bytes: &[u8]) -> Result<ChangeEvent, ProtocolError> {
        self.verify(&SignedChange::from_json(bytes)?)
    }
}

// ─── Broker frames ────────────────────────────────────────────────────

/// Topic-hub wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerFrame {
    Subscribe { topic: String },
    /// Hub → client: the subscription is live
    Subscribed { topic: String },
    Unsubscribe { topic: String },
    /// Client → hub
    Publish { topic: String, payload: Vec<u8> },
    /// Hub → subscribers
    Message { topic: String, payload: Vec<u8> },
    Ping,
    Pong,
}

impl BrokerFrame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

// ─── Live channel ─────────────────────────────────────────────────────

/// JSON text frames on the live WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LiveMessage {
    /// Server → client: something the user owns changed
    Change {
        entity: EntityKind,
        op: ChangeOp,
        id: Uuid,
    },
    Ping,
    Pong,
}

impl LiveMessage {
    pub fn change(event: &ChangeEvent) -> Self {
        LiveMessage::Change {
            entity: event.entity,
            op: event.op,
            id: event.id,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Missing, malformed or forged auth tag
    #[error("auth tag does not verify")]
    BadSignature,
}
