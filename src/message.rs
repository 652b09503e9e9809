// Message model shared by the remailer, the queue and the pump

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};

/// A mail in transit: SMTP envelope sender, recipients and the raw RFC 5322 bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Envelope sender
    pub from: String,
    /// Envelope recipients, in order
    pub to: Vec<String>,
    /// Raw message (header and body)
    pub body: Vec<u8>,
}

impl Message {
    /// Create a new message
    pub fn new(from: impl Into<String>, to: Vec<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            from: from.into(),
            to,
            body: body.into(),
        }
    }

    /// Serialize to the compact binary form stored in the queue
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| RelayError::Encode(e.to_string()))
    }

    /// Deserialize a queue value. The key is carried into the error so the
    /// caller can still act on the corrupt entry.
    pub fn from_bytes(key: &[u8], bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| RelayError::Deserialize {
            key: key.to_vec(),
            reason: e.to_string(),
        })
    }

    /// Size of the raw message in bytes
    pub fn size(&self) -> usize {
        self.body.len()
    }
}

/// A stored message together with its queue key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub message: Message,
}

impl Entry {
    /// The key rendered for logs
    pub fn key_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}
