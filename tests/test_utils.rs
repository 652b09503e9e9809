//! Test utilities and fixtures for anonrelay
//!
//! Fixture keys, message builders and an in-memory delivery backend shared
//! by the integration tests.

#![allow(dead_code)]

use anonrelay::crypto::{Keyring, RecipientKey};
use anonrelay::{Deliver, Message, RelayError};
use std::path::Path;
use tempfile::TempDir;

pub const HOP1_SECRET: &str = include_str!("fixtures/hop1.sec.asc");
pub const HOP1_PUBLIC: &str = include_str!("fixtures/hop1.pub.asc");
pub const HOP2_SECRET: &str = include_str!("fixtures/hop2.sec.asc");
pub const HOP2_PUBLIC: &str = include_str!("fixtures/hop2.pub.asc");
pub const STRANGER_SECRET: &str = include_str!("fixtures/stranger.sec.asc");

/// Create a temporary directory for testing
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Keyring holding the given armored secret keys
pub fn keyring(armored: &[&str]) -> Keyring {
    let mut ring = Keyring::new();
    for key in armored {
        ring.add_armored(key).expect("Failed to load fixture key");
    }
    ring
}

pub fn public_key(armored: &str) -> RecipientKey {
    RecipientKey::from_armored(armored).expect("Failed to load fixture public key")
}

/// A plain message from alice to the given recipients
pub fn sample_message(body: &str, to: &[&str]) -> Message {
    Message::new(
        "alice@example.org",
        to.iter().map(|s| s.to_string()).collect(),
        format!("From: alice@example.org\r\nSubject: test\r\n\r\n{body}\r\n").into_bytes(),
    )
}

/// Drop a raw message into a spool directory
pub fn spool_file(dir: &Path, name: &str, raw: &[u8]) {
    std::fs::create_dir_all(dir).expect("Failed to create spool");
    std::fs::write(dir.join(format!("{name}.eml")), raw).expect("Failed to write spool file");
}

/// Records deliveries; can fail on the n-th attempt (0-based)
#[derive(Default)]
pub struct MemoryDelivery {
    pub delivered: Vec<Message>,
    pub fail_at: Option<usize>,
    attempts: usize,
}

impl MemoryDelivery {
    pub fn failing_at(attempt: usize) -> Self {
        Self {
            fail_at: Some(attempt),
            ..Self::default()
        }
    }
}

impl Deliver for MemoryDelivery {
    fn deliver(&mut self, message: &Message) -> anonrelay::Result<()> {
        let attempt = self.attempts;
        self.attempts += 1;
        if self.fail_at == Some(attempt) {
            return Err(RelayError::Transport("connection reset".to_string()));
        }
        self.delivered.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_dir_creation() {
        let dir = temp_dir();
        assert!(dir.path().exists());
    }

    #[test]
    fn test_memory_delivery_fails_once() {
        let mut delivery = MemoryDelivery::failing_at(1);
        let msg = sample_message("x", &["x@example.org"]);
        assert!(delivery.deliver(&msg).is_ok());
        assert!(delivery.deliver(&msg).is_err());
        assert!(delivery.deliver(&msg).is_ok());
        assert_eq!(delivery.delivered.len(), 2);
    }

    #[test]
    fn test_fixture_keys_load() {
        assert_eq!(keyring(&[HOP1_SECRET, HOP2_SECRET]).len(), 2);
        assert!(!public_key(HOP1_PUBLIC).key_id().is_empty());
    }
}
