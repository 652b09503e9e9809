//! OpenPGP keys and the encrypt/decrypt primitives used by every codec.

use std::io::Cursor;
use std::path::Path;

use pgp::crypto::sym::SymmetricKeyAlgorithm;
use pgp::ser::Serialize;
use pgp::types::KeyTrait;
use pgp::{Deserializable, Message as PgpMessage, SignedPublicKey, SignedPublicSubKey, SignedSecretKey};
use tracing::debug;

use crate::error::{RelayError, Result};

/// Secret keys this node can decrypt with
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: Vec<SignedSecretKey>,
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one armored secret key
    pub fn from_armored(armored: &str) -> Result<Self> {
        let mut ring = Self::new();
        ring.add_armored(armored)?;
        Ok(ring)
    }

    /// Add every secret key from an armored block
    pub fn add_armored(&mut self, armored: &str) -> Result<()> {
        let (keys, _headers) = SignedSecretKey::from_armor_many(Cursor::new(armored.as_bytes()))?;
        let mut added = 0;
        for key in keys {
            let key = key?;
            debug!("Loaded secret key {}", hex::encode(key.key_id()));
            self.keys.push(key);
            added += 1;
        }
        if added == 0 {
            return Err(RelayError::KeyUnusable("no secret key in armored input".to_string()));
        }
        Ok(())
    }

    /// Load armored secret key files
    pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut ring = Self::new();
        for path in paths {
            let armored = std::fs::read_to_string(path.as_ref())?;
            ring.add_armored(&armored)?;
        }
        Ok(ring)
    }

    pub fn merge(mut self, other: Keyring) -> Self {
        self.keys.extend(other.keys);
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Hex key ids of the primary keys
    pub fn key_ids(&self) -> Vec<String> {
        self.keys.iter().map(|k| hex::encode(k.key_id())).collect()
    }

    /// Public halves, usable as encryption recipients
    pub fn recipients(&self) -> Vec<RecipientKey> {
        self.keys
            .iter()
            .cloned()
            .map(|k| RecipientKey {
                key: SignedPublicKey::from(k),
            })
            .collect()
    }

    fn usable(&self) -> Vec<&SignedSecretKey> {
        self.keys
            .iter()
            .filter(|k| k.details.revocation_signatures.is_empty())
            .collect()
    }
}

/// A public key messages are encrypted to
#[derive(Debug, Clone)]
pub struct RecipientKey {
    key: SignedPublicKey,
}

impl RecipientKey {
    pub fn from_armored(armored: &str) -> Result<Self> {
        let (key, _headers) = SignedPublicKey::from_string(armored)?;
        Ok(Self { key })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let armored = std::fs::read_to_string(path)?;
        Self::from_armored(&armored)
    }

    pub fn key_id(&self) -> String {
        hex::encode(self.key.key_id())
    }

    fn encryption_subkey(&self) -> Result<&SignedPublicSubKey> {
        if !self.key.details.revocation_signatures.is_empty() {
            return Err(RelayError::KeyUnusable(format!("key {} is revoked", self.key_id())));
        }
        self.key
            .public_subkeys
            .iter()
            .find(|sub| sub.is_encryption_key())
            .ok_or_else(|| {
                RelayError::KeyUnusable(format!("key {} has no encryption subkey", self.key_id()))
            })
    }
}

/// Encrypt to every recipient, returning binary OpenPGP packets
pub fn encrypt(plaintext: &[u8], recipients: &[RecipientKey]) -> Result<Vec<u8>> {
    if recipients.is_empty() {
        return Err(RelayError::KeyUnusable("no recipients".to_string()));
    }

    let subkeys = recipients
        .iter()
        .map(RecipientKey::encryption_subkey)
        .collect::<Result<Vec<_>>>()?;

    let mut rng = rand::thread_rng();
    let literal = PgpMessage::new_literal_bytes("", plaintext);
    let encrypted = literal.encrypt_to_keys(&mut rng, SymmetricKeyAlgorithm::AES256, &subkeys[..])?;

    Ok(encrypted.to_bytes()?)
}

/// Decrypt binary OpenPGP packets with any matching key in the ring
pub fn decrypt(ciphertext: &[u8], keyring: &Keyring) -> Result<Vec<u8>> {
    let keys = keyring.usable();
    if keys.is_empty() {
        return Err(RelayError::KeyUnusable("keyring is empty".to_string()));
    }

    let message = PgpMessage::from_bytes(ciphertext)?;
    let (decrypted, key_ids) = message.decrypt(String::new, &keys)?;
    debug!("Decrypted layer for {} key(s)", key_ids.len());

    decrypted
        .get_content()?
        .ok_or_else(|| RelayError::CryptoStructural("decrypted message has no literal data".to_string()))
}
