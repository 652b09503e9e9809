//! Body and full-message envelope encryption.
//!
//! A sealed message carries the whole original mail as an `ENCLOSED-OPGP`
//! armored blob (bzip2, then OpenPGP). In header mode the sensitive header
//! fields are also readable from `X-Pgp-Envelope` lines; when those lines
//! would cost more than the blob itself they are dropped (body mode).

use std::io::{Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression;
use tracing::debug;

use super::armor;
use super::envelope::{self, X_PGP_ENVELOPE};
use super::keyring::{self, Keyring, RecipientKey};
use crate::error::{RelayError, Result};
use crate::mail::{self, Header};

pub const BODY_ARMOR_LABEL: &str = "ENCLOSED-OPGP";
pub const X_ENCRYPTED: &str = "X-Encrypted";
pub const SUBJECT_HEADER_MODE: &str = "<Enclosed-H>";
pub const SUBJECT_BODY_MODE: &str = "<Enclosed-B>";

/// How a sealed message exposes its metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    /// Encrypted header lines plus the body blob
    Header,
    /// Body blob only
    Body,
}

impl Representation {
    pub fn subject(self) -> &'static str {
        match self {
            Representation::Header => SUBJECT_HEADER_MODE,
            Representation::Body => SUBJECT_BODY_MODE,
        }
    }

    pub fn from_subject(subject: &str) -> Option<Self> {
        match subject.trim() {
            SUBJECT_HEADER_MODE => Some(Representation::Header),
            SUBJECT_BODY_MODE => Some(Representation::Body),
            _ => None,
        }
    }
}

/// Keep the header envelope unless its rendered cost exceeds the blob
pub fn choose_representation(header_cost: usize, blob_len: usize) -> Representation {
    if header_cost > blob_len {
        Representation::Body
    } else {
        Representation::Header
    }
}

/// Compress, encrypt and armor `raw`
pub fn encrypt_body(raw: &[u8], recipients: &[RecipientKey]) -> Result<Vec<u8>> {
    let mut bz = BzEncoder::new(Vec::new(), Compression::best());
    bz.write_all(raw)?;
    let compressed = bz.finish()?;

    let ciphertext = keyring::encrypt(&compressed, recipients)?;
    Ok(armor::encode(BODY_ARMOR_LABEL, &ciphertext))
}

/// Reverse [`encrypt_body`]
pub fn decrypt_body(blob: &[u8], keyring: &Keyring) -> Result<Vec<u8>> {
    let ciphertext = armor::decode_labeled(blob, BODY_ARMOR_LABEL)?;
    let compressed = keyring::decrypt(&ciphertext, keyring)?;

    let mut raw = Vec::new();
    BzDecoder::new(compressed.as_slice())
        .read_to_end(&mut raw)
        .map_err(|e| RelayError::CryptoStructural(format!("bzip2 stream: {e}")))?;
    Ok(raw)
}

/// Seal a complete mail. `overrides` seeds the outer header (typically
/// transport addressing); Subject, `X-Encrypted` and the envelope lines are
/// set on top of it.
pub fn seal_message(
    raw: &[u8],
    overrides: Option<Header>,
    recipients: &[RecipientKey],
) -> Result<Vec<u8>> {
    let (source, _body) = mail::split_message(raw)?;

    let mut outer = overrides.unwrap_or_default();
    envelope::encode_header(&mut outer, &source, recipients)?;
    outer.set("Subject", Representation::Header.subject());
    outer.set(X_ENCRYPTED, BODY_ARMOR_LABEL);

    let blob = encrypt_body(raw, recipients)?;

    let representation = choose_representation(outer.byte_cost(), blob.len());
    if representation == Representation::Body {
        outer.set("Subject", representation.subject());
        outer.remove(X_PGP_ENVELOPE);
    }
    debug!(
        "Sealed {} byte message in {:?} mode ({} byte blob)",
        raw.len(),
        representation,
        blob.len()
    );

    Ok(mail::compose(&outer, &blob))
}

/// A decoded sealed message
#[derive(Debug, Clone)]
pub struct OpenedMessage {
    pub representation: Representation,
    /// Header fields recovered from `X-Pgp-Envelope`, header mode only
    pub envelope: Option<Header>,
    /// The original mail, header and body
    pub original: Vec<u8>,
}

/// Reverse [`seal_message`]
pub fn open_message(raw: &[u8], keyring: &Keyring) -> Result<OpenedMessage> {
    let (outer, body) = mail::split_message(raw)?;

    match outer.get(X_ENCRYPTED) {
        Some(marker) if marker.trim() == BODY_ARMOR_LABEL => {}
        Some(other) => return Err(RelayError::UnknownEncryptionScheme(other.to_string())),
        None => {
            return Err(RelayError::MalformedHeader(format!("missing {X_ENCRYPTED} field")))
        }
    }

    let representation = outer
        .get("Subject")
        .and_then(Representation::from_subject)
        .unwrap_or(if outer.contains(X_PGP_ENVELOPE) {
            Representation::Header
        } else {
            Representation::Body
        });

    let envelope = match representation {
        Representation::Header => Some(envelope::decode_header(&outer, keyring)?),
        Representation::Body => None,
    };

    let original = decrypt_body(body, keyring)?;

    Ok(OpenedMessage {
        representation,
        envelope,
        original,
    })
}
