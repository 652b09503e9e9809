//! Error types shared by every stage of the relay.

use thiserror::Error;

/// Errors produced while unwrapping, encoding, queueing or delivering mail.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The body does not start with the `::` marker, or the `##` marker is missing.
    #[error("not a remailer message")]
    NotRemailerMessage,

    /// Armor was corrupt or carried a label other than the declared one.
    #[error("invalid ASCII armor: {0}")]
    InvalidArmor(String),

    /// The `Encrypted:` pseudo-header named a scheme we do not speak.
    #[error("unknown encryption scheme: {0:?}")]
    UnknownEncryptionScheme(String),

    /// More encryption layers than the configured maximum.
    #[error("message nests more than {0} encryption layers")]
    TooManyLayers(usize),

    /// A header block could not be parsed or decoded.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// No usable key: missing, revoked or unable to encrypt/decrypt.
    #[error("key unusable: {0}")]
    KeyUnusable(String),

    /// OpenPGP packet, signature or decompression failure.
    #[error("OpenPGP error: {0}")]
    CryptoStructural(String),

    /// Inbound payload above the configured cap.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    Capacity { size: usize, limit: usize },

    /// Queue database failure. The enclosing transaction is rolled back.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Outbound delivery failed; the message stays queued.
    #[error("transport error: {0}")]
    Transport(String),

    /// A stored entry could not be decoded.
    #[error("corrupt queue entry {}: {reason}", String::from_utf8_lossy(.key))]
    Deserialize { key: Vec<u8>, reason: String },

    /// Serializing a value failed.
    #[error("encoding error: {0}")]
    Encode(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used by callers to pick a handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Format,
    Crypto,
    Capacity,
    Storage,
    Transport,
    Deserialize,
    Internal,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::NotRemailerMessage
            | RelayError::InvalidArmor(_)
            | RelayError::UnknownEncryptionScheme(_)
            | RelayError::TooManyLayers(_)
            | RelayError::MalformedHeader(_) => ErrorKind::Format,
            RelayError::KeyUnusable(_) | RelayError::CryptoStructural(_) => ErrorKind::Crypto,
            RelayError::Capacity { .. } => ErrorKind::Capacity,
            RelayError::Storage(_) => ErrorKind::Storage,
            RelayError::Transport(_) => ErrorKind::Transport,
            RelayError::Deserialize { .. } => ErrorKind::Deserialize,
            RelayError::Encode(_) | RelayError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Format and crypto failures mean the input itself cannot be relayed.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self.kind(), ErrorKind::Format | ErrorKind::Crypto)
    }
}

impl From<pgp::errors::Error> for RelayError {
    fn from(err: pgp::errors::Error) -> Self {
        match err {
            pgp::errors::Error::MissingKey => {
                RelayError::KeyUnusable("no secret key matches the message recipients".to_string())
            }
            other => RelayError::CryptoStructural(other.to_string()),
        }
    }
}

impl From<mailparse::MailParseError> for RelayError {
    fn from(err: mailparse::MailParseError) -> Self {
        RelayError::MalformedHeader(err.to_string())
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(RelayError::NotRemailerMessage.kind(), ErrorKind::Format);
        assert_eq!(
            RelayError::UnknownEncryptionScheme("XPGP".into()).kind(),
            ErrorKind::Format
        );
        assert_eq!(RelayError::KeyUnusable("x".into()).kind(), ErrorKind::Crypto);
        assert_eq!(
            RelayError::Capacity { size: 2, limit: 1 }.kind(),
            ErrorKind::Capacity
        );
        assert_eq!(RelayError::Transport("down".into()).kind(), ErrorKind::Transport);

        assert!(RelayError::InvalidArmor("label".into()).is_invalid_input());
        assert!(!RelayError::Transport("down".into()).is_invalid_input());
    }

    #[test]
    fn test_missing_key_is_unusable_key() {
        let err: RelayError = pgp::errors::Error::MissingKey.into();
        assert!(matches!(err, RelayError::KeyUnusable(_)));
    }

    #[test]
    fn test_deserialize_display_includes_key() {
        let err = RelayError::Deserialize {
            key: b"2026-01-01T00:00:00.000000000Z".to_vec(),
            reason: "eof".into(),
        };
        assert!(err.to_string().contains("2026-01-01T00:00:00"));
    }
}
