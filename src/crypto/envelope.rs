//! Envelope header codec.
//!
//! A fixed list of sensitive header fields is packed positionally into a
//! JSON array, DEFLATE-compressed, OpenPGP-encrypted and spread over as many
//! `X-Pgp-Envelope: <hex-index>-<base64>` lines as needed to keep every line
//! within [`LINE_BUDGET`] characters.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use tracing::debug;

use super::keyring::{self, Keyring, RecipientKey};
use crate::error::{RelayError, Result};
use crate::mail::Header;

/// Header fields carried inside the envelope, by position
pub const ENVELOPE_FIELDS: [&str; 10] = [
    "Date",
    "Subject",
    "From",
    "Sender",
    "Reply-To",
    "To",
    "Cc",
    "Bcc",
    "In-Reply-To",
    "Message-Id",
];

pub const X_PGP_ENVELOPE: &str = "X-Pgp-Envelope";

/// Maximum rendered length of one `X-Pgp-Envelope: ...` line
pub const LINE_BUDGET: usize = 70;

/// Number of hex digits needed to print `index`
pub fn hex_width(index: usize) -> usize {
    let mut width = 1;
    let mut rest = index >> 4;
    while rest > 0 {
        rest >>= 4;
        width += 1;
    }
    width
}

/// Base64 characters that fit on the line carrying chunk `index`
fn chunk_capacity(index: usize) -> usize {
    // "X-Pgp-Envelope: " + "<hex>-" + chunk
    LINE_BUDGET - (X_PGP_ENVELOPE.len() + 2) - hex_width(index) - 1
}

/// Split base64 text into `<hex-index>-<chunk>` values
pub fn split_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    let mut index = 0;

    while !rest.is_empty() {
        let take = chunk_capacity(index).min(rest.len());
        // base64 is ASCII, so byte offsets are char boundaries
        let (part, tail) = rest.split_at(take);
        chunks.push(format!("{index:x}-{part}"));
        rest = tail;
        index += 1;
    }

    chunks
}

/// Reassemble chunk values by index.
///
/// Values that do not parse as `<hex>-<chunk>` are skipped; the first value
/// seen for an index wins; reassembly stops at the first missing index.
pub fn join_chunks<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut parts: BTreeMap<usize, &str> = BTreeMap::new();

    for value in values {
        let Some((index, chunk)) = value.trim().split_once('-') else {
            continue;
        };
        let Ok(index) = usize::from_str_radix(index, 16) else {
            continue;
        };
        if chunk.is_empty() || chunk.contains(char::is_whitespace) {
            continue;
        }
        parts.entry(index).or_insert(chunk);
    }

    let mut text = String::new();
    for (expected, (index, chunk)) in parts.iter().enumerate() {
        if *index != expected {
            break;
        }
        text.push_str(chunk);
    }
    text
}

/// Encrypt the envelope fields of `source` into `target` as `X-Pgp-Envelope` values
pub fn encode_header(target: &mut Header, source: &Header, recipients: &[RecipientKey]) -> Result<()> {
    let fields: Vec<Vec<String>> = ENVELOPE_FIELDS
        .iter()
        .map(|name| source.get_all(name).into_iter().map(str::to_string).collect())
        .collect();

    let json = serde_json::to_vec(&fields).map_err(|e| RelayError::Encode(e.to_string()))?;

    let mut deflate = DeflateEncoder::new(Vec::new(), Compression::best());
    deflate.write_all(&json)?;
    let compressed = deflate.finish()?;

    let ciphertext = keyring::encrypt(&compressed, recipients)?;
    let text = STANDARD_NO_PAD.encode(ciphertext);

    let chunks = split_chunks(&text);
    debug!("Encoded envelope header into {} lines", chunks.len());
    target.set_all(X_PGP_ENVELOPE, chunks);

    Ok(())
}

/// Recover the envelope fields carried by `source`
pub fn decode_header(source: &Header, keyring: &Keyring) -> Result<Header> {
    let text = join_chunks(source.get_all(X_PGP_ENVELOPE));
    if text.is_empty() {
        return Err(RelayError::MalformedHeader(format!("no {X_PGP_ENVELOPE} lines")));
    }

    let ciphertext = STANDARD_NO_PAD
        .decode(text.as_bytes())
        .map_err(|e| RelayError::MalformedHeader(format!("envelope is not base64: {e}")))?;

    let compressed = keyring::decrypt(&ciphertext, keyring)?;

    let mut json = Vec::new();
    DeflateDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|e| RelayError::CryptoStructural(format!("envelope inflate failed: {e}")))?;

    let fields: Vec<Option<Vec<String>>> = serde_json::from_slice(&json)
        .map_err(|e| RelayError::MalformedHeader(format!("envelope is not a field array: {e}")))?;

    let mut header = Header::new();
    for (name, values) in ENVELOPE_FIELDS.iter().zip(fields) {
        for value in values.unwrap_or_default() {
            header.append(name, value);
        }
    }

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keyring::fixtures::*;

    #[test]
    fn test_hex_width() {
        assert_eq!(hex_width(0), 1);
        assert_eq!(hex_width(15), 1);
        assert_eq!(hex_width(16), 2);
        assert_eq!(hex_width(255), 2);
        assert_eq!(hex_width(256), 3);
    }

    #[test]
    fn test_chunks_fill_the_line_budget() {
        let text = "A".repeat(20_000);
        let chunks = split_chunks(&text);

        for value in &chunks {
            let line = format!("{X_PGP_ENVELOPE}: {value}");
            assert!(line.len() <= LINE_BUDGET, "{line}");
        }
        // every line but the last is full
        for value in &chunks[..chunks.len() - 1] {
            assert_eq!(format!("{X_PGP_ENVELOPE}: {value}").len(), LINE_BUDGET);
        }
        assert!(chunks.len() > 256, "index must cross the two-digit boundary");
        assert_eq!(join_chunks(chunks.iter().map(String::as_str)), text);
    }

    #[test]
    fn test_chunk_count_is_minimal() {
        // 52 chars fit behind a single-digit index
        assert_eq!(split_chunks(&"x".repeat(52)).len(), 1);
        assert_eq!(split_chunks(&"x".repeat(53)).len(), 2);
        assert!(split_chunks("").is_empty());
    }

    #[test]
    fn test_join_is_order_independent_and_lenient() {
        let values = vec!["1-world", "garbage", "0-hello", "zz-bad", "0-ignored"];
        assert_eq!(join_chunks(values), "helloworld");
    }

    #[test]
    fn test_join_stops_at_gap() {
        let values = vec!["0-aa", "2-cc"];
        assert_eq!(join_chunks(values), "aa");
    }

    #[test]
    fn test_header_round_trip() {
        let mut source = Header::new();
        source.append("Subject", "Meeting");
        source.append("From", "alice@example.org");
        source.append("To", "bob@example.org");
        source.append("To", "carol@example.org");
        source.append("X-Mailer", "not carried");

        let mut target = Header::new();
        encode_header(&mut target, &source, &[recipient(HOP1_PUBLIC)]).unwrap();
        assert!(target.get_all(X_PGP_ENVELOPE).len() > 1);
        assert!(target
            .iter()
            .all(|(k, v)| k.len() + 2 + v.len() <= LINE_BUDGET));

        let decoded = decode_header(&target, &ring(&[HOP1_SECRET])).unwrap();
        assert_eq!(decoded.get("Subject"), Some("Meeting"));
        assert_eq!(decoded.get("From"), Some("alice@example.org"));
        assert_eq!(decoded.get_all("To"), vec!["bob@example.org", "carol@example.org"]);
        assert!(!decoded.contains("X-Mailer"));
        assert!(!decoded.contains("Date"));
        assert_eq!(decoded.len(), 4);
    }

    #[test]
    fn test_decode_needs_matching_key() {
        let mut source = Header::new();
        source.append("Subject", "private");
        let mut target = Header::new();
        encode_header(&mut target, &source, &[recipient(HOP1_PUBLIC)]).unwrap();

        let err = decode_header(&target, &ring(&[STRANGER_SECRET])).unwrap_err();
        assert!(matches!(err, RelayError::KeyUnusable(_)));
    }

    #[test]
    fn test_shorter_array_restores_prefix() {
        // an encoder that knew only the first three fields
        let json = br#"[["Mon, 1 Jan 2026 00:00:00 +0000"],["hi"],null]"#;
        let mut deflate = DeflateEncoder::new(Vec::new(), Compression::best());
        deflate.write_all(json).unwrap();
        let ciphertext =
            keyring::encrypt(&deflate.finish().unwrap(), &[recipient(HOP1_PUBLIC)]).unwrap();

        let mut source = Header::new();
        source.set_all(X_PGP_ENVELOPE, split_chunks(&STANDARD_NO_PAD.encode(ciphertext)));

        let decoded = decode_header(&source, &ring(&[HOP1_SECRET])).unwrap();
        assert_eq!(decoded.get("Subject"), Some("hi"));
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn test_missing_envelope() {
        assert!(matches!(
            decode_header(&Header::new(), &ring(&[HOP1_SECRET])),
            Err(RelayError::MalformedHeader(_))
        ));
    }
}
