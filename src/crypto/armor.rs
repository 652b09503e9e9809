//! ASCII armor with arbitrary block labels.
//!
//! The remailer uses labels that stock OpenPGP armor parsers reject
//! (`ZPGP MESSAGE`, `ENCLOSED-OPGP`), so armoring is done here and only the
//! binary packets are handed to the OpenPGP layer.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{RelayError, Result};

const LINE_WIDTH: usize = 64;

/// A decoded armor block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArmorBlock {
    pub label: String,
    pub headers: Vec<(String, String)>,
    pub data: Vec<u8>,
}

/// Armor checksum: OpenPGP CRC-24 as three big-endian bytes
fn checksum(data: &[u8]) -> [u8; 3] {
    let [_, a, b, c] = crc24::hash_raw(data).to_be_bytes();
    [a, b, c]
}

/// Armor `data` under `label`, CRLF line endings
pub fn encode(label: &str, data: &[u8]) -> Vec<u8> {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / LINE_WIDTH * 2 + 96);

    out.push_str("-----BEGIN ");
    out.push_str(label);
    out.push_str("-----\r\n\r\n");

    for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
        // base64 output is ASCII
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }

    out.push('=');
    out.push_str(&STANDARD.encode(checksum(data)));
    out.push_str("\r\n-----END ");
    out.push_str(label);
    out.push_str("-----\r\n");

    out.into_bytes()
}

/// Decode the first armor block found in `input`. Text before the
/// `-----BEGIN` line is skipped.
pub fn decode(input: &[u8]) -> Result<ArmorBlock> {
    let text = String::from_utf8_lossy(input);
    let mut lines = text.lines().map(|l| l.trim_end_matches('\r'));

    let label = loop {
        let line = lines
            .next()
            .ok_or_else(|| RelayError::InvalidArmor("no armor header line".to_string()))?;
        if let Some(rest) = line.trim().strip_prefix("-----BEGIN ") {
            let label = rest
                .strip_suffix("-----")
                .ok_or_else(|| RelayError::InvalidArmor(format!("bad armor line {line:?}")))?;
            break label.to_string();
        }
    };

    let mut headers = Vec::new();
    let mut body = String::new();
    let mut armor_crc = None;
    let mut in_headers = true;
    let mut ended = false;

    for line in lines {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("-----END ") {
            let end_label = rest.strip_suffix("-----").unwrap_or(rest);
            if end_label != label {
                return Err(RelayError::InvalidArmor(format!(
                    "armor opened as {label:?} but closed as {end_label:?}"
                )));
            }
            ended = true;
            break;
        }

        if in_headers {
            if line.is_empty() {
                in_headers = false;
                continue;
            }
            if let Some((key, value)) = line.split_once(": ") {
                headers.push((key.to_string(), value.to_string()));
                continue;
            }
            in_headers = false;
        }

        if let Some(crc) = line.strip_prefix('=') {
            armor_crc = Some(crc.to_string());
        } else {
            body.push_str(line);
        }
    }

    if !ended {
        return Err(RelayError::InvalidArmor(format!("unterminated {label:?} block")));
    }

    let data = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| RelayError::InvalidArmor(format!("bad base64: {e}")))?;

    if let Some(crc) = armor_crc {
        let expected = STANDARD
            .decode(crc.as_bytes())
            .map_err(|e| RelayError::InvalidArmor(format!("bad checksum encoding: {e}")))?;
        if expected.as_slice() != checksum(&data) {
            return Err(RelayError::InvalidArmor("checksum mismatch".to_string()));
        }
    }

    Ok(ArmorBlock {
        label,
        headers,
        data,
    })
}

/// Decode and insist on `label`
pub fn decode_labeled(input: &[u8], label: &str) -> Result<Vec<u8>> {
    let block = decode(input)?;
    if block.label != label {
        return Err(RelayError::InvalidArmor(format!(
            "expected {label:?} block, found {:?}",
            block.label
        )));
    }
    Ok(block.data)
}
