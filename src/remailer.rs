//! Cypherpunk remailer layers.
//!
//! A wrapped message body looks like
//!
//! ```text
//! ::
//! Encrypted: PGP
//!
//! -----BEGIN PGP MESSAGE-----
//! ...
//! ```
//!
//! and decrypts to either another such layer or a routing block:
//!
//! ```text
//! ::
//! Anon-To: bob@example.org
//! Latent-Time: +0:00
//!
//! ##
//! <payload>
//! ```

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use lettre::Address;
use tracing::{debug, info};

use crate::crypto::armor;
use crate::crypto::keyring::{self, Keyring, RecipientKey};
use crate::error::{RelayError, Result};
use crate::mail::{self, Header};
use crate::message::Message;

pub const OPEN_MARKER: &str = "::";
pub const PAYLOAD_MARKER: &str = "##";
pub const ANON_TO: &str = "Anon-To";
pub const LATENT_TIME: &str = "Latent-Time";
pub const DEFAULT_LATENT_TIME: &str = "+0:00";
pub const OUTER_SUBJECT: &str = "Anonymous Message.";
pub const DEFAULT_MAX_LAYERS: usize = 64;

/// Optional DEFLATE stage inside the encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerCompression {
    /// Standard `Encrypted: PGP` layer
    #[default]
    None,
    /// `Encrypted: ZPGP` layer at the given DEFLATE level (1..=9)
    Deflate(u32),
}

impl LayerCompression {
    /// Level 0 (or no level) means a plain PGP layer
    pub fn from_level(level: Option<u32>) -> Self {
        match level {
            None | Some(0) => LayerCompression::None,
            Some(level) => LayerCompression::Deflate(level.min(9)),
        }
    }

    fn scheme(self) -> Scheme {
        match self {
            LayerCompression::None => Scheme::Pgp,
            LayerCompression::Deflate(_) => Scheme::Zpgp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Pgp,
    Zpgp,
}

impl Scheme {
    fn parse(declared: &str) -> Result<Option<Self>> {
        match declared {
            "" => Ok(None),
            "PGP" => Ok(Some(Scheme::Pgp)),
            "ZPGP" => Ok(Some(Scheme::Zpgp)),
            other => Err(RelayError::UnknownEncryptionScheme(other.to_string())),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Scheme::Pgp => "PGP",
            Scheme::Zpgp => "ZPGP",
        }
    }

    fn armor_label(self) -> &'static str {
        match self {
            Scheme::Pgp => "PGP MESSAGE",
            Scheme::Zpgp => "ZPGP MESSAGE",
        }
    }
}

/// A remailer on the route: where to send and whom to encrypt for
#[derive(Debug, Clone)]
pub struct Hop {
    pub address: String,
    pub key: RecipientKey,
}

impl Hop {
    pub fn new(address: impl Into<String>, key: RecipientKey) -> Self {
        Self {
            address: address.into(),
            key,
        }
    }
}

/// Wrap `message` in one layer addressed to `hop`
pub fn wrap(message: &Message, hop: &Hop, compression: LayerCompression) -> Result<Message> {
    wrap_onion(message, std::slice::from_ref(hop), compression)
}

/// Wrap `message` in one encryption layer per hop, outermost first.
///
/// The layers nest directly, so a node holding every key peels them all in
/// a single unwrap. The outer mail is addressed to the first hop.
pub fn wrap_onion(message: &Message, hops: &[Hop], compression: LayerCompression) -> Result<Message> {
    let first = hops
        .first()
        .ok_or_else(|| RelayError::Encode("route has no hops".to_string()))?;

    let mut body = routing_block(message);
    for hop in hops.iter().rev() {
        body = encryption_block(&body, &hop.key, compression)?;
        debug!("Added layer for key {}", hop.key.key_id());
    }

    let mut outer = Header::new();
    outer.append("To", first.address.as_str());
    outer.append("From", message.from.as_str());
    outer.append("Subject", OUTER_SUBJECT);

    Ok(Message::new(
        message.from.clone(),
        vec![first.address.clone()],
        mail::compose(&outer, &body),
    ))
}

fn routing_block(message: &Message) -> Vec<u8> {
    let mut routing = Header::new();
    routing.append(ANON_TO, message.to.join(", "));
    routing.append(LATENT_TIME, DEFAULT_LATENT_TIME);

    let mut out = format!("{OPEN_MARKER}\r\n").into_bytes();
    routing.write_to(&mut out);
    out.extend_from_slice(format!("{PAYLOAD_MARKER}\r\n").as_bytes());
    out.extend_from_slice(&message.body);
    out
}

fn encryption_block(
    plaintext: &[u8],
    key: &RecipientKey,
    compression: LayerCompression,
) -> Result<Vec<u8>> {
    let scheme = compression.scheme();

    let packed = match compression {
        LayerCompression::None => keyring::encrypt(plaintext, std::slice::from_ref(key))?,
        LayerCompression::Deflate(level) => {
            let mut deflate = DeflateEncoder::new(Vec::new(), Compression::new(level));
            deflate.write_all(plaintext)?;
            keyring::encrypt(&deflate.finish()?, std::slice::from_ref(key))?
        }
    };

    let mut out = format!("{OPEN_MARKER}\r\nEncrypted: {}\r\n\r\n", scheme.name()).into_bytes();
    out.extend_from_slice(&armor::encode(scheme.armor_label(), &packed));
    Ok(out)
}

/// Result of unwrapping a remailer message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peeled {
    /// The message to forward
    pub message: Message,
    /// Encryption layers removed
    pub layers: usize,
    /// Delay hint from the routing block
    pub latent_time: Option<String>,
}

enum State {
    Peeling(Vec<u8>),
    Delivered { routing: Header, payload: Vec<u8> },
}

/// Peels remailer layers with a node's keyring
#[derive(Debug, Clone)]
pub struct Unwrapper {
    keyring: Keyring,
    local_address: String,
    max_layers: usize,
}

impl Unwrapper {
    pub fn new(keyring: Keyring, local_address: impl Into<String>) -> Self {
        Self {
            keyring,
            local_address: local_address.into(),
            max_layers: DEFAULT_MAX_LAYERS,
        }
    }

    pub fn with_max_layers(mut self, max_layers: usize) -> Self {
        self.max_layers = max_layers;
        self
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Unwrap a complete mail: the outer header is discarded, then the body
    /// is peeled
    pub fn unwrap(&self, raw: &[u8]) -> Result<Peeled> {
        let (_outer, body) = mail::split_message(raw)?;
        self.unwrap_body(body)
    }

    /// Peel a remailer body until the routing block is reached
    pub fn unwrap_body(&self, body: &[u8]) -> Result<Peeled> {
        let mut layers = 0;
        let mut state = State::Peeling(body.to_vec());

        let (routing, payload) = loop {
            state = match state {
                State::Peeling(work) => {
                    let next = self.step(&work, layers)?;
                    if matches!(next, State::Peeling(_)) {
                        layers += 1;
                        debug!("Peeled layer {}", layers);
                    }
                    next
                }
                State::Delivered { routing, payload } => break (routing, payload),
            };
        };

        let to: Vec<String> = routing
            .get_all(ANON_TO)
            .into_iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect();
        if to.is_empty() {
            return Err(RelayError::MalformedHeader(format!("routing block has no {ANON_TO}")));
        }
        if let Some(bad) = to.iter().find(|addr| addr.parse::<Address>().is_err()) {
            return Err(RelayError::MalformedHeader(format!("{ANON_TO} {bad:?} is not a mail address")));
        }

        info!("Unwrapped {} layer(s) for {} recipient(s)", layers, to.len());

        Ok(Peeled {
            message: Message::new(self.local_address.clone(), to, payload),
            layers,
            latent_time: routing.get(LATENT_TIME).map(str::to_string),
        })
    }

    fn step(&self, work: &[u8], layers: usize) -> Result<State> {
        let rest = expect_marker(work, OPEN_MARKER)?;
        let (pseudo, offset) = Header::parse(rest)?;
        let rest = &rest[offset..];

        let Some(scheme) = Scheme::parse(pseudo.get("Encrypted").unwrap_or(""))? else {
            let payload = expect_marker(rest, PAYLOAD_MARKER)?;
            return Ok(State::Delivered {
                routing: pseudo,
                payload: payload.to_vec(),
            });
        };

        if layers >= self.max_layers {
            return Err(RelayError::TooManyLayers(self.max_layers));
        }

        let packed = armor::decode_labeled(rest, scheme.armor_label())?;
        let plaintext = keyring::decrypt(&packed, &self.keyring)?;

        let next = match scheme {
            Scheme::Pgp => plaintext,
            Scheme::Zpgp => {
                let mut inflated = Vec::new();
                DeflateDecoder::new(plaintext.as_slice())
                    .read_to_end(&mut inflated)
                    .map_err(|e| RelayError::CryptoStructural(format!("ZPGP inflate failed: {e}")))?;
                inflated
            }
        };

        Ok(State::Peeling(next))
    }
}

/// Consume a `marker` line, returning what follows it
fn expect_marker<'a>(data: &'a [u8], marker: &str) -> Result<&'a [u8]> {
    let (line, rest) = mail::split_line(data).ok_or(RelayError::NotRemailerMessage)?;
    if line.trim_ascii() != marker.as_bytes() {
        return Err(RelayError::NotRemailerMessage);
    }
    Ok(rest)
}

/// Unwrap `raw` with `keyring`, addressing the result from `local_address`
pub fn process_message(raw: &[u8], local_address: &str, keyring: &Keyring) -> Result<Message> {
    Unwrapper::new(keyring.clone(), local_address)
        .unwrap(raw)
        .map(|peeled| peeled.message)
}
