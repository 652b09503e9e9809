//! anonrelay - a cypherpunk remailer node
//!
//! Inbound mail is peeled of the OpenPGP remailer layers addressed to this
//! node, stored in a durable SQLite queue and pumped out over SMTP. The
//! `crypto` module also provides the encrypted header envelope and sealed
//! body codecs used for end-to-end protected mail.

pub mod cli;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ingest;
pub mod mail;
pub mod message;
pub mod pump;
pub mod queue;
pub mod remailer;
pub mod smtp;

pub use error::{ErrorKind, RelayError, Result};
pub use ingest::{EnqueueTarget, Ingestor, Mailbox, SpoolDir, Submission};
pub use message::{Entry, Message};
pub use pump::{drain, Deliver, PumpReport};
pub use queue::{Queue, Tx};
pub use remailer::{process_message, wrap, wrap_onion, Hop, LayerCompression, Peeled, Unwrapper};
