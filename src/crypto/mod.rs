// OpenPGP codecs: armor, keys, header envelopes and sealed bodies

pub mod armor;
pub mod body;
pub mod envelope;
pub mod keyring;

pub use body::{open_message, seal_message, OpenedMessage, Representation};
pub use envelope::{decode_header, encode_header};
pub use keyring::{Keyring, RecipientKey};
