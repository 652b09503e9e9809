// Mail header blocks: an ordered, case-insensitive multimap

use crate::error::Result;

/// RFC 5322 hard limit on a header line, excluding CRLF
pub const MAX_LINE: usize = 998;

/// Ordered header fields. Names compare case-insensitively; a name may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    fields: Vec<(String, String)>,
}

impl Header {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a header block from the start of `raw`.
    ///
    /// Returns the header and the offset of the first byte after the blank
    /// line that terminates it (or `raw.len()` if the block runs to the end).
    pub fn parse(raw: &[u8]) -> Result<(Self, usize)> {
        let (parsed, offset) = mailparse::parse_headers(raw)?;

        let fields = parsed
            .iter()
            .map(|h| (h.get_key(), h.get_value().trim().to_string()))
            .collect();

        Ok((Self { fields }, offset))
    }

    /// First value for `name`
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Append a value, keeping existing ones
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.fields.push((name.to_string(), value.into()));
    }

    /// Replace all values of `name` with a single one
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.set_all(name, vec![value.into()]);
    }

    /// Replace all values of `name`. The new values take the position of the
    /// first old one, or go to the end if the field was absent.
    pub fn set_all(&mut self, name: &str, values: Vec<String>) {
        let position = self
            .fields
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
            .unwrap_or(self.fields.len());
        self.remove(name);

        let position = position.min(self.fields.len());
        let entries = values.into_iter().map(|v| (name.to_string(), v));
        self.fields.splice(position..position, entries);
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Rendered size as `Name: Value\r\n` lines, without the terminating blank line
    pub fn byte_cost(&self) -> usize {
        self.fields.iter().map(|(k, v)| k.len() + 4 + v.len()).sum()
    }

    /// Render the header block including the terminating blank line.
    /// Lines over [`MAX_LINE`] are folded after `,` separators.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            write_folded(out, name.len() + 2, value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_cost() + 2);
        self.write_to(&mut out);
        out
    }
}

fn write_folded(out: &mut Vec<u8>, prefix: usize, value: &str) {
    if prefix + value.len() <= MAX_LINE {
        out.extend_from_slice(value.as_bytes());
        return;
    }

    let mut line_len = prefix;
    for (i, item) in value.split(", ").enumerate() {
        if i > 0 {
            out.push(b',');
            line_len += 1;
            // continuation lines start with the separator's space
            if line_len + 1 + item.len() > MAX_LINE {
                out.extend_from_slice(b"\r\n");
                line_len = 0;
            }
            out.push(b' ');
            line_len += 1;
        }
        out.extend_from_slice(item.as_bytes());
        line_len += item.len();
    }
}

/// Split a raw message into its header and body
pub fn split_message(raw: &[u8]) -> Result<(Header, &[u8])> {
    let (header, offset) = Header::parse(raw)?;
    Ok((header, &raw[offset..]))
}

/// Assemble a message from a header and a body
pub fn compose(header: &Header, body: &[u8]) -> Vec<u8> {
    let mut out = header.to_bytes();
    out.extend_from_slice(body);
    out
}

/// Split off the first line (including its `\n`). `None` if there is no newline.
pub fn split_line(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let end = data.iter().position(|&b| b == b'\n')?;
    Some(data.split_at(end + 1))
}
