use std::fmt;
use std::str::FromStr;

use crate::gemini::{Error, Result};

/// A validated Gemini request URI.
///
/// The raw string is kept exactly as received and component accessors slice
/// it, so `as_str()` and `Display` round-trip the input losslessly. Host,
/// path and input are percent-decoded on access; the raw string is not.
#[derive(Debug, Clone)]
pub struct Uri {
    data: String,
    host_start: usize,
    host_end: usize,
    path_start: usize,
    port: Option<u16>,
    input_start: Option<usize>,
}

impl Uri {
    /// Parse and validate a URI string.
    ///
    /// Validation accepts any string containing `://`. The host may be an
    /// IPv6 literal in brackets; an optional `:port` must be a decimal
    /// number no greater than 65535 ending exactly at the path boundary.
    pub fn new(uri_string: &str) -> Result<Uri> {
        let invalid = || Error::InvalidUri(uri_string.to_string());
        let data = uri_string;

        let host_start = data.find("://").ok_or_else(invalid)? + 3;
        let path_start = data[host_start..]
            .find('/')
            .map(|i| host_start + i)
            .unwrap_or(data.len());

        // An empty host (e.g. "file:///") cannot carry a port.
        let (host_end, port) = if host_start == path_start {
            (path_start, None)
        } else {
            // IPv6 literals contain colons, so skip to the closing bracket
            // before searching for the port separator.
            let port_search_start = if data.as_bytes()[host_start] == b'[' {
                let closing = data[host_start..path_start].find(']').ok_or_else(invalid)?;
                host_start + closing
            } else {
                host_start
            };
            match data[port_search_start..path_start].find(':') {
                Some(i) => {
                    let colon = port_search_start + i;
                    let digits = &data[colon + 1..path_start];
                    match digits.as_bytes().first() {
                        Some(first) if first.is_ascii_digit() => {}
                        _ => return Err(invalid()),
                    }
                    let port = digits.parse::<u32>().map_err(|_| invalid())?;
                    if port > u32::from(u16::MAX) {
                        return Err(invalid());
                    }
                    (colon, Some(port as u16))
                }
                None => (path_start, None),
            }
        };

        let input_start = data[path_start..].find('?').map(|i| path_start + i + 1);

        Ok(Uri {
            data: data.to_string(),
            host_start,
            host_end,
            path_start,
            port,
            input_start,
        })
    }

    /// The part before `://`, e.g. "gemini".
    pub fn scheme(&self) -> &str {
        &self.data[..self.host_start - 3]
    }

    /// The percent-decoded host. IPv6 literals keep their brackets.
    pub fn host(&self) -> String {
        decode_percent_encoding(&self.data[self.host_start..self.host_end])
    }

    /// The port, if one was given.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The percent-decoded path. Empty if the URI has no `/` after the host.
    pub fn path(&self) -> String {
        match self.input_start {
            Some(input) => decode_percent_encoding(&self.data[self.path_start..input - 1]),
            None => decode_percent_encoding(&self.data[self.path_start..]),
        }
    }

    /// The percent-decoded query input, if a `?` follows the path.
    pub fn input(&self) -> Option<String> {
        self.input_start
            .map(|input| decode_percent_encoding(&self.data[input..]))
    }

    /// The raw URI string, exactly as parsed.
    pub fn as_str(&self) -> &str {
        &self.data
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.data)
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Uri> {
        Uri::new(s)
    }
}

impl PartialEq for Uri {
    fn eq(&self, other: &Uri) -> bool {
        self.data == other.data
    }
}

impl Eq for Uri {}

impl PartialEq<str> for Uri {
    fn eq(&self, other: &str) -> bool {
        self.data == other
    }
}

impl PartialEq<&str> for Uri {
    fn eq(&self, other: &&str) -> bool {
        self.data == *other
    }
}

/// Replace every `%HH` triple (case-insensitive hex) with the decoded byte.
/// Escapes that are not two hex digits are left literal.
fn decode_percent_encoding(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(high), Some(low)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                decoded.push(high << 4 | low);
                i += 3;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
