// ABOUTME: Portable migration key codec: destination URL plus bearer token in one string
// ABOUTME: base64 over `url || token`; decoding fails closed with MalformedKey

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{BridgeError, Result};

const SEPARATOR: &str = "||";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationKey {
    pub url: String,
    pub token: String,
}

impl MigrationKey {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }

    pub fn encode(&self) -> String {
        encode(&self.url, &self.token)
    }
}

pub fn encode(url: &str, token: &str) -> String {
    STANDARD.encode(format!("{url}{SEPARATOR}{token}"))
}

/// Reverses [`encode`]. Surrounding whitespace from copy/paste is ignored.
pub fn decode(key: &str) -> Result<MigrationKey> {
    let raw = STANDARD
        .decode(key.trim())
        .map_err(|_| BridgeError::MalformedKey)?;
    let text = String::from_utf8(raw).map_err(|_| BridgeError::MalformedKey)?;

    let parts: Vec<&str> = text.split(SEPARATOR).collect();
    match parts.as_slice() {
        [url, token] if !url.is_empty() && !token.is_empty() => {
            Ok(MigrationKey::new(*url, *token))
        }
        _ => Err(BridgeError::MalformedKey),
    }
}
