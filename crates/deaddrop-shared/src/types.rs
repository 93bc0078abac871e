use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{PAIRING_CODE_ALPHABET, PAIRING_CODE_LEN};

/// Six uppercase alphanumeric characters identifying a live session.
///
/// Construction is validating: a `PairingCode` can only ever hold
/// `[A-Z0-9]{6}`, so it is safe to embed in filesystem paths and URLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PairingCode(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid pairing code")]
pub struct InvalidPairingCode;

impl PairingCode {
    /// Parse a caller-supplied code. Lowercase input is accepted and
    /// normalized; anything outside `[A-Za-z0-9]{6}` is rejected.
    pub fn parse(s: &str) -> Result<Self, InvalidPairingCode> {
        let s = s.trim();
        if s.len() != PAIRING_CODE_LEN {
            return Err(InvalidPairingCode);
        }
        if !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(InvalidPairingCode);
        }
        Ok(Self(s.to_ascii_uppercase()))
    }

    /// Draw a fresh code uniformly from the 36-symbol alphabet.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let code: String = (0..PAIRING_CODE_LEN)
            .map(|_| PAIRING_CODE_ALPHABET[rng.gen_range(0..PAIRING_CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PairingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PairingCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PairingCode::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Server-issued opaque identity for one participant within a session.
/// Survives reconnects; clients store it and present it on rejoin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientToken(Uuid);

impl ClientToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle for one in-flight chunked upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
