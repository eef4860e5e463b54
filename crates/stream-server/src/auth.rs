//! Client credential checking

use crate::error::ConfigError;
use irrv_protocol::{DEFAULT_AUTH_ID, DEFAULT_AUTH_KEY, UUID_LEN};
use uuid::Uuid;

/// 16-byte credential pair as carried in VAUTH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub id: [u8; UUID_LEN],
    pub key: [u8; UUID_LEN],
}

impl Credentials {
    /// Parse textual credentials
    ///
    /// Each part is either a UUID string (stored as its 16 raw bytes) or at
    /// most 16 ASCII bytes, zero padded.
    pub fn parse(id: &str, key: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            id: parse_token("auth_id", id)?,
            key: parse_token("auth_key", key)?,
        })
    }

    /// Fixed-size token from an ASCII string, truncated to 16 bytes
    pub fn token(text: &str) -> [u8; UUID_LEN] {
        let mut out = [0u8; UUID_LEN];
        for (slot, byte) in out.iter_mut().zip(text.bytes()) {
            *slot = byte;
        }
        out
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            id: Self::token(DEFAULT_AUTH_ID),
            key: Self::token(DEFAULT_AUTH_KEY),
        }
    }
}

fn parse_token(name: &'static str, text: &str) -> Result<[u8; UUID_LEN], ConfigError> {
    if let Ok(uuid) = Uuid::parse_str(text) {
        return Ok(*uuid.as_bytes());
    }
    if text.is_ascii() && text.len() <= UUID_LEN {
        return Ok(Credentials::token(text));
    }
    Err(ConfigError::Invalid {
        key: name,
        value: text.to_string(),
    })
}

/// Source of the expected client credentials
pub trait CredentialSource: Send + Sync {
    /// Whether the presented id/key pair is accepted
    fn verify(&self, id: &[u8; UUID_LEN], key: &[u8; UUID_LEN]) -> bool;
}

/// Single credential pair fixed at startup
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    expected: Credentials,
}

impl StaticCredentials {
    pub fn new(expected: Credentials) -> Self {
        Self { expected }
    }
}

impl CredentialSource for StaticCredentials {
    fn verify(&self, id: &[u8; UUID_LEN], key: &[u8; UUID_LEN]) -> bool {
        // Plain byte comparison; not constant time
        self.expected.id == *id && self.expected.key == *key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_credentials_are_zero_padded() {
        let creds = Credentials::default();
        assert_eq!(&creds.id[..7], b"irrv_id");
        assert!(creds.id[7..].iter().all(|b| *b == 0));
        assert_eq!(&creds.key[..8], b"irrv_key");
    }

    #[test]
    fn test_parse_uuid_credentials() {
        let creds = Credentials::parse(
            "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "short",
        )
        .unwrap();
        assert_eq!(creds.id[0], 0x67);
        assert_eq!(creds.id[15], 0xc8);
        assert_eq!(&creds.key[..5], b"short");
    }

    #[test]
    fn test_parse_rejects_long_token() {
        let err = Credentials::parse("this-id-is-far-too-long", "k").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "auth_id", .. }));
    }

    #[test]
    fn test_static_verify() {
        let source = StaticCredentials::default();
        let good = Credentials::default();
        assert!(source.verify(&good.id, &good.key));
        assert!(!source.verify(&good.id, &Credentials::token("wrong")));
    }
}
