//! SHA-256 content checksums.

use std::fmt;
use std::io::Read;

use anyhow::{Error, bail};
use serde::{Deserialize, Serialize};

use crate::error::RvnError;

/// Fixed width content hash. Equality is content equality; the canonical
/// text form is lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub const LEN: usize = 32;

    pub fn of(data: &[u8]) -> Self {
        Self(openssl::sha::sha256(data))
    }

    /// Hash everything `reader` yields.
    pub fn of_reader<R: Read>(mut reader: R) -> Result<Self, Error> {
        let mut hasher = openssl::sha::Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let got = reader.read(&mut buf)?;
            if got == 0 {
                break;
            }
            hasher.update(&buf[..got]);
        }
        Ok(Self(hasher.finish()))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form. Lenient on case, strict on length.
    pub fn from_hex(text: &str) -> Result<Self, Error> {
        if text.len() != 2 * Self::LEN {
            bail!(RvnError::InvalidInput(format!(
                "checksum '{}' has wrong length (expected {} hex digits)",
                text,
                2 * Self::LEN
            )));
        }
        let bytes = hex::decode(text).map_err(|err| {
            RvnError::InvalidInput(format!("checksum '{}' is not valid hex - {}", text, err))
        })?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&bytes);
        Ok(Self(digest))
    }

    /// First two hex digits, used as the blob directory fan-out prefix.
    pub fn hex_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> String {
        checksum.to_hex()
    }
}

impl TryFrom<String> for Checksum {
    type Error = Error;

    fn try_from(text: String) -> Result<Self, Error> {
        Self::from_hex(&text)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let checksum = Checksum::of(b"hello");
        let parsed = Checksum::from_hex(&checksum.to_hex()).unwrap();
        assert_eq!(checksum, parsed);
    }

    #[test]
    fn from_hex_is_lenient_on_case() {
        let lower = Checksum::of(b"data").to_hex();
        let upper = lower.to_uppercase();
        assert_eq!(
            Checksum::from_hex(&lower).unwrap(),
            Checksum::from_hex(&upper).unwrap()
        );
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(Checksum::from_hex("abc").is_err());
        assert!(Checksum::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn known_sha256() {
        assert_eq!(
            Checksum::of(b"hello").to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn reader_matches_slice() {
        let data = vec![7u8; 200_000];
        assert_eq!(
            Checksum::of(&data),
            Checksum::of_reader(&data[..]).unwrap()
        );
    }
}
