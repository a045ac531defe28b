//! Time-ordered 128-bit identifiers.
//!
//! A thin wrapper over [`ulid::Ulid`]: 48 bits of unix milliseconds followed
//! by 80 bits of entropy. Minting goes through one process-wide monotonic
//! generator, so later-minted identifiers always compare greater. The textual
//! form is the 26-character Crockford base32 string, which is URL-safe.

use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::{Generator, Ulid};

use crate::error::{Error, Result};

const TEXT_LEN: usize = 26;

/// Opaque 128-bit identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(Ulid);

impl Id {
    /// The reserved zero identifier.
    pub const ZERO: Id = Id(Ulid(0));

    /// Mint a new identifier, greater than every identifier previously minted
    /// by this process.
    pub fn new() -> Self {
        let mut generator = match generator().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            match generator.generate() {
                Ok(ulid) => return Id(ulid),
                // Entropy exhausted within one millisecond; the next tick resets it.
                Err(_) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0 .0 == 0
    }

    /// Milliseconds since the unix epoch encoded in the prefix.
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 16] = bytes.try_into().map_err(|_| {
            Error::InvalidInput(format!(
                "invalid_bytes: identifier needs 16 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Id(Ulid::from_bytes(array)))
    }

    pub fn as_u128(&self) -> u128 {
        self.0 .0
    }

    pub fn from_u128(value: u128) -> Self {
        Id(Ulid(value))
    }
}

impl Default for Id {
    fn default() -> Self {
        Id::ZERO
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.0)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != TEXT_LEN {
            return Err(Error::InvalidInput(format!(
                "identifier '{}' must be {} characters",
                s, TEXT_LEN
            )));
        }
        // 26 * 5 = 130 bits; the leading character may only carry 3 bits.
        if !matches!(s.as_bytes()[0], b'0'..=b'7') {
            return Err(Error::InvalidInput(format!(
                "identifier '{}' overflows 128 bits",
                s
            )));
        }
        Ulid::from_string(&s.to_ascii_uppercase())
            .map(Id)
            .map_err(|e| Error::InvalidInput(format!("identifier '{}': {}", s, e)))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl rusqlite::ToSql for Id {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::Owned(
            rusqlite::types::Value::Blob(self.to_bytes().to_vec()),
        ))
    }
}

impl rusqlite::types::FromSql for Id {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let bytes = value.as_blob()?;
        Id::from_bytes(bytes).map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
    }
}

fn generator() -> &'static Mutex<Generator> {
    static GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();
    GENERATOR.get_or_init(|| Mutex::new(Generator::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_ids_are_strictly_increasing() {
        let ids: Vec<Id> = (0..10_000).map(|_| Id::new()).collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_ids_from_many_threads_are_unique() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..1_000).map(|_| Id::new()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<Id> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4_000);
    }

    #[test]
    fn test_text_form_is_url_safe_and_parses_back() {
        let id = Id::new();
        let text = id.to_string();
        assert_eq!(text.len(), 26);
        assert!(text.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(text.parse::<Id>().unwrap(), id);
        assert_eq!(text.to_lowercase().parse::<Id>().unwrap(), id);
    }

    #[test]
    fn test_bytes_are_big_endian() {
        let id = Id::from_u128(0x0102);
        let bytes = id.to_bytes();
        assert_eq!(bytes[14], 0x01);
        assert_eq!(bytes[15], 0x02);
        assert_eq!(Id::from_bytes(&bytes).unwrap(), id);
    }

    #[test]
    fn test_invalid_bytes() {
        let err = Id::from_bytes(&[1, 2, 3]).unwrap_err();
        assert!(err.to_string().contains("invalid_bytes"));
    }

    #[test]
    fn test_zero_is_reserved() {
        assert!(Id::ZERO.is_zero());
        assert!(Id::default().is_zero());
        assert!(!Id::new().is_zero());
        assert_eq!(Id::ZERO.to_string(), "0".repeat(26));
    }

    #[test]
    fn test_timestamp_prefix() {
        let before = Utc::now().timestamp_millis() as u64;
        let id = Id::new();
        assert!(id.timestamp_ms() >= before);
    }

    #[test]
    fn test_rejects_malformed_text() {
        assert!("8ZZZZZZZZZZZZZZZZZZZZZZZZZ".parse::<Id>().is_err());
        assert!("7ZZZZZZZZZZZZZZZZZZZZZZZZZ".parse::<Id>().is_ok());
        assert!("short".parse::<Id>().is_err());
        assert!("0000000000000000000000000U".parse::<Id>().is_err());
    }
}
