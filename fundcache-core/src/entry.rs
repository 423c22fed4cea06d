//! Cache entries and their durable encoding.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CacheResult, StorageError};

/// Size of the fixed header in front of every encoded payload.
pub const ENTRY_HEADER_LEN: usize = 17;

/// A cached value with its timing metadata.
///
/// The payload is opaque bytes; [`CacheEntry::from_json`] and
/// [`CacheEntry::decode_json`] are the typed accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// `None` means the entry never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// New entry created now, expiring after `ttl` if given.
    pub fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        let created_at = Utc::now();
        Self {
            value,
            created_at,
            expires_at: ttl.and_then(|ttl| expiry_after(created_at, ttl)),
        }
    }

    pub fn with_times(
        value: Vec<u8>,
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            value,
            created_at,
            expires_at,
        }
    }

    /// Serialize `value` as JSON into a new entry.
    pub fn from_json<T: Serialize>(value: &T, ttl: Option<Duration>) -> CacheResult<Self> {
        let bytes = serde_json::to_vec(value).map_err(|e| StorageError::Encoding {
            reason: e.to_string(),
        })?;
        Ok(Self::new(bytes, ttl))
    }

    /// Decode the payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> CacheResult<T> {
        Ok(serde_json::from_slice(&self.value)?)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left before expiry; `None` for entries without TTL.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at.map(|expires_at| {
            expires_at
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Advisory size in bytes, used for reporting only.
    pub fn size_estimate(&self) -> usize {
        ENTRY_HEADER_LEN + self.value.len()
    }

    /// Encode for the durable tier.
    ///
    /// Format: `[created_at ms: i64 LE][has_expiry: u8][expires_at ms: i64 LE][payload]`
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ENTRY_HEADER_LEN + self.value.len());
        bytes.extend_from_slice(&self.created_at.timestamp_millis().to_le_bytes());
        match self.expires_at {
            Some(expires_at) => {
                bytes.push(1);
                bytes.extend_from_slice(&expires_at.timestamp_millis().to_le_bytes());
            }
            None => {
                bytes.push(0);
                bytes.extend_from_slice(&0i64.to_le_bytes());
            }
        }
        bytes.extend_from_slice(&self.value);
        bytes
    }

    /// Decode bytes written by [`CacheEntry::encode`].
    pub fn decode(bytes: &[u8]) -> CacheResult<Self> {
        if bytes.len() < ENTRY_HEADER_LEN {
            return Err(StorageError::Decoding {
                reason: format!(
                    "entry is {} bytes, header needs {}",
                    bytes.len(),
                    ENTRY_HEADER_LEN
                ),
            }
            .into());
        }

        let created_at = read_timestamp(&bytes[0..8])?;
        let expires_at = match bytes[8] {
            0 => None,
            1 => Some(read_timestamp(&bytes[9..17])?),
            flag => {
                return Err(StorageError::Decoding {
                    reason: format!("invalid expiry flag {}", flag),
                }
                .into())
            }
        };

        Ok(Self {
            value: bytes[ENTRY_HEADER_LEN..].to_vec(),
            created_at,
            expires_at,
        })
    }
}

fn read_timestamp(bytes: &[u8]) -> CacheResult<DateTime<Utc>> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| StorageError::Decoding {
        reason: "invalid timestamp width".to_string(),
    })?;
    let millis = i64::from_le_bytes(raw);
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        StorageError::Decoding {
            reason: format!("timestamp {} out of range", millis),
        }
        .into()
    })
}

/// `None` when the TTL is too large to represent, which reads as "never expires".
fn expiry_after(created_at: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    ChronoDuration::from_std(ttl)
        .ok()
        .and_then(|ttl| created_at.checked_add_signed(ttl))
}

/// Hex string (de)serialization for opaque payload bytes.
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
