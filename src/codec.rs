//! Value encoding and the wire-level entry format.
//!
//! Every stored entry carries a flags word telling readers how the payload
//! was produced, so values written by any client decode correctly:
//!
//! | flag | payload |
//! |------|---------|
//! | `0`  | raw bytes |
//! | `1`  | legacy pickled object (never decoded here) |
//! | `2`  | JSON document |

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{RingError, RingResult};

/// Payload is opaque bytes.
pub const FLAG_RAW: u32 = 0;
/// Payload is a pickled object from a legacy writer.
pub const FLAG_PICKLE: u32 = 1;
/// Payload is a JSON document.
pub const FLAG_JSON: u32 = 2;

/// Relative expirations longer than this are sent as Unix timestamps,
/// matching how memcached interprets the exptime field.
pub const MAX_RELATIVE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// A value as stored in or read from the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// Opaque bytes, stored as-is.
    Raw(Bytes),
    /// A structured value, stored as JSON.
    Json(Value),
}

impl CacheValue {
    /// Serialize any value as a JSON entry.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> RingResult<Self> {
        Ok(CacheValue::Json(serde_json::to_value(value)?))
    }

    /// Decode a JSON entry into `T`. Raw entries are parsed as JSON text.
    pub fn to_json<T: DeserializeOwned>(&self) -> RingResult<T> {
        match self {
            CacheValue::Json(value) => Ok(T::deserialize(value)?),
            CacheValue::Raw(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// Encode into the wire entry.
    pub fn encode(&self) -> RingResult<CacheEntry> {
        match self {
            CacheValue::Raw(bytes) => Ok(CacheEntry {
                value: bytes.clone(),
                flags: FLAG_RAW,
            }),
            CacheValue::Json(value) => Ok(CacheEntry {
                value: Bytes::from(serde_json::to_vec(value)?),
                flags: FLAG_JSON,
            }),
        }
    }
}

impl From<Bytes> for CacheValue {
    fn from(bytes: Bytes) -> Self {
        CacheValue::Raw(bytes)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(bytes: Vec<u8>) -> Self {
        CacheValue::Raw(Bytes::from(bytes))
    }
}

impl From<&'static str> for CacheValue {
    fn from(s: &'static str) -> Self {
        CacheValue::Raw(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for CacheValue {
    fn from(s: String) -> Self {
        CacheValue::Raw(Bytes::from(s))
    }
}

impl From<Value> for CacheValue {
    fn from(value: Value) -> Self {
        CacheValue::Json(value)
    }
}

/// A value together with its serialization tag, as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Bytes,
    pub flags: u32,
}

impl CacheEntry {
    pub fn new(value: impl Into<Bytes>, flags: u32) -> Self {
        Self {
            value: value.into(),
            flags,
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Decode according to the flags.
    pub fn decode(&self) -> RingResult<CacheValue> {
        if self.flags & FLAG_PICKLE != 0 {
            Err(RingError::UnsupportedFlags(self.flags))
        } else if self.flags & FLAG_JSON != 0 {
            Ok(CacheValue::Json(serde_json::from_slice(&self.value)?))
        } else {
            Ok(CacheValue::Raw(self.value.clone()))
        }
    }

    /// Whether this entry should trigger the item size warning.
    pub fn exceeds(&self, threshold: i64) -> bool {
        threshold >= 0 && self.value.len() as u64 > threshold as u64
    }
}

/// Convert a TTL into memcached's exptime field.
///
/// `None` and zero mean "never expire". A TTL under one second rounds up to
/// one second. Anything over thirty days becomes an absolute Unix timestamp.
pub fn exptime(ttl: Option<Duration>) -> u64 {
    exptime_at(ttl, SystemTime::now())
}

/// Like [`exptime`] with an explicit clock.
pub fn exptime_at(ttl: Option<Duration>, now: SystemTime) -> u64 {
    match ttl {
        None => 0,
        Some(ttl) if ttl > MAX_RELATIVE_TTL => {
            let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
            (since_epoch + ttl).as_secs()
        }
        Some(ttl) if ttl.is_zero() => 0,
        // memcached would read 0 as "never expire"
        Some(ttl) => ttl.as_secs().max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Account {
        name: String,
        containers: u32,
    }

    #[test]
    fn test_raw_entry() {
        let entry = CacheValue::from("hello").encode().unwrap();
        assert_eq!(entry.flags, FLAG_RAW);
        assert_eq!(&entry.value[..], b"hello");
        assert_eq!(entry.decode().unwrap(), CacheValue::from("hello"));
    }

    #[test]
    fn test_json_entry() {
        let account = Account {
            name: "AUTH_test".to_string(),
            containers: 3,
        };
        let entry = CacheValue::json(&account).unwrap().encode().unwrap();
        assert_eq!(entry.flags, FLAG_JSON);

        let decoded: Account = entry.decode().unwrap().to_json().unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn test_entry_from_other_writer() {
        // written by another client with the JSON tag
        let entry = CacheEntry::new(&b"{\"a\": [1, 2]}"[..], FLAG_JSON);
        assert_eq!(entry.decode().unwrap(), CacheValue::Json(json!({"a": [1, 2]})));
    }

    #[test]
    fn test_pickle_is_unsupported() {
        let entry = CacheEntry::new(&b"\x80\x02}q\x00."[..], FLAG_PICKLE);
        assert!(matches!(entry.decode(), Err(RingError::UnsupportedFlags(1))));
    }

    #[test]
    fn test_corrupt_json() {
        let entry = CacheEntry::new(&b"{not json"[..], FLAG_JSON);
        assert!(matches!(entry.decode(), Err(RingError::Serialization(_))));
    }

    #[test]
    fn test_size_threshold() {
        let entry = CacheEntry::new(vec![0u8; 100], FLAG_RAW);
        assert!(!entry.exceeds(-1));
        assert!(!entry.exceeds(100));
        assert!(entry.exceeds(99));
        assert!(entry.exceeds(0));
    }

    #[test]
    fn test_exptime() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(exptime_at(None, now), 0);
        assert_eq!(exptime_at(Some(Duration::from_secs(300)), now), 300);
        assert_eq!(exptime_at(Some(Duration::ZERO), now), 0);
        assert_eq!(exptime_at(Some(Duration::from_millis(200)), now), 1);
        assert_eq!(exptime_at(Some(Duration::from_millis(1500)), now), 1);
        assert_eq!(exptime_at(Some(MAX_RELATIVE_TTL), now), MAX_RELATIVE_TTL.as_secs());

        let long = MAX_RELATIVE_TTL + Duration::from_secs(1);
        assert_eq!(exptime_at(Some(long), now), 1_700_000_000 + long.as_secs());
    }
}
