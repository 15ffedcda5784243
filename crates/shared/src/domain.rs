use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(MessageRowId);
id_newtype!(MediaRowId);

/// Message identifier assigned by the remote source. Unbounded precision:
/// some providers hand out ids past the i64 range, so all comparison and
/// arithmetic goes through `BigUint`, never through native integers or floats.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExternalId(BigUint);

impl ExternalId {
    pub fn parse(raw: &str) -> Result<Self, ExternalIdParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ExternalIdParseError(raw.to_string()));
        }
        let value = trimmed
            .parse::<BigUint>()
            .map_err(|_| ExternalIdParseError(raw.to_string()))?;
        Ok(Self(value))
    }

    pub fn from_u64(value: u64) -> Self {
        Self(BigUint::from(value))
    }

    /// Normalized decimal rendering (no sign, no leading zeros). This is the
    /// canonical persisted form; `(LENGTH, value)` ordering over it matches
    /// numeric ordering.
    pub fn as_decimal(&self) -> String {
        self.0.to_string()
    }

    pub fn value(&self) -> &BigUint {
        &self.0
    }

    /// Number of ids in the inclusive range `earliest..=latest`.
    /// Caller must ensure `earliest <= latest`.
    pub fn span(earliest: &ExternalId, latest: &ExternalId) -> BigUint {
        (&latest.0 - &earliest.0) + 1u32
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ExternalId {
    type Err = ExternalIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ExternalId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_decimal())
    }
}

impl<'de> Deserialize<'de> for ExternalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ExternalId::parse(&raw).map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid external id '{0}': expected a non-negative decimal integer")]
pub struct ExternalIdParseError(String);

/// One archival source stream. Opaque arbitrary-precision integer string,
/// normalized on parse so string equality matches numeric equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn parse(raw: &str) -> Result<Self, ExternalIdParseError> {
        let id = ExternalId::parse(raw)?;
        Ok(Self(id.as_decimal()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChannelId {
    type Err = ExternalIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ChannelId::parse(&raw).map_err(de::Error::custom)
    }
}

/// Lifecycle of the optional attachment on a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaStatus {
    None,
    Pending,
    Processing,
    Completed,
    Failed,
    SkippedType,
    SkippedLarge,
    Skipped,
}

impl MediaStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaStatus::None => "none",
            MediaStatus::Pending => "pending",
            MediaStatus::Processing => "processing",
            MediaStatus::Completed => "completed",
            MediaStatus::Failed => "failed",
            MediaStatus::SkippedType => "skipped_type",
            MediaStatus::SkippedLarge => "skipped_large",
            MediaStatus::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "none" => MediaStatus::None,
            "pending" => MediaStatus::Pending,
            "processing" => MediaStatus::Processing,
            "completed" => MediaStatus::Completed,
            "failed" => MediaStatus::Failed,
            "skipped_type" => MediaStatus::SkippedType,
            "skipped_large" => MediaStatus::SkippedLarge,
            "skipped" => MediaStatus::Skipped,
            _ => return None,
        })
    }

    /// Terminal under normal operation; only `failed` is re-selected.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MediaStatus::Completed
                | MediaStatus::SkippedType
                | MediaStatus::SkippedLarge
                | MediaStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Forward,
    Backfill,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Forward => "forward",
            SyncMode::Backfill => "backfill",
        }
    }
}

/// Derived sync position for one channel. Never persisted; recomputed from
/// the message table on every invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCursor {
    pub earliest: ExternalId,
    pub latest: ExternalId,
    pub count: u64,
}

impl ChannelCursor {
    /// True when the known range has no holes: `count == latest - earliest + 1`.
    pub fn is_contiguous(&self) -> bool {
        ExternalId::span(&self.earliest, &self.latest) == BigUint::from(self.count)
    }

    /// A gap exists below the earliest known message that backfill can fill.
    pub fn has_gap_below(&self) -> bool {
        !self.is_contiguous() && self.earliest.value() > &BigUint::from(1u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_id_orders_numerically_past_i64_range() {
        let small = ExternalId::parse("999999999999").expect("id");
        let huge = ExternalId::parse("92233720368547758080").expect("id");
        assert!(small < huge);
        assert_eq!(huge.as_decimal(), "92233720368547758080");
    }

    #[test]
    fn external_id_normalizes_leading_zeros() {
        let id = ExternalId::parse("000101").expect("id");
        assert_eq!(id.as_decimal(), "101");
        assert_eq!(id, ExternalId::from_u64(101));
    }

    #[test]
    fn cursor_contiguity() {
        let cursor = ChannelCursor {
            earliest: ExternalId::from_u64(5),
            latest: ExternalId::from_u64(9),
            count: 5,
        };
        assert!(cursor.is_contiguous());
        assert!(!cursor.has_gap_below());

        let gapped = ChannelCursor {
            count: 3,
            ..cursor
        };
        assert!(!gapped.is_contiguous());
        assert!(gapped.has_gap_below());
    }

    #[test]
    fn cursor_starting_at_one_has_no_gap_below() {
        let cursor = ChannelCursor {
            earliest: ExternalId::from_u64(1),
            latest: ExternalId::from_u64(10),
            count: 4,
        };
        assert!(!cursor.is_contiguous());
        assert!(!cursor.has_gap_below());
    }
}
