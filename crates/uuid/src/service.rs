//! Implementation of the storage and surrogate identifier types.

use crate::{UuidError, UuidResult};
use std::path::{Path, PathBuf};
use std::{fmt, str::FromStr};

/// Re-exported for convenience.
pub use ::uuid::Uuid;

/// Prefix used when a surrogate id is rendered as a bundle-local URI.
pub const URN_UUID_PREFIX: &str = "urn:uuid:";

/// Canonical storage UUID (32 lowercase hex characters, no hyphens).
///
/// Once constructed the contained UUID is guaranteed to be in canonical form, so path
/// derivation is deterministic.
///
/// # Construction
/// - [`ShardableUuid::new`] generates a fresh identifier.
/// - [`ShardableUuid::parse`] validates an externally supplied identifier and does **not**
///   normalise hyphenated or uppercase input.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardableUuid(Uuid);

impl Default for ShardableUuid {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardableUuid {
    /// Generates a new random (v4) identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Validates and parses a UUID string that must already be in canonical form.
    ///
    /// # Errors
    ///
    /// Returns [`UuidError::InvalidInput`] if `input` is not 32 lowercase hex characters.
    pub fn parse(input: &str) -> UuidResult<Self> {
        if !Self::is_canonical(input) {
            return Err(UuidError::InvalidInput(format!(
                "UUID must be 32 lowercase hex characters without hyphens, got: '{}'",
                input
            )));
        }
        Uuid::parse_str(input)
            .map(Self)
            .map_err(|e| UuidError::InvalidInput(format!("{input}: {e}")))
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Returns true if `input` is in canonical form.
    ///
    /// Purely syntactic: exactly 32 bytes, each `0-9` or `a-f`.
    pub fn is_canonical(input: &str) -> bool {
        input.len() == 32
            && input
                .bytes()
                .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    /// Returns `parent_dir/<s1>/<s2>/` where `s1`/`s2` are the first two pairs of hex digits.
    pub fn shard_dir(&self, parent_dir: &Path) -> PathBuf {
        let canonical = self.0.simple().to_string();
        parent_dir.join(&canonical[0..2]).join(&canonical[2..4])
    }

    /// Returns `parent_dir/<s1>/<s2>/<uuid>.<extension>`.
    pub fn sharded_file(&self, parent_dir: &Path, extension: &str) -> PathBuf {
        self.shard_dir(parent_dir)
            .join(format!("{}.{extension}", self.0.simple()))
    }
}

impl fmt::Display for ShardableUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for ShardableUuid {
    type Err = UuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShardableUuid::parse(s)
    }
}

/// Document-local surrogate identity.
///
/// Displayed in the hyphenated RFC 4122 form. [`SurrogateId::urn`] gives the
/// `urn:uuid:` URI that members of a canonicalized document use to point at each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct SurrogateId(Uuid);

impl Default for SurrogateId {
    fn default() -> Self {
        Self::new()
    }
}

impl SurrogateId {
    /// Generates a new random surrogate.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }

    /// Returns `urn:uuid:<hyphenated>`.
    pub fn urn(&self) -> String {
        format!("{URN_UUID_PREFIX}{}", self.0.hyphenated())
    }

    /// Parses either a bare hyphenated UUID or a `urn:uuid:` URI.
    ///
    /// # Errors
    ///
    /// Returns [`UuidError::InvalidInput`] if the remainder is not a UUID.
    pub fn parse(input: &str) -> UuidResult<Self> {
        let bare = input.strip_prefix(URN_UUID_PREFIX).unwrap_or(input);
        Uuid::parse_str(bare)
            .map(Self)
            .map_err(|e| UuidError::InvalidInput(format!("invalid surrogate id '{input}': {e}")))
    }
}

impl fmt::Display for SurrogateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SurrogateId {
    type Err = UuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SurrogateId::parse(s)
    }
}

/// Deterministic surrogate source: yields `00000000-0000-0000-0000-000000000001`, `...0002`, ...
///
/// Intended for tests and reproducible document output.
#[derive(Clone, Debug, Default)]
pub struct SequentialSurrogates {
    next: u128,
}

impl SequentialSurrogates {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    pub fn next_id(&mut self) -> SurrogateId {
        self.next += 1;
        SurrogateId(Uuid::from_u128(self.next))
    }
}
