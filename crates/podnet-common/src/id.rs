//! Pod identifiers and the host resource names derived from them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::fmt;
use std::str::FromStr;

use crate::error::{PodnetError, PodnetResult};

/// A validated pod ID.
///
/// Pod IDs are UUIDs kept in their canonical lowercase hyphenated form,
/// since every derived name (interface templates, firewall chains) is
/// computed from that string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PodId(String);

impl PodId {
    /// Number of leading characters embedded in interface names.
    pub const FRAGMENT_LENGTH: usize = 4;

    /// Number of digest bytes used in chain names.
    pub const HASH_BYTES: usize = 8;

    /// Parse a pod ID, validating the UUID format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is not a UUID.
    pub fn new(id: impl AsRef<str>) -> PodnetResult<Self> {
        let id = id.as_ref();
        let uuid = uuid::Uuid::parse_str(id)
            .map_err(|_| PodnetError::InvalidPodId { id: id.to_string() })?;
        Ok(Self::from_uuid(uuid))
    }

    /// Generate a new random pod ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_uuid(uuid::Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid.hyphenated().to_string())
    }

    /// Get the pod ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters of the ID, used to tag host interface names.
    #[must_use]
    pub fn fragment(&self) -> &str {
        &self.0[..Self::FRAGMENT_LENGTH]
    }

    /// Lowercase hex of the first eight bytes of SHA-512 over the ID string.
    #[must_use]
    pub fn hash_suffix(&self) -> String {
        let digest = Sha512::digest(self.0.as_bytes());
        hex::encode(&digest[..Self::HASH_BYTES])
    }
}

impl fmt::Display for PodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PodId {
    type Err = PodnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for PodId {
    type Error = PodnetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PodId> for String {
    fn from(id: PodId) -> Self {
        id.0
    }
}

impl AsRef<str> for PodId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
