//! Identifiers for spaces, objects and per-space sessions.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Identifier parse error.
#[derive(Debug, Error)]
pub enum IdError {
    #[error("Invalid space URL '{input}': {source}")]
    InvalidSpace {
        input: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Invalid object id '{input}': {source}")]
    InvalidObject {
        input: String,
        #[source]
        source: uuid::Error,
    },
}

/// Address of a space, e.g. `loop://local/` or `sirikata://host:7777/`.
///
/// The scheme selects which protocol handler builds the connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceId(Url);

impl SpaceId {
    /// Parse a space URL.
    ///
    /// # Errors
    /// Returns error if the input is not an absolute URL.
    pub fn parse(input: &str) -> Result<Self, IdError> {
        Url::parse(input)
            .map(Self)
            .map_err(|source| IdError::InvalidSpace {
                input: input.to_string(),
                source,
            })
    }

    /// Protocol scheme of this space.
    #[must_use]
    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    /// Underlying URL.
    #[must_use]
    pub const fn as_url(&self) -> &Url {
        &self.0
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl FromStr for SpaceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Url> for SpaceId {
    fn from(url: Url) -> Self {
        Self(url)
    }
}

/// Object identifier within a space.
///
/// Temporary ids are generated locally for pending connects; the space
/// replaces them with its own id once the connect succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ObjectId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|source| IdError::InvalidObject {
                input: s.to_string(),
                source,
            })
    }
}

/// Lookup key for everything that is scoped to one object in one space.
///
/// Kept as a structured pair so distinct (space, object) combinations can
/// never alias each other.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    pub space: SpaceId,
    pub object: ObjectId,
}

impl SessionKey {
    #[must_use]
    pub const fn new(space: SpaceId, object: ObjectId) -> Self {
        Self { space, object }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.space, self.object)
    }
}

/// Server-assigned identity of a connected presence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceId {
    pub space: SpaceId,
    pub object: ObjectId,
}

impl PresenceId {
    #[must_use]
    pub const fn new(space: SpaceId, object: ObjectId) -> Self {
        Self { space, object }
    }

    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.space.clone(), self.object)
    }
}

impl fmt::Display for PresenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.space, self.object)
    }
}
