//! Conversation addressing: participant identities, roles, and pair keys.
//!
//! A conversation is addressed by an ordered [`PairKey`]. The participant
//! holding [`Role::A`] is always the first element, so both sides derive the
//! same key no matter who opens the conversation. Topic and publish
//! destinations are derived from the key:
//!
//! - subscribe: `chat/{a}/{b}`
//! - publish: `send/chat/{a}/{b}`

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix of every subscription topic.
pub const TOPIC_PREFIX: &str = "chat/";

/// Prefix of every publish destination.
pub const PUBLISH_PREFIX: &str = "send/chat/";

/// Errors produced while building or parsing addresses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The participant identifier was empty.
    #[error("participant id must not be empty")]
    EmptyId,

    /// The participant identifier contains a character that cannot appear
    /// in a destination path segment.
    #[error("participant id {0:?} contains a reserved character")]
    ReservedCharacter(String),

    /// Both halves of a pair key named the same participant.
    #[error("pair key needs two distinct participants, got {0} twice")]
    SameParticipant(ParticipantId),

    /// The destination string did not match the expected layout.
    #[error("malformed destination: {0}")]
    MalformedDestination(String),

    /// The role string was neither `A` nor `B`.
    #[error("unknown role {0:?} (expected \"A\" or \"B\")")]
    UnknownRole(String),
}

/// Identifier of one participant in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Validate and wrap a participant identifier.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::EmptyId`] for an empty string and
    /// [`AddressError::ReservedCharacter`] if the id contains `/`, whitespace,
    /// or a control character (it must fit in one destination segment).
    pub fn new(id: impl Into<String>) -> Result<Self, AddressError> {
        let id = id.into();
        if id.is_empty() {
            return Err(AddressError::EmptyId);
        }
        if id
            .chars()
            .any(|c| c == '/' || c.is_whitespace() || c.is_control())
        {
            return Err(AddressError::ReservedCharacter(id));
        }
        Ok(Self(id))
    }

    /// Return the string representation of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the conversation a participant is on.
///
/// On the wire the sender is encoded as `"A"` or `"B"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The participant listed first in the pair key.
    A,
    /// The participant listed second in the pair key.
    B,
}

impl Role {
    /// The opposite role.
    #[must_use]
    pub const fn counterpart(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "a" => Ok(Self::A),
            "B" | "b" => Ok(Self::B),
            other => Err(AddressError::UnknownRole(other.to_string())),
        }
    }
}

/// Ordered pair of participants addressing exactly one conversation.
///
/// Equality is order-sensitive: `(x, y)` and `(y, x)` are different keys.
/// Build keys through [`PairKey::from_roles`] so that the canonical order
/// (role `A` first) is applied once, at resolution time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    first: ParticipantId,
    second: ParticipantId,
}

impl PairKey {
    /// Create a key from an already-ordered pair.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::SameParticipant`] if both ids are equal.
    pub fn new(first: ParticipantId, second: ParticipantId) -> Result<Self, AddressError> {
        if first == second {
            return Err(AddressError::SameParticipant(first));
        }
        Ok(Self { first, second })
    }

    /// Canonicalize a pair from one participant's point of view: whoever
    /// holds [`Role::A`] goes first.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::SameParticipant`] if both ids are equal.
    pub fn from_roles(
        own_role: Role,
        own: ParticipantId,
        counterpart: ParticipantId,
    ) -> Result<Self, AddressError> {
        match own_role {
            Role::A => Self::new(own, counterpart),
            Role::B => Self::new(counterpart, own),
        }
    }

    /// The participant holding role `A`.
    #[must_use]
    pub const fn first(&self) -> &ParticipantId {
        &self.first
    }

    /// The participant holding role `B`.
    #[must_use]
    pub const fn second(&self) -> &ParticipantId {
        &self.second
    }

    /// The participant holding `role` in this conversation.
    #[must_use]
    pub const fn participant(&self, role: Role) -> &ParticipantId {
        match role {
            Role::A => &self.first,
            Role::B => &self.second,
        }
    }

    /// The role `id` holds in this conversation, if it is a member.
    #[must_use]
    pub fn role_of(&self, id: &ParticipantId) -> Option<Role> {
        if *id == self.first {
            Some(Role::A)
        } else if *id == self.second {
            Some(Role::B)
        } else {
            None
        }
    }

    /// Subscription topic for this conversation: `chat/{a}/{b}`.
    #[must_use]
    pub fn topic(&self) -> String {
        format!("{TOPIC_PREFIX}{}/{}", self.first, self.second)
    }

    /// Publish destination for this conversation: `send/chat/{a}/{b}`.
    #[must_use]
    pub fn publish_destination(&self) -> String {
        format!("{PUBLISH_PREFIX}{}/{}", self.first, self.second)
    }

    /// Parse a subscription topic back into a key.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::MalformedDestination`] if the topic does not
    /// have the `chat/{a}/{b}` layout, or an id validation error.
    pub fn from_topic(topic: &str) -> Result<Self, AddressError> {
        Self::parse_segments(topic, TOPIC_PREFIX)
    }

    /// Parse a publish destination back into a key.
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::MalformedDestination`] if the destination does
    /// not have the `send/chat/{a}/{b}` layout, or an id validation error.
    pub fn from_publish_destination(destination: &str) -> Result<Self, AddressError> {
        Self::parse_segments(destination, PUBLISH_PREFIX)
    }

    fn parse_segments(value: &str, prefix: &str) -> Result<Self, AddressError> {
        let rest = value
            .strip_prefix(prefix)
            .ok_or_else(|| AddressError::MalformedDestination(value.to_string()))?;
        let mut parts = rest.split('/');
        let (Some(a), Some(b), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(AddressError::MalformedDestination(value.to_string()));
        };
        Self::new(ParticipantId::new(a)?, ParticipantId::new(b)?)
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.first, self.second)
    }
}
