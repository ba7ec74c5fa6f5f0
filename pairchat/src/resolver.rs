//! Session resolution: which conversation is active for this participant.
//!
//! The caller knows its own identity and role, and holds a reference to the
//! counterpart that may not exist yet (for example before an assignment has
//! been made). [`resolve`] turns that into the canonical [`PairKey`] or
//! reports why it cannot. While unresolved, nothing downstream (history,
//! connection) may run; the UI shows a waiting state instead.

use pairchat_proto::address::{AddressError, PairKey, ParticipantId, Role};

/// Errors that prevent a conversation from being resolved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    /// No counterpart is assigned yet. Not retryable until the external
    /// assignment state changes.
    #[error("no counterpart assigned yet")]
    Unassigned,

    /// The counterpart reference cannot address a conversation.
    #[error("invalid counterpart: {0}")]
    InvalidCounterpart(#[from] AddressError),
}

/// The local participant: who we are and which side we are on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    /// Our role in every conversation we take part in.
    pub role: Role,
    /// Our identifier.
    pub id: ParticipantId,
}

impl Participant {
    /// Create a participant.
    #[must_use]
    pub const fn new(role: Role, id: ParticipantId) -> Self {
        Self { role, id }
    }
}

/// Reference to the other side of the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterpartRef {
    /// A counterpart has been assigned; the raw identifier is validated at
    /// resolution time.
    Assigned(String),
    /// Nobody has been assigned yet.
    Unassigned,
}

impl CounterpartRef {
    /// Build a reference from an optional identifier; `None` and blank
    /// strings mean unassigned.
    #[must_use]
    pub fn from_option(id: Option<&str>) -> Self {
        match id.map(str::trim) {
            Some(id) if !id.is_empty() => Self::Assigned(id.to_string()),
            _ => Self::Unassigned,
        }
    }
}

/// Resolve the canonical pair key for `own` talking to `counterpart`.
///
/// # Errors
///
/// - [`ResolutionError::Unassigned`] if there is no counterpart.
/// - [`ResolutionError::InvalidCounterpart`] if the identifier is not a
///   valid participant id or names `own`.
pub fn resolve(own: &Participant, counterpart: &CounterpartRef) -> Result<PairKey, ResolutionError> {
    let CounterpartRef::Assigned(raw) = counterpart else {
        return Err(ResolutionError::Unassigned);
    };
    let other = ParticipantId::new(raw.as_str())?;
    let key = PairKey::from_roles(own.role, own.id.clone(), other)?;
    tracing::debug!(pair = %key, role = %own.role, "conversation resolved");
    Ok(key)
}
