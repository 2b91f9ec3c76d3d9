//! Typed identifiers for Parley entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_type! {
    /// Unique identifier for an agent
    AgentId
}

id_type! {
    /// Unique identifier for an organization
    OrgId
}

id_type! {
    /// Unique identifier for a two-party conversation session
    SessionId
}

id_type! {
    /// Unique identifier for a meeting
    MeetingId
}

id_type! {
    /// Unique identifier for a message
    MessageId
}

id_type! {
    /// Unique identifier for a meeting participant record
    ParticipantId
}

/// Order two agent ids canonically (lower id first).
///
/// Sessions store their participant pair in this order so that a lookup by
/// unordered pair always resolves to the same row.
#[must_use]
pub fn canonical_pair(a: AgentId, b: AgentId) -> (AgentId, AgentId) {
    if a.0 <= b.0 {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_pair_is_order_independent() {
        let a = AgentId::new();
        let b = AgentId::new();

        assert_eq!(canonical_pair(a, b), canonical_pair(b, a));
    }

    #[test]
    fn test_canonical_pair_puts_lower_id_first() {
        let a = AgentId::new();
        let b = AgentId::new();

        let (first, second) = canonical_pair(a, b);
        assert!(first.0 <= second.0);
    }

    #[test]
    fn test_display_matches_uuid() {
        let id = MeetingId::new();
        assert_eq!(id.to_string(), id.0.to_string());
    }
}
