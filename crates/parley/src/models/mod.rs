//! Parley entity models.
//!
//! Row structs mirror the persisted shape of each entity; status enums map
//! to/from their lowercase database string representations.

use crate::types::{AgentId, MeetingId, MessageId, OrgId, ParticipantId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Communication pattern a message or handler belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// Fire-and-forget, sessionless delivery.
    OneWay,
    /// Two-party session-bound exchange.
    Conversation,
    /// Multi-party turn-based meeting.
    Meeting,
    /// SDK-originated notifications.
    System,
}

impl ContextKind {
    /// String form used in routing keys, logs, and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::OneWay => "one_way",
            ContextKind::Conversation => "conversation",
            ContextKind::Meeting => "meeting",
            ContextKind::System => "system",
        }
    }
}

impl std::fmt::Display for ContextKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// User-supplied payload.
    User,
    /// SDK-originated bookkeeping message (e.g. a passed turn).
    System,
    /// Synthetic message recorded when a turn timer fires.
    Timeout,
    /// Terminal message recorded when a session or meeting ends.
    Ending,
}

impl MessageKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            MessageKind::User => "user",
            MessageKind::System => "system",
            MessageKind::Timeout => "timeout",
            MessageKind::Ending => "ending",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "system" => MessageKind::System,
            "timeout" => MessageKind::Timeout,
            "ending" => MessageKind::Ending,
            _ => MessageKind::User,
        }
    }
}

/// Lifecycle state of a conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No caller is parked waiting on a reply.
    Active,
    /// One agent is blocked waiting for the other to reply.
    Waiting,
    /// Terminal; a new message between the pair starts a new session.
    Ended,
}

impl SessionStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Ended => "ended",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "waiting" => SessionStatus::Waiting,
            "ended" => SessionStatus::Ended,
            _ => SessionStatus::Active,
        }
    }
}

/// Lifecycle state of a meeting.
///
/// Advances monotonically: created -> ready -> active -> ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    /// Invitations sent, not everyone has attended yet.
    Created,
    /// Every invited agent has attended; waiting for the host to start.
    Ready,
    /// In progress; exactly one current speaker at a time.
    Active,
    /// Terminal.
    Ended,
}

impl MeetingStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            MeetingStatus::Created => "created",
            MeetingStatus::Ready => "ready",
            MeetingStatus::Active => "active",
            MeetingStatus::Ended => "ended",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "ready" => MeetingStatus::Ready,
            "active" => MeetingStatus::Active,
            "ended" => MeetingStatus::Ended,
            _ => MeetingStatus::Created,
        }
    }
}

/// Per-meeting state of one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    /// Invited but not yet attending.
    Invited,
    /// Attended; meeting has not started.
    Attending,
    /// Meeting is active and it is not this participant's turn.
    Waiting,
    /// Holds the current turn.
    Speaking,
    /// Terminal for this participant record.
    Left,
}

impl ParticipantStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ParticipantStatus::Invited => "invited",
            ParticipantStatus::Attending => "attending",
            ParticipantStatus::Waiting => "waiting",
            ParticipantStatus::Speaking => "speaking",
            ParticipantStatus::Left => "left",
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        match s {
            "attending" => ParticipantStatus::Attending,
            "waiting" => ParticipantStatus::Waiting,
            "speaking" => ParticipantStatus::Speaking,
            "left" => ParticipantStatus::Left,
            _ => ParticipantStatus::Invited,
        }
    }
}

/// Agent identity row.
#[derive(Debug, Clone)]
pub struct AgentRow {
    pub agent_id: AgentId,
    /// Externally-supplied stable id, unique across the store.
    pub external_id: String,
    pub display_name: String,
    pub org_id: OrgId,
    pub created_at: DateTime<Utc>,
}

/// Organization row.
#[derive(Debug, Clone)]
pub struct OrganizationRow {
    pub org_id: OrgId,
    pub external_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// Persisted message envelope.
///
/// Immutable once written, except for `read_at`. Exactly one of
/// `recipient_id` / `meeting_id` is set; the core validates this before the
/// store is reached.
#[derive(Debug, Clone)]
pub struct MessageRow {
    pub message_id: MessageId,
    pub sender_id: AgentId,
    pub recipient_id: Option<AgentId>,
    pub meeting_id: Option<MeetingId>,
    pub session_id: Option<SessionId>,
    pub kind: MessageKind,
    pub content: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    /// Set when the recipient marks the message read; conversations only.
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Two-party conversation session row.
///
/// `agent_a` and `agent_b` are stored in canonical order (lower id first).
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub session_id: SessionId,
    pub agent_a: AgentId,
    pub agent_b: AgentId,
    pub status: SessionStatus,
    /// Agent currently holding the conversational lock (parked sender).
    pub locked_agent_id: Option<AgentId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRow {
    /// The other member of the pair.
    pub fn peer_of(&self, agent: AgentId) -> Option<AgentId> {
        if agent == self.agent_a {
            Some(self.agent_b)
        } else if agent == self.agent_b {
            Some(self.agent_a)
        } else {
            None
        }
    }
}

/// Meeting row.
#[derive(Debug, Clone)]
pub struct MeetingRow {
    pub meeting_id: MeetingId,
    pub host_id: AgentId,
    pub status: MeetingStatus,
    pub current_speaker_id: Option<AgentId>,
    /// Turn budget in milliseconds; `None` disables the turn timer.
    pub turn_duration_ms: Option<i64>,
    pub turn_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Membership record of one agent in one meeting.
#[derive(Debug, Clone)]
pub struct ParticipantRow {
    pub participant_id: ParticipantId,
    pub meeting_id: MeetingId,
    pub agent_id: AgentId,
    pub status: ParticipantStatus,
    /// Assigned at invite time; drives round-robin turn order.
    pub join_order: i32,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
}

/// Append-only meeting audit event.
#[derive(Debug, Clone)]
pub struct MeetingEventRow {
    pub event_id: Uuid,
    pub meeting_id: MeetingId,
    pub kind: String,
    /// Acting agent; `None` for meeting-level events.
    pub agent_id: Option<AgentId>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_db_round_trips() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Waiting,
            SessionStatus::Ended,
        ] {
            assert_eq!(SessionStatus::from_db_str(status.as_db_str()), status);
        }

        for status in [
            MeetingStatus::Created,
            MeetingStatus::Ready,
            MeetingStatus::Active,
            MeetingStatus::Ended,
        ] {
            assert_eq!(MeetingStatus::from_db_str(status.as_db_str()), status);
        }

        for status in [
            ParticipantStatus::Invited,
            ParticipantStatus::Attending,
            ParticipantStatus::Waiting,
            ParticipantStatus::Speaking,
            ParticipantStatus::Left,
        ] {
            assert_eq!(ParticipantStatus::from_db_str(status.as_db_str()), status);
        }

        for kind in [
            MessageKind::User,
            MessageKind::System,
            MessageKind::Timeout,
            MessageKind::Ending,
        ] {
            assert_eq!(MessageKind::from_db_str(kind.as_db_str()), kind);
        }
    }

    #[test]
    fn test_unknown_db_strings_fall_back() {
        assert_eq!(SessionStatus::from_db_str("bogus"), SessionStatus::Active);
        assert_eq!(MeetingStatus::from_db_str("bogus"), MeetingStatus::Created);
        assert_eq!(MessageKind::from_db_str("bogus"), MessageKind::User);
    }

    #[test]
    fn test_context_kind_serialization() {
        let json = serde_json::to_string(&ContextKind::OneWay).unwrap();
        assert_eq!(json, "\"one_way\"");
    }

    #[test]
    fn test_session_peer_of() {
        let a = AgentId::new();
        let b = AgentId::new();
        let (first, second) = crate::types::canonical_pair(a, b);
        let session = SessionRow {
            session_id: SessionId::new(),
            agent_a: first,
            agent_b: second,
            status: SessionStatus::Active,
            locked_agent_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(session.peer_of(a), Some(b));
        assert_eq!(session.peer_of(b), Some(a));
        assert_eq!(session.peer_of(AgentId::new()), None);
    }
}
