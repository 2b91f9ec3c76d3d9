//! Persistence facade.
//!
//! [`Storage`] is the narrow contract the coordination core issues reads and
//! writes against. The core never talks to a database driver directly; the
//! conversation and meeting state machines only see this trait. The shipped
//! implementations are [`postgres::PgStore`] and, behind the `test-utils`
//! feature, an in-memory store for deterministic tests.

use crate::errors::Result;
use crate::models::{
    AgentRow, MeetingEventRow, MeetingRow, MeetingStatus, MessageKind, MessageRow,
    OrganizationRow, ParticipantRow, ParticipantStatus, SessionRow, SessionStatus,
};
use crate::types::{AgentId, MeetingId, MessageId, OrgId, ParticipantId, SessionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub mod postgres;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

/// Target of a message envelope.
///
/// Exactly one of recipient/meeting is set on every persisted message; this
/// enum makes the invariant unrepresentable rather than validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    /// Direct message to one agent.
    Recipient(AgentId),
    /// Message into a meeting.
    Meeting(MeetingId),
}

/// Parameters for persisting a new message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: AgentId,
    pub target: MessageTarget,
    pub session_id: Option<SessionId>,
    pub kind: MessageKind,
    pub content: Value,
    pub metadata: Option<Value>,
}

/// Filterable, paginated message query.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub session_id: Option<SessionId>,
    pub meeting_id: Option<MeetingId>,
    pub sender_id: Option<AgentId>,
    pub recipient_id: Option<AgentId>,
    pub kind: Option<MessageKind>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl MessageQuery {
    /// Messages of one session, oldest first.
    #[must_use]
    pub fn for_session(session_id: SessionId) -> Self {
        Self {
            session_id: Some(session_id),
            ..Self::default()
        }
    }

    /// Messages of one meeting, oldest first.
    #[must_use]
    pub fn for_meeting(meeting_id: MeetingId) -> Self {
        Self {
            meeting_id: Some(meeting_id),
            ..Self::default()
        }
    }
}

/// Narrow read/write contract required from the storage layer.
///
/// Results are plain rows; all state-machine validation happens in the core,
/// under the relevant entity lock.
#[async_trait]
pub trait Storage: Send + Sync {
    // Organizations

    async fn create_organization(
        &self,
        external_id: &str,
        display_name: &str,
    ) -> Result<OrganizationRow>;

    async fn organization_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<OrganizationRow>>;

    /// Delete an organization, cascading to its member agents.
    async fn delete_organization(&self, org_id: OrgId) -> Result<()>;

    // Agents

    async fn create_agent(
        &self,
        org_id: OrgId,
        external_id: &str,
        display_name: &str,
    ) -> Result<AgentRow>;

    async fn agent_by_external_id(&self, external_id: &str) -> Result<Option<AgentRow>>;

    async fn agent_by_id(&self, agent_id: AgentId) -> Result<Option<AgentRow>>;

    /// Display name is the only mutable agent attribute.
    async fn rename_agent(&self, agent_id: AgentId, display_name: &str) -> Result<()>;

    /// Delete an agent, cascading sessions, participations, and messages.
    async fn delete_agent(&self, agent_id: AgentId) -> Result<()>;

    // Sessions

    /// Find the live (active or waiting) session for an unordered pair.
    async fn find_session_by_pair(&self, a: AgentId, b: AgentId) -> Result<Option<SessionRow>>;

    /// Create a session for the pair, storing the ids in canonical order.
    async fn create_session(&self, a: AgentId, b: AgentId) -> Result<SessionRow>;

    async fn session_by_id(&self, session_id: SessionId) -> Result<Option<SessionRow>>;

    /// Set session status and locked-agent bookkeeping in one write.
    async fn update_session_state(
        &self,
        session_id: SessionId,
        status: SessionStatus,
        locked_agent_id: Option<AgentId>,
    ) -> Result<()>;

    // Messages

    async fn create_message(&self, message: NewMessage) -> Result<MessageRow>;

    async fn message_by_id(&self, message_id: MessageId) -> Result<Option<MessageRow>>;

    async fn mark_read(&self, message_id: MessageId, read_at: DateTime<Utc>) -> Result<()>;

    /// Direct messages to `recipient_id` with no read timestamp, oldest first.
    async fn unread_messages(
        &self,
        recipient_id: AgentId,
        session_id: Option<SessionId>,
    ) -> Result<Vec<MessageRow>>;

    /// Filterable query, oldest first.
    async fn messages(&self, query: MessageQuery) -> Result<Vec<MessageRow>>;

    // Meetings

    async fn create_meeting(
        &self,
        host_id: AgentId,
        turn_duration_ms: Option<i64>,
    ) -> Result<MeetingRow>;

    async fn meeting_by_id(&self, meeting_id: MeetingId) -> Result<Option<MeetingRow>>;

    /// Update meeting status, stamping `started_at`/`ended_at` on the
    /// corresponding transitions.
    async fn update_meeting_status(
        &self,
        meeting_id: MeetingId,
        status: MeetingStatus,
    ) -> Result<()>;

    /// Set the current speaker and turn start timestamp in one write.
    async fn update_current_speaker(
        &self,
        meeting_id: MeetingId,
        speaker_id: Option<AgentId>,
        turn_started_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    // Participants

    async fn create_participant(
        &self,
        meeting_id: MeetingId,
        agent_id: AgentId,
        status: ParticipantStatus,
        join_order: i32,
    ) -> Result<ParticipantRow>;

    async fn participant(
        &self,
        meeting_id: MeetingId,
        agent_id: AgentId,
    ) -> Result<Option<ParticipantRow>>;

    /// All participant records of a meeting, join order ascending.
    async fn participants(&self, meeting_id: MeetingId) -> Result<Vec<ParticipantRow>>;

    /// Update a participant's status, stamping `joined_at` on the transition
    /// to attending and `left_at` on the transition to left.
    async fn update_participant_status(
        &self,
        participant_id: ParticipantId,
        status: ParticipantStatus,
    ) -> Result<()>;

    /// Non-left participants with `join_order` strictly greater than
    /// `after_order`, join order ascending, at most `limit` rows. The
    /// round-robin advance reads this window.
    async fn participants_window(
        &self,
        meeting_id: MeetingId,
        after_order: i32,
        limit: i64,
    ) -> Result<Vec<ParticipantRow>>;

    // Meeting audit events

    async fn append_meeting_event(
        &self,
        meeting_id: MeetingId,
        kind: &str,
        agent_id: Option<AgentId>,
        payload: Value,
    ) -> Result<()>;

    async fn meeting_events(&self, meeting_id: MeetingId) -> Result<Vec<MeetingEventRow>>;
}
