//! In-memory implementation of the persistence facade.
//!
//! Behaviourally equivalent to the Postgres store for everything the core
//! observes: canonical session ordering, the one-live-session-per-pair
//! constraint, unique external ids, cascading deletes, and status-transition
//! timestamp stamping. Used by tests and local experimentation.

use crate::errors::{ParleyError, Result};
use crate::models::{
    AgentRow, MeetingEventRow, MeetingRow, MeetingStatus, MessageRow, OrganizationRow,
    ParticipantRow, ParticipantStatus, SessionRow, SessionStatus,
};
use crate::store::{MessageQuery, MessageTarget, NewMessage, Storage};
use crate::types::{
    canonical_pair, AgentId, MeetingId, MessageId, OrgId, ParticipantId, SessionId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    organizations: HashMap<OrgId, OrganizationRow>,
    agents: HashMap<AgentId, AgentRow>,
    sessions: HashMap<SessionId, SessionRow>,
    messages: Vec<MessageRow>,
    meetings: HashMap<MeetingId, MeetingRow>,
    participants: HashMap<ParticipantId, ParticipantRow>,
    events: Vec<MeetingEventRow>,
}

/// In-memory [`Storage`].
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Inner {
    fn delete_agent_cascade(&mut self, agent_id: AgentId) {
        self.agents.remove(&agent_id);
        self.sessions
            .retain(|_, s| s.agent_a != agent_id && s.agent_b != agent_id);
        self.participants.retain(|_, p| p.agent_id != agent_id);
        self.messages
            .retain(|m| m.sender_id != agent_id && m.recipient_id != Some(agent_id));
    }
}

#[async_trait]
impl Storage for MemStore {
    async fn create_organization(
        &self,
        external_id: &str,
        display_name: &str,
    ) -> Result<OrganizationRow> {
        let mut inner = self.lock();
        if inner
            .organizations
            .values()
            .any(|o| o.external_id == external_id)
        {
            return Err(ParleyError::Database(format!(
                "duplicate organization external id: {external_id}"
            )));
        }

        let row = OrganizationRow {
            org_id: OrgId::new(),
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            created_at: Utc::now(),
        };
        inner.organizations.insert(row.org_id, row.clone());
        Ok(row)
    }

    async fn organization_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<OrganizationRow>> {
        let inner = self.lock();
        Ok(inner
            .organizations
            .values()
            .find(|o| o.external_id == external_id)
            .cloned())
    }

    async fn delete_organization(&self, org_id: OrgId) -> Result<()> {
        let mut inner = self.lock();
        inner.organizations.remove(&org_id);
        let members: Vec<AgentId> = inner
            .agents
            .values()
            .filter(|a| a.org_id == org_id)
            .map(|a| a.agent_id)
            .collect();
        for agent_id in members {
            inner.delete_agent_cascade(agent_id);
        }
        Ok(())
    }

    async fn create_agent(
        &self,
        org_id: OrgId,
        external_id: &str,
        display_name: &str,
    ) -> Result<AgentRow> {
        let mut inner = self.lock();
        if !inner.organizations.contains_key(&org_id) {
            return Err(ParleyError::Database(format!(
                "unknown organization: {org_id}"
            )));
        }
        if inner.agents.values().any(|a| a.external_id == external_id) {
            return Err(ParleyError::Database(format!(
                "duplicate agent external id: {external_id}"
            )));
        }

        let row = AgentRow {
            agent_id: AgentId::new(),
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            org_id,
            created_at: Utc::now(),
        };
        inner.agents.insert(row.agent_id, row.clone());
        Ok(row)
    }

    async fn agent_by_external_id(&self, external_id: &str) -> Result<Option<AgentRow>> {
        let inner = self.lock();
        Ok(inner
            .agents
            .values()
            .find(|a| a.external_id == external_id)
            .cloned())
    }

    async fn agent_by_id(&self, agent_id: AgentId) -> Result<Option<AgentRow>> {
        let inner = self.lock();
        Ok(inner.agents.get(&agent_id).cloned())
    }

    async fn rename_agent(&self, agent_id: AgentId, display_name: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(agent) = inner.agents.get_mut(&agent_id) {
            agent.display_name = display_name.to_string();
        }
        Ok(())
    }

    async fn delete_agent(&self, agent_id: AgentId) -> Result<()> {
        let mut inner = self.lock();
        inner.delete_agent_cascade(agent_id);
        Ok(())
    }

    async fn find_session_by_pair(&self, a: AgentId, b: AgentId) -> Result<Option<SessionRow>> {
        let (first, second) = canonical_pair(a, b);
        let inner = self.lock();
        Ok(inner
            .sessions
            .values()
            .find(|s| {
                s.agent_a == first
                    && s.agent_b == second
                    && matches!(s.status, SessionStatus::Active | SessionStatus::Waiting)
            })
            .cloned())
    }

    async fn create_session(&self, a: AgentId, b: AgentId) -> Result<SessionRow> {
        let (first, second) = canonical_pair(a, b);
        let mut inner = self.lock();

        // Mirror the partial unique index: one live session per pair.
        if inner.sessions.values().any(|s| {
            s.agent_a == first
                && s.agent_b == second
                && matches!(s.status, SessionStatus::Active | SessionStatus::Waiting)
        }) {
            return Err(ParleyError::Database(
                "live session already exists for pair".to_string(),
            ));
        }

        let now = Utc::now();
        let row = SessionRow {
            session_id: SessionId::new(),
            agent_a: first,
            agent_b: second,
            status: SessionStatus::Active,
            locked_agent_id: None,
            created_at: now,
            updated_at: now,
        };
        inner.sessions.insert(row.session_id, row.clone());
        Ok(row)
    }

    async fn session_by_id(&self, session_id: SessionId) -> Result<Option<SessionRow>> {
        let inner = self.lock();
        Ok(inner.sessions.get(&session_id).cloned())
    }

    async fn update_session_state(
        &self,
        session_id: SessionId,
        status: SessionStatus,
        locked_agent_id: Option<AgentId>,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(session) = inner.sessions.get_mut(&session_id) {
            session.status = status;
            session.locked_agent_id = locked_agent_id;
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn create_message(&self, message: NewMessage) -> Result<MessageRow> {
        let (recipient_id, meeting_id) = match message.target {
            MessageTarget::Recipient(agent) => (Some(agent), None),
            MessageTarget::Meeting(meeting) => (None, Some(meeting)),
        };

        let row = MessageRow {
            message_id: MessageId::new(),
            sender_id: message.sender_id,
            recipient_id,
            meeting_id,
            session_id: message.session_id,
            kind: message.kind,
            content: message.content,
            metadata: message.metadata,
            read_at: None,
            created_at: Utc::now(),
        };

        let mut inner = self.lock();
        inner.messages.push(row.clone());
        Ok(row)
    }

    async fn message_by_id(&self, message_id: MessageId) -> Result<Option<MessageRow>> {
        let inner = self.lock();
        Ok(inner
            .messages
            .iter()
            .find(|m| m.message_id == message_id)
            .cloned())
    }

    async fn mark_read(&self, message_id: MessageId, read_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        if let Some(message) = inner
            .messages
            .iter_mut()
            .find(|m| m.message_id == message_id)
        {
            if message.read_at.is_none() {
                message.read_at = Some(read_at);
            }
        }
        Ok(())
    }

    async fn unread_messages(
        &self,
        recipient_id: AgentId,
        session_id: Option<SessionId>,
    ) -> Result<Vec<MessageRow>> {
        let inner = self.lock();
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.recipient_id == Some(recipient_id) && m.read_at.is_none())
            .filter(|m| session_id.is_none() || m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn messages(&self, query: MessageQuery) -> Result<Vec<MessageRow>> {
        let inner = self.lock();
        let mut rows: Vec<MessageRow> = inner
            .messages
            .iter()
            .filter(|m| query.session_id.is_none() || m.session_id == query.session_id)
            .filter(|m| query.meeting_id.is_none() || m.meeting_id == query.meeting_id)
            .filter(|m| query.sender_id.is_none() || Some(m.sender_id) == query.sender_id)
            .filter(|m| query.recipient_id.is_none() || m.recipient_id == query.recipient_id)
            .filter(|m| query.kind.is_none() || Some(m.kind) == query.kind)
            .filter(|m| query.created_after.map_or(true, |t| m.created_at > t))
            .filter(|m| query.created_before.map_or(true, |t| m.created_at < t))
            .cloned()
            .collect();

        rows.sort_by_key(|m| m.created_at);

        let offset = usize::try_from(query.offset.unwrap_or(0)).unwrap_or(0);
        let rows: Vec<MessageRow> = rows.into_iter().skip(offset).collect();
        match query.limit.and_then(|l| usize::try_from(l).ok()) {
            Some(limit) => Ok(rows.into_iter().take(limit).collect()),
            None => Ok(rows),
        }
    }

    async fn create_meeting(
        &self,
        host_id: AgentId,
        turn_duration_ms: Option<i64>,
    ) -> Result<MeetingRow> {
        let row = MeetingRow {
            meeting_id: MeetingId::new(),
            host_id,
            status: MeetingStatus::Created,
            current_speaker_id: None,
            turn_duration_ms,
            turn_started_at: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        let mut inner = self.lock();
        inner.meetings.insert(row.meeting_id, row.clone());
        Ok(row)
    }

    async fn meeting_by_id(&self, meeting_id: MeetingId) -> Result<Option<MeetingRow>> {
        let inner = self.lock();
        Ok(inner.meetings.get(&meeting_id).cloned())
    }

    async fn update_meeting_status(
        &self,
        meeting_id: MeetingId,
        status: MeetingStatus,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(meeting) = inner.meetings.get_mut(&meeting_id) {
            meeting.status = status;
            match status {
                MeetingStatus::Active if meeting.started_at.is_none() => {
                    meeting.started_at = Some(Utc::now());
                }
                MeetingStatus::Ended if meeting.ended_at.is_none() => {
                    meeting.ended_at = Some(Utc::now());
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn update_current_speaker(
        &self,
        meeting_id: MeetingId,
        speaker_id: Option<AgentId>,
        turn_started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(meeting) = inner.meetings.get_mut(&meeting_id) {
            meeting.current_speaker_id = speaker_id;
            meeting.turn_started_at = turn_started_at;
        }
        Ok(())
    }

    async fn create_participant(
        &self,
        meeting_id: MeetingId,
        agent_id: AgentId,
        status: ParticipantStatus,
        join_order: i32,
    ) -> Result<ParticipantRow> {
        let mut inner = self.lock();
        if inner
            .participants
            .values()
            .any(|p| p.meeting_id == meeting_id && p.agent_id == agent_id)
        {
            return Err(ParleyError::Database(
                "participant already exists for (meeting, agent)".to_string(),
            ));
        }

        let row = ParticipantRow {
            participant_id: ParticipantId::new(),
            meeting_id,
            agent_id,
            status,
            join_order,
            joined_at: match status {
                ParticipantStatus::Invited => None,
                _ => Some(Utc::now()),
            },
            left_at: None,
        };
        inner.participants.insert(row.participant_id, row.clone());
        Ok(row)
    }

    async fn participant(
        &self,
        meeting_id: MeetingId,
        agent_id: AgentId,
    ) -> Result<Option<ParticipantRow>> {
        let inner = self.lock();
        Ok(inner
            .participants
            .values()
            .find(|p| p.meeting_id == meeting_id && p.agent_id == agent_id)
            .cloned())
    }

    async fn participants(&self, meeting_id: MeetingId) -> Result<Vec<ParticipantRow>> {
        let inner = self.lock();
        let mut rows: Vec<ParticipantRow> = inner
            .participants
            .values()
            .filter(|p| p.meeting_id == meeting_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.join_order);
        Ok(rows)
    }

    async fn update_participant_status(
        &self,
        participant_id: ParticipantId,
        status: ParticipantStatus,
    ) -> Result<()> {
        let mut inner = self.lock();
        if let Some(participant) = inner.participants.get_mut(&participant_id) {
            participant.status = status;
            match status {
                ParticipantStatus::Attending if participant.joined_at.is_none() => {
                    participant.joined_at = Some(Utc::now());
                }
                ParticipantStatus::Left if participant.left_at.is_none() => {
                    participant.left_at = Some(Utc::now());
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn participants_window(
        &self,
        meeting_id: MeetingId,
        after_order: i32,
        limit: i64,
    ) -> Result<Vec<ParticipantRow>> {
        let inner = self.lock();
        let mut rows: Vec<ParticipantRow> = inner
            .participants
            .values()
            .filter(|p| {
                p.meeting_id == meeting_id
                    && p.join_order > after_order
                    && p.status != ParticipantStatus::Left
            })
            .cloned()
            .collect();
        rows.sort_by_key(|p| p.join_order);
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(rows.into_iter().take(limit).collect())
    }

    async fn append_meeting_event(
        &self,
        meeting_id: MeetingId,
        kind: &str,
        agent_id: Option<AgentId>,
        payload: Value,
    ) -> Result<()> {
        let row = MeetingEventRow {
            event_id: Uuid::new_v4(),
            meeting_id,
            kind: kind.to_string(),
            agent_id,
            payload,
            created_at: Utc::now(),
        };
        let mut inner = self.lock();
        inner.events.push(row);
        Ok(())
    }

    async fn meeting_events(&self, meeting_id: MeetingId) -> Result<Vec<MeetingEventRow>> {
        let inner = self.lock();
        Ok(inner
            .events
            .iter()
            .filter(|e| e.meeting_id == meeting_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn seeded() -> (MemStore, AgentRow, AgentRow) {
        let store = MemStore::new();
        let org = store.create_organization("acme", "Acme").await.unwrap();
        let alice = store.create_agent(org.org_id, "alice", "Alice").await.unwrap();
        let bob = store.create_agent(org.org_id, "bob", "Bob").await.unwrap();
        (store, alice, bob)
    }

    #[tokio::test]
    async fn test_session_pair_is_canonical_both_ways() {
        let (store, alice, bob) = seeded().await;

        let session = store
            .create_session(bob.agent_id, alice.agent_id)
            .await
            .unwrap();
        assert!(session.agent_a.0 <= session.agent_b.0);

        let found_ab = store
            .find_session_by_pair(alice.agent_id, bob.agent_id)
            .await
            .unwrap()
            .unwrap();
        let found_ba = store
            .find_session_by_pair(bob.agent_id, alice.agent_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found_ab.session_id, session.session_id);
        assert_eq!(found_ba.session_id, session.session_id);
    }

    #[tokio::test]
    async fn test_one_live_session_per_pair() {
        let (store, alice, bob) = seeded().await;

        store
            .create_session(alice.agent_id, bob.agent_id)
            .await
            .unwrap();
        let duplicate = store.create_session(bob.agent_id, alice.agent_id).await;
        assert!(matches!(duplicate, Err(ParleyError::Database(_))));
    }

    #[tokio::test]
    async fn test_ended_session_frees_the_pair() {
        let (store, alice, bob) = seeded().await;

        let first = store
            .create_session(alice.agent_id, bob.agent_id)
            .await
            .unwrap();
        store
            .update_session_state(first.session_id, SessionStatus::Ended, None)
            .await
            .unwrap();

        assert!(store
            .find_session_by_pair(alice.agent_id, bob.agent_id)
            .await
            .unwrap()
            .is_none());

        let second = store
            .create_session(alice.agent_id, bob.agent_id)
            .await
            .unwrap();
        assert_ne!(second.session_id, first.session_id);
    }

    #[tokio::test]
    async fn test_delete_agent_cascades() {
        let (store, alice, bob) = seeded().await;

        let session = store
            .create_session(alice.agent_id, bob.agent_id)
            .await
            .unwrap();
        store
            .create_message(NewMessage {
                sender_id: alice.agent_id,
                target: MessageTarget::Recipient(bob.agent_id),
                session_id: Some(session.session_id),
                kind: crate::models::MessageKind::User,
                content: serde_json::json!({"text": "hi"}),
                metadata: None,
            })
            .await
            .unwrap();

        store.delete_agent(alice.agent_id).await.unwrap();

        assert!(store
            .agent_by_external_id("alice")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .session_by_id(session.session_id)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .messages(MessageQuery::for_session(session.session_id))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_every_message_has_exactly_one_target() {
        let (store, alice, bob) = seeded().await;

        store
            .create_message(NewMessage {
                sender_id: alice.agent_id,
                target: MessageTarget::Recipient(bob.agent_id),
                session_id: None,
                kind: crate::models::MessageKind::User,
                content: serde_json::json!({}),
                metadata: None,
            })
            .await
            .unwrap();
        let meeting = store.create_meeting(alice.agent_id, None).await.unwrap();
        store
            .create_message(NewMessage {
                sender_id: alice.agent_id,
                target: MessageTarget::Meeting(meeting.meeting_id),
                session_id: None,
                kind: crate::models::MessageKind::User,
                content: serde_json::json!({}),
                metadata: None,
            })
            .await
            .unwrap();

        let all = store.messages(MessageQuery::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        for message in all {
            assert!(message.recipient_id.is_some() ^ message.meeting_id.is_some());
        }
    }

    #[tokio::test]
    async fn test_participants_window_skips_left_and_wraps() {
        let (store, alice, bob) = seeded().await;
        let org = store
            .organization_by_external_id("acme")
            .await
            .unwrap()
            .unwrap();
        let carol = store
            .create_agent(org.org_id, "carol", "Carol")
            .await
            .unwrap();

        let meeting = store.create_meeting(alice.agent_id, None).await.unwrap();
        store
            .create_participant(
                meeting.meeting_id,
                alice.agent_id,
                ParticipantStatus::Attending,
                0,
            )
            .await
            .unwrap();
        let bob_row = store
            .create_participant(
                meeting.meeting_id,
                bob.agent_id,
                ParticipantStatus::Attending,
                1,
            )
            .await
            .unwrap();
        store
            .create_participant(
                meeting.meeting_id,
                carol.agent_id,
                ParticipantStatus::Attending,
                2,
            )
            .await
            .unwrap();

        store
            .update_participant_status(bob_row.participant_id, ParticipantStatus::Left)
            .await
            .unwrap();

        // After order 0, bob (left) is skipped; carol is next.
        let window = store
            .participants_window(meeting.meeting_id, 0, 2)
            .await
            .unwrap();
        assert_eq!(window.first().map(|p| p.agent_id), Some(carol.agent_id));

        // After the highest order the window is empty; callers wrap to -1.
        assert!(store
            .participants_window(meeting.meeting_id, 2, 2)
            .await
            .unwrap()
            .is_empty());
        let head = store
            .participants_window(meeting.meeting_id, -1, 2)
            .await
            .unwrap();
        assert_eq!(head.first().map(|p| p.agent_id), Some(alice.agent_id));
    }

    #[tokio::test]
    async fn test_mark_read_sets_timestamp_once() {
        let (store, alice, bob) = seeded().await;

        let message = store
            .create_message(NewMessage {
                sender_id: alice.agent_id,
                target: MessageTarget::Recipient(bob.agent_id),
                session_id: None,
                kind: crate::models::MessageKind::User,
                content: serde_json::json!({"text": "hi"}),
                metadata: None,
            })
            .await
            .unwrap();

        let unread = store.unread_messages(bob.agent_id, None).await.unwrap();
        assert_eq!(unread.len(), 1);

        let first_read = Utc::now();
        store.mark_read(message.message_id, first_read).await.unwrap();
        store
            .mark_read(message.message_id, Utc::now())
            .await
            .unwrap();

        let row = store
            .message_by_id(message.message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.read_at, Some(first_read));
        assert!(store
            .unread_messages(bob.agent_id, None)
            .await
            .unwrap()
            .is_empty());
    }
}
