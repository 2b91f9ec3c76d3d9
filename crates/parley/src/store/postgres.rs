//! Postgres implementation of the persistence facade.
//!
//! All queries use parameterized statements; dynamic filters are assembled
//! with `QueryBuilder` and bound values, never string interpolation. Row
//! mapping goes through one helper per entity so column lists stay in one
//! place.

use crate::errors::{ParleyError, Result};
use crate::models::{
    AgentRow, MeetingEventRow, MeetingRow, MeetingStatus, MessageKind, MessageRow,
    OrganizationRow, ParticipantRow, ParticipantStatus, SessionRow, SessionStatus,
};
use crate::observability::metrics;
use crate::store::{MessageQuery, MessageTarget, NewMessage, Storage};
use crate::types::{
    canonical_pair, AgentId, MeetingId, MessageId, OrgId, ParticipantId, SessionId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::time::Instant;
use tracing::instrument;
use uuid::Uuid;

/// Postgres-backed [`Storage`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, shared with the advisory lock manager.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ParleyError::Database(e.to_string()))
    }
}

/// Record query metrics and convert driver errors in one place.
fn track<T>(
    query: &'static str,
    start: Instant,
    result: std::result::Result<T, sqlx::Error>,
) -> Result<T> {
    match result {
        Ok(value) => {
            metrics::record_store_query(query, "success", start.elapsed());
            Ok(value)
        }
        Err(e) => {
            metrics::record_store_query(query, "error", start.elapsed());
            Err(ParleyError::Database(e.to_string()))
        }
    }
}

fn map_organization(row: &PgRow) -> OrganizationRow {
    OrganizationRow {
        org_id: OrgId(row.get("org_id")),
        external_id: row.get("external_id"),
        display_name: row.get("display_name"),
        created_at: row.get("created_at"),
    }
}

fn map_agent(row: &PgRow) -> AgentRow {
    AgentRow {
        agent_id: AgentId(row.get("agent_id")),
        external_id: row.get("external_id"),
        display_name: row.get("display_name"),
        org_id: OrgId(row.get("org_id")),
        created_at: row.get("created_at"),
    }
}

fn map_session(row: &PgRow) -> SessionRow {
    SessionRow {
        session_id: SessionId(row.get("session_id")),
        agent_a: AgentId(row.get("agent_a")),
        agent_b: AgentId(row.get("agent_b")),
        status: SessionStatus::from_db_str(row.get::<&str, _>("status")),
        locked_agent_id: row
            .get::<Option<Uuid>, _>("locked_agent_id")
            .map(AgentId),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn map_message(row: &PgRow) -> MessageRow {
    MessageRow {
        message_id: MessageId(row.get("message_id")),
        sender_id: AgentId(row.get("sender_id")),
        recipient_id: row.get::<Option<Uuid>, _>("recipient_id").map(AgentId),
        meeting_id: row.get::<Option<Uuid>, _>("meeting_id").map(MeetingId),
        session_id: row.get::<Option<Uuid>, _>("session_id").map(SessionId),
        kind: MessageKind::from_db_str(row.get::<&str, _>("kind")),
        content: row.get("content"),
        metadata: row.get("metadata"),
        read_at: row.get("read_at"),
        created_at: row.get("created_at"),
    }
}

fn map_meeting(row: &PgRow) -> MeetingRow {
    MeetingRow {
        meeting_id: MeetingId(row.get("meeting_id")),
        host_id: AgentId(row.get("host_id")),
        status: MeetingStatus::from_db_str(row.get::<&str, _>("status")),
        current_speaker_id: row
            .get::<Option<Uuid>, _>("current_speaker_id")
            .map(AgentId),
        turn_duration_ms: row.get("turn_duration_ms"),
        turn_started_at: row.get("turn_started_at"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    }
}

fn map_participant(row: &PgRow) -> ParticipantRow {
    ParticipantRow {
        participant_id: ParticipantId(row.get("participant_id")),
        meeting_id: MeetingId(row.get("meeting_id")),
        agent_id: AgentId(row.get("agent_id")),
        status: ParticipantStatus::from_db_str(row.get::<&str, _>("status")),
        join_order: row.get("join_order"),
        joined_at: row.get("joined_at"),
        left_at: row.get("left_at"),
    }
}

fn map_event(row: &PgRow) -> MeetingEventRow {
    MeetingEventRow {
        event_id: row.get("event_id"),
        meeting_id: MeetingId(row.get("meeting_id")),
        kind: row.get("kind"),
        agent_id: row.get::<Option<Uuid>, _>("agent_id").map(AgentId),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
    }
}

const MESSAGE_COLUMNS: &str = "message_id, sender_id, recipient_id, meeting_id, session_id, \
     kind, content, metadata, read_at, created_at";

#[async_trait]
impl Storage for PgStore {
    #[instrument(skip_all, name = "store.create_organization", fields(external_id = %external_id))]
    async fn create_organization(
        &self,
        external_id: &str,
        display_name: &str,
    ) -> Result<OrganizationRow> {
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            INSERT INTO organizations (org_id, external_id, display_name)
            VALUES ($1, $2, $3)
            RETURNING org_id, external_id, display_name, created_at
            "#,
        )
        .bind(OrgId::new().0)
        .bind(external_id)
        .bind(display_name)
        .fetch_one(&self.pool)
        .await;

        track("create_organization", start, row).map(|r| map_organization(&r))
    }

    #[instrument(skip_all, name = "store.organization_by_external_id")]
    async fn organization_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<OrganizationRow>> {
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            SELECT org_id, external_id, display_name, created_at
            FROM organizations
            WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await;

        track("organization_by_external_id", start, row)
            .map(|r| r.map(|row| map_organization(&row)))
    }

    #[instrument(skip_all, name = "store.delete_organization", fields(org_id = %org_id))]
    async fn delete_organization(&self, org_id: OrgId) -> Result<()> {
        let start = Instant::now();
        let result = sqlx::query("DELETE FROM organizations WHERE org_id = $1")
            .bind(org_id.0)
            .execute(&self.pool)
            .await;

        track("delete_organization", start, result).map(|_| ())
    }

    #[instrument(skip_all, name = "store.create_agent", fields(external_id = %external_id))]
    async fn create_agent(
        &self,
        org_id: OrgId,
        external_id: &str,
        display_name: &str,
    ) -> Result<AgentRow> {
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            INSERT INTO agents (agent_id, external_id, display_name, org_id)
            VALUES ($1, $2, $3, $4)
            RETURNING agent_id, external_id, display_name, org_id, created_at
            "#,
        )
        .bind(AgentId::new().0)
        .bind(external_id)
        .bind(display_name)
        .bind(org_id.0)
        .fetch_one(&self.pool)
        .await;

        track("create_agent", start, row).map(|r| map_agent(&r))
    }

    #[instrument(skip_all, name = "store.agent_by_external_id")]
    async fn agent_by_external_id(&self, external_id: &str) -> Result<Option<AgentRow>> {
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            SELECT agent_id, external_id, display_name, org_id, created_at
            FROM agents
            WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await;

        track("agent_by_external_id", start, row).map(|r| r.map(|row| map_agent(&row)))
    }

    #[instrument(skip_all, name = "store.agent_by_id", fields(agent_id = %agent_id))]
    async fn agent_by_id(&self, agent_id: AgentId) -> Result<Option<AgentRow>> {
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            SELECT agent_id, external_id, display_name, org_id, created_at
            FROM agents
            WHERE agent_id = $1
            "#,
        )
        .bind(agent_id.0)
        .fetch_optional(&self.pool)
        .await;

        track("agent_by_id", start, row).map(|r| r.map(|row| map_agent(&row)))
    }

    #[instrument(skip_all, name = "store.rename_agent", fields(agent_id = %agent_id))]
    async fn rename_agent(&self, agent_id: AgentId, display_name: &str) -> Result<()> {
        let start = Instant::now();
        let result = sqlx::query("UPDATE agents SET display_name = $2 WHERE agent_id = $1")
            .bind(agent_id.0)
            .bind(display_name)
            .execute(&self.pool)
            .await;

        track("rename_agent", start, result).map(|_| ())
    }

    #[instrument(skip_all, name = "store.delete_agent", fields(agent_id = %agent_id))]
    async fn delete_agent(&self, agent_id: AgentId) -> Result<()> {
        let start = Instant::now();
        let result = sqlx::query("DELETE FROM agents WHERE agent_id = $1")
            .bind(agent_id.0)
            .execute(&self.pool)
            .await;

        track("delete_agent", start, result).map(|_| ())
    }

    #[instrument(skip_all, name = "store.find_session_by_pair")]
    async fn find_session_by_pair(&self, a: AgentId, b: AgentId) -> Result<Option<SessionRow>> {
        let (first, second) = canonical_pair(a, b);
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            SELECT session_id, agent_a, agent_b, status, locked_agent_id,
                   created_at, updated_at
            FROM sessions
            WHERE agent_a = $1 AND agent_b = $2 AND status IN ('active', 'waiting')
            "#,
        )
        .bind(first.0)
        .bind(second.0)
        .fetch_optional(&self.pool)
        .await;

        track("find_session_by_pair", start, row).map(|r| r.map(|row| map_session(&row)))
    }

    #[instrument(skip_all, name = "store.create_session")]
    async fn create_session(&self, a: AgentId, b: AgentId) -> Result<SessionRow> {
        let (first, second) = canonical_pair(a, b);
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            INSERT INTO sessions (session_id, agent_a, agent_b, status)
            VALUES ($1, $2, $3, 'active')
            RETURNING session_id, agent_a, agent_b, status, locked_agent_id,
                      created_at, updated_at
            "#,
        )
        .bind(SessionId::new().0)
        .bind(first.0)
        .bind(second.0)
        .fetch_one(&self.pool)
        .await;

        track("create_session", start, row).map(|r| map_session(&r))
    }

    #[instrument(skip_all, name = "store.session_by_id", fields(session_id = %session_id))]
    async fn session_by_id(&self, session_id: SessionId) -> Result<Option<SessionRow>> {
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            SELECT session_id, agent_a, agent_b, status, locked_agent_id,
                   created_at, updated_at
            FROM sessions
            WHERE session_id = $1
            "#,
        )
        .bind(session_id.0)
        .fetch_optional(&self.pool)
        .await;

        track("session_by_id", start, row).map(|r| r.map(|row| map_session(&row)))
    }

    #[instrument(skip_all, name = "store.update_session_state", fields(session_id = %session_id))]
    async fn update_session_state(
        &self,
        session_id: SessionId,
        status: SessionStatus,
        locked_agent_id: Option<AgentId>,
    ) -> Result<()> {
        let start = Instant::now();
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = $2, locked_agent_id = $3, updated_at = now()
            WHERE session_id = $1
            "#,
        )
        .bind(session_id.0)
        .bind(status.as_db_str())
        .bind(locked_agent_id.map(|a| a.0))
        .execute(&self.pool)
        .await;

        track("update_session_state", start, result).map(|_| ())
    }

    #[instrument(skip_all, name = "store.create_message")]
    async fn create_message(&self, message: NewMessage) -> Result<MessageRow> {
        let (recipient_id, meeting_id) = match message.target {
            MessageTarget::Recipient(agent) => (Some(agent.0), None),
            MessageTarget::Meeting(meeting) => (None, Some(meeting.0)),
        };

        let start = Instant::now();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO messages
                (message_id, sender_id, recipient_id, meeting_id, session_id,
                 kind, content, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(MessageId::new().0)
        .bind(message.sender_id.0)
        .bind(recipient_id)
        .bind(meeting_id)
        .bind(message.session_id.map(|s| s.0))
        .bind(message.kind.as_db_str())
        .bind(message.content)
        .bind(message.metadata)
        .fetch_one(&self.pool)
        .await;

        track("create_message", start, row).map(|r| map_message(&r))
    }

    #[instrument(skip_all, name = "store.message_by_id", fields(message_id = %message_id))]
    async fn message_by_id(&self, message_id: MessageId) -> Result<Option<MessageRow>> {
        let start = Instant::now();
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = $1"
        ))
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await;

        track("message_by_id", start, row).map(|r| r.map(|row| map_message(&row)))
    }

    #[instrument(skip_all, name = "store.mark_read", fields(message_id = %message_id))]
    async fn mark_read(&self, message_id: MessageId, read_at: DateTime<Utc>) -> Result<()> {
        let start = Instant::now();
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET read_at = $2
            WHERE message_id = $1 AND read_at IS NULL
            "#,
        )
        .bind(message_id.0)
        .bind(read_at)
        .execute(&self.pool)
        .await;

        track("mark_read", start, result).map(|_| ())
    }

    #[instrument(skip_all, name = "store.unread_messages", fields(recipient_id = %recipient_id))]
    async fn unread_messages(
        &self,
        recipient_id: AgentId,
        session_id: Option<SessionId>,
    ) -> Result<Vec<MessageRow>> {
        let start = Instant::now();
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE read_at IS NULL AND recipient_id = "
        ));
        builder.push_bind(recipient_id.0);
        if let Some(session) = session_id {
            builder.push(" AND session_id = ");
            builder.push_bind(session.0);
        }
        builder.push(" ORDER BY created_at ASC");

        let rows = builder.build().fetch_all(&self.pool).await;

        track("unread_messages", start, rows)
            .map(|rows| rows.iter().map(map_message).collect())
    }

    #[instrument(skip_all, name = "store.messages")]
    async fn messages(&self, query: MessageQuery) -> Result<Vec<MessageRow>> {
        let start = Instant::now();
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE TRUE"
        ));

        if let Some(session) = query.session_id {
            builder.push(" AND session_id = ");
            builder.push_bind(session.0);
        }
        if let Some(meeting) = query.meeting_id {
            builder.push(" AND meeting_id = ");
            builder.push_bind(meeting.0);
        }
        if let Some(sender) = query.sender_id {
            builder.push(" AND sender_id = ");
            builder.push_bind(sender.0);
        }
        if let Some(recipient) = query.recipient_id {
            builder.push(" AND recipient_id = ");
            builder.push_bind(recipient.0);
        }
        if let Some(kind) = query.kind {
            builder.push(" AND kind = ");
            builder.push_bind(kind.as_db_str());
        }
        if let Some(after) = query.created_after {
            builder.push(" AND created_at > ");
            builder.push_bind(after);
        }
        if let Some(before) = query.created_before {
            builder.push(" AND created_at < ");
            builder.push_bind(before);
        }

        builder.push(" ORDER BY created_at ASC");

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit);
        }
        if let Some(offset) = query.offset {
            builder.push(" OFFSET ");
            builder.push_bind(offset);
        }

        let rows = builder.build().fetch_all(&self.pool).await;

        track("messages", start, rows).map(|rows| rows.iter().map(map_message).collect())
    }

    #[instrument(skip_all, name = "store.create_meeting", fields(host_id = %host_id))]
    async fn create_meeting(
        &self,
        host_id: AgentId,
        turn_duration_ms: Option<i64>,
    ) -> Result<MeetingRow> {
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            INSERT INTO meetings (meeting_id, host_id, status, turn_duration_ms)
            VALUES ($1, $2, 'created', $3)
            RETURNING meeting_id, host_id, status, current_speaker_id,
                      turn_duration_ms, turn_started_at, created_at,
                      started_at, ended_at
            "#,
        )
        .bind(MeetingId::new().0)
        .bind(host_id.0)
        .bind(turn_duration_ms)
        .fetch_one(&self.pool)
        .await;

        track("create_meeting", start, row).map(|r| map_meeting(&r))
    }

    #[instrument(skip_all, name = "store.meeting_by_id", fields(meeting_id = %meeting_id))]
    async fn meeting_by_id(&self, meeting_id: MeetingId) -> Result<Option<MeetingRow>> {
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            SELECT meeting_id, host_id, status, current_speaker_id,
                   turn_duration_ms, turn_started_at, created_at,
                   started_at, ended_at
            FROM meetings
            WHERE meeting_id = $1
            "#,
        )
        .bind(meeting_id.0)
        .fetch_optional(&self.pool)
        .await;

        track("meeting_by_id", start, row).map(|r| r.map(|row| map_meeting(&row)))
    }

    #[instrument(skip_all, name = "store.update_meeting_status", fields(meeting_id = %meeting_id))]
    async fn update_meeting_status(
        &self,
        meeting_id: MeetingId,
        status: MeetingStatus,
    ) -> Result<()> {
        let start = Instant::now();
        let result = sqlx::query(
            r#"
            UPDATE meetings
            SET status = $2,
                started_at = CASE WHEN $2 = 'active'
                                  THEN COALESCE(started_at, now())
                                  ELSE started_at END,
                ended_at = CASE WHEN $2 = 'ended'
                                THEN COALESCE(ended_at, now())
                                ELSE ended_at END
            WHERE meeting_id = $1
            "#,
        )
        .bind(meeting_id.0)
        .bind(status.as_db_str())
        .execute(&self.pool)
        .await;

        track("update_meeting_status", start, result).map(|_| ())
    }

    #[instrument(skip_all, name = "store.update_current_speaker", fields(meeting_id = %meeting_id))]
    async fn update_current_speaker(
        &self,
        meeting_id: MeetingId,
        speaker_id: Option<AgentId>,
        turn_started_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let start = Instant::now();
        let result = sqlx::query(
            r#"
            UPDATE meetings
            SET current_speaker_id = $2, turn_started_at = $3
            WHERE meeting_id = $1
            "#,
        )
        .bind(meeting_id.0)
        .bind(speaker_id.map(|a| a.0))
        .bind(turn_started_at)
        .execute(&self.pool)
        .await;

        track("update_current_speaker", start, result).map(|_| ())
    }

    #[instrument(skip_all, name = "store.create_participant", fields(meeting_id = %meeting_id))]
    async fn create_participant(
        &self,
        meeting_id: MeetingId,
        agent_id: AgentId,
        status: ParticipantStatus,
        join_order: i32,
    ) -> Result<ParticipantRow> {
        let start = Instant::now();
        let joined_at = match status {
            ParticipantStatus::Invited => None,
            _ => Some(Utc::now()),
        };
        let row = sqlx::query(
            r#"
            INSERT INTO meeting_participants
                (participant_id, meeting_id, agent_id, status, join_order, joined_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING participant_id, meeting_id, agent_id, status, join_order,
                      joined_at, left_at
            "#,
        )
        .bind(ParticipantId::new().0)
        .bind(meeting_id.0)
        .bind(agent_id.0)
        .bind(status.as_db_str())
        .bind(join_order)
        .bind(joined_at)
        .fetch_one(&self.pool)
        .await;

        track("create_participant", start, row).map(|r| map_participant(&r))
    }

    #[instrument(skip_all, name = "store.participant", fields(meeting_id = %meeting_id))]
    async fn participant(
        &self,
        meeting_id: MeetingId,
        agent_id: AgentId,
    ) -> Result<Option<ParticipantRow>> {
        let start = Instant::now();
        let row = sqlx::query(
            r#"
            SELECT participant_id, meeting_id, agent_id, status, join_order,
                   joined_at, left_at
            FROM meeting_participants
            WHERE meeting_id = $1 AND agent_id = $2
            "#,
        )
        .bind(meeting_id.0)
        .bind(agent_id.0)
        .fetch_optional(&self.pool)
        .await;

        track("participant", start, row).map(|r| r.map(|row| map_participant(&row)))
    }

    #[instrument(skip_all, name = "store.participants", fields(meeting_id = %meeting_id))]
    async fn participants(&self, meeting_id: MeetingId) -> Result<Vec<ParticipantRow>> {
        let start = Instant::now();
        let rows = sqlx::query(
            r#"
            SELECT participant_id, meeting_id, agent_id, status, join_order,
                   joined_at, left_at
            FROM meeting_participants
            WHERE meeting_id = $1
            ORDER BY join_order ASC
            "#,
        )
        .bind(meeting_id.0)
        .fetch_all(&self.pool)
        .await;

        track("participants", start, rows).map(|rows| rows.iter().map(map_participant).collect())
    }

    #[instrument(skip_all, name = "store.update_participant_status", fields(participant_id = %participant_id))]
    async fn update_participant_status(
        &self,
        participant_id: ParticipantId,
        status: ParticipantStatus,
    ) -> Result<()> {
        let start = Instant::now();
        let result = sqlx::query(
            r#"
            UPDATE meeting_participants
            SET status = $2,
                joined_at = CASE WHEN $2 = 'attending'
                                 THEN COALESCE(joined_at, now())
                                 ELSE joined_at END,
                left_at = CASE WHEN $2 = 'left'
                               THEN COALESCE(left_at, now())
                               ELSE left_at END
            WHERE participant_id = $1
            "#,
        )
        .bind(participant_id.0)
        .bind(status.as_db_str())
        .execute(&self.pool)
        .await;

        track("update_participant_status", start, result).map(|_| ())
    }

    #[instrument(skip_all, name = "store.participants_window", fields(meeting_id = %meeting_id))]
    async fn participants_window(
        &self,
        meeting_id: MeetingId,
        after_order: i32,
        limit: i64,
    ) -> Result<Vec<ParticipantRow>> {
        let start = Instant::now();
        let rows = sqlx::query(
            r#"
            SELECT participant_id, meeting_id, agent_id, status, join_order,
                   joined_at, left_at
            FROM meeting_participants
            WHERE meeting_id = $1 AND join_order > $2 AND status != 'left'
            ORDER BY join_order ASC
            LIMIT $3
            "#,
        )
        .bind(meeting_id.0)
        .bind(after_order)
        .bind(limit)
        .fetch_all(&self.pool)
        .await;

        track("participants_window", start, rows)
            .map(|rows| rows.iter().map(map_participant).collect())
    }

    #[instrument(skip_all, name = "store.append_meeting_event", fields(meeting_id = %meeting_id, kind = %kind))]
    async fn append_meeting_event(
        &self,
        meeting_id: MeetingId,
        kind: &str,
        agent_id: Option<AgentId>,
        payload: serde_json::Value,
    ) -> Result<()> {
        let start = Instant::now();
        let result = sqlx::query(
            r#"
            INSERT INTO meeting_events (event_id, meeting_id, kind, agent_id, payload)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(meeting_id.0)
        .bind(kind)
        .bind(agent_id.map(|a| a.0))
        .bind(payload)
        .execute(&self.pool)
        .await;

        track("append_meeting_event", start, result).map(|_| ())
    }

    #[instrument(skip_all, name = "store.meeting_events", fields(meeting_id = %meeting_id))]
    async fn meeting_events(&self, meeting_id: MeetingId) -> Result<Vec<MeetingEventRow>> {
        let start = Instant::now();
        let rows = sqlx::query(
            r#"
            SELECT event_id, meeting_id, kind, agent_id, payload, created_at
            FROM meeting_events
            WHERE meeting_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(meeting_id.0)
        .fetch_all(&self.pool)
        .await;

        track("meeting_events", start, rows).map(|rows| rows.iter().map(map_event).collect())
    }
}
