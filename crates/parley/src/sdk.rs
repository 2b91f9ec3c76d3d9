//! The Parley SDK instance.
//!
//! [`Parley`] wires the store, lock manager, handler registry, event bus, and
//! the conversation/meeting state machines together and exposes the operation
//! surface. One instance per embedding process; agents in other processes
//! coordinate through the same shared store.
//!
//! Payloads are generic at this boundary (`impl Serialize`) and travel as
//! opaque JSON blobs inside the core; only the application's handler code
//! needs the concrete type.

use crate::config::Config;
use crate::conversation::{ConversationService, SendOutcome};
use crate::errors::{ParleyError, Result};
use crate::events::{EventBus, EventKind, Subscriber};
use crate::handlers::{Handler, HandlerInvoker, HandlerRegistry};
use crate::lock::LockManager;
use crate::meeting::{MeetingService, TurnOutcome};
use crate::models::{
    AgentRow, ContextKind, MeetingEventRow, MeetingRow, MessageRow, OrganizationRow,
    ParticipantRow,
};
use crate::store::{MessageQuery, Storage};
use crate::types::{MeetingId, MessageId, SessionId};
use crate::observability::metrics;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Agent coordination SDK over a shared relational store.
pub struct Parley {
    config: Config,
    store: Arc<dyn Storage>,
    registry: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    tracker: tokio_util::task::TaskTracker,
    shutdown: CancellationToken,
    conversations: ConversationService,
    meetings: MeetingService,
}

impl Parley {
    /// Build an SDK instance over explicit backends.
    ///
    /// Must be called within a tokio runtime; the event dispatcher starts
    /// immediately.
    #[must_use]
    pub fn new(store: Arc<dyn Storage>, locks: Arc<dyn LockManager>, config: Config) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let events = Arc::new(EventBus::new(config.event_queue_capacity));
        let tracker = tokio_util::task::TaskTracker::new();
        let invoker = HandlerInvoker::new(tracker.clone());
        let shutdown = CancellationToken::new();

        let conversations = ConversationService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&registry),
            invoker.clone(),
            config.clone(),
            shutdown.clone(),
        );

        let meetings = MeetingService::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&registry),
            invoker.clone(),
            Arc::clone(&events),
            config.clone(),
            shutdown.clone(),
        );

        info!(
            target: "parley.sdk",
            instance_id = %config.instance_id,
            "Parley SDK instance created"
        );

        Self {
            config,
            store,
            registry,
            events,
            tracker,
            shutdown,
            conversations,
            meetings,
        }
    }

    /// Connect to Postgres using `config.database_url`, run migrations, and
    /// build an instance over the advisory-lock and sqlx backends.
    pub async fn connect(config: Config) -> Result<Self> {
        use crate::lock::postgres::PgLockManager;
        use crate::store::postgres::PgStore;
        use secrecy::ExposeSecret;

        let url = config
            .database_url
            .as_ref()
            .ok_or_else(|| {
                ParleyError::InvalidState(
                    "no database URL configured; set PARLEY_DATABASE_URL".to_string(),
                )
            })?
            .expose_secret()
            .to_string();

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_db_connections)
            .connect(&url)
            .await
            .map_err(|e| ParleyError::Database(e.to_string()))?;

        let store = PgStore::new(pool.clone());
        store.migrate().await?;

        Ok(Self::new(
            Arc::new(store),
            Arc::new(PgLockManager::new(pool)),
            config,
        ))
    }

    /// This instance's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register an organization by external id.
    pub async fn register_organization(
        &self,
        external_id: &str,
        display_name: &str,
    ) -> Result<OrganizationRow> {
        timed("register_organization", async {
            self.store.create_organization(external_id, display_name).await
        })
        .await
    }

    /// Register an agent under an organization.
    pub async fn register_agent(
        &self,
        org_external_id: &str,
        external_id: &str,
        display_name: &str,
    ) -> Result<AgentRow> {
        timed("register_agent", async {
            let org = self
                .store
                .organization_by_external_id(org_external_id)
                .await?
                .ok_or_else(|| {
                    ParleyError::OrganizationNotFound(org_external_id.to_string())
                })?;
            self.store
                .create_agent(org.org_id, external_id, display_name)
                .await
        })
        .await
    }

    /// Change an agent's display name, the only mutable agent attribute.
    pub async fn rename_agent(&self, external_id: &str, display_name: &str) -> Result<()> {
        timed("rename_agent", async {
            let agent = self
                .store
                .agent_by_external_id(external_id)
                .await?
                .ok_or_else(|| ParleyError::AgentNotFound(external_id.to_string()))?;
            self.store.rename_agent(agent.agent_id, display_name).await
        })
        .await
    }

    /// Delete an agent, cascading its sessions, participations, and messages.
    pub async fn remove_agent(&self, external_id: &str) -> Result<()> {
        timed("remove_agent", async {
            let agent = self
                .store
                .agent_by_external_id(external_id)
                .await?
                .ok_or_else(|| ParleyError::AgentNotFound(external_id.to_string()))?;
            self.store.delete_agent(agent.agent_id).await
        })
        .await
    }

    /// Delete an organization, cascading its member agents.
    pub async fn remove_organization(&self, external_id: &str) -> Result<()> {
        timed("remove_organization", async {
            let org = self
                .store
                .organization_by_external_id(external_id)
                .await?
                .ok_or_else(|| ParleyError::OrganizationNotFound(external_id.to_string()))?;
            self.store.delete_organization(org.org_id).await
        })
        .await
    }

    /// Agent lookup by external id.
    pub async fn agent(&self, external_id: &str) -> Result<AgentRow> {
        self.store
            .agent_by_external_id(external_id)
            .await?
            .ok_or_else(|| ParleyError::AgentNotFound(external_id.to_string()))
    }

    // ------------------------------------------------------------------
    // Handler and event registration
    // ------------------------------------------------------------------

    /// Register a handler for `(agent, context kind)`.
    pub fn register_handler(
        &self,
        agent_external_id: &str,
        kind: ContextKind,
        handler: Arc<dyn Handler>,
    ) {
        self.registry.register(agent_external_id, kind, handler);
    }

    /// Register the process-wide fallback handler for a context kind.
    pub fn register_default_handler(&self, kind: ContextKind, handler: Arc<dyn Handler>) {
        self.registry.register_default(kind, handler);
    }

    /// Subscribe to meeting lifecycle events.
    pub fn subscribe(&self, kind: EventKind, subscriber: Arc<dyn Subscriber>) {
        self.events.subscribe(kind, subscriber);
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Fire-and-forget fan-out to multiple recipients.
    pub async fn send_one_way<P: Serialize>(
        &self,
        sender: &str,
        recipients: &[&str],
        payload: &P,
    ) -> Result<Vec<MessageId>> {
        let payload = serde_json::to_value(payload)?;
        timed("send_one_way", async {
            self.conversations
                .send_one_way(sender, recipients, payload, None)
                .await
        })
        .await
    }

    /// Fire-and-forget fan-out with an opaque metadata blob attached to each
    /// envelope; handlers see it on their context.
    pub async fn send_one_way_with_metadata<P: Serialize, M: Serialize>(
        &self,
        sender: &str,
        recipients: &[&str],
        payload: &P,
        metadata: &M,
    ) -> Result<Vec<MessageId>> {
        let payload = serde_json::to_value(payload)?;
        let metadata = serde_json::to_value(metadata)?;
        timed("send_one_way", async {
            self.conversations
                .send_one_way(sender, recipients, payload, Some(metadata))
                .await
        })
        .await
    }

    /// Blocking request/response: send and wait for the recipient's reply.
    pub async fn send_and_wait<P: Serialize>(
        &self,
        sender: &str,
        recipient: &str,
        payload: &P,
        timeout: Duration,
    ) -> Result<SendOutcome> {
        let payload = serde_json::to_value(payload)?;
        timed("send_and_wait", async {
            self.conversations
                .send_and_wait(sender, recipient, payload, timeout)
                .await
        })
        .await
    }

    /// Non-blocking queued send; also the reply path for a parked peer.
    pub async fn send_no_wait<P: Serialize>(
        &self,
        sender: &str,
        recipient: &str,
        payload: &P,
    ) -> Result<MessageRow> {
        let payload = serde_json::to_value(payload)?;
        timed("send_no_wait", async {
            self.conversations
                .send_no_wait(sender, recipient, payload)
                .await
        })
        .await
    }

    /// End the conversation between two agents; wakes a parked sender.
    pub async fn end_conversation(&self, agent_a: &str, agent_b: &str) -> Result<()> {
        timed("end_conversation", async {
            self.conversations.end_conversation(agent_a, agent_b).await
        })
        .await
    }

    /// Unread direct messages, optionally scoped to one session.
    pub async fn unread_messages(
        &self,
        agent: &str,
        session_id: Option<SessionId>,
    ) -> Result<Vec<MessageRow>> {
        self.conversations.unread_messages(agent, session_id).await
    }

    /// Stamp a message's read timestamp.
    pub async fn mark_read(&self, message_id: MessageId) -> Result<()> {
        self.conversations.mark_read(message_id).await
    }

    /// Message history, filterable and paginated.
    pub async fn messages(&self, query: MessageQuery) -> Result<Vec<MessageRow>> {
        self.conversations.messages(query).await
    }

    // ------------------------------------------------------------------
    // Meetings
    // ------------------------------------------------------------------

    /// Create a meeting hosted by `host` with the given invitees.
    pub async fn create_meeting(
        &self,
        host: &str,
        invited: &[&str],
        turn_duration: Option<Duration>,
    ) -> Result<MeetingRow> {
        timed("create_meeting", async {
            self.meetings
                .create_meeting(host, invited, turn_duration)
                .await
        })
        .await
    }

    /// Attend a meeting this agent was invited to.
    pub async fn attend_meeting(&self, agent: &str, meeting_id: MeetingId) -> Result<()> {
        timed("attend_meeting", async {
            self.meetings.attend_meeting(agent, meeting_id).await
        })
        .await
    }

    /// Host starts a ready meeting.
    pub async fn start_meeting<P: Serialize>(
        &self,
        host: &str,
        meeting_id: MeetingId,
        payload: &P,
        first_speaker: Option<&str>,
    ) -> Result<MessageRow> {
        let payload = serde_json::to_value(payload)?;
        timed("start_meeting", async {
            self.meetings
                .start_meeting(host, meeting_id, payload, first_speaker)
                .await
        })
        .await
    }

    /// Speak while holding the turn; passes the turn on.
    pub async fn speak<P: Serialize>(
        &self,
        agent: &str,
        meeting_id: MeetingId,
        payload: &P,
        next_speaker: Option<&str>,
    ) -> Result<MessageRow> {
        let payload = serde_json::to_value(payload)?;
        timed("speak", async {
            self.meetings
                .speak(agent, meeting_id, payload, next_speaker)
                .await
        })
        .await
    }

    /// Yield the turn without a payload.
    pub async fn pass_turn(
        &self,
        agent: &str,
        meeting_id: MeetingId,
        next_speaker: Option<&str>,
    ) -> Result<MessageRow> {
        timed("pass_turn", async {
            self.meetings
                .pass_turn(agent, meeting_id, next_speaker)
                .await
        })
        .await
    }

    /// Leave a meeting (non-host only).
    pub async fn leave_meeting(&self, agent: &str, meeting_id: MeetingId) -> Result<()> {
        timed("leave_meeting", async {
            self.meetings.leave_meeting(agent, meeting_id).await
        })
        .await
    }

    /// Host ends the meeting.
    pub async fn end_meeting(&self, host: &str, meeting_id: MeetingId) -> Result<()> {
        timed("end_meeting", async {
            self.meetings.end_meeting(host, meeting_id).await
        })
        .await
    }

    /// Park until it is this agent's turn; returns what they missed.
    pub async fn wait_for_turn(
        &self,
        agent: &str,
        meeting_id: MeetingId,
        timeout: Duration,
    ) -> Result<TurnOutcome> {
        timed("wait_for_turn", async {
            self.meetings.wait_for_turn(agent, meeting_id, timeout).await
        })
        .await
    }

    /// Meeting status and bookkeeping row.
    pub async fn meeting(&self, meeting_id: MeetingId) -> Result<MeetingRow> {
        self.meetings.meeting(meeting_id).await
    }

    /// Participant records of a meeting, join order ascending.
    pub async fn meeting_participants(
        &self,
        meeting_id: MeetingId,
    ) -> Result<Vec<ParticipantRow>> {
        self.meetings.participants(meeting_id).await
    }

    /// Append-only audit trail of a meeting.
    pub async fn meeting_events(&self, meeting_id: MeetingId) -> Result<Vec<MeetingEventRow>> {
        self.store.meeting_events(meeting_id).await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Shut the instance down: wake parked waiters, cancel turn timers,
    /// drain the event queue, and await outstanding handler invocations.
    pub async fn shutdown(&self) {
        info!(
            target: "parley.sdk",
            instance_id = %self.config.instance_id,
            "Parley SDK shutting down"
        );

        self.shutdown.cancel();
        self.events.close().await;
        self.tracker.close();
        self.tracker.wait().await;

        info!(
            target: "parley.sdk",
            instance_id = %self.config.instance_id,
            "Parley SDK shutdown complete"
        );
    }

    /// Total callers currently parked on conversation replies or turns
    /// (test/diagnostic hook).
    #[must_use]
    pub fn parked_waiters(&self) -> usize {
        self.conversations.parked_waiters() + self.meetings.parked_waiters()
    }
}

/// Time an operation and record its outcome.
async fn timed<T, F>(operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = fut.await;
    let outcome = if result.is_ok() { "success" } else { "error" };
    metrics::record_operation(operation, outcome, start.elapsed());
    result
}
