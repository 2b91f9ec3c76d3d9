//! Conversation state machine.
//!
//! Owns session lifecycle, the blocking send-and-wait protocol, the
//! non-blocking send path, and reply delivery.
//!
//! # Lock discipline
//!
//! Every state-mutating critical section acquires the session's lock once,
//! holds it through persistence and bookkeeping, and releases it at exactly
//! one point per operation, after the locked closure returns — success or
//! error. The blocking caller is parked only after the lock is released; the
//! lock is never held across a parked wait.
//!
//! # Session states
//!
//! `active` (no one waiting) -> `waiting` (one agent parked on a reply) ->
//! `active` (reply delivered) -> ... -> `ended` (terminal, explicit end).

use crate::config::Config;
use crate::errors::{ParleyError, Result};
use crate::handlers::{HandlerInvoker, HandlerRegistry, MessageContext, SyncInvocation};
use crate::lock::{LockKey, LockManager};
use crate::models::{AgentRow, ContextKind, MessageKind, MessageRow, SessionRow, SessionStatus};
use crate::observability::metrics;
use crate::store::{MessageQuery, MessageTarget, NewMessage, Storage};
use crate::types::{AgentId, MessageId, SessionId};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

mod waiters;

use waiters::{ReplySignal, SessionWaiters};

/// Outcome of a blocking `send_and_wait`.
///
/// Expected terminations are values, not errors: a timed-out wait and an
/// ended conversation are normal protocol outcomes the caller is expected to
/// handle.
#[derive(Debug)]
pub enum SendOutcome {
    /// The reply message.
    Replied(MessageRow),
    /// The wait deadline elapsed; the session was restored to `active`.
    TimedOut,
    /// The conversation was ended while (or before) waiting.
    Ended,
}

/// How the locked section of `send_and_wait` left the caller.
enum WaitSetup {
    /// Handler replied within the grace period.
    Immediate(MessageRow),
    /// Caller must park on the reply waiter.
    Parked(tokio::sync::oneshot::Receiver<ReplySignal>),
    /// The session raced to `ended` before the message could be sent.
    AlreadyEnded,
}

/// Conversation state machine over the shared store.
pub struct ConversationService {
    store: Arc<dyn Storage>,
    locks: Arc<dyn LockManager>,
    registry: Arc<HandlerRegistry>,
    invoker: HandlerInvoker,
    waiters: Arc<SessionWaiters>,
    config: Config,
    shutdown: CancellationToken,
}

impl ConversationService {
    pub(crate) fn new(
        store: Arc<dyn Storage>,
        locks: Arc<dyn LockManager>,
        registry: Arc<HandlerRegistry>,
        invoker: HandlerInvoker,
        config: Config,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            locks,
            registry,
            invoker,
            waiters: Arc::new(SessionWaiters::new()),
            config,
            shutdown,
        }
    }

    /// Send to one recipient and block until their reply, a timeout, or the
    /// end of the conversation.
    #[instrument(skip(self, payload), name = "conversation.send_and_wait")]
    pub async fn send_and_wait(
        &self,
        sender_ext: &str,
        recipient_ext: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<SendOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::Shutdown);
        }

        let sender = self.require_agent(sender_ext).await?;
        let recipient = self.require_agent(recipient_ext).await?;
        if sender.agent_id == recipient.agent_id {
            return Err(ParleyError::InvalidState(
                "an agent cannot converse with itself".to_string(),
            ));
        }

        let session = self
            .find_or_create_session(sender.agent_id, recipient.agent_id)
            .await?;
        let session_id = session.session_id;

        let guard = self
            .locks
            .try_acquire(LockKey::for_session(session_id), self.config.lock_wait())
            .await?;

        // Single critical section; the lock is released at exactly one point
        // below, whatever the setup result was.
        let setup = self
            .send_and_wait_locked(session_id, &sender, &recipient, payload)
            .await;

        if let Err(e) = guard.release().await {
            warn!(
                target: "parley.conversation",
                session_id = %session_id,
                error = %e,
                "failed to release session lock"
            );
        }

        match setup? {
            WaitSetup::Immediate(reply) => Ok(SendOutcome::Replied(reply)),
            WaitSetup::AlreadyEnded => Ok(SendOutcome::Ended),
            WaitSetup::Parked(rx) => {
                self.await_reply(session_id, sender.agent_id, rx, timeout)
                    .await
            }
        }
    }

    /// The critical section of `send_and_wait`. Runs with the session lock
    /// held; must leave the session consistent on every path.
    async fn send_and_wait_locked(
        &self,
        session_id: SessionId,
        sender: &AgentRow,
        recipient: &AgentRow,
        payload: Value,
    ) -> Result<WaitSetup> {
        // Re-read authoritative state now that the lock is held.
        let session = self.require_session(session_id).await?;
        match session.status {
            SessionStatus::Ended => return Ok(WaitSetup::AlreadyEnded),
            SessionStatus::Waiting => {
                return Err(ParleyError::InvalidState(
                    "a reply is already pending on this session".to_string(),
                ));
            }
            SessionStatus::Active => {}
        }

        // A response is structurally required, so a missing handler is a
        // hard error — detected before anything is persisted.
        let Some(handler) = self
            .registry
            .resolve(&recipient.external_id, ContextKind::Conversation)
        else {
            return Err(ParleyError::NoHandlerRegistered {
                agent: recipient.external_id.clone(),
                kind: ContextKind::Conversation,
            });
        };

        self.store
            .create_message(NewMessage {
                sender_id: sender.agent_id,
                target: MessageTarget::Recipient(recipient.agent_id),
                session_id: Some(session_id),
                kind: MessageKind::User,
                content: payload.clone(),
                metadata: None,
            })
            .await?;

        self.store
            .update_session_state(session_id, SessionStatus::Waiting, Some(sender.agent_id))
            .await?;

        // Register before invoking the handler so a racing async reply can
        // never be lost between handler start and park.
        let rx = self.waiters.register(session_id);

        let ctx = MessageContext {
            sender: sender.external_id.clone(),
            recipient: Some(recipient.external_id.clone()),
            session_id: Some(session_id),
            meeting_id: None,
            kind: ContextKind::Conversation,
            metadata: None,
        };

        match self
            .invoker
            .invoke_sync(handler, payload, ctx, self.config.sync_reply_grace())
            .await
        {
            SyncInvocation::Completed(Ok(Some(reply_payload))) => {
                // Immediate reply: the caller never observes the wait.
                self.waiters.remove(session_id);
                let reply = self
                    .store
                    .create_message(NewMessage {
                        sender_id: recipient.agent_id,
                        target: MessageTarget::Recipient(sender.agent_id),
                        session_id: Some(session_id),
                        kind: MessageKind::User,
                        content: reply_payload,
                        metadata: None,
                    })
                    .await?;
                self.store
                    .update_session_state(session_id, SessionStatus::Active, None)
                    .await?;
                Ok(WaitSetup::Immediate(reply))
            }
            SyncInvocation::Completed(Ok(None)) => {
                // Handler finished without an immediate reply; it will reply
                // later through the non-blocking path.
                Ok(WaitSetup::Parked(rx))
            }
            SyncInvocation::Completed(Err(e)) => {
                self.waiters.remove(session_id);
                self.store
                    .update_session_state(session_id, SessionStatus::Active, None)
                    .await?;
                Err(ParleyError::HandlerFailed(e.to_string()))
            }
            SyncInvocation::StillRunning(handle) => {
                // Grace elapsed with the handler still going. Its eventual
                // return value is delivered through the normal reply path by
                // a tracked continuation.
                let service = self.clone_refs();
                let sender_id = sender.agent_id;
                let replier = recipient.clone();
                self.invoker.spawn_tracked(async move {
                    match handle.await {
                        Ok(Ok(Some(reply_payload))) => {
                            if let Err(e) = service
                                .deliver_reply(session_id, &replier, reply_payload)
                                .await
                            {
                                warn!(
                                    target: "parley.conversation",
                                    session_id = %session_id,
                                    error = %e,
                                    "late handler reply could not be delivered"
                                );
                            }
                        }
                        Ok(Ok(None)) => {}
                        Ok(Err(e)) => {
                            service
                                .fail_parked_sender(session_id, sender_id, e.to_string())
                                .await;
                        }
                        Err(join_error) => {
                            service
                                .fail_parked_sender(
                                    session_id,
                                    sender_id,
                                    format!("handler panicked: {join_error}"),
                                )
                                .await;
                        }
                    }
                });
                Ok(WaitSetup::Parked(rx))
            }
        }
    }

    /// Park the caller until reply, timeout, or shutdown.
    async fn await_reply(
        &self,
        session_id: SessionId,
        sender_id: AgentId,
        rx: tokio::sync::oneshot::Receiver<ReplySignal>,
        timeout: Duration,
    ) -> Result<SendOutcome> {
        metrics::set_parked_waiters(self.waiters.count() as u64);

        let outcome = tokio::select! {
            signal = rx => match signal {
                Ok(ReplySignal::Reply(message)) => Ok(SendOutcome::Replied(message)),
                Ok(ReplySignal::Ended) => Ok(SendOutcome::Ended),
                Ok(ReplySignal::HandlerFailed(reason)) => {
                    Err(ParleyError::HandlerFailed(reason))
                }
                // The sender side is only dropped by waiter replacement,
                // which means this wait was superseded.
                Err(_) => Ok(SendOutcome::Ended),
            },
            () = tokio::time::sleep(timeout) => {
                self.restore_after_wait(session_id, sender_id).await;
                Ok(SendOutcome::TimedOut)
            }
            () = self.shutdown.cancelled() => {
                self.restore_after_wait(session_id, sender_id).await;
                Err(ParleyError::Shutdown)
            }
        };

        metrics::set_parked_waiters(self.waiters.count() as u64);
        outcome
    }

    /// Leave the session `active` after an abandoned wait (timeout or
    /// shutdown), under the session lock when possible.
    async fn restore_after_wait(&self, session_id: SessionId, sender_id: AgentId) {
        self.waiters.remove(session_id);

        let key = LockKey::for_session(session_id);
        let guard = match self.locks.try_acquire(key, self.config.lock_wait()).await {
            Ok(guard) => Some(guard),
            Err(e) => {
                // Best effort: the session must not stay `waiting`. Proceed
                // without the lock; the conditional re-read below keeps the
                // window narrow.
                warn!(
                    target: "parley.conversation",
                    session_id = %session_id,
                    error = %e,
                    "restoring session state without the lock"
                );
                None
            }
        };

        match self.store.session_by_id(session_id).await {
            Ok(Some(session))
                if session.status == SessionStatus::Waiting
                    && session.locked_agent_id == Some(sender_id) =>
            {
                if let Err(e) = self
                    .store
                    .update_session_state(session_id, SessionStatus::Active, None)
                    .await
                {
                    warn!(
                        target: "parley.conversation",
                        session_id = %session_id,
                        error = %e,
                        "failed to restore session to active"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    target: "parley.conversation",
                    session_id = %session_id,
                    error = %e,
                    "failed to re-read session while restoring state"
                );
            }
        }

        if let Some(guard) = guard {
            if let Err(e) = guard.release().await {
                warn!(
                    target: "parley.conversation",
                    session_id = %session_id,
                    error = %e,
                    "failed to release session lock after restore"
                );
            }
        }
    }

    /// A late handler failure: restore the session and resolve the parked
    /// sender with the failure instead of letting them ride out the timeout.
    async fn fail_parked_sender(&self, session_id: SessionId, sender_id: AgentId, reason: String) {
        self.restore_after_wait(session_id, sender_id).await;
        if !self
            .waiters
            .resolve(session_id, ReplySignal::HandlerFailed(reason.clone()))
        {
            debug!(
                target: "parley.conversation",
                session_id = %session_id,
                reason = %reason,
                "handler failed after the waiter was already resolved"
            );
        }
    }

    /// Deliver a reply to the agent parked on `session_id`.
    ///
    /// Used by the late-reply continuation and by `send_no_wait` when it
    /// detects it is the reply a parked sender is waiting for.
    async fn deliver_reply(
        &self,
        session_id: SessionId,
        replier: &AgentRow,
        payload: Value,
    ) -> Result<MessageRow> {
        let guard = self
            .locks
            .try_acquire(LockKey::for_session(session_id), self.config.lock_wait())
            .await?;

        let result = self.deliver_reply_locked(session_id, replier, payload).await;

        if let Err(e) = guard.release().await {
            warn!(
                target: "parley.conversation",
                session_id = %session_id,
                error = %e,
                "failed to release session lock"
            );
        }

        let (message, parked) = result?;
        if let Some(parked) = parked {
            if !self
                .waiters
                .resolve(session_id, ReplySignal::Reply(message.clone()))
            {
                debug!(
                    target: "parley.conversation",
                    session_id = %session_id,
                    parked_agent = %parked,
                    "reply delivered but the parked sender already gave up"
                );
            }
        }
        Ok(message)
    }

    async fn deliver_reply_locked(
        &self,
        session_id: SessionId,
        replier: &AgentRow,
        payload: Value,
    ) -> Result<(MessageRow, Option<AgentId>)> {
        let session = self.require_session(session_id).await?;
        if session.status == SessionStatus::Ended {
            return Err(ParleyError::InvalidState(
                "cannot reply to an ended session".to_string(),
            ));
        }

        let Some(peer) = session.peer_of(replier.agent_id) else {
            return Err(ParleyError::InvalidState(
                "replier is not a member of this session".to_string(),
            ));
        };

        // Only a reply to the agent the session is locked on resolves the
        // wait; otherwise this is an ordinary message.
        let resolves_wait =
            session.status == SessionStatus::Waiting && session.locked_agent_id == Some(peer);

        let message = self
            .store
            .create_message(NewMessage {
                sender_id: replier.agent_id,
                target: MessageTarget::Recipient(peer),
                session_id: Some(session_id),
                kind: MessageKind::User,
                content: payload,
                metadata: None,
            })
            .await?;

        if resolves_wait {
            self.store
                .update_session_state(session_id, SessionStatus::Active, None)
                .await?;
            Ok((message, Some(peer)))
        } else {
            Ok((message, None))
        }
    }

    /// Non-blocking send: persist, deliver (or wake the parked peer), return.
    #[instrument(skip(self, payload), name = "conversation.send_no_wait")]
    pub async fn send_no_wait(
        &self,
        sender_ext: &str,
        recipient_ext: &str,
        payload: Value,
    ) -> Result<MessageRow> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::Shutdown);
        }

        let sender = self.require_agent(sender_ext).await?;
        let recipient = self.require_agent(recipient_ext).await?;
        if sender.agent_id == recipient.agent_id {
            return Err(ParleyError::InvalidState(
                "an agent cannot converse with itself".to_string(),
            ));
        }

        let session = self
            .find_or_create_session(sender.agent_id, recipient.agent_id)
            .await?;

        // If the recipient is parked waiting on this sender, this message is
        // the reply and goes through the locked delivery path.
        if session.status == SessionStatus::Waiting
            && session.locked_agent_id == Some(recipient.agent_id)
        {
            return self
                .deliver_reply(session.session_id, &sender, payload)
                .await;
        }

        // Plain queued delivery. No caller is parked, so no lock is needed;
        // the recipient's handler runs fire-and-forget.
        let message = self
            .store
            .create_message(NewMessage {
                sender_id: sender.agent_id,
                target: MessageTarget::Recipient(recipient.agent_id),
                session_id: Some(session.session_id),
                kind: MessageKind::User,
                content: payload.clone(),
                metadata: None,
            })
            .await?;

        match self
            .registry
            .resolve(&recipient.external_id, ContextKind::Conversation)
        {
            Some(handler) => {
                let ctx = MessageContext {
                    sender: sender.external_id.clone(),
                    recipient: Some(recipient.external_id.clone()),
                    session_id: Some(session.session_id),
                    meeting_id: None,
                    kind: ContextKind::Conversation,
                    metadata: None,
                };
                self.invoker.invoke_async(handler, payload, ctx);
            }
            None => {
                debug!(
                    target: "parley.conversation",
                    recipient = %recipient.external_id,
                    "no conversation handler registered; message queued only"
                );
            }
        }

        Ok(message)
    }

    /// Fire-and-forget fan-out to multiple recipients, outside any session.
    /// Optional metadata rides the envelope and reaches each handler's
    /// context.
    #[instrument(skip(self, payload, metadata), name = "conversation.send_one_way")]
    pub async fn send_one_way(
        &self,
        sender_ext: &str,
        recipient_exts: &[&str],
        payload: Value,
        metadata: Option<Value>,
    ) -> Result<Vec<MessageId>> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::Shutdown);
        }

        let sender = self.require_agent(sender_ext).await?;

        // Validate the whole recipient list before sending anything, so the
        // operation never partially succeeds.
        let mut recipients = Vec::with_capacity(recipient_exts.len());
        for ext in recipient_exts {
            recipients.push(self.require_agent(ext).await?);
        }

        let mut message_ids = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            let message = self
                .store
                .create_message(NewMessage {
                    sender_id: sender.agent_id,
                    target: MessageTarget::Recipient(recipient.agent_id),
                    session_id: None,
                    kind: MessageKind::User,
                    content: payload.clone(),
                    metadata: metadata.clone(),
                })
                .await?;
            message_ids.push(message.message_id);

            match self
                .registry
                .resolve(&recipient.external_id, ContextKind::OneWay)
            {
                Some(handler) => {
                    let ctx = MessageContext {
                        sender: sender.external_id.clone(),
                        recipient: Some(recipient.external_id.clone()),
                        session_id: None,
                        meeting_id: None,
                        kind: ContextKind::OneWay,
                        metadata: message.metadata.clone(),
                    };
                    self.invoker.invoke_async(handler, payload.clone(), ctx);
                }
                None => {
                    debug!(
                        target: "parley.conversation",
                        recipient = %recipient.external_id,
                        "no one-way handler registered; skipped"
                    );
                }
            }
        }

        Ok(message_ids)
    }

    /// End the conversation between two agents. Terminal; a parked sender is
    /// woken with [`SendOutcome::Ended`] rather than left to time out.
    #[instrument(skip(self), name = "conversation.end")]
    pub async fn end_conversation(&self, a_ext: &str, b_ext: &str) -> Result<()> {
        let a = self.require_agent(a_ext).await?;
        let b = self.require_agent(b_ext).await?;

        let Some(session) = self.store.find_session_by_pair(a.agent_id, b.agent_id).await? else {
            return Err(ParleyError::SessionNotFound(format!(
                "no live session between {a_ext} and {b_ext}"
            )));
        };
        let session_id = session.session_id;

        let guard = self
            .locks
            .try_acquire(LockKey::for_session(session_id), self.config.lock_wait())
            .await?;

        let result = self.end_conversation_locked(session_id, &a, &b).await;

        if let Err(e) = guard.release().await {
            warn!(
                target: "parley.conversation",
                session_id = %session_id,
                error = %e,
                "failed to release session lock"
            );
        }

        let ended = result?;
        if ended {
            self.waiters.resolve(session_id, ReplySignal::Ended);

            // System notification for the peer, fire-and-forget.
            if let Some(handler) = self.registry.resolve(&b.external_id, ContextKind::System) {
                let ctx = MessageContext {
                    sender: a.external_id.clone(),
                    recipient: Some(b.external_id.clone()),
                    session_id: Some(session_id),
                    meeting_id: None,
                    kind: ContextKind::System,
                    metadata: None,
                };
                self.invoker.invoke_async(
                    handler,
                    serde_json::json!({ "event": "conversation_ended" }),
                    ctx,
                );
            }
        }
        Ok(())
    }

    /// Returns whether this call performed the transition to `ended`.
    async fn end_conversation_locked(
        &self,
        session_id: SessionId,
        a: &AgentRow,
        b: &AgentRow,
    ) -> Result<bool> {
        let session = self.require_session(session_id).await?;
        if session.status == SessionStatus::Ended {
            // Raced with a concurrent end; nothing left to do.
            return Ok(false);
        }

        self.store
            .create_message(NewMessage {
                sender_id: a.agent_id,
                target: MessageTarget::Recipient(b.agent_id),
                session_id: Some(session_id),
                kind: MessageKind::Ending,
                content: serde_json::json!({ "event": "conversation_ended" }),
                metadata: None,
            })
            .await?;

        self.store
            .update_session_state(session_id, SessionStatus::Ended, None)
            .await?;

        Ok(true)
    }

    /// Unread direct messages for an agent, optionally scoped to a session.
    pub async fn unread_messages(
        &self,
        agent_ext: &str,
        session_id: Option<SessionId>,
    ) -> Result<Vec<MessageRow>> {
        let agent = self.require_agent(agent_ext).await?;
        self.store.unread_messages(agent.agent_id, session_id).await
    }

    /// Stamp a message's read timestamp. Independent of the lock machinery.
    pub async fn mark_read(&self, message_id: MessageId) -> Result<()> {
        self.store.mark_read(message_id, Utc::now()).await
    }

    /// Message history, filterable and paginated.
    pub async fn messages(&self, query: MessageQuery) -> Result<Vec<MessageRow>> {
        self.store.messages(query).await
    }

    /// Number of callers currently parked on replies (test/diagnostic hook).
    #[must_use]
    pub fn parked_waiters(&self) -> usize {
        self.waiters.count()
    }

    async fn require_agent(&self, external_id: &str) -> Result<AgentRow> {
        self.store
            .agent_by_external_id(external_id)
            .await?
            .ok_or_else(|| ParleyError::AgentNotFound(external_id.to_string()))
    }

    async fn require_session(&self, session_id: SessionId) -> Result<SessionRow> {
        self.store
            .session_by_id(session_id)
            .await?
            .ok_or_else(|| ParleyError::SessionNotFound(session_id.to_string()))
    }

    async fn find_or_create_session(&self, a: AgentId, b: AgentId) -> Result<SessionRow> {
        if let Some(session) = self.store.find_session_by_pair(a, b).await? {
            return Ok(session);
        }

        match self.store.create_session(a, b).await {
            Ok(session) => Ok(session),
            Err(create_err) => {
                // Unique-pair race: another caller created the session
                // between our lookup and insert.
                match self.store.find_session_by_pair(a, b).await? {
                    Some(session) => Ok(session),
                    None => Err(create_err),
                }
            }
        }
    }

    /// A cheap clone for continuations; shares every component.
    fn clone_refs(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            registry: Arc::clone(&self.registry),
            invoker: self.invoker.clone(),
            waiters: Arc::clone(&self.waiters),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}
