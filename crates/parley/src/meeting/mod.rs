//! Meeting turn coordinator.
//!
//! Owns meeting lifecycle, participant lifecycle, round-robin and explicit
//! turn assignment, and turn-timeout auto-advance.
//!
//! # Lock discipline
//!
//! Every state-mutating operation acquires the per-meeting lock for its
//! whole critical section and **re-reads authoritative state after acquiring
//! it** — state may have changed between the caller's last read and lock
//! acquisition. Without this, two agents can each observe "it is my turn"
//! before either commits a transition, and both speak. The timer path uses
//! the identical locked, re-validated transition as `speak`, so a late
//! `speak` and a firing timer cannot both advance the same turn.
//!
//! Meeting status: `created` -> `ready` (all invitees attended) -> `active`
//! (host starts) -> `ended` (host ends; terminal). Participant status:
//! `invited` -> `attending` -> `waiting` <-> `speaking` -> `left` (terminal).

use crate::config::Config;
use crate::errors::{ParleyError, Result};
use crate::events::{Event, EventBus, EventData};
use crate::handlers::{HandlerInvoker, HandlerRegistry, MessageContext};
use crate::lock::{LockKey, LockManager};
use crate::models::{
    AgentRow, ContextKind, MeetingRow, MessageKind, MessageRow, ParticipantRow,
    ParticipantStatus, MeetingStatus,
};
use crate::store::{MessageQuery, MessageTarget, NewMessage, Storage};
use crate::types::{AgentId, MeetingId};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

mod turns;

pub use turns::TurnOutcome;
use turns::{TurnSignal, TurnTimers, TurnWaiters};

/// Tolerance when matching a re-read `turn_started_at` against the timestamp
/// a timer was armed with; absorbs timestamp precision loss in the store.
const TURN_STAMP_TOLERANCE_MS: i64 = 1;

/// What a turn-advancing critical section produced, applied after the lock
/// is released.
struct SpeakEffects {
    message: MessageRow,
    next_speaker: AgentRow,
    /// Non-left participants other than the speaker; their meeting handlers
    /// receive the message fire-and-forget.
    fan_out: Vec<AgentRow>,
}

/// Meeting turn coordinator over the shared store.
pub struct MeetingService {
    store: Arc<dyn Storage>,
    locks: Arc<dyn LockManager>,
    registry: Arc<HandlerRegistry>,
    invoker: HandlerInvoker,
    events: Arc<EventBus>,
    config: Config,
    shutdown: CancellationToken,
    timers: Arc<TurnTimers>,
    waiters: Arc<TurnWaiters>,
}

impl MeetingService {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn Storage>,
        locks: Arc<dyn LockManager>,
        registry: Arc<HandlerRegistry>,
        invoker: HandlerInvoker,
        events: Arc<EventBus>,
        config: Config,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            locks,
            registry,
            invoker,
            events,
            config,
            shutdown,
            timers: Arc::new(TurnTimers::new()),
            waiters: Arc::new(TurnWaiters::new()),
        }
    }

    /// Create a meeting. The host attends implicitly at join order 0;
    /// invitees get ascending join orders and must attend before the meeting
    /// becomes `ready`.
    #[instrument(skip(self), name = "meeting.create")]
    pub async fn create_meeting(
        &self,
        host_ext: &str,
        invited_exts: &[&str],
        turn_duration: Option<Duration>,
    ) -> Result<MeetingRow> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::Shutdown);
        }
        if invited_exts.is_empty() {
            return Err(ParleyError::InvalidState(
                "a meeting needs at least one invited agent".to_string(),
            ));
        }

        let host = self.require_agent(host_ext).await?;

        let mut invitees = Vec::with_capacity(invited_exts.len());
        for ext in invited_exts {
            let agent = self.require_agent(ext).await?;
            if agent.agent_id == host.agent_id {
                return Err(ParleyError::InvalidState(
                    "the host is a participant implicitly and cannot be invited".to_string(),
                ));
            }
            if invitees
                .iter()
                .any(|a: &AgentRow| a.agent_id == agent.agent_id)
            {
                return Err(ParleyError::InvalidState(format!(
                    "agent {ext} invited more than once"
                )));
            }
            invitees.push(agent);
        }

        let turn_duration_ms = match turn_duration {
            Some(duration) => Some(i64::try_from(duration.as_millis()).map_err(|_| {
                ParleyError::InvalidState("turn duration out of range".to_string())
            })?),
            None => None,
        };

        let meeting = self
            .store
            .create_meeting(host.agent_id, turn_duration_ms)
            .await?;

        self.store
            .create_participant(
                meeting.meeting_id,
                host.agent_id,
                ParticipantStatus::Attending,
                0,
            )
            .await?;

        for (index, invitee) in invitees.iter().enumerate() {
            let join_order = i32::try_from(index + 1).map_err(|_| {
                ParleyError::InvalidState("too many invited agents".to_string())
            })?;
            self.store
                .create_participant(
                    meeting.meeting_id,
                    invitee.agent_id,
                    ParticipantStatus::Invited,
                    join_order,
                )
                .await?;
        }

        self.store
            .append_meeting_event(
                meeting.meeting_id,
                "meeting_created",
                Some(host.agent_id),
                json!({ "host": host.external_id, "invited": invited_exts.len() }),
            )
            .await?;

        Ok(meeting)
    }

    /// An invited agent attends. When the last invitee attends, the meeting
    /// becomes `ready`.
    #[instrument(skip(self), name = "meeting.attend")]
    pub async fn attend_meeting(&self, agent_ext: &str, meeting_id: MeetingId) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::Shutdown);
        }
        let agent = self.require_agent(agent_ext).await?;

        let guard = self
            .locks
            .try_acquire(LockKey::for_meeting(meeting_id), self.config.lock_wait())
            .await?;

        let result = self.attend_locked(meeting_id, &agent).await;

        if let Err(e) = guard.release().await {
            warn!(
                target: "parley.meeting",
                meeting_id = %meeting_id,
                error = %e,
                "failed to release meeting lock"
            );
        }

        result
    }

    async fn attend_locked(&self, meeting_id: MeetingId, agent: &AgentRow) -> Result<()> {
        let meeting = self.require_meeting(meeting_id).await?;
        match meeting.status {
            MeetingStatus::Created | MeetingStatus::Ready => {}
            MeetingStatus::Active => {
                return Err(ParleyError::InvalidState(
                    "meeting has already started".to_string(),
                ));
            }
            MeetingStatus::Ended => {
                return Err(ParleyError::InvalidState("meeting has ended".to_string()));
            }
        }

        let participant = self.require_participant(meeting_id, agent).await?;
        if participant.status != ParticipantStatus::Invited {
            return Err(ParleyError::InvalidState(
                "agent has already attended".to_string(),
            ));
        }

        self.store
            .update_participant_status(participant.participant_id, ParticipantStatus::Attending)
            .await?;

        // Once nobody is left in `invited`, the host may start.
        let participants = self.store.participants(meeting_id).await?;
        let all_attended = participants
            .iter()
            .all(|p| p.status != ParticipantStatus::Invited);
        if all_attended && meeting.status == MeetingStatus::Created {
            self.store
                .update_meeting_status(meeting_id, MeetingStatus::Ready)
                .await?;
        }

        self.store
            .append_meeting_event(
                meeting_id,
                "participant_joined",
                Some(agent.agent_id),
                json!({ "agent": agent.external_id }),
            )
            .await?;

        self.events.emit(Event::new(
            meeting_id,
            EventData::ParticipantJoined {
                agent: agent.external_id.clone(),
            },
        ));

        Ok(())
    }

    /// Host starts a `ready` meeting with an opening message and a first
    /// speaker (explicit, or the round-robin head).
    #[instrument(skip(self, payload), name = "meeting.start")]
    pub async fn start_meeting(
        &self,
        host_ext: &str,
        meeting_id: MeetingId,
        payload: Value,
        first_speaker_ext: Option<&str>,
    ) -> Result<MessageRow> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::Shutdown);
        }
        let host = self.require_agent(host_ext).await?;
        let first_speaker = match first_speaker_ext {
            Some(ext) => Some(self.require_agent(ext).await?),
            None => None,
        };

        let guard = self
            .locks
            .try_acquire(LockKey::for_meeting(meeting_id), self.config.lock_wait())
            .await?;

        let result = self
            .start_locked(meeting_id, &host, payload, first_speaker.as_ref())
            .await;

        if let Err(e) = guard.release().await {
            warn!(
                target: "parley.meeting",
                meeting_id = %meeting_id,
                error = %e,
                "failed to release meeting lock"
            );
        }

        let effects = result?;
        self.apply_speak_effects(meeting_id, &host.external_id, effects)
            .await
    }

    async fn start_locked(
        &self,
        meeting_id: MeetingId,
        host: &AgentRow,
        payload: Value,
        first_speaker: Option<&AgentRow>,
    ) -> Result<SpeakEffects> {
        let meeting = self.require_meeting(meeting_id).await?;
        if meeting.host_id != host.agent_id {
            return Err(ParleyError::PermissionDenied(
                "only the host may start the meeting".to_string(),
            ));
        }
        match meeting.status {
            MeetingStatus::Ready => {}
            MeetingStatus::Created => {
                return Err(ParleyError::InvalidState(
                    "not every invited agent has attended yet".to_string(),
                ));
            }
            MeetingStatus::Active => {
                return Err(ParleyError::InvalidState(
                    "meeting has already started".to_string(),
                ));
            }
            MeetingStatus::Ended => {
                return Err(ParleyError::InvalidState("meeting has ended".to_string()));
            }
        }

        let message = self
            .store
            .create_message(NewMessage {
                sender_id: host.agent_id,
                target: MessageTarget::Meeting(meeting_id),
                session_id: None,
                kind: MessageKind::User,
                content: payload,
                metadata: None,
            })
            .await?;

        self.store
            .update_meeting_status(meeting_id, MeetingStatus::Active)
            .await?;

        let first_participant = match first_speaker {
            Some(agent) => {
                let participant = self
                    .store
                    .participant(meeting_id, agent.agent_id)
                    .await?
                    .ok_or_else(|| ParleyError::ParticipantNotFound {
                        meeting_id,
                        agent: agent.external_id.clone(),
                    })?;
                if participant.status == ParticipantStatus::Left {
                    return Err(ParleyError::InvalidState(
                        "chosen first speaker has left the meeting".to_string(),
                    ));
                }
                participant
            }
            None => self
                .next_by_join_order(meeting_id, -1, None)
                .await?
                .ok_or_else(|| {
                    ParleyError::InvalidState("meeting has no eligible speaker".to_string())
                })?,
        };

        // Everyone parks except the first speaker.
        let participants = self.store.participants(meeting_id).await?;
        for participant in &participants {
            if participant.status == ParticipantStatus::Left {
                continue;
            }
            let status = if participant.participant_id == first_participant.participant_id {
                ParticipantStatus::Speaking
            } else {
                ParticipantStatus::Waiting
            };
            self.store
                .update_participant_status(participant.participant_id, status)
                .await?;
        }

        let now = Utc::now();
        self.store
            .update_current_speaker(meeting_id, Some(first_participant.agent_id), Some(now))
            .await?;

        if let Some(duration) = turn_duration_of(&meeting) {
            self.arm_turn_timer(meeting_id, first_participant.agent_id, now, duration);
        }

        let first_agent = self.require_agent_by_id(first_participant.agent_id).await?;

        self.store
            .append_meeting_event(
                meeting_id,
                "meeting_started",
                Some(host.agent_id),
                json!({ "host": host.external_id, "first_speaker": first_agent.external_id }),
            )
            .await?;

        self.events.emit(Event::new(
            meeting_id,
            EventData::MeetingStarted {
                host: host.external_id.clone(),
                first_speaker: first_agent.external_id.clone(),
            },
        ));
        self.events.emit(Event::new(
            meeting_id,
            EventData::TurnChanged {
                previous: None,
                current: first_agent.external_id.clone(),
            },
        ));

        let fan_out = self.fan_out_targets(&participants, host.agent_id).await?;

        Ok(SpeakEffects {
            message,
            next_speaker: first_agent,
            fan_out,
        })
    }

    /// The current speaker speaks: persist the message, pass the turn to the
    /// explicit next speaker or the round-robin successor, restart the turn
    /// timer, and fan the message out to the other participants.
    #[instrument(skip(self, payload), name = "meeting.speak")]
    pub async fn speak(
        &self,
        agent_ext: &str,
        meeting_id: MeetingId,
        payload: Value,
        next_speaker_ext: Option<&str>,
    ) -> Result<MessageRow> {
        self.take_turn(
            agent_ext,
            meeting_id,
            payload,
            MessageKind::User,
            next_speaker_ext,
        )
        .await
    }

    /// Yield the turn without a payload message.
    #[instrument(skip(self), name = "meeting.pass_turn")]
    pub async fn pass_turn(
        &self,
        agent_ext: &str,
        meeting_id: MeetingId,
        next_speaker_ext: Option<&str>,
    ) -> Result<MessageRow> {
        self.take_turn(
            agent_ext,
            meeting_id,
            json!({ "event": "turn_passed" }),
            MessageKind::System,
            next_speaker_ext,
        )
        .await
    }

    async fn take_turn(
        &self,
        agent_ext: &str,
        meeting_id: MeetingId,
        content: Value,
        kind: MessageKind,
        next_speaker_ext: Option<&str>,
    ) -> Result<MessageRow> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::Shutdown);
        }
        let agent = self.require_agent(agent_ext).await?;
        let explicit_next = match next_speaker_ext {
            Some(ext) => Some(self.require_agent(ext).await?),
            None => None,
        };

        let guard = self
            .locks
            .try_acquire(LockKey::for_meeting(meeting_id), self.config.lock_wait())
            .await?;

        let result = self
            .speak_locked(meeting_id, &agent, content, kind, explicit_next.as_ref())
            .await;

        if let Err(e) = guard.release().await {
            warn!(
                target: "parley.meeting",
                meeting_id = %meeting_id,
                error = %e,
                "failed to release meeting lock"
            );
        }

        let effects = result?;
        self.apply_speak_effects(meeting_id, &agent.external_id, effects)
            .await
    }

    async fn speak_locked(
        &self,
        meeting_id: MeetingId,
        agent: &AgentRow,
        content: Value,
        kind: MessageKind,
        explicit_next: Option<&AgentRow>,
    ) -> Result<SpeakEffects> {
        // Fresh read under the lock; the turn may have moved since the
        // caller last looked.
        let meeting = self.require_meeting(meeting_id).await?;
        if meeting.status != MeetingStatus::Active {
            return Err(ParleyError::InvalidState(format!(
                "meeting is not active (status: {})",
                meeting.status.as_db_str()
            )));
        }

        let participant = self.require_participant(meeting_id, agent).await?;
        if participant.status == ParticipantStatus::Left {
            return Err(ParleyError::InvalidState(
                "agent has left the meeting".to_string(),
            ));
        }

        if meeting.current_speaker_id != Some(agent.agent_id) {
            let current = match meeting.current_speaker_id {
                Some(id) => self
                    .store
                    .agent_by_id(id)
                    .await?
                    .map_or_else(|| id.to_string(), |row| row.external_id),
                None => "none".to_string(),
            };
            return Err(ParleyError::NotYourTurn { current });
        }

        let message = self
            .store
            .create_message(NewMessage {
                sender_id: agent.agent_id,
                target: MessageTarget::Meeting(meeting_id),
                session_id: None,
                kind,
                content,
                metadata: None,
            })
            .await?;

        let next_agent = self
            .advance_turn_locked(&meeting, &participant, &agent.external_id, explicit_next, None)
            .await?;

        let participants = self.store.participants(meeting_id).await?;
        let fan_out = if kind == MessageKind::User {
            self.fan_out_targets(&participants, agent.agent_id).await?
        } else {
            Vec::new()
        };

        Ok(SpeakEffects {
            message,
            next_speaker: next_agent,
            fan_out,
        })
    }

    /// Advance the current speaker. Shared verbatim by `speak`, `pass_turn`,
    /// the turn-timeout path, and speaker leave — always under the meeting
    /// lock, always against freshly-read state.
    async fn advance_turn_locked(
        &self,
        meeting: &MeetingRow,
        current: &ParticipantRow,
        current_ext: &str,
        explicit_next: Option<&AgentRow>,
        exclude: Option<AgentId>,
    ) -> Result<AgentRow> {
        let next_participant = match explicit_next {
            Some(next_agent) => {
                let participant = self
                    .store
                    .participant(meeting.meeting_id, next_agent.agent_id)
                    .await?
                    .ok_or_else(|| ParleyError::ParticipantNotFound {
                        meeting_id: meeting.meeting_id,
                        agent: next_agent.external_id.clone(),
                    })?;
                if participant.status == ParticipantStatus::Left {
                    return Err(ParleyError::InvalidState(
                        "chosen next speaker has left the meeting".to_string(),
                    ));
                }
                participant
            }
            None => self
                .next_by_join_order(meeting.meeting_id, current.join_order, exclude)
                .await?
                .ok_or_else(|| {
                    ParleyError::InvalidState("meeting has no eligible speaker".to_string())
                })?,
        };

        let now = Utc::now();

        if next_participant.participant_id != current.participant_id {
            // The leaver keeps its status; leave marks it `left` right after.
            if exclude != Some(current.agent_id) {
                self.store
                    .update_participant_status(current.participant_id, ParticipantStatus::Waiting)
                    .await?;
            }
            self.store
                .update_participant_status(
                    next_participant.participant_id,
                    ParticipantStatus::Speaking,
                )
                .await?;
        }

        self.store
            .update_current_speaker(meeting.meeting_id, Some(next_participant.agent_id), Some(now))
            .await?;

        if let Some(duration) = turn_duration_of(meeting) {
            self.arm_turn_timer(meeting.meeting_id, next_participant.agent_id, now, duration);
        }

        let next_agent = self.require_agent_by_id(next_participant.agent_id).await?;

        self.store
            .append_meeting_event(
                meeting.meeting_id,
                "turn_changed",
                Some(next_participant.agent_id),
                json!({ "previous": current_ext, "current": next_agent.external_id }),
            )
            .await?;

        self.events.emit(Event::new(
            meeting.meeting_id,
            EventData::TurnChanged {
                previous: Some(current_ext.to_string()),
                current: next_agent.external_id.clone(),
            },
        ));

        Ok(next_agent)
    }

    /// Round-robin successor by join order among non-left participants,
    /// wrapping to the lowest order after the highest.
    async fn next_by_join_order(
        &self,
        meeting_id: MeetingId,
        after_order: i32,
        exclude: Option<AgentId>,
    ) -> Result<Option<ParticipantRow>> {
        // Window of two: at most one candidate can be excluded.
        let window = self
            .store
            .participants_window(meeting_id, after_order, 2)
            .await?;
        if let Some(next) = window.iter().find(|p| Some(p.agent_id) != exclude) {
            return Ok(Some(next.clone()));
        }

        let head = self.store.participants_window(meeting_id, -1, 2).await?;
        Ok(head.iter().find(|p| Some(p.agent_id) != exclude).cloned())
    }

    /// Leave the meeting. The host cannot leave; a leaving speaker first
    /// hands the turn on, so an active meeting is never speaker-less.
    #[instrument(skip(self), name = "meeting.leave")]
    pub async fn leave_meeting(&self, agent_ext: &str, meeting_id: MeetingId) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::Shutdown);
        }
        let agent = self.require_agent(agent_ext).await?;

        let guard = self
            .locks
            .try_acquire(LockKey::for_meeting(meeting_id), self.config.lock_wait())
            .await?;

        let result = self.leave_locked(meeting_id, &agent).await;

        if let Err(e) = guard.release().await {
            warn!(
                target: "parley.meeting",
                meeting_id = %meeting_id,
                error = %e,
                "failed to release meeting lock"
            );
        }

        let next = result?;
        self.waiters.remove(meeting_id, agent.agent_id);
        if let Some(next) = next {
            self.waiters.resolve_speaker(meeting_id, next.agent_id);
        }
        Ok(())
    }

    async fn leave_locked(
        &self,
        meeting_id: MeetingId,
        agent: &AgentRow,
    ) -> Result<Option<AgentRow>> {
        let meeting = self.require_meeting(meeting_id).await?;
        if meeting.status == MeetingStatus::Ended {
            return Err(ParleyError::InvalidState("meeting has ended".to_string()));
        }
        if meeting.host_id == agent.agent_id {
            return Err(ParleyError::PermissionDenied(
                "the host cannot leave the meeting".to_string(),
            ));
        }

        let participant = self.require_participant(meeting_id, agent).await?;
        if participant.status == ParticipantStatus::Left {
            return Err(ParleyError::InvalidState(
                "agent has already left the meeting".to_string(),
            ));
        }

        // A leaving speaker hands the turn on first.
        let next = if meeting.status == MeetingStatus::Active
            && meeting.current_speaker_id == Some(agent.agent_id)
        {
            Some(
                self.advance_turn_locked(
                    &meeting,
                    &participant,
                    &agent.external_id,
                    None,
                    Some(agent.agent_id),
                )
                .await?,
            )
        } else {
            None
        };

        self.store
            .update_participant_status(participant.participant_id, ParticipantStatus::Left)
            .await?;

        // An invitee bowing out may complete the attendance round.
        if meeting.status == MeetingStatus::Created {
            let participants = self.store.participants(meeting_id).await?;
            let all_attended = participants
                .iter()
                .filter(|p| p.status != ParticipantStatus::Left)
                .all(|p| p.status != ParticipantStatus::Invited);
            if all_attended {
                self.store
                    .update_meeting_status(meeting_id, MeetingStatus::Ready)
                    .await?;
            }
        }

        self.store
            .append_meeting_event(
                meeting_id,
                "participant_left",
                Some(agent.agent_id),
                json!({ "agent": agent.external_id }),
            )
            .await?;

        self.events.emit(Event::new(
            meeting_id,
            EventData::ParticipantLeft {
                agent: agent.external_id.clone(),
            },
        ));

        Ok(next)
    }

    /// Host ends the meeting. Terminal; parked turn-waiters are woken with
    /// [`TurnOutcome::MeetingEnded`] and the remaining participants get a
    /// system notification.
    #[instrument(skip(self), name = "meeting.end")]
    pub async fn end_meeting(&self, host_ext: &str, meeting_id: MeetingId) -> Result<()> {
        let host = self.require_agent(host_ext).await?;

        let guard = self
            .locks
            .try_acquire(LockKey::for_meeting(meeting_id), self.config.lock_wait())
            .await?;

        let result = self.end_locked(meeting_id, &host).await;

        if let Err(e) = guard.release().await {
            warn!(
                target: "parley.meeting",
                meeting_id = %meeting_id,
                error = %e,
                "failed to release meeting lock"
            );
        }

        result?;
        self.waiters.resolve_all(meeting_id);

        let participants = self.store.participants(meeting_id).await?;
        for recipient in self.fan_out_targets(&participants, host.agent_id).await? {
            let Some(handler) = self
                .registry
                .resolve(&recipient.external_id, ContextKind::System)
            else {
                continue;
            };
            let ctx = MessageContext {
                sender: host.external_id.clone(),
                recipient: Some(recipient.external_id.clone()),
                session_id: None,
                meeting_id: Some(meeting_id),
                kind: ContextKind::System,
                metadata: None,
            };
            self.invoker
                .invoke_async(handler, json!({ "event": "meeting_ended" }), ctx);
        }
        Ok(())
    }

    async fn end_locked(&self, meeting_id: MeetingId, host: &AgentRow) -> Result<()> {
        let meeting = self.require_meeting(meeting_id).await?;
        if meeting.host_id != host.agent_id {
            return Err(ParleyError::PermissionDenied(
                "only the host may end the meeting".to_string(),
            ));
        }
        if meeting.status == MeetingStatus::Ended {
            return Err(ParleyError::InvalidState(
                "meeting has already ended".to_string(),
            ));
        }

        self.timers.disarm(meeting_id);

        self.store
            .create_message(NewMessage {
                sender_id: host.agent_id,
                target: MessageTarget::Meeting(meeting_id),
                session_id: None,
                kind: MessageKind::Ending,
                content: json!({ "event": "meeting_ended" }),
                metadata: None,
            })
            .await?;

        self.store
            .update_meeting_status(meeting_id, MeetingStatus::Ended)
            .await?;
        self.store
            .update_current_speaker(meeting_id, None, None)
            .await?;

        self.store
            .append_meeting_event(
                meeting_id,
                "meeting_ended",
                Some(host.agent_id),
                json!({ "host": host.external_id }),
            )
            .await?;

        self.events
            .emit(Event::new(meeting_id, EventData::MeetingEnded));

        Ok(())
    }

    /// Park until this agent holds the turn, the meeting ends, the deadline
    /// elapses, or the SDK shuts down. On `YourTurn`, returns the meeting
    /// messages persisted while parked.
    #[instrument(skip(self), name = "meeting.wait_for_turn")]
    pub async fn wait_for_turn(
        &self,
        agent_ext: &str,
        meeting_id: MeetingId,
        timeout: Duration,
    ) -> Result<TurnOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(ParleyError::Shutdown);
        }
        let agent = self.require_agent(agent_ext).await?;

        let meeting = self.require_meeting(meeting_id).await?;
        if meeting.status == MeetingStatus::Ended {
            return Ok(TurnOutcome::MeetingEnded);
        }

        let participant = self.require_participant(meeting_id, &agent).await?;
        if participant.status == ParticipantStatus::Left {
            return Err(ParleyError::InvalidState(
                "agent has left the meeting".to_string(),
            ));
        }

        if meeting.current_speaker_id == Some(agent.agent_id) {
            return Ok(TurnOutcome::YourTurn(Vec::new()));
        }

        let parked_at = Utc::now();
        let rx = self.waiters.register(meeting_id, agent.agent_id);

        // Close the register/transition race: the turn may have reached this
        // agent (or the meeting may have ended) while registering.
        let fresh = self.require_meeting(meeting_id).await?;
        if fresh.status == MeetingStatus::Ended {
            self.waiters.remove(meeting_id, agent.agent_id);
            return Ok(TurnOutcome::MeetingEnded);
        }
        if fresh.current_speaker_id == Some(agent.agent_id) {
            self.waiters.remove(meeting_id, agent.agent_id);
            return Ok(TurnOutcome::YourTurn(Vec::new()));
        }

        let signal = tokio::select! {
            signal = rx => signal,
            () = tokio::time::sleep(timeout) => {
                self.waiters.remove(meeting_id, agent.agent_id);
                return Ok(TurnOutcome::TimedOut);
            }
            () = self.shutdown.cancelled() => {
                self.waiters.remove(meeting_id, agent.agent_id);
                return Err(ParleyError::Shutdown);
            }
        };

        match signal {
            Ok(TurnSignal::YourTurn) => {
                let missed = self
                    .store
                    .messages(MessageQuery {
                        meeting_id: Some(meeting_id),
                        created_after: Some(parked_at),
                        ..MessageQuery::default()
                    })
                    .await?;
                Ok(TurnOutcome::YourTurn(missed))
            }
            Ok(TurnSignal::MeetingEnded) | Err(_) => Ok(TurnOutcome::MeetingEnded),
        }
    }

    /// Timer-driven auto-advance, acting as the system rather than as any
    /// agent. Identical locked, re-validated transition logic as `speak`; if
    /// the turn moved before the lock was taken, the timer does nothing.
    async fn handle_turn_timeout(
        &self,
        meeting_id: MeetingId,
        expected_speaker: AgentId,
        expected_started: DateTime<Utc>,
    ) {
        let guard = match self
            .locks
            .try_acquire(LockKey::for_meeting(meeting_id), self.config.lock_wait())
            .await
        {
            Ok(guard) => guard,
            Err(e) => {
                // A concurrent transition holds the lock; it re-arms the
                // timer itself.
                debug!(
                    target: "parley.meeting",
                    meeting_id = %meeting_id,
                    error = %e,
                    "turn timer yielded: meeting lock unavailable"
                );
                return;
            }
        };

        let result = self
            .timeout_locked(meeting_id, expected_speaker, expected_started)
            .await;

        if let Err(e) = guard.release().await {
            warn!(
                target: "parley.meeting",
                meeting_id = %meeting_id,
                error = %e,
                "failed to release meeting lock"
            );
        }

        match result {
            Ok(Some(next)) => {
                self.waiters.resolve_speaker(meeting_id, next.agent_id);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    target: "parley.meeting",
                    meeting_id = %meeting_id,
                    error = %e,
                    "turn timeout handling failed"
                );
            }
        }
    }

    /// Returns the new speaker when this firing actually advanced the turn.
    async fn timeout_locked(
        &self,
        meeting_id: MeetingId,
        expected_speaker: AgentId,
        expected_started: DateTime<Utc>,
    ) -> Result<Option<AgentRow>> {
        let Some(meeting) = self.store.meeting_by_id(meeting_id).await? else {
            return Ok(None);
        };
        if meeting.status != MeetingStatus::Active {
            return Ok(None);
        }
        if meeting.current_speaker_id != Some(expected_speaker) {
            return Ok(None);
        }
        let Some(started) = meeting.turn_started_at else {
            return Ok(None);
        };
        if (started - expected_started).num_milliseconds().abs() > TURN_STAMP_TOLERANCE_MS {
            // A later `speak` by the same agent restarted the turn clock.
            return Ok(None);
        }

        let Some(participant) = self.store.participant(meeting_id, expected_speaker).await? else {
            return Ok(None);
        };
        let speaker = self.require_agent_by_id(expected_speaker).await?;

        self.store
            .create_message(NewMessage {
                sender_id: expected_speaker,
                target: MessageTarget::Meeting(meeting_id),
                session_id: None,
                kind: MessageKind::Timeout,
                content: json!({ "event": "turn_timeout" }),
                metadata: None,
            })
            .await?;

        self.store
            .append_meeting_event(
                meeting_id,
                "turn_timeout",
                Some(expected_speaker),
                json!({ "speaker": speaker.external_id }),
            )
            .await?;

        // Timeout event first, then the turn change the advance emits.
        self.events.emit(Event::new(
            meeting_id,
            EventData::TimeoutOccurred {
                speaker: speaker.external_id.clone(),
            },
        ));

        let next = self
            .advance_turn_locked(&meeting, &participant, &speaker.external_id, None, None)
            .await?;

        Ok(Some(next))
    }

    fn arm_turn_timer(
        &self,
        meeting_id: MeetingId,
        speaker: AgentId,
        turn_started_at: DateTime<Utc>,
        duration: Duration,
    ) {
        let token = self.timers.arm(meeting_id, &self.shutdown);
        let service = self.clone_refs();
        self.invoker.spawn_tracked(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(duration) => {
                    service
                        .handle_turn_timeout(meeting_id, speaker, turn_started_at)
                        .await;
                }
            }
        });
    }

    /// Post-lock effects of a turn-advancing operation: wake the new
    /// speaker's parked waiter and fan the message out.
    async fn apply_speak_effects(
        &self,
        meeting_id: MeetingId,
        speaker_ext: &str,
        effects: SpeakEffects,
    ) -> Result<MessageRow> {
        self.waiters
            .resolve_speaker(meeting_id, effects.next_speaker.agent_id);

        for recipient in &effects.fan_out {
            match self
                .registry
                .resolve(&recipient.external_id, ContextKind::Meeting)
            {
                Some(handler) => {
                    let ctx = MessageContext {
                        sender: speaker_ext.to_string(),
                        recipient: Some(recipient.external_id.clone()),
                        session_id: None,
                        meeting_id: Some(meeting_id),
                        kind: ContextKind::Meeting,
                        metadata: None,
                    };
                    self.invoker
                        .invoke_async(handler, effects.message.content.clone(), ctx);
                }
                None => {
                    debug!(
                        target: "parley.meeting",
                        recipient = %recipient.external_id,
                        "no meeting handler registered; skipped"
                    );
                }
            }
        }

        Ok(effects.message)
    }

    /// Agents whose meeting handlers receive a fan-out: every non-left
    /// participant except the sender.
    async fn fan_out_targets(
        &self,
        participants: &[ParticipantRow],
        sender: AgentId,
    ) -> Result<Vec<AgentRow>> {
        let mut targets = Vec::new();
        for participant in participants {
            if participant.status == ParticipantStatus::Left || participant.agent_id == sender {
                continue;
            }
            targets.push(self.require_agent_by_id(participant.agent_id).await?);
        }
        Ok(targets)
    }

    // Read-only queries

    /// Meeting row by id.
    pub async fn meeting(&self, meeting_id: MeetingId) -> Result<MeetingRow> {
        self.require_meeting(meeting_id).await
    }

    /// Participant records, join order ascending.
    pub async fn participants(&self, meeting_id: MeetingId) -> Result<Vec<ParticipantRow>> {
        self.require_meeting(meeting_id).await?;
        self.store.participants(meeting_id).await
    }

    /// Number of agents currently parked for a turn (test/diagnostic hook).
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

    async fn require_agent_by_id(&self, agent_id: AgentId) -> Result<AgentRow> {
        self.store
            .agent_by_id(agent_id)
            .await?
            .ok_or_else(|| ParleyError::AgentNotFound(agent_id.to_string()))
    }

    async fn require_meeting(&self, meeting_id: MeetingId) -> Result<MeetingRow> {
        self.store
            .meeting_by_id(meeting_id)
            .await?
            .ok_or(ParleyError::MeetingNotFound(meeting_id))
    }

    async fn require_participant(
        &self,
        meeting_id: MeetingId,
        agent: &AgentRow,
    ) -> Result<ParticipantRow> {
        self.store
            .participant(meeting_id, agent.agent_id)
            .await?
            .ok_or_else(|| ParleyError::ParticipantNotFound {
                meeting_id,
                agent: agent.external_id.clone(),
            })
    }

    /// A cheap clone for timer tasks; shares every component.
    fn clone_refs(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            registry: Arc::clone(&self.registry),
            invoker: self.invoker.clone(),
            events: Arc::clone(&self.events),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            timers: Arc::clone(&self.timers),
            waiters: Arc::clone(&self.waiters),
        }
    }
}

fn turn_duration_of(meeting: &MeetingRow) -> Option<Duration> {
    meeting
        .turn_duration_ms
        .and_then(|ms| u64::try_from(ms).ok())
        .map(Duration::from_millis)
}
