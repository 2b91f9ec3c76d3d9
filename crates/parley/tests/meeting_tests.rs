//! Meeting turn coordinator integration tests.
//!
//! Runs against the in-memory store and lock manager. Turn-timer tests use
//! tokio's paused clock (`start_paused`) with explicit time advancement.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use parley::models::{MeetingStatus, MessageKind, ParticipantStatus};
use parley::{ContextKind, EventKind, MeetingId, ParleyError, Storage, TurnOutcome};
use parley_test_utils::{EventRecorder, TestHarness};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Poll until `cond` holds; panics if it never does within the budget.
async fn eventually<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within budget");
}

/// Three-agent harness: host + bob + carol, everyone attended.
async fn ready_meeting(harness: &TestHarness) -> MeetingId {
    ready_meeting_with_turns(harness, None).await
}

async fn ready_meeting_with_turns(
    harness: &TestHarness,
    turn_duration: Option<Duration>,
) -> MeetingId {
    let meeting = harness
        .sdk
        .create_meeting("host", &["bob", "carol"], turn_duration)
        .await
        .unwrap();
    harness
        .sdk
        .attend_meeting("bob", meeting.meeting_id)
        .await
        .unwrap();
    harness
        .sdk
        .attend_meeting("carol", meeting.meeting_id)
        .await
        .unwrap();
    meeting.meeting_id
}

#[tokio::test]
async fn test_meeting_lifecycle_created_ready_active_ended() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;

    let meeting = harness
        .sdk
        .create_meeting("host", &["bob", "carol"], None)
        .await
        .unwrap();
    let meeting_id = meeting.meeting_id;
    assert_eq!(meeting.status, MeetingStatus::Created);

    harness.sdk.attend_meeting("bob", meeting_id).await.unwrap();
    assert_eq!(
        harness.sdk.meeting(meeting_id).await.unwrap().status,
        MeetingStatus::Created
    );

    harness
        .sdk
        .attend_meeting("carol", meeting_id)
        .await
        .unwrap();
    assert_eq!(
        harness.sdk.meeting(meeting_id).await.unwrap().status,
        MeetingStatus::Ready
    );

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({ "agenda": "standup" }), None)
        .await
        .unwrap();
    let active = harness.sdk.meeting(meeting_id).await.unwrap();
    assert_eq!(active.status, MeetingStatus::Active);
    assert!(active.started_at.is_some());

    harness.sdk.end_meeting("host", meeting_id).await.unwrap();
    let ended = harness.sdk.meeting(meeting_id).await.unwrap();
    assert_eq!(ended.status, MeetingStatus::Ended);
    assert!(ended.ended_at.is_some());
    assert_eq!(ended.current_speaker_id, None);

    harness.assert_no_outstanding_locks();
}

#[tokio::test]
async fn test_start_requires_ready_status_and_host() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;
    let meeting = harness
        .sdk
        .create_meeting("host", &["bob", "carol"], None)
        .await
        .unwrap();
    let meeting_id = meeting.meeting_id;

    // Not everyone has attended yet.
    let result = harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), None)
        .await;
    assert!(matches!(result, Err(ParleyError::InvalidState(_))));

    harness.sdk.attend_meeting("bob", meeting_id).await.unwrap();
    harness
        .sdk
        .attend_meeting("carol", meeting_id)
        .await
        .unwrap();

    // Ready now, but bob is not the host.
    let result = harness
        .sdk
        .start_meeting("bob", meeting_id, &json!({}), None)
        .await;
    assert!(matches!(result, Err(ParleyError::PermissionDenied(_))));

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), None)
        .await
        .unwrap();

    harness.assert_no_outstanding_locks();
}

#[tokio::test]
async fn test_explicit_first_speaker_then_round_robin_assigns_next() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;
    let recorder = EventRecorder::new();
    harness
        .sdk
        .subscribe(EventKind::TurnChanged, recorder.subscriber());

    let meeting_id = ready_meeting(&harness).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({ "agenda": "go" }), Some("bob"))
        .await
        .unwrap();

    let bob = harness.sdk.agent("bob").await.unwrap();
    let meeting = harness.sdk.meeting(meeting_id).await.unwrap();
    assert_eq!(meeting.current_speaker_id, Some(bob.agent_id));

    // Bob speaks with no explicit next; carol follows by join order.
    harness
        .sdk
        .speak("bob", meeting_id, &json!({ "text": "my update" }), None)
        .await
        .unwrap();

    let carol = harness.sdk.agent("carol").await.unwrap();
    let meeting = harness.sdk.meeting(meeting_id).await.unwrap();
    assert_eq!(meeting.current_speaker_id, Some(carol.agent_id));

    // The turn-changed event carries previous=bob, current=carol.
    eventually(|| recorder.events().len() >= 2).await;
    let events = recorder.events();
    match &events[1].data {
        parley::EventData::TurnChanged { previous, current } => {
            assert_eq!(previous.as_deref(), Some("bob"));
            assert_eq!(current, "carol");
        }
        other => panic!("expected a turn change, got {other:?}"),
    }

    harness.assert_no_outstanding_locks();
}

#[tokio::test]
async fn test_round_robin_cycles_in_join_order() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;
    let meeting_id = ready_meeting(&harness).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), None)
        .await
        .unwrap();

    // Round-robin head is the host (join order 0).
    let mut spoken = Vec::new();
    for _ in 0..6 {
        let meeting = harness.sdk.meeting(meeting_id).await.unwrap();
        let speaker_id = meeting.current_speaker_id.unwrap();
        let speaker = harness
            .store
            .agent_by_id(speaker_id)
            .await
            .unwrap()
            .unwrap();
        spoken.push(speaker.external_id.clone());
        harness
            .sdk
            .speak(&speaker.external_id, meeting_id, &json!({}), None)
            .await
            .unwrap();
    }

    assert_eq!(spoken, ["host", "bob", "carol", "host", "bob", "carol"]);
    harness.assert_no_outstanding_locks();
}

#[tokio::test]
async fn test_round_robin_skips_left_participants() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;
    let meeting_id = ready_meeting(&harness).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), None)
        .await
        .unwrap();

    harness
        .sdk
        .leave_meeting("bob", meeting_id)
        .await
        .unwrap();

    let mut spoken = Vec::new();
    for _ in 0..4 {
        let meeting = harness.sdk.meeting(meeting_id).await.unwrap();
        let speaker = harness
            .store
            .agent_by_id(meeting.current_speaker_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        spoken.push(speaker.external_id.clone());
        harness
            .sdk
            .speak(&speaker.external_id, meeting_id, &json!({}), None)
            .await
            .unwrap();
    }

    assert_eq!(spoken, ["host", "carol", "host", "carol"]);
    harness.assert_no_outstanding_locks();
}

#[tokio::test]
async fn test_turn_exclusivity_under_concurrent_speak() {
    let harness = Arc::new(TestHarness::with_agents(&["host", "bob", "carol"]).await);
    let meeting_id = ready_meeting(&harness).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), None)
        .await
        .unwrap();

    // Host keeps the turn explicitly, so exactly one of the three
    // concurrent attempts can ever validate against the fresh state.
    let mut attempts = Vec::new();
    for agent in ["host", "bob", "carol"] {
        let harness = Arc::clone(&harness);
        attempts.push(tokio::spawn(async move {
            harness
                .sdk
                .speak(agent, meeting_id, &json!({ "from": agent }), Some("host"))
                .await
        }));
    }

    let mut successes = 0;
    let mut not_your_turn = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(message) => {
                successes += 1;
                // The winner is the agent that held the turn at call time.
                let host = harness.sdk.agent("host").await.unwrap();
                assert_eq!(message.sender_id, host.agent_id);
            }
            Err(ParleyError::NotYourTurn { .. }) => not_your_turn += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(not_your_turn, 2);
    harness.assert_no_outstanding_locks();
}

#[tokio::test(start_paused = true)]
async fn test_turn_timeout_advances_speaker_and_orders_events() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;
    let recorder = EventRecorder::new();
    harness
        .sdk
        .subscribe(EventKind::TimeoutOccurred, recorder.subscriber());
    harness
        .sdk
        .subscribe(EventKind::TurnChanged, recorder.subscriber());

    let meeting_id = ready_meeting_with_turns(&harness, Some(Duration::from_secs(1))).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), None)
        .await
        .unwrap();

    let host = harness.sdk.agent("host").await.unwrap();
    let bob = harness.sdk.agent("bob").await.unwrap();
    assert_eq!(
        harness.sdk.meeting(meeting_id).await.unwrap().current_speaker_id,
        Some(host.agent_id)
    );

    // Nobody speaks; the turn timer fires.
    tokio::time::advance(Duration::from_millis(1100)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let meeting = harness.sdk.meeting(meeting_id).await.unwrap();
    assert_eq!(meeting.current_speaker_id, Some(bob.agent_id));

    // A synthetic timeout message was recorded for the lapsed turn.
    let timeout_messages = harness
        .sdk
        .messages(parley::MessageQuery {
            meeting_id: Some(meeting_id),
            kind: Some(MessageKind::Timeout),
            ..parley::MessageQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(timeout_messages.len(), 1);
    assert_eq!(timeout_messages[0].sender_id, host.agent_id);

    // timeout-occurred fires before the turn-changed it causes.
    eventually(|| recorder.kinds().len() >= 3).await;
    let kinds = recorder.kinds();
    assert_eq!(
        &kinds[kinds.len() - 2..],
        &[EventKind::TimeoutOccurred, EventKind::TurnChanged]
    );

    harness.assert_no_outstanding_locks();
}

#[tokio::test(start_paused = true)]
async fn test_speak_rearms_the_turn_timer() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;
    let meeting_id = ready_meeting_with_turns(&harness, Some(Duration::from_secs(1))).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), None)
        .await
        .unwrap();

    // Speak at 600 ms; the fresh turn runs until 1600 ms.
    tokio::time::advance(Duration::from_millis(600)).await;
    harness
        .sdk
        .speak("host", meeting_id, &json!({}), None)
        .await
        .unwrap();

    tokio::time::advance(Duration::from_millis(700)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let no_timeouts = harness
        .sdk
        .messages(parley::MessageQuery {
            meeting_id: Some(meeting_id),
            kind: Some(MessageKind::Timeout),
            ..parley::MessageQuery::default()
        })
        .await
        .unwrap();
    assert!(no_timeouts.is_empty(), "the lapsed timer must not fire");

    // The re-armed timer fires at 1600 ms.
    tokio::time::advance(Duration::from_millis(400)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let timeouts = harness
        .sdk
        .messages(parley::MessageQuery {
            meeting_id: Some(meeting_id),
            kind: Some(MessageKind::Timeout),
            ..parley::MessageQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(timeouts.len(), 1);

    harness.assert_no_outstanding_locks();
}

#[tokio::test]
async fn test_leave_while_speaking_advances_turn_first() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;
    let meeting_id = ready_meeting(&harness).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), Some("bob"))
        .await
        .unwrap();

    harness.sdk.leave_meeting("bob", meeting_id).await.unwrap();

    // The meeting is never left without a speaker.
    let carol = harness.sdk.agent("carol").await.unwrap();
    let meeting = harness.sdk.meeting(meeting_id).await.unwrap();
    assert_eq!(meeting.current_speaker_id, Some(carol.agent_id));

    let bob = harness.sdk.agent("bob").await.unwrap();
    let participants = harness.sdk.meeting_participants(meeting_id).await.unwrap();
    let bob_row = participants
        .iter()
        .find(|p| p.agent_id == bob.agent_id)
        .unwrap();
    assert_eq!(bob_row.status, ParticipantStatus::Left);
    assert!(bob_row.left_at.is_some());

    harness.assert_no_outstanding_locks();
}

#[tokio::test]
async fn test_host_cannot_leave_and_only_host_ends() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;
    let meeting_id = ready_meeting(&harness).await;

    let result = harness.sdk.leave_meeting("host", meeting_id).await;
    assert!(matches!(result, Err(ParleyError::PermissionDenied(_))));

    let result = harness.sdk.end_meeting("bob", meeting_id).await;
    assert!(matches!(result, Err(ParleyError::PermissionDenied(_))));

    harness.sdk.end_meeting("host", meeting_id).await.unwrap();
    harness.assert_no_outstanding_locks();
}

#[tokio::test]
async fn test_speak_out_of_turn_is_rejected() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;
    let meeting_id = ready_meeting(&harness).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), Some("bob"))
        .await
        .unwrap();

    let result = harness
        .sdk
        .speak("carol", meeting_id, &json!({}), None)
        .await;

    match result {
        Err(ParleyError::NotYourTurn { current }) => assert_eq!(current, "bob"),
        other => panic!("expected NotYourTurn, got {other:?}"),
    }

    harness.assert_no_outstanding_locks();
}

#[tokio::test]
async fn test_pass_turn_advances_without_user_payload() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;
    let meeting_id = ready_meeting(&harness).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), None)
        .await
        .unwrap();

    let passed = harness
        .sdk
        .pass_turn("host", meeting_id, Some("carol"))
        .await
        .unwrap();
    assert_eq!(passed.kind, MessageKind::System);

    let carol = harness.sdk.agent("carol").await.unwrap();
    let meeting = harness.sdk.meeting(meeting_id).await.unwrap();
    assert_eq!(meeting.current_speaker_id, Some(carol.agent_id));

    harness.assert_no_outstanding_locks();
}

#[tokio::test(start_paused = true)]
async fn test_end_meeting_wakes_parked_turn_waiters() {
    let harness = Arc::new(TestHarness::with_agents(&["host", "bob", "carol"]).await);
    let meeting_id = ready_meeting(&harness).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), Some("bob"))
        .await
        .unwrap();

    let waiter = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move {
            harness
                .sdk
                .wait_for_turn("carol", meeting_id, Duration::from_secs(60))
                .await
        })
    };

    // Give the waiter time to park, then end the meeting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.sdk.end_meeting("host", meeting_id).await.unwrap();

    let outcome = waiter.await.unwrap().unwrap();
    assert!(matches!(outcome, TurnOutcome::MeetingEnded));

    assert_eq!(harness.sdk.parked_waiters(), 0);
    harness.assert_no_outstanding_locks();
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_turn_returns_missed_messages() {
    let harness = Arc::new(TestHarness::with_agents(&["host", "bob", "carol"]).await);
    let meeting_id = ready_meeting(&harness).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), Some("bob"))
        .await
        .unwrap();

    let waiter = {
        let harness = Arc::clone(&harness);
        tokio::spawn(async move {
            harness
                .sdk
                .wait_for_turn("carol", meeting_id, Duration::from_secs(60))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    harness
        .sdk
        .speak("bob", meeting_id, &json!({ "text": "over to carol" }), Some("carol"))
        .await
        .unwrap();

    let outcome = waiter.await.unwrap().unwrap();
    match outcome {
        TurnOutcome::YourTurn(missed) => {
            assert!(missed
                .iter()
                .any(|m| m.content == json!({ "text": "over to carol" })));
        }
        other => panic!("expected the turn, got {other:?}"),
    }

    harness.assert_no_outstanding_locks();
}

#[tokio::test]
async fn test_wait_for_turn_when_already_speaker_is_immediate() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;
    let meeting_id = ready_meeting(&harness).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), None)
        .await
        .unwrap();

    let outcome = harness
        .sdk
        .wait_for_turn("host", meeting_id, Duration::from_secs(1))
        .await
        .unwrap();
    match outcome {
        TurnOutcome::YourTurn(missed) => assert!(missed.is_empty()),
        other => panic!("expected an immediate turn, got {other:?}"),
    }
}

#[tokio::test]
async fn test_meeting_fan_out_reaches_other_participants() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;

    let bob_calls = Arc::new(AtomicUsize::new(0));
    let carol_calls = Arc::new(AtomicUsize::new(0));
    for (agent, counter) in [("bob", &bob_calls), ("carol", &carol_calls)] {
        let counter = Arc::clone(counter);
        harness.sdk.register_handler(
            agent,
            ContextKind::Meeting,
            parley::handler_fn(move |_payload, _ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            }),
        );
    }

    let meeting_id = ready_meeting(&harness).await;
    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), None)
        .await
        .unwrap();
    harness
        .sdk
        .speak("host", meeting_id, &json!({ "text": "hello all" }), None)
        .await
        .unwrap();

    harness.sdk.shutdown().await;

    // Opening message + host's speak each reached bob and carol once.
    assert_eq!(bob_calls.load(Ordering::SeqCst), 2);
    assert_eq!(carol_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_end_meeting_notifies_system_handlers() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;

    let notified = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&notified);
    harness.sdk.register_default_handler(
        ContextKind::System,
        parley::handler_fn(move |payload, ctx| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(payload, json!({ "event": "meeting_ended" }));
                assert_eq!(ctx.kind, ContextKind::System);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        }),
    );

    let meeting_id = ready_meeting(&harness).await;
    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), None)
        .await
        .unwrap();
    harness.sdk.end_meeting("host", meeting_id).await.unwrap();

    harness.sdk.shutdown().await;
    // bob and carol each notified; the host initiated the end.
    assert_eq!(notified.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_attend_validations() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol", "mallory"]).await;

    let result = harness.sdk.attend_meeting("bob", MeetingId::new()).await;
    assert!(matches!(result, Err(ParleyError::MeetingNotFound(_))));

    let meeting = harness
        .sdk
        .create_meeting("host", &["bob", "carol"], None)
        .await
        .unwrap();

    // Not invited.
    let result = harness
        .sdk
        .attend_meeting("mallory", meeting.meeting_id)
        .await;
    assert!(matches!(
        result,
        Err(ParleyError::ParticipantNotFound { .. })
    ));

    // Attending twice is a state error.
    harness
        .sdk
        .attend_meeting("bob", meeting.meeting_id)
        .await
        .unwrap();
    let result = harness.sdk.attend_meeting("bob", meeting.meeting_id).await;
    assert!(matches!(result, Err(ParleyError::InvalidState(_))));
}

#[tokio::test]
async fn test_meeting_audit_trail_is_appended() {
    let harness = TestHarness::with_agents(&["host", "bob", "carol"]).await;
    let meeting_id = ready_meeting(&harness).await;

    harness
        .sdk
        .start_meeting("host", meeting_id, &json!({}), None)
        .await
        .unwrap();
    harness
        .sdk
        .speak("host", meeting_id, &json!({}), None)
        .await
        .unwrap();
    harness.sdk.end_meeting("host", meeting_id).await.unwrap();

    let kinds: Vec<String> = harness
        .sdk
        .meeting_events(meeting_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();

    assert_eq!(
        kinds,
        [
            "meeting_created",
            "participant_joined",
            "participant_joined",
            "meeting_started",
            "turn_changed",
            "meeting_ended",
        ]
    );
}
