//! Replies and out-of-band notifications

use iris_core::{IrisError, Mode, Priority, RunState, TargetRef};
use iris_engine::{OutOfBandNotification, ResponseCommand};
use iris_test_utils::{email_user, incident, plan, user, Harness};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn harness() -> Harness {
    Harness::builder()
        .user(user("alice"))
        .user(user("bob"))
        .plan(plan("p", TargetRef::user("alice"), &[60, 60]))
        .build()
}

#[tokio::test(start_paused = true)]
async fn claim_by_message_id_resolves_with_sender_as_owner() {
    let h = harness();
    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;
    let sent = h.plugin(&Mode::im()).sent_to("alice");
    let message_id = sent[0].message_id;

    let resolved = h
        .engine
        .handle_response(&Mode::sms(), "+1-555-alice", &format!("claim {}", message_id.0))
        .await
        .unwrap();
    assert_eq!(resolved, vec![id]);

    let run = h.snapshot(id).await;
    assert_eq!(run.state, RunState::Resolved);
    assert_eq!(run.owner.as_deref(), Some("alice"));
    assert!(!h.engine.is_timer_armed(&id));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn id_first_and_lowercase_replies_are_understood() {
    let h = harness();
    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;
    let message_id = h.plugin(&Mode::im()).sent()[0].message_id;

    let text = format!("{} CLAIM on it", message_id.0.to_string().to_lowercase());
    h.engine
        .handle_response(&Mode::im(), "@bob", &text)
        .await
        .unwrap();
    assert_eq!(h.snapshot(id).await.owner.as_deref(), Some("bob"));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn claim_last_uses_latest_delivery_to_the_sender() {
    let h = harness();
    h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;
    let latest = h.engine.start_run(incident("db", "p", "cpu hot")).await.unwrap();
    h.settle().await;

    let resolved = h
        .engine
        .handle_response(&Mode::im(), "@alice", "claim last")
        .await
        .unwrap();
    assert_eq!(resolved, vec![latest]);
    assert_eq!(h.engine.active_runs(), 1);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn claim_last_from_unknown_sender_is_rejected() {
    let h = harness();
    h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;

    let err = h
        .engine
        .handle_response(&Mode::sms(), "+1-555-stranger", "claim")
        .await
        .unwrap_err();
    assert!(matches!(err, IrisError::InvalidResponse(_)));

    // known user that never received anything
    let err = h
        .engine
        .handle_response(&Mode::im(), "@bob", "claim last")
        .await
        .unwrap_err();
    assert!(matches!(err, IrisError::InvalidResponse(_)));
    assert_eq!(h.engine.active_runs(), 1);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_message_id_is_rejected() {
    let h = harness();
    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;

    let err = h
        .engine
        .handle_response(&Mode::im(), "@alice", "claim 01ARZ3NDEKTSV4RRFFQ69G5FAV")
        .await
        .unwrap_err();
    assert!(matches!(err, IrisError::InvalidResponse(_)));
    assert_eq!(h.snapshot(id).await.state, RunState::WaitingAck);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn gibberish_is_rejected() {
    let h = harness();
    let err = h
        .engine
        .handle_response(&Mode::im(), "@alice", "thanks, looking")
        .await
        .unwrap_err();
    assert!(matches!(err, IrisError::InvalidResponse(_)));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn suppress_resolves_without_owner() {
    let h = harness();
    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;
    let message_id = h.plugin(&Mode::im()).sent()[0].message_id;

    h.engine
        .apply_response(&Mode::im(), "@alice", ResponseCommand::Suppress(message_id.0))
        .await
        .unwrap();
    let run = h.snapshot(id).await;
    assert_eq!(run.state, RunState::Resolved);
    assert_eq!(run.owner, None);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reply_to_resolved_incident_is_harmless() {
    let h = harness();
    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;
    let message_id = h.plugin(&Mode::im()).sent()[0].message_id;
    h.engine.acknowledge(id, Some("bob".into())).await.unwrap();

    let resolved = h
        .engine
        .handle_response(&Mode::im(), "@alice", &format!("claim {}", message_id.0))
        .await
        .unwrap();
    assert_eq!(resolved, vec![id]);
    assert_eq!(h.snapshot(id).await.owner.as_deref(), Some("bob"));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn out_of_band_follows_user_mode_order() {
    let h = harness();
    let id = h
        .engine
        .notify(OutOfBandNotification::new("ops", "alice", "maintenance", "tonight 22:00"))
        .await
        .unwrap();
    h.settle().await;

    let sent = h.plugin(&Mode::im()).sent_to("alice");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_id, id);
    assert_eq!(sent[0].incident_id, None);
    assert_eq!(sent[0].subject, "maintenance");
    assert_eq!(sent[0].body, "tonight 22:00");
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn out_of_band_explicit_mode() {
    let h = harness();
    h.engine
        .notify(
            OutOfBandNotification::new("ops", "alice", "maintenance", "tonight")
                .with_mode(Mode::email())
                .with_priority(Priority::Low),
        )
        .await
        .unwrap();
    h.settle().await;

    assert!(h.plugin(&Mode::im()).sent().is_empty());
    let sent = h.plugin(&Mode::email()).sent_to("alice");
    assert_eq!(sent[0].destination, "alice@example.com");
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn out_of_band_is_never_quenched() {
    let h = harness();
    for _ in 0..3 {
        h.engine
            .notify(OutOfBandNotification::new("ops", "alice", "ping", "ping"))
            .await
            .unwrap();
    }
    h.advance(Duration::from_secs(1)).await;
    assert_eq!(h.plugin(&Mode::im()).calls(), 3);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn out_of_band_to_unknown_user_or_mode_fails() {
    let h = Harness::builder().user(email_user("carol")).build();

    let err = h
        .engine
        .notify(OutOfBandNotification::new("ops", "nobody", "s", "b"))
        .await
        .unwrap_err();
    assert!(matches!(err, IrisError::Resolution(_)));

    let err = h
        .engine
        .notify(OutOfBandNotification::new("ops", "carol", "s", "b").with_mode(Mode::sms()))
        .await
        .unwrap_err();
    assert!(matches!(err, IrisError::Resolution(_)));
    h.engine.shutdown().await;
}
