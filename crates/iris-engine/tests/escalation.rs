//! Escalation runs end to end: scripted plugins, in-memory stores and a
//! paused clock

use iris_core::{
    AggregationPolicy, ChannelError, DeliveryOutcome, IrisError, Mode, Plan, Priority, RunState,
    Step, StepTarget, TargetRef,
};
use iris_engine::RunEventKind;
use iris_sender::AuditRecord;
use iris_test_utils::{
    email_user, incident, plan, step, team, user, Harness, ScriptedPlugin, TEMPLATE,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

const SECOND: Duration = Duration::from_secs(1);

#[tokio::test(start_paused = true)]
async fn acknowledged_run_stops_escalating() {
    let h = Harness::builder()
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[60, 60]))
        .build();

    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;
    assert_eq!(h.plugin(&Mode::im()).calls(), 1);

    let state = h.engine.acknowledge(id, Some("alice".into())).await.unwrap();
    assert_eq!(state, RunState::Resolved);
    assert!(!h.engine.is_timer_armed(&id));

    h.advance(Duration::from_secs(300)).await;
    let run = h.snapshot(id).await;
    assert_eq!(run.state, RunState::Resolved);
    assert_eq!(run.owner.as_deref(), Some("alice"));
    assert_eq!(run.ordinal, Some(0));
    assert_eq!(h.plugin(&Mode::im()).calls(), 1);
    assert_eq!(
        run.states(),
        vec![
            RunState::Pending,
            RunState::Active,
            RunState::WaitingAck,
            RunState::Resolved
        ]
    );
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn replayed_acknowledgement_changes_nothing() {
    let h = Harness::builder()
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[60]))
        .build();

    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;
    h.engine.acknowledge(id, Some("alice".into())).await.unwrap();
    let history = h.snapshot(id).await.history.len();
    let audit = h.engine.audit().len();

    assert_eq!(
        h.engine.acknowledge(id, Some("bob".into())).await.unwrap(),
        RunState::Resolved
    );
    assert_eq!(h.engine.close(id).await.unwrap(), RunState::Resolved);
    assert_eq!(h.engine.abort(id, "late").await.unwrap(), RunState::Resolved);

    let run = h.snapshot(id).await;
    assert_eq!(run.history.len(), history);
    assert_eq!(run.owner.as_deref(), Some("alice"));
    assert_eq!(h.engine.audit().len(), audit);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_incident_is_not_found() {
    let h = Harness::builder().build();
    let err = h
        .engine
        .acknowledge(iris_core::IncidentId::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, IrisError::RunNotFound(_)));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn escalates_through_every_step_then_exhausts() {
    let h = Harness::builder()
        .user(user("alice"))
        .user(user("bob"))
        .plan(
            Plan::new("p")
                .with_step(step(0, 60, Priority::High, &[TargetRef::user("alice")]))
                .with_step(step(1, 120, Priority::Urgent, &[TargetRef::user("bob")])),
        )
        .build();

    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;
    assert_eq!(h.plugin(&Mode::im()).sent_to("alice").len(), 1);
    assert!(h.plugin(&Mode::im()).sent_to("bob").is_empty());

    // not before the step timeout
    h.advance(Duration::from_secs(59)).await;
    assert_eq!(h.snapshot(id).await.step_index, 0);

    h.advance(Duration::from_secs(2)).await;
    let run = h.snapshot(id).await;
    assert_eq!(run.state, RunState::WaitingAck);
    assert_eq!(run.ordinal, Some(1));
    assert_eq!(h.plugin(&Mode::im()).sent_to("bob").len(), 1);

    h.advance(Duration::from_secs(120)).await;
    let run = h.snapshot(id).await;
    assert_eq!(run.state, RunState::Exhausted);
    assert_eq!(
        run.states(),
        vec![
            RunState::Pending,
            RunState::Active,
            RunState::WaitingAck,
            RunState::Escalated,
            RunState::Active,
            RunState::WaitingAck,
            RunState::Escalated,
            RunState::Exhausted,
        ]
    );
    assert_eq!(h.engine.armed_timers(), 0);
    assert_eq!(h.engine.active_runs(), 0);

    // ack after exhaustion is a no-op
    assert_eq!(
        h.engine.acknowledge(id, None).await.unwrap(),
        RunState::Exhausted
    );
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_step_is_sent_again_not_quenched() {
    let h = Harness::builder()
        .user(user("alice"))
        .plan(
            Plan::new("p").with_step(
                step(0, 10, Priority::High, &[TargetRef::user("alice")]).with_repeat(1),
            ),
        )
        .build();

    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.advance(Duration::from_secs(11)).await;

    let run = h.snapshot(id).await;
    assert_eq!((run.step_index, run.round), (0, 1));
    assert_eq!(run.state, RunState::WaitingAck);
    assert_eq!(h.plugin(&Mode::im()).calls(), 2);

    h.advance(Duration::from_secs(11)).await;
    assert_eq!(h.snapshot(id).await.state, RunState::Exhausted);
    assert_eq!(h.plugin(&Mode::im()).calls(), 2);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_incident_is_quenched() {
    let h = Harness::builder()
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[60]))
        .build();

    h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.advance(2 * SECOND).await;
    let second = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;

    assert_eq!(h.plugin(&Mode::im()).calls(), 1);
    let run = h.snapshot(second).await;
    assert!(run.events().contains(&RunEventKind::StepDispatched {
        ordinal: 0,
        round: 0,
        submitted: 0,
        quenched: 1,
        held: 0,
    }));
    let quenched: Vec<u64> = h
        .engine
        .audit()
        .entries()
        .into_iter()
        .filter_map(|e| match e.record {
            AuditRecord::Quenched { suppressed, .. } => Some(suppressed),
            _ => None,
        })
        .collect();
    assert_eq!(quenched, vec![1]);

    // different content is not a duplicate
    h.engine.start_run(incident("db", "p", "cpu hot")).await.unwrap();
    h.settle().await;
    assert_eq!(h.plugin(&Mode::im()).calls(), 2);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_then_fall_back_within_one_step() {
    let h = Harness::builder()
        .plugin(ScriptedPlugin::flaky(Mode::im(), 3))
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[60]))
        .build();

    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.advance(10 * SECOND).await;

    let attempts: Vec<(Mode, u32, DeliveryOutcome)> = h
        .attempts(id)
        .into_iter()
        .map(|a| (a.mode, a.attempt, a.outcome))
        .collect();
    assert_eq!(
        attempts,
        vec![
            (Mode::im(), 1, DeliveryOutcome::TransientFailure),
            (Mode::im(), 2, DeliveryOutcome::TransientFailure),
            (Mode::im(), 3, DeliveryOutcome::TransientFailure),
            (Mode::sms(), 1, DeliveryOutcome::Success),
        ]
    );

    let run = h.snapshot(id).await;
    assert_eq!(run.state, RunState::WaitingAck);
    assert_eq!(run.step_index, 0);
    assert_eq!(run.transitions_into(RunState::WaitingAck), 1);
    assert!(run.failures.is_empty());
    assert!(run.events().contains(&RunEventKind::Delivered {
        target: "alice".into(),
        mode: Mode::sms(),
    }));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_on_every_channel_records_one_failure() {
    let h = Harness::builder()
        .plugin(ScriptedPlugin::failing(Mode::im()))
        .plugin(ScriptedPlugin::failing(Mode::sms()))
        .plugin(ScriptedPlugin::failing(Mode::email()))
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[60]))
        .build();

    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.advance(5 * SECOND).await;

    let modes: Vec<Mode> = h.attempts(id).into_iter().map(|a| a.mode).collect();
    assert_eq!(modes, vec![Mode::im(), Mode::sms(), Mode::email()]);
    assert!(h
        .attempts(id)
        .iter()
        .all(|a| a.outcome == DeliveryOutcome::PermanentFailure));

    let run = h.snapshot(id).await;
    assert_eq!(run.failures.len(), 1);
    assert_eq!(run.failures[0].target, "alice");
    assert_eq!(h.engine.audit().failures_for(id).len(), 1);
    // failure does not advance the plan
    assert_eq!(run.state, RunState::WaitingAck);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_plugin_is_an_ambiguous_failure() {
    let h = Harness::builder()
        .config(|c| c.sender.send_timeout_ms = 500)
        .plugin(ScriptedPlugin::new(Mode::im()).with_delay(5 * SECOND))
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[60]))
        .build();

    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.advance(5 * SECOND).await;

    let attempts = h.attempts(id);
    assert_eq!(attempts[0].mode, Mode::im());
    assert_eq!(attempts[0].outcome, DeliveryOutcome::Unknown);
    // one unknown attempt, then the next channel
    assert_eq!(attempts[1].mode, Mode::sms());
    assert_eq!(attempts[1].outcome, DeliveryOutcome::Success);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn at_most_one_timer_per_incident() {
    let h = Harness::builder()
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[30, 30, 30]))
        .build();

    let first = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    let second = h.engine.start_run(incident("db", "p", "cpu hot")).await.unwrap();
    assert_eq!(h.engine.armed_timers(), 2);

    for _ in 0..3 {
        h.advance(31 * SECOND).await;
        assert!(h.engine.armed_timers() <= 2);
    }
    assert_eq!(h.engine.armed_timers(), 0);

    let third = h.engine.start_run(incident("db", "p", "oom")).await.unwrap();
    assert_eq!(h.engine.armed_timers(), 1);
    h.engine.close(third).await.unwrap();
    assert_eq!(h.engine.armed_timers(), 0);

    for id in [first, second] {
        let run = h.snapshot(id).await;
        assert_eq!(run.state, RunState::Exhausted);
        assert_eq!(run.transitions_into(RunState::WaitingAck), 3);
    }
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn team_members_are_each_notified() {
    let h = Harness::builder()
        .user(user("alice"))
        .user(user("bob"))
        .team(team("dba", &[TargetRef::user("alice"), TargetRef::user("bob")]))
        .plan(plan("p", TargetRef::team("dba"), &[60]))
        .build();

    h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;

    let im = h.plugin(&Mode::im());
    assert_eq!(im.sent_to("alice").len(), 1);
    assert_eq!(im.sent_to("bob").len(), 1);
    assert_eq!(im.sent_to("alice")[0].subject, "[db] disk full");
    assert_eq!(im.sent_to("alice")[0].destination, "@alice");
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unresolvable_target_falls_back_to_plan_creator() {
    let h = Harness::builder()
        .user(email_user("carol"))
        .plan(plan("p", TargetRef::user("ghost"), &[60]).with_creator("carol"))
        .build();

    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;

    let sent = h.plugin(&Mode::email()).sent_to("carol");
    assert_eq!(sent.len(), 1);
    assert!(sent[0].body.starts_with("Iris could not reach any target"));
    assert!(sent[0].body.ends_with(&format!("({})", sent[0].message_id.0)));

    let events = h.snapshot(id).await.events();
    assert!(events
        .iter()
        .any(|e| matches!(e, RunEventKind::ResolutionFailed { .. })));
    assert!(events.contains(&RunEventKind::CreatorFallback {
        target: TargetRef::user("ghost").to_string(),
        creator: "carol".into(),
    }));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unresolvable_target_without_creator_still_waits() {
    let h = Harness::builder()
        .plan(plan("p", TargetRef::user("ghost"), &[60]))
        .build();

    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    let run = h.snapshot(id).await;
    assert_eq!(run.state, RunState::WaitingAck);
    assert!(run.events().contains(&RunEventKind::StepDispatched {
        ordinal: 0,
        round: 0,
        submitted: 0,
        quenched: 0,
        held: 0,
    }));
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn acknowledgement_drops_queued_retries() {
    let h = Harness::builder()
        .plugin(
            ScriptedPlugin::new(Mode::im())
                .with_fallback(Err(ChannelError::Transient("503".into()))),
        )
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[60]))
        .build();

    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;
    assert_eq!(h.plugin(&Mode::im()).calls(), 1);

    h.engine.acknowledge(id, None).await.unwrap();
    h.advance(30 * SECOND).await;
    assert_eq!(h.plugin(&Mode::im()).calls(), 1);
    assert!(h.plugin(&Mode::sms()).sent().is_empty());
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalidated_plan_aborts_its_live_runs() {
    let h = Harness::builder()
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[60]))
        .plan(plan("q", TargetRef::user("alice"), &[60]))
        .build();

    let a = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    let b = h.engine.start_run(incident("db", "p", "cpu hot")).await.unwrap();
    let c = h.engine.start_run(incident("db", "q", "oom")).await.unwrap();

    assert_eq!(h.engine.invalidate_plan("p").await, 2);
    for id in [a, b] {
        let run = h.snapshot(id).await;
        assert_eq!(run.state, RunState::Aborted);
        assert!(run
            .events()
            .iter()
            .any(|e| matches!(e, RunEventKind::Aborted { reason } if reason == "plan p was invalidated")));
    }
    assert_eq!(h.snapshot(c).await.state, RunState::WaitingAck);
    assert_eq!(h.engine.armed_timers(), 1);
    assert_eq!(h.engine.invalidate_plan("p").await, 0);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn resolved_incident_can_run_again() {
    let h = Harness::builder()
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[60]))
        .build();

    let incident = incident("db", "p", "disk full");
    let id = h.engine.start_run(incident.clone()).await.unwrap();
    h.settle().await;
    assert!(matches!(
        h.engine.start_run(incident.clone()).await,
        Err(IrisError::RunAlreadyActive(_))
    ));
    h.engine.close(id).await.unwrap();

    // past the quench window so the rerun is not a duplicate
    h.advance(31 * SECOND).await;
    assert_eq!(h.engine.start_run(incident).await.unwrap(), id);
    h.settle().await;
    assert_eq!(h.snapshot(id).await.state, RunState::WaitingAck);
    assert_eq!(h.plugin(&Mode::im()).calls(), 2);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rerun_ignores_retries_left_by_the_previous_run() {
    let h = Harness::builder()
        .plugin(ScriptedPlugin::flaky(Mode::im(), 1))
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[60]))
        .build();

    let incident = incident("db", "p", "disk full");
    let id = h.engine.start_run(incident.clone()).await.unwrap();
    h.settle().await;
    // first send failed transiently; its retry waits out the backoff
    assert_eq!(h.plugin(&Mode::im()).calls(), 1);
    h.engine.close(id).await.unwrap();

    let rerun = plan("q", TargetRef::user("alice"), &[60]);
    h.engine.start_run_with_plan(incident, rerun).await.unwrap();
    h.settle().await;
    assert_eq!(h.plugin(&Mode::im()).calls(), 2);

    h.advance(30 * SECOND).await;
    assert_eq!(h.plugin(&Mode::im()).calls(), 2);
    assert_eq!(h.engine.sender().queue().discarded(), 1);
    assert_eq!(h.snapshot(id).await.state, RunState::WaitingAck);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn prune_forgets_only_old_terminal_runs() {
    let h = Harness::builder()
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[600]))
        .build();

    let done = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    let live = h.engine.start_run(incident("db", "p", "cpu hot")).await.unwrap();
    h.engine.acknowledge(done, None).await.unwrap();

    assert_eq!(h.engine.prune_terminal(Duration::from_secs(60)), 0);
    h.advance(Duration::from_secs(61)).await;
    assert_eq!(h.engine.prune_terminal(Duration::from_secs(60)), 1);

    assert!(h.engine.get_run_state(done).await.is_none());
    assert_eq!(h.snapshot(live).await.state, RunState::WaitingAck);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn transitions_are_audited_and_chained() {
    let h = Harness::builder()
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[60]))
        .build();

    let id = h.engine.start_run(incident("db", "p", "disk full")).await.unwrap();
    h.settle().await;
    h.engine.acknowledge(id, None).await.unwrap();

    let transitions: Vec<(RunState, RunState)> = h
        .engine
        .audit()
        .entries()
        .into_iter()
        .filter_map(|e| match e.record {
            AuditRecord::Transition {
                incident_id,
                from,
                to,
                ..
            } if incident_id == id => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (RunState::Pending, RunState::Active),
            (RunState::Active, RunState::WaitingAck),
            (RunState::WaitingAck, RunState::Resolved),
        ]
    );
    h.engine.audit().verify_integrity().unwrap();
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn explicit_plan_bypasses_the_store() {
    let h = Harness::builder().user(user("alice")).build();
    let plan = Plan::new("adhoc").with_step(
        Step::new(0, Duration::from_secs(60)).with_target(StepTarget::new(
            TargetRef::user("alice"),
            Priority::Low,
            TEMPLATE,
        )),
    );

    let id = h
        .engine
        .start_run_with_plan(incident("db", "adhoc", "disk full"), plan)
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.snapshot(id).await.plan, "adhoc");
    assert_eq!(h.plugin(&Mode::im()).calls(), 1);
    h.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn noisy_plan_is_aggregated_into_one_batch() {
    let policy = AggregationPolicy {
        threshold_window_secs: 60,
        threshold_count: 2,
        aggregation_window_secs: 10,
        aggregation_reset_secs: 300,
    };
    let h = Harness::builder()
        .user(user("alice"))
        .plan(plan("p", TargetRef::user("alice"), &[600]).with_aggregation(policy))
        .build();

    let mut ids = Vec::new();
    for title in ["a", "b", "c", "d", "e"] {
        ids.push(h.engine.start_run(incident("db", "p", title)).await.unwrap());
    }
    h.settle().await;
    assert_eq!(h.plugin(&Mode::im()).calls(), 2);
    assert!(h.snapshot(ids[4]).await.events().contains(&RunEventKind::StepDispatched {
        ordinal: 0,
        round: 0,
        submitted: 0,
        quenched: 0,
        held: 1,
    }));

    h.advance(11 * SECOND).await;
    let sent = h.plugin(&Mode::im()).sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[2].subject, "[db] 3 messages from plan p");

    // one claim covers every incident of the batch
    let mut resolved = h
        .engine
        .handle_response(&Mode::im(), "@alice", "claim last")
        .await
        .unwrap();
    resolved.sort();
    let mut expected = ids[2..].to_vec();
    expected.sort();
    assert_eq!(resolved, expected);
    assert_eq!(h.engine.active_runs(), 2);
    h.engine.shutdown().await;
}
