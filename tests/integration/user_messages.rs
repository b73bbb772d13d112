//! User messages and activities through the engine.

use std::sync::Arc;

use cadence::concern::{Topic, Urgency};
use cadence::queue::{EventPayload, EventSource};
use cadence::{Collaborators, EngineError, EngineOutput, LifeState, SqliteStateStore, StateStore};

use crate::helpers::{
    FlakyStore, ScriptedCompletion, TestEngine, TriggerClassifier, at, candidate, test_config,
};

fn replies(out: &[EngineOutput]) -> Vec<(String, bool)> {
    out.iter()
        .filter_map(|o| match o {
            EngineOutput::Reply { text, generated, .. } => Some((text.clone(), *generated)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn message_while_sleeping_is_answered_even_without_budget() {
    let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let completion = ScriptedCompletion::new("I'm awake, what's up?");
    let mut config = test_config();
    config.budget.daily_quota = 0;
    let mut te = TestEngine::start(
        at(1, 3, 0),
        store,
        config,
        Collaborators::default().with_completion(completion.clone()),
    );
    assert_eq!(te.engine.life_state(), LifeState::Sleeping);

    te.handle.user_message("u1", "can't sleep");
    let out = te.tick_at(at(1, 3, 0)).await;

    assert_eq!(replies(&out), vec![("I'm awake, what's up?".to_owned(), true)]);
    assert_eq!(te.engine.life_state(), LifeState::Active);
    assert_eq!(completion.calls(), 1);
    let snap = te.handle.snapshot();
    assert_eq!(snap.calls_used, 1);
    assert_eq!(snap.budget_remaining, 0);
}

#[tokio::test]
async fn activities_spend_budget_only_when_the_routine_allows_them() {
    let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let completion = ScriptedCompletion::new("reflected");
    let mut te = TestEngine::start(
        at(1, 20, 30),
        store,
        test_config(),
        Collaborators::default().with_completion(completion.clone()),
    );

    te.handle.submit_payload(
        EventPayload::GoalCheckpoint {
            goal: "run a half marathon".into(),
        },
        EventSource::External("planner".into()),
    );
    te.handle.submit_payload(
        EventPayload::ScheduledTask {
            task: "order groceries".into(),
        },
        EventSource::External("planner".into()),
    );
    let out = te.tick_at(at(1, 20, 30)).await;

    let activities: Vec<(String, bool)> = out
        .iter()
        .filter_map(|o| match o {
            EngineOutput::Activity { text, generated, .. } => Some((text.clone(), *generated)),
            _ => None,
        })
        .collect();
    assert_eq!(
        activities,
        vec![
            ("reflected".to_owned(), true),
            ("Scheduled task noted: order groceries".to_owned(), false),
        ]
    );
    assert_eq!(completion.calls(), 1);
    assert_eq!(te.handle.snapshot().calls_used, 1);
}

#[tokio::test]
async fn store_outage_aborts_the_tick_and_keeps_the_event() {
    let inner = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let store = FlakyStore::new(inner);
    let mut te = TestEngine::start(
        at(1, 10, 0),
        store.clone(),
        test_config(),
        Collaborators::default(),
    );

    store.set_failing(true);
    te.handle.user_message("u1", "hello?");
    let err = te.engine.tick().await.unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
    assert!(replies(&te.drain()).is_empty());

    store.set_failing(false);
    let out = te.tick_at(at(1, 10, 0)).await;
    assert!(replies(&out).is_empty(), "held event must not be retried at once");
    assert_eq!(te.handle.snapshot().queue_len, 1);

    let out = te.tick_at(at(1, 10, 1)).await;
    assert_eq!(replies(&out).len(), 1);
    assert_eq!(te.handle.snapshot().queue_len, 0);
}

#[tokio::test]
async fn store_outage_does_not_spin_the_running_loop() {
    let inner = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let store = FlakyStore::new(inner);
    let te = TestEngine::start(
        at(1, 10, 0),
        store.clone(),
        test_config(),
        Collaborators::default(),
    );

    store.set_failing(true);
    let before = store.calls();
    te.handle.user_message("u1", "anyone there?");
    let handle = te.handle.clone();
    let task = te.engine.spawn();

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    let calls = store.calls() - before;
    handle.shutdown();
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), task)
        .await
        .expect("loop stops after shutdown")
        .expect("loop task joins");

    assert!(result.is_ok());
    assert!(calls < 10, "{calls} store calls during the outage");
}

#[tokio::test]
async fn message_retried_after_failed_save_tracks_and_charges_once() {
    let inner = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let store = FlakyStore::new(inner.clone());
    let collaborators = Collaborators::default()
        .with_completion(ScriptedCompletion::new("Sorry about the knee."))
        .with_follow_up_classifier(Arc::new(TriggerClassifier {
            trigger: "knee",
            candidate: candidate(Topic::Health, "sore knee", Urgency::Normal, 2 * 3600),
        }));
    let mut te = TestEngine::start(at(1, 10, 0), store.clone(), test_config(), collaborators);

    store.fail_budget_saves(1);
    te.handle.user_message("u1", "my knee is sore again");
    let err = te.engine.tick().await.unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
    let mut out = te.drain();

    out.extend(te.tick_at(at(1, 10, 1)).await);
    let tracked = out
        .iter()
        .filter(|o| matches!(o, EngineOutput::ConcernTracked { .. }))
        .count();
    assert_eq!(tracked, 1);
    assert_eq!(replies(&out).len(), 1);
    assert_eq!(
        inner.active_concerns_for_subject("default", "u1").unwrap().len(),
        1
    );
    assert_eq!(te.handle.snapshot().calls_used, 1);
    assert_eq!(inner.load_budget("default").unwrap().unwrap().calls_used, 1);
}
