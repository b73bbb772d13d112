//! State that must survive a restart: concerns, budget, life state and the
//! pacing window. Also clock jumps across several days.

use std::sync::Arc;

use cadence::concern::{Topic, Urgency};
use cadence::queue::{EventPayload, EventSource};
use cadence::timing::TimingReason;
use cadence::{Collaborators, EngineOutput, LifeState, SqliteStateStore};

use crate::helpers::{ScriptedCompletion, TestEngine, at, candidate, follow_ups_sent, test_config};

fn task(te: &TestEngine, name: &str) {
    te.handle.submit_payload(
        EventPayload::ScheduledTask {
            task: name.to_owned(),
        },
        EventSource::Internal,
    );
}

fn generated_activities(out: &[EngineOutput]) -> Vec<bool> {
    out.iter()
        .filter_map(|o| match o {
            EngineOutput::Activity { generated, .. } => Some(*generated),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn restart_resumes_concerns_budget_and_life_state() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state").join("cadence.db");
    let completion = ScriptedCompletion::new("done");

    let concern_id = {
        let store = Arc::new(SqliteStateStore::open(&db).unwrap());
        let mut te = TestEngine::start(
            at(1, 7, 30),
            store,
            test_config(),
            Collaborators::default().with_completion(completion.clone()),
        );
        task(&te, "stretch");
        let out = te.tick_at(at(1, 7, 30)).await;
        assert_eq!(generated_activities(&out), vec![true]);
        te.track("u1", &candidate(Topic::Work, "the slides", Urgency::Normal, 3600))
            .concern_id
    };

    let store = Arc::new(SqliteStateStore::open(&db).unwrap());
    let mut te = TestEngine::start(at(1, 8, 30), store, test_config(), Collaborators::default());
    assert_eq!(te.engine.life_state(), LifeState::Active);
    assert_eq!(te.handle.snapshot().calls_used, 1);

    let out = te.tick_at(at(1, 8, 30)).await;
    assert_eq!(follow_ups_sent(&out), vec![concern_id]);
}

#[tokio::test]
async fn pacing_window_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cadence.db");
    let mut config = test_config();
    config.pacing.max_notifications_per_hour = 1;

    {
        let store = Arc::new(SqliteStateStore::open(&db).unwrap());
        let mut te = TestEngine::start(at(1, 10, 0), store, config.clone(), Collaborators::default());
        te.track("u1", &candidate(Topic::Work, "report", Urgency::Normal, 3600));
        te.track("u1", &candidate(Topic::Task, "taxes", Urgency::Normal, 3600));
        let out = te.tick_at(at(1, 11, 0)).await;
        assert_eq!(follow_ups_sent(&out).len(), 1);
    }

    let store = Arc::new(SqliteStateStore::open(&db).unwrap());
    let mut te = TestEngine::start(at(1, 11, 20), store, config, Collaborators::default());
    let out = te.tick_at(at(1, 11, 20)).await;
    assert!(follow_ups_sent(&out).is_empty());
    assert!(out.iter().any(|o| matches!(
        o,
        EngineOutput::FollowUpDeferred { reason: TimingReason::RateLimited, .. }
    )));
}

#[tokio::test]
async fn budget_rolls_over_once_across_a_multi_day_jump() {
    let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let completion = ScriptedCompletion::new("done");
    let mut config = test_config();
    config.budget.daily_quota = 2;
    let mut te = TestEngine::start(
        at(1, 7, 30),
        store,
        config,
        Collaborators::default().with_completion(completion.clone()),
    );

    for name in ["a", "b", "c"] {
        task(&te, name);
    }
    let out = te.tick_at(at(1, 7, 30)).await;
    assert_eq!(generated_activities(&out), vec![true, true, false]);
    assert_eq!(te.handle.snapshot().budget_remaining, 0);

    task(&te, "d");
    let out = te.tick_at(at(4, 7, 30)).await;
    assert_eq!(generated_activities(&out), vec![true]);
    let snap = te.handle.snapshot();
    assert_eq!(snap.calls_used, 1);
    assert_eq!(snap.budget_remaining, 1);

    // Going back in time never hands out a fresh day.
    te.tick_at(at(3, 7, 30)).await;
    assert_eq!(te.handle.snapshot().calls_used, 1);
    assert_eq!(completion.calls(), 3);
}
