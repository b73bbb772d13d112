//! Concern lifecycle end to end: tracking from a conversation, delivery,
//! resolution, backoff to the cap and the retention sweep.

use std::sync::Arc;

use cadence::concern::{ConcernStatus, Topic, Urgency};
use cadence::dispatch::NotificationDispatcher;
use cadence::retry::RetryPolicy;
use cadence::{Collaborators, EngineOutput, SqliteStateStore, StateStore};
use chrono::{Duration, TimeZone, Utc};

use crate::helpers::{
    FailOnceChannel, MarkerResolution, TestEngine, TriggerClassifier, at, candidate,
    follow_ups_sent, test_config,
};

fn tracked_ids(out: &[EngineOutput]) -> Vec<String> {
    out.iter()
        .filter_map(|o| match o {
            EngineOutput::ConcernTracked { concern_id, .. } => Some(concern_id.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn health_concern_reported_at_ten_is_followed_up_at_noon() {
    let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let collaborators = Collaborators::default().with_follow_up_classifier(Arc::new(
        TriggerClassifier {
            trigger: "sprained",
            candidate: candidate(Topic::Health, "sprained ankle", Urgency::Normal, 2 * 3600),
        },
    ));
    let mut te = TestEngine::start(at(1, 10, 0), store, test_config(), collaborators);

    te.handle.user_message("u1", "I sprained my ankle this morning");
    let out = te.tick_at(at(1, 10, 0)).await;
    let ids = tracked_ids(&out);
    assert_eq!(ids.len(), 1);

    assert!(follow_ups_sent(&te.tick_at(at(1, 11, 59)).await).is_empty());

    let out = te.tick_at(at(1, 12, 0)).await;
    assert_eq!(follow_ups_sent(&out), ids);
    let sent = te.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject_id, "u1");
    assert!(sent[0].text.contains("sprained ankle"));
}

#[tokio::test]
async fn resolved_concern_is_never_dispatched() {
    let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let collaborators = Collaborators::default()
        .with_follow_up_classifier(Arc::new(TriggerClassifier {
            trigger: "deadline",
            candidate: candidate(Topic::Work, "the quarterly report", Urgency::High, 3600),
        }))
        .with_resolution_classifier(Arc::new(MarkerResolution { marker: "submitted" }));
    let mut te = TestEngine::start(at(1, 10, 0), store, test_config(), collaborators);

    te.handle.user_message("u1", "the report deadline is Friday");
    let ids = tracked_ids(&te.tick_at(at(1, 10, 0)).await);
    assert_eq!(ids.len(), 1);

    te.handle.user_message("u1", "report submitted!");
    let out = te.tick_at(at(1, 10, 30)).await;
    assert!(out.iter().any(|o| matches!(
        o,
        EngineOutput::ConcernResolved { concern_id, .. } if *concern_id == ids[0]
    )));

    let out = te
        .run_until(at(3, 10, 0), Duration::minutes(30))
        .await;
    assert!(follow_ups_sent(&out).is_empty());
    assert_eq!(te.channel.sent_for(&ids[0]), 0);

    let concern = te.engine.tracker().get(&ids[0]).unwrap().unwrap();
    assert_eq!(concern.status, ConcernStatus::Resolved);
    assert!(concern.resolved_at.is_some());
}

#[tokio::test]
async fn capped_concern_is_abandoned_and_swept_after_retention() {
    let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let mut te = TestEngine::start(
        at(1, 10, 0),
        store.clone(),
        test_config(),
        Collaborators::default(),
    );
    let concern = te.track("u1", &candidate(Topic::General, "the new bike", Urgency::Normal, 3600));
    assert_eq!(concern.max_follow_ups, 2);

    let out = te.run_until(at(1, 20, 0), Duration::minutes(30)).await;
    assert_eq!(
        follow_ups_sent(&out),
        vec![concern.concern_id.clone(), concern.concern_id.clone()]
    );
    assert!(out.iter().any(|o| matches!(
        o,
        EngineOutput::FollowUpSent { abandoned: true, follow_up_count: 2, .. }
    )));

    let stored = te.engine.tracker().get(&concern.concern_id).unwrap().unwrap();
    assert_eq!(stored.status, ConcernStatus::Abandoned);
    assert!(
        store
            .due_concerns("default", at(30, 0, 0))
            .unwrap()
            .is_empty()
    );
    let audit = store.concern_audit(&concern.concern_id).unwrap();
    assert_eq!(audit.first().unwrap().status, ConcernStatus::Active);
    assert_eq!(audit.last().unwrap().status, ConcernStatus::Abandoned);

    // Still inside retention.
    te.tick_at(at(20, 10, 0)).await;
    assert!(te.engine.tracker().get(&concern.concern_id).unwrap().is_some());

    te.tick_at(Utc.with_ymd_and_hms(2024, 9, 1, 10, 0, 0).unwrap())
        .await;
    assert!(te.engine.tracker().get(&concern.concern_id).unwrap().is_none());
}

#[tokio::test]
async fn failing_channel_is_retried_and_every_channel_is_logged() {
    let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let flaky = Arc::new(FailOnceChannel::default());
    let dispatcher = NotificationDispatcher::new(
        RetryPolicy::none().with_max_attempts(1),
        std::time::Duration::from_secs(1),
    )
    .with_channel(flaky.clone());
    let mut te = TestEngine::start_with_dispatcher(
        at(1, 10, 0),
        store.clone(),
        test_config(),
        Collaborators::default(),
        dispatcher,
    );

    let concern = te.track(
        "u1",
        &candidate(Topic::Health, "sprained ankle", Urgency::Normal, 2 * 3600),
    );
    let out = te.tick_at(at(1, 12, 0)).await;

    assert_eq!(follow_ups_sent(&out), vec![concern.concern_id.clone()]);
    assert_eq!(flaky.calls(), 2);
    assert_eq!(te.channel.sent_for(&concern.concern_id), 1);
    let log = store.deliveries_since("default", at(1, 11, 0)).unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|r| r.delivered));
}
