//! Timing rules as seen through the running engine.

use std::sync::Arc;

use cadence::concern::{Topic, Urgency};
use cadence::timing::TimingReason;
use cadence::{Collaborators, EngineOutput, SqliteStateStore};
use chrono::Duration;

use crate::helpers::{TestEngine, at, candidate, follow_ups_sent, test_config};

fn deferrals(out: &[EngineOutput]) -> Vec<(String, chrono::DateTime<chrono::Utc>, TimingReason)> {
    out.iter()
        .filter_map(|o| match o {
            EngineOutput::FollowUpDeferred {
                concern_id,
                until,
                reason,
            } => Some((concern_id.clone(), *until, *reason)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn concern_due_in_quiet_hours_waits_for_the_wake_boundary() {
    let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let mut te = TestEngine::start(at(1, 22, 30), store, test_config(), Collaborators::default());
    let concern = te.track("u1", &candidate(Topic::Health, "a headache", Urgency::Normal, 2 * 3600));

    let out = te.tick_at(at(2, 0, 30)).await;
    let deferred = deferrals(&out);
    assert_eq!(deferred.len(), 1);
    let (id, until, reason) = deferred[0].clone();
    assert_eq!(id, concern.concern_id);
    assert_eq!(reason, TimingReason::QuietHours);
    assert!(until >= at(2, 7, 0) && until <= at(2, 7, 10), "{until}");
    assert!(te.channel.sent().is_empty());

    let out = te.tick_at(until).await;
    assert_eq!(follow_ups_sent(&out), vec![concern.concern_id]);
}

#[tokio::test]
async fn critical_concern_bypasses_quiet_hours() {
    let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let mut te = TestEngine::start(at(1, 23, 0), store, test_config(), Collaborators::default());
    let concern = te.track("u1", &candidate(Topic::Health, "chest pain", Urgency::Critical, 1800));

    let out = te.tick_at(at(1, 23, 30)).await;
    assert!(deferrals(&out).is_empty());
    assert_eq!(follow_ups_sent(&out), vec![concern.concern_id.clone()]);
    assert_eq!(te.channel.sent()[0].text, concern.template_message());
}

#[tokio::test]
async fn eleventh_notification_in_an_hour_is_deferred_not_dropped() {
    let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let mut te = TestEngine::start(at(1, 10, 0), store, test_config(), Collaborators::default());
    for i in 0..11 {
        te.track(
            "u1",
            &candidate(Topic::Work, &format!("task {i}"), Urgency::High, 3600),
        );
    }

    let out = te.tick_at(at(1, 11, 0)).await;
    assert_eq!(follow_ups_sent(&out).len(), 10);
    let deferred = deferrals(&out);
    assert_eq!(deferred.len(), 1);
    assert_eq!(deferred[0].2, TimingReason::RateLimited);
    assert_eq!(deferred[0].1, at(1, 11, 15));

    let late = deferred[0].0.clone();
    let out = te.run_until(at(1, 12, 0), Duration::minutes(15)).await;
    assert_eq!(follow_ups_sent(&out), vec![late.clone()]);
    assert_eq!(te.channel.sent().len(), 11);
    assert_eq!(te.channel.sent_for(&late), 1);
}

#[tokio::test]
async fn other_subjects_are_not_paced_together() {
    let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
    let mut config = test_config();
    config.pacing.max_notifications_per_hour = 1;
    let mut te = TestEngine::start(at(1, 10, 0), store, config, Collaborators::default());
    te.track("u1", &candidate(Topic::Work, "report", Urgency::Normal, 3600));
    te.track("u2", &candidate(Topic::Work, "report", Urgency::Normal, 3600));

    let out = te.tick_at(at(1, 11, 0)).await;
    assert_eq!(follow_ups_sent(&out).len(), 2);
    assert!(deferrals(&out).is_empty());
}
