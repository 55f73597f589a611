use std::collections::HashSet;

use serde_json::json;

use fieldsync::{
    core::{
        backoff::Backoff,
        queue::{CoalescePolicy, MutationQueue, QueueConfig, QueueError, QueueWrite},
    },
    engine::traits::ProcessorError,
    types::MutationStatus,
};

fn no_jitter(max_retries: u32) -> QueueConfig {
    QueueConfig {
        max_retries,
        backoff: Backoff {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ratio: 0.0,
        },
        ..QueueConfig::default()
    }
}

#[test]
fn enqueued_ids_are_pairwise_distinct() {
    let mut queue = MutationQueue::new(QueueConfig::default());
    let mut ids = HashSet::new();
    for i in 0..2_000 {
        let m = queue.enqueue("location_update", json!({ "seq": i })).unwrap();
        assert_eq!(m.status, MutationStatus::Pending);
        assert_eq!(m.retry_count, 0);
        ids.insert(m.id);
    }
    assert_eq!(ids.len(), 2_000);
    assert_eq!(queue.len(), 2_000);
}

#[test]
fn stats_after_completing_first_of_two() {
    let mut queue = MutationQueue::new(QueueConfig::default());
    let a = queue.enqueue("a", json!({})).unwrap();
    let _b = queue.enqueue("b", json!({})).unwrap();

    queue.begin_attempt(&a.id, 10).unwrap();
    queue.finish_attempt(&a.id, &Ok(true)).unwrap();

    let stats = queue.stats();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.total, 2);
}

#[test]
fn in_flight_mutation_is_visible_as_processing() {
    let mut queue = MutationQueue::new(QueueConfig::default());
    let a = queue.enqueue("a", json!({})).unwrap();
    queue.begin_attempt(&a.id, 10).unwrap();

    assert_eq!(queue.get(&a.id).unwrap().status, MutationStatus::Processing);
    assert_eq!(queue.stats().processing, 1);
    assert!(queue.next_eligible(u64::MAX).is_none());
}

#[test]
fn drain_order_is_enqueue_order() {
    let mut queue = MutationQueue::new(QueueConfig::default());
    let ids: Vec<_> = ["check_in", "location_update", "manifest_update", "expense"]
        .iter()
        .map(|k| queue.enqueue(k, json!({})).unwrap().id)
        .collect();

    let mut seen = Vec::new();
    while let Some(next) = queue.next_eligible(u64::MAX).map(|m| m.id.clone()) {
        queue.begin_attempt(&next, 1).unwrap();
        queue.finish_attempt(&next, &Ok(true)).unwrap();
        seen.push(next);
    }
    assert_eq!(seen, ids);
}

#[test]
fn later_mutation_for_same_entity_waits_behind_failed_one() {
    let mut queue = MutationQueue::new(no_jitter(5));
    let check_in = queue.enqueue_for("boat-7", "check_in", json!({})).unwrap().0;
    let location = queue.enqueue_for("boat-7", "location_update", json!({})).unwrap().0;
    let other = queue.enqueue_for("boat-9", "check_in", json!({})).unwrap().0;

    queue.begin_attempt(&check_in.id, 1_000).unwrap();
    queue
        .finish_attempt(&check_in.id, &Err(ProcessorError::failed("503")))
        .unwrap();

    // boat-7 is blocked by its failed check-in; boat-9 proceeds.
    assert_eq!(queue.next_eligible(1_001).unwrap().id, other.id);
    queue.begin_attempt(&other.id, 1_001).unwrap();
    queue.finish_attempt(&other.id, &Ok(true)).unwrap();
    assert!(queue.next_eligible(1_001).is_none());

    // After the backoff the check-in comes first, then the location update.
    let retry_at = queue.get(&check_in.id).unwrap().next_attempt_at_ms.unwrap();
    assert_eq!(retry_at, 1_000 + 200);
    assert_eq!(queue.next_eligible(retry_at).unwrap().id, check_in.id);
    queue.begin_attempt(&check_in.id, retry_at).unwrap();
    queue.finish_attempt(&check_in.id, &Ok(true)).unwrap();
    assert_eq!(queue.next_eligible(retry_at).unwrap().id, location.id);
}

#[test]
fn abandoned_mutation_stays_queued_and_blocks_its_entity() {
    let mut queue = MutationQueue::new(no_jitter(2));
    let first = queue.enqueue_for("guest-1", "check_in", json!({})).unwrap().0;
    let second = queue.enqueue_for("guest-1", "expense", json!({})).unwrap().0;

    for attempt in 0..2u64 {
        let now = attempt * 10_000;
        assert_eq!(queue.next_eligible(now).unwrap().id, first.id);
        queue.begin_attempt(&first.id, now).unwrap();
        queue
            .finish_attempt(&first.id, &Err(ProcessorError::failed("timeout")))
            .unwrap();
    }

    let m = queue.get(&first.id).unwrap();
    assert_eq!(m.status, MutationStatus::Failed);
    assert_eq!(m.retry_count, 2);
    assert!(m.is_abandoned(2));
    assert!(queue.next_eligible(u64::MAX).is_none());
    assert_eq!(queue.next_wake_at(0), None);
    assert!(matches!(
        queue.begin_attempt(&first.id, u64::MAX),
        Err(QueueError::InvalidTransition { .. })
    ));

    let stats = queue.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.pending, 1);

    queue.discard(&first.id).unwrap();
    assert_eq!(queue.next_eligible(u64::MAX).unwrap().id, second.id);
}

#[test]
fn resend_keeps_retry_count_and_grants_one_more_attempt() {
    let mut queue = MutationQueue::new(no_jitter(1));
    let m = queue.enqueue("a", json!({})).unwrap();
    queue.begin_attempt(&m.id, 1).unwrap();
    queue.finish_attempt(&m.id, &Ok(false)).unwrap();
    assert!(queue.get(&m.id).unwrap().is_abandoned(1));

    let resent = queue.resend(&m.id).unwrap();
    assert_eq!(resent.status, MutationStatus::Pending);
    assert_eq!(resent.retry_count, 1);
    assert_eq!(resent.error, None);

    queue.begin_attempt(&m.id, 2).unwrap();
    let failed = queue.finish_attempt(&m.id, &Ok(false)).unwrap();
    assert_eq!(failed.retry_count, 2);
    assert!(queue.next_eligible(u64::MAX).is_none());
}

#[test]
fn keep_all_policy_never_coalesces() {
    let mut queue = MutationQueue::new(QueueConfig::default());
    queue.enqueue_for("boat-1", "location_update", json!({"lat": 1})).unwrap();
    let (_, superseded) = queue
        .enqueue_for("boat-1", "location_update", json!({"lat": 2}))
        .unwrap();
    assert!(superseded.is_empty());
    assert_eq!(queue.stats().pending, 2);
}

#[test]
fn supersede_policy_drops_only_unattempted_same_kind_pending() {
    let mut queue = MutationQueue::new(QueueConfig {
        coalesce: CoalescePolicy::SupersedePending,
        ..QueueConfig::default()
    });
    let check_in = queue.enqueue_for("boat-1", "check_in", json!({})).unwrap().0;
    let old_loc = queue
        .enqueue_for("boat-1", "location_update", json!({"lat": 1}))
        .unwrap()
        .0;
    let other_boat = queue
        .enqueue_for("boat-2", "location_update", json!({"lat": 5}))
        .unwrap()
        .0;
    queue.drain_pending_writes();

    let (new_loc, superseded) = queue
        .enqueue_for("boat-1", "location_update", json!({"lat": 2}))
        .unwrap();

    assert_eq!(superseded, vec![old_loc.id.clone()]);
    assert!(queue.get(&old_loc.id).is_none());
    let order: Vec<_> = queue.iter().map(|m| m.id.clone()).collect();
    assert_eq!(order, vec![check_in.id, other_boat.id, new_loc.id.clone()]);
    assert_eq!(
        queue.drain_pending_writes(),
        vec![QueueWrite::Remove(old_loc.id), QueueWrite::Upsert(new_loc)]
    );
}

#[test]
fn supersede_policy_keeps_attempted_mutations() {
    let mut queue = MutationQueue::new(QueueConfig {
        coalesce: CoalescePolicy::SupersedePending,
        ..no_jitter(5)
    });
    let first = queue
        .enqueue_for("boat-1", "location_update", json!({"lat": 1}))
        .unwrap()
        .0;
    queue.begin_attempt(&first.id, 1).unwrap();
    queue.finish_attempt(&first.id, &Ok(false)).unwrap();
    queue.resend(&first.id).unwrap();

    let (_, superseded) = queue
        .enqueue_for("boat-1", "location_update", json!({"lat": 2}))
        .unwrap();
    assert!(superseded.is_empty());
    assert_eq!(queue.len(), 2);
}

#[test]
fn purge_completed_removes_only_completed() {
    let mut queue = MutationQueue::new(QueueConfig::default());
    let a = queue.enqueue("a", json!({})).unwrap();
    let b = queue.enqueue("b", json!({})).unwrap();
    queue.begin_attempt(&a.id, 1).unwrap();
    queue.finish_attempt(&a.id, &Ok(true)).unwrap();

    assert_eq!(queue.purge_completed(), 1);
    assert!(queue.get(&a.id).is_none());
    assert!(queue.get(&b.id).is_some());
    assert_eq!(queue.stats().total, 1);
}

#[test]
fn rebase_refuses_completed_mutation() {
    let mut queue = MutationQueue::new(QueueConfig::default());
    let a = queue.enqueue("a", json!({})).unwrap();
    queue.begin_attempt(&a.id, 1).unwrap();
    queue.finish_attempt(&a.id, &Ok(true)).unwrap();
    assert!(matches!(
        queue.rebase(&a.id, json!({"x": 1})),
        Err(QueueError::InvalidTransition { status: MutationStatus::Completed, .. })
    ));
    assert!(matches!(
        queue.rebase("nope", json!({})),
        Err(QueueError::MissingMutation(_))
    ));
}
