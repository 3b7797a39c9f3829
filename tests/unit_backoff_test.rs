use driftmq::client::backoff::{BASE_DELAY, Backoff};
use driftmq::client::unacked::UnackedTracker;
use driftmq::core::protocol::MessageIdData;
use std::time::Duration;

#[test]
fn test_backoff_stays_under_growing_ceiling() {
    let cap = Duration::from_secs(60);
    let mut backoff = Backoff::new(cap);
    let mut ceiling = BASE_DELAY;
    for _ in 0..12 {
        let delay = backoff.next_delay();
        assert!(delay <= ceiling, "{delay:?} exceeds ceiling {ceiling:?}");
        ceiling = (ceiling * 2).min(cap);
    }
}

#[test]
fn test_backoff_never_exceeds_cap() {
    let cap = Duration::from_millis(500);
    let mut backoff = Backoff::new(cap);
    for _ in 0..40 {
        assert!(backoff.next_delay() <= cap);
    }
}

#[test]
fn test_backoff_reset_restarts_the_ramp() {
    let mut backoff = Backoff::new(Duration::from_secs(60));
    for _ in 0..8 {
        backoff.next_delay();
    }
    backoff.reset();
    assert!(backoff.next_delay() <= BASE_DELAY);
}

#[test]
fn test_tracker_expires_only_after_ttl() {
    let tracker = UnackedTracker::new(Some(Duration::from_millis(80)));
    tracker.add(MessageIdData::new(1, 0));
    tracker.add(MessageIdData::new(1, 1));
    assert_eq!(tracker.len(), 2);
    assert!(tracker.take_expired().is_empty(), "nothing expires immediately");

    std::thread::sleep(Duration::from_millis(120));
    let expired = tracker.take_expired();
    assert_eq!(expired.len(), 2);
    assert!(tracker.is_empty(), "expired ids leave the tracker");
}

#[test]
fn test_tracker_without_timeout_never_expires() {
    let tracker = UnackedTracker::new(None);
    tracker.add(MessageIdData::new(1, 0));
    std::thread::sleep(Duration::from_millis(50));
    assert!(tracker.take_expired().is_empty());
    assert_eq!(tracker.len(), 1);
}

#[test]
fn test_tracker_remove_and_cumulative_remove() {
    let tracker = UnackedTracker::new(Some(Duration::from_secs(30)));
    for entry in 0..6 {
        tracker.add(MessageIdData::new(1, entry));
    }
    tracker.remove(&MessageIdData::new(1, 5));
    assert_eq!(tracker.len(), 5);

    // Cumulative ack up to entry 3 clears everything at or below it.
    tracker.remove_up_to((1, 3));
    assert_eq!(tracker.len(), 1);
    tracker.clear();
    assert!(tracker.is_empty());
}
