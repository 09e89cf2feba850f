use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(3600);

/// Sliding-hour counter for rate-limited actions. Entries older than one
/// hour are pruned on every `record`/`check`/`count` call before the
/// operation runs, so observers never see a non-monotonic count.
pub struct ActionTracker {
    max_per_hour: u32,
    events: Mutex<Vec<Instant>>,
}

impl ActionTracker {
    pub fn new(max_per_hour: u32) -> Self {
        Self {
            max_per_hour,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn max_per_hour(&self) -> u32 {
        self.max_per_hour
    }

    fn prune_locked(events: &mut Vec<Instant>, now: Instant) {
        events.retain(|&t| now.saturating_duration_since(t) < WINDOW);
    }

    pub fn record(&self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&self, now: Instant) {
        let mut events = self.events.lock().expect("action tracker mutex poisoned");
        Self::prune_locked(&mut events, now);
        events.push(now);
    }

    pub fn check(&self) -> bool {
        self.check_at(Instant::now())
    }

    pub fn check_at(&self, now: Instant) -> bool {
        let mut events = self.events.lock().expect("action tracker mutex poisoned");
        Self::prune_locked(&mut events, now);
        (events.len() as u32) < self.max_per_hour
    }

    pub fn count(&self) -> u32 {
        self.count_at(Instant::now())
    }

    pub fn count_at(&self, now: Instant) -> u32 {
        let mut events = self.events.lock().expect("action tracker mutex poisoned");
        Self::prune_locked(&mut events, now);
        events.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn allows_up_to_max_then_denies() {
        let tracker = ActionTracker::new(3);
        assert!(tracker.check());
        tracker.record();
        tracker.record();
        tracker.record();
        assert_eq!(tracker.count(), 3);
        assert!(!tracker.check());
    }

    #[test]
    fn prunes_entries_older_than_an_hour() {
        let tracker = ActionTracker::new(1);
        let now = Instant::now();
        tracker.record_at(now - Duration::from_secs(3700));
        assert!(tracker.check_at(now));
        assert_eq!(tracker.count_at(now), 0);
    }

    #[test]
    fn concurrent_recorders_never_lose_events() {
        let tracker = Arc::new(ActionTracker::new(10_000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    tracker.record();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.count(), 4000);
    }
}
