use std::collections::BTreeMap;
use std::hash::Hash;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

/// Shift applied to all running timers, e.g. when the one-way light time is re-tuned at runtime
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimerAdjustment {
    Later(Duration),
    Earlier(Duration),
}

struct TimerEntry<P> {
    expiry: Instant,
    seq: u64,
    payload: P,
}

/// Multiplexes any number of per-key expirations onto a single 'next expiry' that the event
///  loop waits for. There is at most one timer per key. Timers with the same expiry fire in the
///  order they were started.
///
/// The payload is stored with the timer and handed back when it expires or is deleted, so
///  callers keep retry state there rather than in a separate map.
pub struct TimerManager<K, P> {
    by_key: FxHashMap<K, TimerEntry<P>>,
    by_expiry: BTreeMap<(Instant, u64), K>,
    next_seq: u64,
}

impl<K: Hash + Eq + Clone, P> Default for TimerManager<K, P> {
    fn default() -> Self {
        TimerManager::new()
    }
}

impl<K: Hash + Eq + Clone, P> TimerManager<K, P> {
    pub fn new() -> TimerManager<K, P> {
        TimerManager {
            by_key: FxHashMap::default(),
            by_expiry: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Starts a timer for a key that has no running timer. Returns false and leaves everything
    ///  unchanged if there is a timer for the key already - callers must delete it first.
    pub fn start_timer(&mut self, key: K, now: Instant, duration: Duration, payload: P) -> bool {
        if self.by_key.contains_key(&key) {
            return false;
        }

        let expiry = now + duration;
        let seq = self.next_seq;
        self.next_seq += 1;

        self.by_expiry.insert((expiry, seq), key.clone());
        self.by_key.insert(key, TimerEntry { expiry, seq, payload });
        true
    }

    pub fn delete_timer(&mut self, key: &K) -> Option<P> {
        let entry = self.by_key.remove(key)?;
        self.by_expiry.remove(&(entry.expiry, entry.seq));
        Some(entry.payload)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn payload(&self, key: &K) -> Option<&P> {
        self.by_key.get(key).map(|e| &e.payload)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        self.by_expiry.first_key_value()
            .map(|((expiry, _), _)| *expiry)
    }

    /// Removes and returns the earliest timer if it is due at `now`. Expired timers are handed
    ///  out one at a time so that handlers can start new timers in between.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(K, P)> {
        let (&(expiry, seq), _) = self.by_expiry.first_key_value()?;
        if expiry > now {
            return None;
        }

        let key = self.by_expiry.remove(&(expiry, seq))?;
        let entry = self.by_key.remove(&key)?;
        Some((key, entry.payload))
    }

    pub fn adjust_running_timers(&mut self, adjustment: TimerAdjustment) {
        self.by_expiry.clear();
        for (key, entry) in self.by_key.iter_mut() {
            entry.expiry = match adjustment {
                TimerAdjustment::Later(d) => entry.expiry + d,
                TimerAdjustment::Earlier(d) => entry.expiry.checked_sub(d).unwrap_or(entry.expiry),
            };
            self.by_expiry.insert((entry.expiry, entry.seq), key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use tokio::time::Instant;
    use super::*;

    #[test]
    fn test_start_and_pop_in_expiry_order() {
        let now = Instant::now();
        let mut timers = TimerManager::new();
        assert!(timers.start_timer(1, now, Duration::from_millis(30), "a"));
        assert!(timers.start_timer(2, now, Duration::from_millis(10), "b"));
        assert!(timers.start_timer(3, now, Duration::from_millis(20), "c"));
        assert_eq!(timers.len(), 3);
        assert_eq!(timers.next_expiry(), Some(now + Duration::from_millis(10)));

        assert_eq!(timers.pop_expired(now), None);
        assert_eq!(timers.pop_expired(now + Duration::from_millis(25)), Some((2, "b")));
        assert_eq!(timers.pop_expired(now + Duration::from_millis(25)), Some((3, "c")));
        assert_eq!(timers.pop_expired(now + Duration::from_millis(25)), None);
        assert_eq!(timers.next_expiry(), Some(now + Duration::from_millis(30)));
        assert_eq!(timers.pop_expired(now + Duration::from_millis(30)), Some((1, "a")));
        assert!(timers.is_empty());
        assert_eq!(timers.next_expiry(), None);
    }

    #[test]
    fn test_same_expiry_fires_in_start_order() {
        let now = Instant::now();
        let mut timers = TimerManager::new();
        for key in [5, 3, 9, 1] {
            timers.start_timer(key, now, Duration::from_secs(1), ());
        }
        let later = now + Duration::from_secs(1);
        let fired = std::iter::from_fn(|| timers.pop_expired(later))
            .map(|(k, _)| k)
            .collect::<Vec<_>>();
        assert_eq!(fired, vec![5, 3, 9, 1]);
    }

    #[test]
    fn test_restart_existing_key_is_refused() {
        let now = Instant::now();
        let mut timers = TimerManager::new();
        assert!(timers.start_timer("x", now, Duration::from_secs(1), 1));
        assert!(!timers.start_timer("x", now, Duration::from_secs(5), 2));
        assert_eq!(timers.payload(&"x"), Some(&1));
        assert_eq!(timers.next_expiry(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_delete_returns_payload() {
        let now = Instant::now();
        let mut timers = TimerManager::new();
        timers.start_timer(1, now, Duration::from_secs(1), "payload");
        assert!(timers.contains(&1));
        assert_eq!(timers.delete_timer(&1), Some("payload"));
        assert_eq!(timers.delete_timer(&1), None);
        assert!(!timers.contains(&1));
        assert_eq!(timers.next_expiry(), None);

        // the key can be used again after deletion
        assert!(timers.start_timer(1, now, Duration::from_secs(2), "again"));
    }

    #[rstest]
    #[case::later(TimerAdjustment::Later(Duration::from_millis(500)), 1500, 2500)]
    #[case::earlier(TimerAdjustment::Earlier(Duration::from_millis(500)), 500, 1500)]
    fn test_adjust_running_timers(#[case] adjustment: TimerAdjustment, #[case] expected_first_millis: u64, #[case] expected_second_millis: u64) {
        let now = Instant::now();
        let mut timers = TimerManager::new();
        timers.start_timer(1, now, Duration::from_secs(1), ());
        timers.start_timer(2, now, Duration::from_secs(2), ());

        timers.adjust_running_timers(adjustment);

        assert_eq!(timers.next_expiry(), Some(now + Duration::from_millis(expected_first_millis)));
        assert!(timers.pop_expired(now + Duration::from_millis(expected_first_millis) - Duration::from_millis(1)).is_none());
        assert_eq!(timers.pop_expired(now + Duration::from_millis(expected_first_millis)), Some((1, ())));
        assert_eq!(timers.next_expiry(), Some(now + Duration::from_millis(expected_second_millis)));
    }
}
