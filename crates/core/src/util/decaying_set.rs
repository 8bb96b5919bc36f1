use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use veilnet_common::Timestamp;

/// TTL-bounded membership cache
///
/// Maps a value to its insertion time. Entries live until a `decay` call
/// observes them past the interval; there is no interior timer, callers
/// decay on their maintenance tick.
#[derive(Debug, Clone)]
pub struct DecayingHashSet<T: Hash + Eq> {
    interval: Duration,
    values: HashMap<T, Timestamp>,
}

impl<T: Hash + Eq> DecayingHashSet<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            values: HashMap::new(),
        }
    }

    pub fn contains(&self, v: &T) -> bool {
        self.values.contains_key(v)
    }

    /// Insert a value, returning true if it was not already present
    pub fn insert(&mut self, v: T, now: Timestamp) -> bool {
        match self.values.entry(v) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        }
    }

    /// Insert with an explicit expiry instead of `now + interval`
    ///
    /// The entry is stored so that it decays once `expires_at` has passed.
    pub fn insert_until(&mut self, v: T, expires_at: Timestamp) -> bool {
        let synthetic = Timestamp::from_millis(
            expires_at
                .as_millis()
                .saturating_sub(self.interval.as_millis() as u64),
        );
        match self.values.entry(v) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                if *e.get() < synthetic {
                    e.insert(synthetic);
                }
                false
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(synthetic);
                true
            }
        }
    }

    /// Erase entries whose insertion time plus the interval has passed
    pub fn decay(&mut self, now: Timestamp) {
        let interval = self.interval;
        self.values
            .retain(|_, inserted| now < inserted.add(interval));
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_twice_within_interval() {
        let mut set = DecayingHashSet::new(Duration::from_secs(5));
        let now = Timestamp::from_millis(1_000);

        assert!(set.insert("a", now));
        assert!(!set.insert("a", now));
        assert!(set.contains(&"a"));
    }

    #[test]
    fn test_contains_until_decayed() {
        let mut set = DecayingHashSet::new(Duration::from_secs(5));
        let now = Timestamp::from_millis(1_000);
        set.insert("a", now);

        // before the interval elapses nothing is erased
        set.decay(Timestamp::from_millis(5_999));
        assert!(set.contains(&"a"));

        // once insertion + interval <= now the entry goes
        set.decay(Timestamp::from_millis(6_001));
        assert!(!set.contains(&"a"));
        assert!(set.insert("a", Timestamp::from_millis(6_001)));
    }

    #[test]
    fn test_empty_and_interval() {
        let mut set: DecayingHashSet<u32> = DecayingHashSet::new(Duration::from_secs(1));
        assert!(set.is_empty());
        set.set_interval(Duration::from_secs(9));
        assert_eq!(set.interval(), Duration::from_secs(9));
    }

    #[test]
    fn test_insert_until_expiry() {
        let mut set = DecayingHashSet::new(Duration::from_secs(5));
        set.insert_until("intro", Timestamp::from_millis(20_000));

        set.decay(Timestamp::from_millis(19_999));
        assert!(set.contains(&"intro"));

        set.decay(Timestamp::from_millis(20_001));
        assert!(!set.contains(&"intro"));
    }
}
