//! Sliding-window frequency meter for flood and malformed-message defense.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Counts events per identifier within a rolling time window.
#[derive(Debug)]
pub struct FrequencyMeter<K> {
    window: Duration,
    samples: HashMap<K, VecDeque<Instant>>,
}

impl<K: Eq + Hash + Copy> FrequencyMeter<K> {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: HashMap::new(),
        }
    }

    /// Records one event and returns the in-window count, it included.
    pub fn track(&mut self, key: K, now: Instant) -> usize {
        self.track_many(key, 1, now)
    }

    /// Records `count` simultaneous events.
    pub fn track_many(&mut self, key: K, count: usize, now: Instant) -> usize {
        let samples = self.samples.entry(key).or_default();
        while let Some(front) = samples.front() {
            if now.duration_since(*front) > self.window {
                samples.pop_front();
            } else {
                break;
            }
        }
        for _ in 0..count {
            samples.push_back(now);
        }
        samples.len()
    }

    /// Forgets an identifier, restarting its window from scratch.
    pub fn remove(&mut self, key: &K) {
        self.samples.remove(key);
    }

    /// Forgets every identifier.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
