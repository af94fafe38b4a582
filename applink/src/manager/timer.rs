//! One-shot watchdog timer, restartable and idempotent on stop.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

struct WatchState {
    generation: Mutex<u64>,
    cv: Condvar,
}

/// A restartable one-shot timer.
///
/// `start` supersedes any armed run; `stop` cancels without firing and
/// may be called any number of times.
pub struct Watchdog {
    state: Arc<WatchState>,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(WatchState {
                generation: Mutex::new(0),
                cv: Condvar::new(),
            }),
        }
    }

    /// Arms the timer; `task` runs after `delay` unless superseded or
    /// stopped first.
    pub fn start(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let armed_generation = {
            let mut generation = self.state.generation.lock().expect("watchdog poisoned");
            *generation += 1;
            *generation
        };
        self.state.cv.notify_all();

        let state = Arc::clone(&self.state);
        std::thread::Builder::new()
            .name("applink-watchdog".into())
            .spawn(move || {
                let deadline = Instant::now() + delay;
                let mut generation = state.generation.lock().expect("watchdog poisoned");
                loop {
                    if *generation != armed_generation {
                        return;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _) = state
                        .cv
                        .wait_timeout(generation, deadline - now)
                        .expect("watchdog poisoned");
                    generation = guard;
                }
                drop(generation);
                task();
            })
            .expect("failed to spawn watchdog thread");
    }

    /// Cancels a pending run, if any.
    pub fn stop(&self) {
        *self.state.generation.lock().expect("watchdog poisoned") += 1;
        self.state.cv.notify_all();
    }
}
