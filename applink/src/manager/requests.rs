//! Request admission control and deadline tracking.
//!
//! Every mobile request entering the head unit passes through here. The
//! controller enforces the per-application pending ceiling, the global
//! burst meter and the HMI-None burst meter, then tracks the request
//! deadline in a min-heap swept by a dedicated thread. A transport
//! disconnect terminates all of a connection's requests at once.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::ManagerConfig;
use crate::engine::meter::FrequencyMeter;
use crate::manager::application::HmiLevel;
use crate::rpc::FunctionId;
use crate::session::ConnectionKey;
use crate::trace::{debug, warn};

/// Verdict on a mobile request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitResult {
    Success,
    /// The app's pending ceiling is reached; reject this one call.
    TooManyPendingRequests,
    /// The app floods the head unit; it must be unregistered.
    TooManyRequests,
    /// The app keeps sending while in HMI None; it must be disconnected.
    NoneLevelBurst,
}

/// Invoked from the sweep thread when a request deadline expires.
pub type TimeoutHandler = Box<dyn Fn(ConnectionKey, u32, FunctionId) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    function_id: FunctionId,
    deadline: Instant,
}

struct Inner {
    pending: HashMap<(ConnectionKey, u32), PendingRequest>,
    deadlines: BinaryHeap<Reverse<(Instant, ConnectionKey, u32)>>,
    hmi_pending: HashSet<u32>,
    burst: FrequencyMeter<ConnectionKey>,
    none_burst: FrequencyMeter<ConnectionKey>,
    /// Low-voltage quiescence: deadlines frozen, nothing expires.
    paused: bool,
}

/// Admission gate plus deadline sweeper.
pub struct RequestController {
    pending_limit: usize,
    burst_limit: usize,
    burst_window: Duration,
    none_limit: usize,
    default_timeout: Duration,
    inner: Mutex<Inner>,
    wakeup: Condvar,
    handler: Mutex<Option<TimeoutHandler>>,
    shutdown: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RequestController {
    #[must_use]
    pub fn new(config: &ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            pending_limit: config.pending_requests_amount,
            burst_limit: config.app_time_scale_max_requests,
            burst_window: config.app_request_time_scale,
            none_limit: config.none_level_max_requests,
            default_timeout: config.default_request_timeout,
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                deadlines: BinaryHeap::new(),
                hmi_pending: HashSet::new(),
                burst: FrequencyMeter::new(config.app_request_time_scale),
                none_burst: FrequencyMeter::new(config.none_level_time_scale),
                paused: false,
            }),
            wakeup: Condvar::new(),
            handler: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(None),
        })
    }

    pub fn set_timeout_handler(&self, handler: TimeoutHandler) {
        *self.handler.lock().expect("handler poisoned") = Some(handler);
    }

    /// Spawns the deadline sweeper.
    pub fn start(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("applink-request-ctrl".into())
            .spawn(move || controller.sweep_loop())
            .expect("failed to spawn request controller");
        *self.worker.lock().expect("worker poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wakeup.notify_all();
        if let Some(handle) = self.worker.lock().expect("worker poisoned").take() {
            let _ = handle.join();
        }
    }

    /// Applies the admission rules to one mobile request and, on success,
    /// starts tracking its deadline.
    pub fn admit_mobile_request(
        &self,
        key: ConnectionKey,
        correlation_id: u32,
        function_id: FunctionId,
        hmi_level: HmiLevel,
    ) -> AdmitResult {
        let mut inner = self.inner.lock().expect("controller poisoned");
        let now = Instant::now();

        if self.pending_limit > 0 {
            let in_flight = inner.pending.keys().filter(|(k, _)| *k == key).count();
            if in_flight >= self.pending_limit {
                warn!(key = %key, in_flight, "pending request ceiling reached");
                return AdmitResult::TooManyPendingRequests;
            }
        }

        if self.burst_limit > 0
            && !self.burst_window.is_zero()
            && inner.burst.track(key, now) > self.burst_limit
        {
            warn!(key = %key, "request burst limit exceeded");
            inner.burst.remove(&key);
            return AdmitResult::TooManyRequests;
        }

        if hmi_level == HmiLevel::None
            && function_id != FunctionId::UNREGISTER_APP_INTERFACE
            && self.none_limit > 0
            && inner.none_burst.track(key, now) > self.none_limit
        {
            warn!(key = %key, "request burst while in HMI None");
            inner.none_burst.remove(&key);
            return AdmitResult::NoneLevelBurst;
        }

        let deadline = now + self.default_timeout;
        inner.pending.insert(
            (key, correlation_id),
            PendingRequest {
                function_id,
                deadline,
            },
        );
        inner.deadlines.push(Reverse((deadline, key, correlation_id)));
        drop(inner);
        self.wakeup.notify_all();
        AdmitResult::Success
    }

    /// Marks a mobile request answered. Returns false if it was unknown
    /// or already timed out.
    pub fn terminate_request(&self, key: ConnectionKey, correlation_id: u32) -> bool {
        self.inner
            .lock()
            .expect("controller poisoned")
            .pending
            .remove(&(key, correlation_id))
            .is_some()
    }

    /// Drops every pending request of one application.
    pub fn terminate_app_requests(&self, key: ConnectionKey) {
        self.inner
            .lock()
            .expect("controller poisoned")
            .pending
            .retain(|(k, _), _| *k != key);
    }

    /// Drops everything; used at shutdown and ignition-off.
    pub fn terminate_all(&self) {
        let mut inner = self.inner.lock().expect("controller poisoned");
        inner.pending.clear();
        inner.deadlines.clear();
        inner.hmi_pending.clear();
    }

    pub fn add_hmi_request(&self, correlation_id: u32) {
        self.inner
            .lock()
            .expect("controller poisoned")
            .hmi_pending
            .insert(correlation_id);
    }

    /// Returns true when the correlation id answered a head-unit-origin
    /// request (and consumes it).
    pub fn terminate_hmi_request(&self, correlation_id: u32) -> bool {
        self.inner
            .lock()
            .expect("controller poisoned")
            .hmi_pending
            .remove(&correlation_id)
    }

    #[must_use]
    pub fn pending_count(&self, key: ConnectionKey) -> usize {
        self.inner
            .lock()
            .expect("controller poisoned")
            .pending
            .keys()
            .filter(|(k, _)| *k == key)
            .count()
    }

    /// Enters the quiescent state: deadlines freeze, requests survive.
    pub fn on_low_voltage(&self) {
        self.inner.lock().expect("controller poisoned").paused = true;
    }

    /// Leaves the quiescent state, re-arming every preserved deadline.
    pub fn on_wake_up(&self) {
        let mut inner = self.inner.lock().expect("controller poisoned");
        inner.paused = false;
        let now = Instant::now();
        let deadline = now + self.default_timeout;
        let mut heap = BinaryHeap::new();
        for ((key, correlation_id), request) in &mut inner.pending {
            request.deadline = deadline;
            heap.push(Reverse((deadline, *key, *correlation_id)));
        }
        inner.deadlines = heap;
        drop(inner);
        self.wakeup.notify_all();
    }

    fn sweep_loop(&self) {
        loop {
            let mut inner = self.inner.lock().expect("controller poisoned");
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            if inner.paused {
                let (guard, _) = self
                    .wakeup
                    .wait_timeout(inner, Duration::from_millis(200))
                    .expect("controller poisoned");
                drop(guard);
                continue;
            }

            let now = Instant::now();
            let mut expired = Vec::new();
            let mut next_deadline = None;
            while let Some(Reverse((deadline, key, correlation_id))) = inner.deadlines.peek().copied()
            {
                if deadline > now {
                    next_deadline = Some(deadline);
                    break;
                }
                inner.deadlines.pop();
                // Heap entries go stale when a request terminates first.
                if let Some(request) = inner.pending.get(&(key, correlation_id)).copied() {
                    if request.deadline <= now {
                        inner.pending.remove(&(key, correlation_id));
                        expired.push((key, correlation_id, request.function_id));
                    } else {
                        inner
                            .deadlines
                            .push(Reverse((request.deadline, key, correlation_id)));
                    }
                }
            }

            if expired.is_empty() {
                let wait = next_deadline
                    .map_or(Duration::from_millis(500), |d| d.saturating_duration_since(now));
                let (guard, _) = self
                    .wakeup
                    .wait_timeout(inner, wait)
                    .expect("controller poisoned");
                drop(guard);
                continue;
            }

            drop(inner);
            let handler = self.handler.lock().expect("handler poisoned");
            for (key, correlation_id, function_id) in expired {
                debug!(key = %key, correlation_id, "request deadline expired");
                if let Some(handler) = handler.as_ref() {
                    handler(key, correlation_id, function_id);
                }
            }
        }
    }
}
