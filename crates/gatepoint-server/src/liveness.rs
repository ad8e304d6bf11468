//! Idle-connection supervision.
//!
//! One scheduler task per monitor services a min-heap of deadlines. Each
//! watched connection holds a [`LivenessGuard`]; activity calls
//! [`LivenessGuard::restart`], and dropping the guard detaches the watch so
//! its callback can never fire afterwards.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

/// Idle threshold used by the framed collector.
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_millis(180_000);

/// How often deadlines are checked.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(1_000);

/// Shortest check interval; a zero interval would spin.
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

type Callback = Box<dyn Fn() + Send + Sync>;

struct Watch {
    last_activity: Instant,
    on_timeout: Callback,
}

#[derive(Default)]
struct Schedule {
    next_key: u64,
    watches: HashMap<u64, Watch>,
    /// Exactly one entry per live watch; entries for removed watches are
    /// skipped when popped.
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
}

struct Shared {
    threshold: Duration,
    schedule: Mutex<Schedule>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fire every expired watch and reschedule it one threshold later.
    fn check(&self, now: Instant) {
        let mut schedule = self.lock();
        while let Some(Reverse((deadline, key))) = schedule.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            schedule.deadlines.pop();

            let Some(watch) = schedule.watches.get_mut(&key) else {
                continue;
            };
            let due = watch.last_activity + self.threshold;
            if due > now {
                schedule.deadlines.push(Reverse((due, key)));
                continue;
            }

            trace!(key, "idle threshold reached");
            // Fired under the lock so a concurrent guard drop cannot race it.
            (watch.on_timeout)();
            watch.last_activity = now;
            schedule.deadlines.push(Reverse((now + self.threshold, key)));
        }
    }
}

/// Supervises any number of connections against one idle threshold.
pub struct LivenessMonitor {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl LivenessMonitor {
    /// Start the scheduler task. Must be called inside a Tokio runtime.
    ///
    /// `check_interval` is raised to 1 ms if smaller.
    pub fn start(threshold: Duration, check_interval: Duration) -> Self {
        let check_interval = check_interval.max(MIN_CHECK_INTERVAL);
        let shared = Arc::new(Shared {
            threshold,
            schedule: Mutex::new(Schedule::default()),
        });

        let weak = Arc::downgrade(&shared);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let now = ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.check(now.max(Instant::now()));
            }
        });

        Self { shared, task }
    }

    pub fn threshold(&self) -> Duration {
        self.shared.threshold
    }

    /// Watch a new connection. `on_timeout` runs each time the connection
    /// stays idle for a full threshold; the clock restarts after it fires.
    ///
    /// `on_timeout` runs on the scheduler task under its lock and must not
    /// block or touch this monitor.
    pub fn watch(&self, on_timeout: impl Fn() + Send + Sync + 'static) -> LivenessGuard {
        let now = Instant::now();
        let mut schedule = self.shared.lock();
        let key = schedule.next_key;
        schedule.next_key += 1;
        schedule.watches.insert(
            key,
            Watch {
                last_activity: now,
                on_timeout: Box::new(on_timeout),
            },
        );
        schedule
            .deadlines
            .push(Reverse((now + self.shared.threshold, key)));

        LivenessGuard {
            key,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of watched connections.
    pub fn len(&self) -> usize {
        self.shared.lock().watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.task.abort();
        self.shared.lock().watches.clear();
    }
}

/// Handle to one watched connection.
pub struct LivenessGuard {
    key: u64,
    shared: Weak<Shared>,
}

impl LivenessGuard {
    /// Record activity: the idle clock starts over.
    pub fn restart(&self) {
        if let Some(shared) = self.shared.upgrade() {
            if let Some(watch) = shared.lock().watches.get_mut(&self.key) {
                watch.last_activity = Instant::now();
            }
        }
    }

    /// Time since the last activity, or `None` once detached.
    pub fn idle_for(&self) -> Option<Duration> {
        let shared = self.shared.upgrade()?;
        let schedule = shared.lock();
        schedule
            .watches
            .get(&self.key)
            .map(|w| Instant::now().saturating_duration_since(w.last_activity))
    }
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.lock().watches.remove(&self.key);
        }
    }
}

impl std::fmt::Debug for LivenessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessGuard").field("key", &self.key).finish()
    }
}
