//! A single background task that fires keyed timeouts.
//!
//! Every timer has a key, and there is at most one live timer per key: starting a timer for a
//!  key that is already scheduled replaces it. Canceled timers are not removed from the
//!  deadline queue eagerly, they are flagged and skipped when their deadline comes up.
//!
//! A timer stays registered under its key until the wait loop claims it, immediately before
//!  its callback runs. So canceling or restarting a timer whose deadline passed, but whose
//!  callback did not run yet (e.g. from the callback of another timer that expired at the same
//!  time), prevents it from firing.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// There is only one delayed-ack timer per connection, so it has a reserved key
    DelayedAck,
    /// Retransmission timer of the data or end-of-stream frame with the given sequence number
    Retransmit(u32),
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TimeoutHandler: Send + Sync + 'static {
    async fn on_timeout(&self, key: TimerKey);
}

struct Timer {
    id: u64,
    key: TimerKey,
    canceled: Arc<AtomicBool>,
}

struct LiveTimer {
    id: u64,
    canceled: Arc<AtomicBool>,
}

#[derive(Default)]
struct TimerSet {
    by_deadline: BTreeMap<(Instant, u64), Timer>,
    by_key: FxHashMap<TimerKey, LiveTimer>,
    next_id: u64,
    is_shut_down: bool,
}

impl TimerSet {
    fn cancel(&mut self, key: TimerKey) -> bool {
        match self.by_key.remove(&key) {
            Some(live) => {
                live.canceled.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some((&(deadline, _), timer)) = self.by_deadline.first_key_value() {
            if !timer.canceled.load(Ordering::Acquire) {
                return Some(deadline);
            }
            self.by_deadline.pop_first();
        }
        None
    }

    fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        let mut result = Vec::new();
        while let Some((&(deadline, id), _)) = self.by_deadline.first_key_value() {
            if deadline > now {
                break;
            }
            if let Some((_, timer)) = self.by_deadline.pop_first() {
                if !timer.canceled.load(Ordering::Acquire) {
                    trace!("timer {:?} (#{}) expired", timer.key, id);
                    result.push(timer);
                }
            }
        }
        result
    }

    /// Unregisters an expired timer right before its callback runs. Returns `false` if the
    ///  timer was canceled or replaced after it expired.
    fn claim(&mut self, timer: &Timer) -> bool {
        if timer.canceled.load(Ordering::Acquire) {
            return false;
        }
        if self.by_key.get(&timer.key).is_some_and(|live| live.id == timer.id) {
            self.by_key.remove(&timer.key);
        }
        true
    }
}

pub struct TimerService {
    timers: Arc<Mutex<TimerSet>>,
    wake_up: Arc<Notify>,
    wait_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    /// Spawns the wait loop, so this must be called inside a Tokio runtime.
    ///
    /// The service holds only a weak reference to its handler, allowing the handler to own the
    ///  service. Timeouts that expire after the handler was dropped are discarded.
    pub fn new(handler: Weak<dyn TimeoutHandler>) -> TimerService {
        let timers = Arc::new(Mutex::new(TimerSet::default()));
        let wake_up = Arc::new(Notify::new());

        let wait_loop = tokio::spawn(Self::wait_loop(timers.clone(), wake_up.clone(), handler));

        TimerService {
            timers,
            wake_up,
            wait_loop: tokio::sync::Mutex::new(Some(wait_loop)),
        }
    }

    fn lock_timers(&self) -> MutexGuard<'_, TimerSet> {
        lock(&self.timers)
    }

    /// (Re)starts the timer for a given key, replacing a timer that is already running for
    ///  the same key
    pub fn start(&self, key: TimerKey, timeout: Duration) {
        let deadline = Instant::now() + timeout;

        let mut timers = self.lock_timers();
        if timers.is_shut_down {
            trace!("timer service is shut down - not starting timer {:?}", key);
            return;
        }

        timers.cancel(key);
        let wakes_up_earlier = timers.next_deadline()
            .map_or(true, |next| deadline < next);

        let id = timers.next_id;
        timers.next_id += 1;

        let canceled = Arc::new(AtomicBool::new(false));
        timers.by_deadline.insert((deadline, id), Timer { id, key, canceled: canceled.clone() });
        timers.by_key.insert(key, LiveTimer { id, canceled });
        drop(timers);

        if wakes_up_earlier {
            self.wake_up.notify_one();
        }
    }

    /// Canceling a timer that is not running is a no-op
    pub fn cancel(&self, key: TimerKey) {
        if self.lock_timers().cancel(key) {
            trace!("canceled timer {:?}", key);
        }
    }

    pub fn is_pending(&self, key: TimerKey) -> bool {
        self.lock_timers().by_key.contains_key(&key)
    }

    /// Stops the wait loop. When this returns, no more callbacks fire, and starting timers
    ///  has no effect
    pub async fn shutdown(&self) {
        {
            let mut timers = self.lock_timers();
            timers.is_shut_down = true;
            timers.by_deadline.clear();
            timers.by_key.clear();
        }
        self.wake_up.notify_one();

        if let Some(wait_loop) = self.wait_loop.lock().await.take() {
            if let Err(e) = wait_loop.await {
                debug!("timer wait loop terminated abnormally: {}", e);
            }
        }
    }

    async fn wait_loop(timers: Arc<Mutex<TimerSet>>, wake_up: Arc<Notify>, handler: Weak<dyn TimeoutHandler>) {
        trace!("starting timer wait loop");

        loop {
            let next_deadline = {
                let mut timers = lock(&timers);
                if timers.is_shut_down {
                    break;
                }
                timers.next_deadline()
            };

            match next_deadline {
                None => {
                    wake_up.notified().await;
                    continue;
                }
                Some(deadline) => {
                    select! {
                        _ = time::sleep_until(deadline) => {}
                        _ = wake_up.notified() => continue,
                    }
                }
            }

            let expired = {
                let mut timers = lock(&timers);
                if timers.is_shut_down {
                    break;
                }
                timers.take_expired(Instant::now())
            };

            for timer in expired {
                {
                    let mut timers = lock(&timers);
                    if timers.is_shut_down {
                        break;
                    }
                    if !timers.claim(&timer) {
                        trace!("timer {:?} was canceled after it expired - skipping", timer.key);
                        continue;
                    }
                }

                let Some(handler) = handler.upgrade() else {
                    debug!("timeout handler was dropped - terminating timer wait loop");
                    return;
                };
                trace!("firing timer {:?}", timer.key);
                handler.on_timeout(timer.key).await;
            }
        }

        trace!("timer wait loop terminated");
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        let mut timers = self.lock_timers();
        timers.is_shut_down = true;
        timers.by_deadline.clear();
        timers.by_key.clear();
        drop(timers);
        self.wake_up.notify_one();
    }
}

fn lock(timers: &Mutex<TimerSet>) -> MutexGuard<'_, TimerSet> {
    // the timer set's invariants hold between any two statements, so it is safe to keep
    //  using it after a panic
    timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
