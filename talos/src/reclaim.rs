//! Deferred reclamation: delayed freeing of objects that racing threads
//! may still be dereferencing.
//!
//! Teardown paths in this crate (pool deletion, registry slot release)
//! never free shared objects synchronously. They hand them to a
//! [`Reclaimer`], which holds them for a grace period and frees them in a
//! periodic background sweep — any thread that loaded a reference before
//! the handoff has long since finished its current operation by the time
//! the deadline passes.
//!
//! The reclaimer is an explicitly constructed, explicitly shut down
//! service object; components that defer through it hold an `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use minstant::Instant;

use crate::trace;

struct Deferred {
    not_before: Instant,
    _item: Box<dyn Send>,
}

/// Grace-period deferred-drop service with a background sweeper thread.
pub struct Reclaimer {
    pending: Mutex<Vec<Deferred>>,
    running: AtomicBool,
    grace: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Reclaimer {
    /// Default grace period between handoff and actual free.
    pub const DEFAULT_GRACE: Duration = Duration::from_secs(2);

    /// Starts a reclaimer sweeping at half the grace period.
    ///
    /// # Panics
    ///
    /// Panics if the sweeper thread cannot be spawned.
    #[must_use]
    pub fn start(grace: Duration) -> Arc<Self> {
        let reclaimer = Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            grace,
            sweeper: Mutex::new(None),
        });

        let weak = Arc::downgrade(&reclaimer);
        let interval = (grace / 2).max(Duration::from_millis(10));
        let handle = std::thread::Builder::new()
            .name("talos-reclaim".into())
            .spawn(move || {
                loop {
                    std::thread::sleep(interval);
                    let Some(this) = weak.upgrade() else { break };
                    if !this.running.load(Ordering::Acquire) {
                        break;
                    }
                    this.sweep_now();
                }
            })
            .expect("failed to spawn reclaim sweeper");
        *reclaimer.sweeper.lock().unwrap() = Some(handle);
        reclaimer
    }

    /// The configured grace period.
    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Defers dropping `item` until at least one grace period from now.
    pub fn defer<I: Send + 'static>(&self, item: I) {
        self.defer_until(Instant::now() + self.grace, item);
    }

    /// Defers dropping `item` until at least `not_before`.
    pub fn defer_until<I: Send + 'static>(&self, not_before: Instant, item: I) {
        let mut pending = self.pending.lock().unwrap();
        pending.push(Deferred {
            not_before,
            _item: Box::new(item),
        });
    }

    /// Frees everything whose deadline has passed; returns the count.
    ///
    /// Called by the sweeper thread; exposed so tests and shutdown paths
    /// can force a pass.
    pub fn sweep_now(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Deferred> = {
            let mut pending = self.pending.lock().unwrap();
            let mut expired = Vec::new();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].not_before <= now {
                    expired.push(pending.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            expired
        };
        let count = expired.len();
        if count > 0 {
            trace::trace!(count, "reclaim sweep freed deferred objects");
        }
        // Destructors run outside the lock.
        drop(expired);
        count
    }

    /// Stops the sweeper and frees everything still pending.
    ///
    /// Only sound once no thread can still be dereferencing deferred
    /// objects — i.e. at teardown.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            let _ = handle.join();
        }
        let drained = std::mem::take(&mut *self.pending.lock().unwrap());
        if !drained.is_empty() {
            trace::debug!(count = drained.len(), "reclaim shutdown drained pending objects");
        }
        drop(drained);
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        // The sweeper only holds a Weak reference, so reaching Drop means
        // it will exit on its next tick; everything pending frees with us.
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Probe(Arc<AtomicUsize>);

    impl Drop for Probe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_defer_respects_grace() {
        let drops = Arc::new(AtomicUsize::new(0));
        let reclaimer = Reclaimer::start(Duration::from_millis(50));

        reclaimer.defer(Probe(Arc::clone(&drops)));
        assert_eq!(reclaimer.sweep_now(), 0);
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(reclaimer.sweep_now(), 1);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_defer_until_immediate_deadline() {
        let drops = Arc::new(AtomicUsize::new(0));
        let reclaimer = Reclaimer::start(Duration::from_secs(10));

        reclaimer.defer_until(Instant::now(), Probe(Arc::clone(&drops)));
        assert_eq!(reclaimer.sweep_now(), 1);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_shutdown_drains_everything() {
        let drops = Arc::new(AtomicUsize::new(0));
        let reclaimer = Reclaimer::start(Duration::from_secs(60));

        reclaimer.defer(Probe(Arc::clone(&drops)));
        reclaimer.defer(Probe(Arc::clone(&drops)));
        reclaimer.shutdown();
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }
}
