/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Detection of channels that were dropped without being shut down.
//!
//! Every channel registers a weak reference to itself with a
//! [`LeakTracker`].  A sweep finds entries whose channel is gone and reports
//! those that were never both shut down and terminated.  The global tracker
//! sweeps from a background thread that starts with the first channel.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct LeakFlags {
    shutdown: AtomicBool,
    shutdown_now: AtomicBool,
    terminated: AtomicBool,
}

struct Entry {
    channel: Weak<dyn Any + Send + Sync>,
    log_id: u64,
    target: String,
    // Only captured when backtraces are enabled, e.g. RUST_BACKTRACE=1.
    allocation_site: Option<Backtrace>,
    flags: Arc<LeakFlags>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sweeper {
    NotStarted,
    Running,
    Disabled,
}

struct TrackerInner {
    entries: HashMap<u64, Entry>,
    next_id: u64,
    sweeper: Sweeper,
}

/// Tracks live channels and reports the ones that leak.
pub struct LeakTracker {
    inner: Mutex<TrackerInner>,
    wakeup: Condvar,
}

static GLOBAL_LEAK_TRACKER: LazyLock<LeakTracker> = LazyLock::new(LeakTracker::new);

impl LeakTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                entries: HashMap::new(),
                next_id: 0,
                sweeper: Sweeper::NotStarted,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// The tracker channels register with.
    pub fn global() -> &'static LeakTracker {
        &GLOBAL_LEAK_TRACKER
    }

    pub(crate) fn register(
        &'static self,
        channel: Weak<dyn Any + Send + Sync>,
        log_id: u64,
        target: String,
    ) -> LeakHandle {
        let backtrace = Backtrace::capture();
        let allocation_site = (backtrace.status() == BacktraceStatus::Captured).then_some(backtrace);
        let flags = Arc::new(LeakFlags::default());
        let (id, start_sweeper) = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.insert(
                id,
                Entry {
                    channel,
                    log_id,
                    target,
                    allocation_site,
                    flags: flags.clone(),
                },
            );
            let start = inner.sweeper == Sweeper::NotStarted
                && std::ptr::eq(self, LeakTracker::global());
            if start {
                inner.sweeper = Sweeper::Running;
            }
            (id, start)
        };
        if start_sweeper {
            self.start_sweeper();
        }
        LeakHandle {
            tracker: self,
            id,
            flags,
        }
    }

    fn start_sweeper(&'static self) {
        let spawned = thread::Builder::new()
            .name("grpc-channel-leak-sweeper".to_string())
            .spawn(move || {
                loop {
                    {
                        let mut inner = self.inner.lock();
                        if inner.sweeper == Sweeper::Disabled {
                            return;
                        }
                        self.wakeup.wait_for(&mut inner, SWEEP_INTERVAL);
                        if inner.sweeper == Sweeper::Disabled {
                            return;
                        }
                    }
                    self.sweep();
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(%err, "failed to start the channel leak sweeper");
            self.inner.lock().sweeper = Sweeper::NotStarted;
        }
    }

    /// Removes the entries of channels that no longer exist and logs the
    /// ones that were not shut down properly.  Returns how many leaks were
    /// found.
    pub fn sweep(&self) -> usize {
        let gone: Vec<Entry> = {
            let mut inner = self.inner.lock();
            let ids: Vec<u64> = inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.channel.strong_count() == 0)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.entries.remove(&id))
                .collect()
        };
        let mut leaks = 0;
        for entry in gone {
            let shutdown = entry.flags.shutdown.load(Ordering::SeqCst);
            let terminated = entry.flags.terminated.load(Ordering::SeqCst);
            if shutdown && terminated {
                continue;
            }
            leaks += 1;
            let site = entry
                .allocation_site
                .as_ref()
                .map(|bt| format!("\nchannel allocation site:\n{bt}"))
                .unwrap_or_default();
            if entry.flags.shutdown_now.load(Ordering::SeqCst) {
                tracing::debug!(
                    channel = entry.log_id,
                    target = %entry.target,
                    "Channel {} was not shutdown properly; shutdown_now() was called but the channel was dropped before it terminated{}",
                    entry.log_id,
                    site,
                );
            } else {
                tracing::error!(
                    channel = entry.log_id,
                    target = %entry.target,
                    "Channel {} was not shutdown properly! Make sure to call shutdown() or shutdown_now() and wait until await_termination() returns true{}",
                    entry.log_id,
                    site,
                );
            }
        }
        leaks
    }

    /// Stops the background sweeper.  Channels keep registering but nothing
    /// is reported until `sweep` is called explicitly.
    pub fn disable(&self) {
        self.inner.lock().sweeper = Sweeper::Disabled;
        self.wakeup.notify_all();
    }

    fn clear(&self, id: u64) {
        self.inner.lock().entries.remove(&id);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl Default for LeakTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A channel's entry in a [`LeakTracker`].
pub(crate) struct LeakHandle {
    tracker: &'static LeakTracker,
    id: u64,
    flags: Arc<LeakFlags>,
}

impl LeakHandle {
    pub(crate) fn mark_shutdown(&self) {
        self.flags.shutdown.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_shutdown_now(&self) {
        self.flags.shutdown_now.store(true, Ordering::SeqCst);
    }

    /// Marks the channel terminated and drops its entry.
    pub(crate) fn release(&self) {
        self.flags.terminated.store(true, Ordering::SeqCst);
        self.tracker.clear(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::sync::{Arc, Weak};

    use super::LeakTracker;

    fn tracker() -> &'static LeakTracker {
        Box::leak(Box::new(LeakTracker::new()))
    }

    fn channel() -> Arc<dyn Any + Send + Sync> {
        Arc::new(42u32)
    }

    #[test]
    fn live_channels_are_not_reported() {
        let tracker = tracker();
        let channel = channel();
        let _handle = tracker.register(Arc::downgrade(&channel), 1, "a".into());
        assert_eq!(tracker.sweep(), 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn dropped_channel_without_shutdown_is_a_leak() {
        let tracker = tracker();
        let channel = channel();
        let _handle = tracker.register(Arc::downgrade(&channel), 1, "a".into());
        drop(channel);
        assert_eq!(tracker.sweep(), 1);
        assert_eq!(tracker.len(), 0);
        assert_eq!(tracker.sweep(), 0);
    }

    #[test]
    fn shutdown_without_termination_is_still_a_leak() {
        let tracker = tracker();
        let channel = channel();
        let handle = tracker.register(Arc::downgrade(&channel), 1, "a".into());
        handle.mark_shutdown();
        handle.mark_shutdown_now();
        drop(channel);
        assert_eq!(tracker.sweep(), 1);
    }

    #[test]
    fn released_channels_are_forgotten() {
        let tracker = tracker();
        let channel = channel();
        let handle = tracker.register(Arc::downgrade(&channel), 1, "a".into());
        handle.mark_shutdown();
        handle.release();
        assert_eq!(tracker.len(), 0);
        drop(channel);
        assert_eq!(tracker.sweep(), 0);
    }

    #[test]
    fn never_allocated_weak_is_swept() {
        let tracker = tracker();
        let weak: Weak<dyn Any + Send + Sync> = Weak::<u32>::new();
        let _handle = tracker.register(weak, 7, "b".into());
        assert_eq!(tracker.sweep(), 1);
    }
}
