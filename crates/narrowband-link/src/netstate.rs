//! Link-State Cache: a debounced view of "is there any network at all".
//!
//! The platform reports raw connectivity changes as [`LinkEvent`]s. Phones
//! flap between networks constantly, so listeners are told only once a
//! new value has held for [`LinkConfig::quiet_interval`]. A flap that
//! settles back before then produces no notification at all, because the
//! comparison is against the last value *sent to listeners*, not the last
//! raw value.
//!
//! When a debounced transition to "available" fires, the cache also bumps
//! a resend generation that endpoints watch to re-send whatever failed
//! while the link was down.
//!
//! Timers are tokio tasks, each tagged with a schedule generation. An
//! aborted timer that already woke up finds its generation stale and does
//! nothing. The state mutex is never held across an await or while
//! calling a listener.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Asks the platform directly whether a network path exists.
pub trait ConnectivityProbe: Send + Sync + 'static {
    fn is_connected(&self) -> bool;
}

impl<F> ConnectivityProbe for F
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    fn is_connected(&self) -> bool {
        self()
    }
}

/// Receives debounced availability changes.
pub trait LinkListener: Send + Sync + 'static {
    fn on_link_change(&self, available: bool);
}

impl<F> LinkListener for F
where
    F: Fn(bool) + Send + Sync + 'static,
{
    fn on_link_change(&self, available: bool) {
        self(available)
    }
}

/// A raw platform connectivity event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { high_bandwidth: bool },
    Disconnected,
    /// Connecting, suspended and the like: no change in availability.
    Other,
}

/// Handle returned by [`LinkStateCache::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// How long a new value must hold before listeners hear about it.
    pub quiet_interval: Duration,
    /// Minimum gap between direct probes made by `is_available` while
    /// the cache says the link is down.
    pub second_guess_interval: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            quiet_interval: Duration::from_secs(2),
            second_guess_interval: Duration::from_secs(20),
        }
    }
}

struct State {
    available: bool,
    high_bandwidth: bool,
    last_sent: bool,
    pending: Option<JoinHandle<()>>,
    schedule: u64,
    last_probe: Option<Instant>,
    listeners: Vec<(ListenerId, Arc<dyn LinkListener>)>,
    next_listener: u64,
}

struct Inner {
    config: LinkConfig,
    probe: Box<dyn ConnectivityProbe>,
    state: Mutex<State>,
    resend: watch::Sender<u64>,
}

/// Process-wide cache of link availability. Cheap to clone.
#[derive(Clone)]
pub struct LinkStateCache {
    inner: Arc<Inner>,
}

impl LinkStateCache {
    /// Creates the cache, taking its initial value from `probe`.
    pub fn new(config: LinkConfig, probe: impl ConnectivityProbe) -> Self {
        let available = probe.is_connected();
        tracing::info!(available, "link state initialised");
        let (resend, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                probe: Box::new(probe),
                state: Mutex::new(State {
                    available,
                    high_bandwidth: false,
                    last_sent: available,
                    pending: None,
                    schedule: 0,
                    last_probe: None,
                    listeners: Vec::new(),
                    next_listener: 1,
                }),
                resend,
            }),
        }
    }

    /// Feeds one raw platform event. Must be called from inside a tokio
    /// runtime, since it may schedule the debounce timer.
    pub fn on_platform_event(&self, event: LinkEvent) {
        let mut state = self.inner.state.lock();
        let available = match event {
            LinkEvent::Connected { high_bandwidth } => {
                state.high_bandwidth = high_bandwidth;
                true
            }
            LinkEvent::Disconnected => false,
            LinkEvent::Other => state.available,
        };
        if available == state.available {
            tracing::debug!(?event, available, "link event without change");
            return;
        }
        tracing::debug!(?event, available, "raw link change");
        state.available = available;
        self.schedule_notify(&mut state);
    }

    /// Current cached value. While it says "down", this also asks the
    /// platform directly, at most once per `second_guess_interval`, and
    /// trusts a "yes".
    pub fn is_available(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.available {
                return true;
            }
            let now = Instant::now();
            let due = state
                .last_probe
                .is_none_or(|at| now.saturating_duration_since(at) > self.inner.config.second_guess_interval);
            if !due {
                return false;
            }
            state.last_probe = Some(now);
        }

        if !self.inner.probe.is_connected() {
            return false;
        }
        tracing::info!("second-guessing link state: available after all");
        let mut state = self.inner.state.lock();
        if !state.available {
            state.available = true;
            self.schedule_notify(&mut state);
        }
        true
    }

    /// Whether the last connect event reported a high-bandwidth network.
    pub fn is_high_bandwidth(&self) -> bool {
        self.inner.state.lock().high_bandwidth
    }

    pub fn register(&self, listener: impl LinkListener) -> ListenerId {
        let mut state = self.inner.state.lock();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Returns `false` if `id` wasn't registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }

    /// Watches the resend generation, bumped on every debounced
    /// transition to available.
    pub fn subscribe_resend(&self) -> watch::Receiver<u64> {
        self.inner.resend.subscribe()
    }

    /// Cancels any pending notification and, if the raw value differs
    /// from what listeners last heard, starts a new quiet-interval timer.
    fn schedule_notify(&self, state: &mut State) {
        state.schedule += 1;
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
        if state.last_sent == state.available {
            tracing::debug!(available = state.available, "link flap settled, nothing to send");
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no runtime for link debounce timer, notification skipped");
            return;
        };
        let cache = self.clone();
        let quiet = self.inner.config.quiet_interval;
        let schedule = state.schedule;
        state.pending = Some(runtime.spawn(async move {
            tokio::time::sleep(quiet).await;
            cache.fire(schedule);
        }));
    }

    fn fire(&self, schedule: u64) {
        let (available, listeners) = {
            let mut state = self.inner.state.lock();
            if state.schedule != schedule {
                tracing::debug!(schedule, current = state.schedule, "stale link timer ignored");
                return;
            }
            state.pending = None;
            if state.last_sent == state.available {
                return;
            }
            state.last_sent = state.available;
            let listeners: Vec<_> = state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (state.available, listeners)
        };

        tracing::info!(available, listeners = listeners.len(), "link state changed");
        for listener in listeners {
            listener.on_link_change(available);
        }
        if available {
            self.inner.resend.send_modify(|generation| *generation += 1);
        }
    }
}
