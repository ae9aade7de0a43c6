//! Connectivity tracking with listener notification and debounced reconnects.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::sync::SyncTransport;

/// Handle returned by [`NetworkMonitor::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(bool) + Send + Sync>;
type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

struct Inner {
    status: watch::Sender<bool>,
    listeners: StdMutex<Vec<(ListenerId, Listener)>>,
    reconnect: StdMutex<Option<ReconnectHook>>,
    next_listener: AtomicU64,
    generation: AtomicU64,
    debounce: Duration,
}

/// Tracks whether the remote authority is reachable.
///
/// Listeners run only on edges (online to offline and back). Going online
/// also fires the reconnect hook once the state has held for the debounce
/// window, so a flapping link produces a single reconnect.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<Inner>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool, debounce: Duration) -> Self {
        let (status, _) = watch::channel(initially_online);
        Self {
            inner: Arc::new(Inner {
                status,
                listeners: StdMutex::new(Vec::new()),
                reconnect: StdMutex::new(None),
                next_listener: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                debounce,
            }),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.inner.status.borrow()
    }

    /// Receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.status.subscribe()
    }

    pub fn add_listener(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        id
    }

    /// Returns `false` when the listener was already removed.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let Ok(mut listeners) = self.inner.listeners.lock() else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Callback invoked after a debounced offline-to-online transition.
    pub fn on_reconnect(&self, hook: impl Fn() + Send + Sync + 'static) {
        if let Ok(mut slot) = self.inner.reconnect.lock() {
            *slot = Some(Arc::new(hook));
        }
    }

    /// Report the current connectivity. Returns `true` on an edge.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.inner.status.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return false;
        }

        tracing::info!(online, "Network status changed");
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(online);
        }

        if online {
            self.schedule_reconnect(generation);
        }
        true
    }

    fn schedule_reconnect(&self, generation: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No runtime available; skipping reconnect hook");
            return;
        };
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            let settled = inner.generation.load(Ordering::SeqCst) == generation;
            if !settled || !*inner.status.borrow() {
                return;
            }
            let hook = inner.reconnect.lock().ok().and_then(|slot| slot.clone());
            if let Some(hook) = hook {
                tracing::debug!("Connection stable; firing reconnect hook");
                hook();
            }
        });
    }

    /// Periodically ping the authority and feed the result into this monitor.
    pub fn spawn_probe(
        &self,
        transport: Arc<dyn SyncTransport>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = match transport.ping().await {
                    Ok(()) => true,
                    Err(error) => {
                        tracing::debug!("Connectivity probe failed: {error}");
                        false
                    }
                };
                monitor.set_online(reachable);
            }
        })
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("online", &self.is_online())
            .field("debounce", &self.inner.debounce)
            .finish_non_exhaustive()
    }
}
