//! Readiness-driven poller abstraction and its tokio implementation.
//!
//! Pollables (connections, listeners) register once, get armed with a
//! readiness source when their socket exists, and receive
//! [`Pollable::on_event`] calls from poller threads. The poller holds only
//! weak references; [`Poller::unregister`] waits for in-flight events to
//! drain before delivering [`Pollable::on_shutdown`] exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::control::PollControl;

/// Boxed future used across the poller seam.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Something that receives poller events.
pub trait Pollable: Send + Sync {
    /// Short tag for logs.
    fn logging_tag(&self) -> String;

    /// Handle readiness (or a retry, with no readiness bits).
    fn on_event(&self, control: PollControl);

    /// Called once after unregistration, when no event is in flight.
    fn on_shutdown(&self);
}

/// A socket whose readiness can be awaited.
pub trait PollSource: Send + Sync {
    /// Poll for any of the readiness bits in `interest`, clearing what is
    /// reported.
    fn poll_ready(&self, cx: &mut Context<'_>, interest: PollControl) -> Poll<io::Result<PollControl>>;
}

/// Registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollToken(u64);

/// Poller primitives used by connections and listeners.
pub trait Poller: Send + Sync {
    /// Poller name, for logs.
    fn name(&self) -> &str;

    /// Register a pollable; `None` once the poller is shutting down.
    fn try_register(&self, pollable: Weak<dyn Pollable>) -> Option<PollToken>;

    /// Unregister; the returned future completes after `on_shutdown` ran.
    ///
    /// The work is scheduled eagerly: dropping the future does not cancel it.
    fn unregister(&self, token: PollToken) -> BoxFuture<()>;

    /// Start delivering readiness of `source` for the bits in `control`.
    fn arm(&self, token: PollToken, source: Arc<dyn PollSource>, control: PollControl);

    /// Stop delivering readiness.
    fn unarm(&self, token: PollToken);

    /// Schedule an `on_event(NONE)` pass. With `wakeup == false` the pass
    /// yields to already-runnable work first.
    fn retry(&self, token: PollToken, wakeup: bool);

    /// Runtime on which continuations run.
    fn invoker(&self) -> Handle;
}

struct Registration {
    pollable: Weak<dyn Pollable>,
    in_flight: AtomicUsize,
    unregistered: AtomicBool,
    idle: Notify,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Registration {
    fn dispatch(&self, control: PollControl) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if !self.unregistered.load(Ordering::SeqCst) {
            if let Some(pollable) = self.pollable.upgrade() {
                pollable.on_event(control);
            }
        }
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn stop_driver(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

/// Poller backed by a tokio runtime.
pub struct TokioPoller {
    name: String,
    handle: Handle,
    runtime: Mutex<Option<Runtime>>,
    registrations: RwLock<HashMap<u64, Arc<Registration>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for TokioPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioPoller")
            .field("name", &self.name)
            .field("registrations", &self.registrations.read().len())
            .finish()
    }
}

impl TokioPoller {
    /// Create a poller owning a runtime with `threads` workers.
    pub fn new(name: impl Into<String>, threads: usize) -> io::Result<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name(name.clone())
            .enable_all()
            .build()?;
        debug!(poller = %name, threads, "Poller started");
        Ok(Self::build(name, runtime.handle().clone(), Some(runtime)))
    }

    /// Create a poller driven by an existing runtime.
    pub fn with_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self::build(name.into(), handle, None)
    }

    fn build(name: String, handle: Handle, runtime: Option<Runtime>) -> Self {
        Self {
            name,
            handle,
            runtime: Mutex::new(runtime),
            registrations: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Stop accepting registrations.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    /// Number of live registrations.
    pub fn registration_count(&self) -> usize {
        self.registrations.read().len()
    }

    fn registration(&self, token: PollToken) -> Option<Arc<Registration>> {
        self.registrations.read().get(&token.0).cloned()
    }
}

impl Poller for TokioPoller {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_register(&self, pollable: Weak<dyn Pollable>) -> Option<PollToken> {
        if self.shut_down.load(Ordering::SeqCst) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(Registration {
            pollable,
            in_flight: AtomicUsize::new(0),
            unregistered: AtomicBool::new(false),
            idle: Notify::new(),
            driver: Mutex::new(None),
        });
        self.registrations.write().insert(id, registration);
        trace!(poller = %self.name, id, "Pollable registered");
        Some(PollToken(id))
    }

    fn unregister(&self, token: PollToken) -> BoxFuture<()> {
        let Some(registration) = self.registrations.write().remove(&token.0) else {
            return Box::pin(async {});
        };
        registration.unregistered.store(true, Ordering::SeqCst);
        registration.stop_driver();

        let poller = self.name.clone();
        let task = self.handle.spawn(async move {
            registration.drained().await;
            if let Some(pollable) = registration.pollable.upgrade() {
                trace!(poller = %poller, tag = %pollable.logging_tag(), "Pollable unregistered");
                pollable.on_shutdown();
            }
        });
        Box::pin(async move {
            let _ = task.await;
        })
    }

    fn arm(&self, token: PollToken, source: Arc<dyn PollSource>, control: PollControl) {
        let Some(registration) = self.registration(token) else {
            return;
        };
        let interest = control & (PollControl::READ | PollControl::WRITE);
        let driven = Arc::clone(&registration);
        let driver = self.handle.spawn(async move {
            loop {
                let ready = std::future::poll_fn(|cx| source.poll_ready(cx, interest)).await;
                match ready {
                    Ok(ready) => driven.dispatch(ready),
                    Err(error) => {
                        debug!(%error, "Poller readiness failed");
                        driven.dispatch(interest);
                        break;
                    }
                }
                tokio::task::yield_now().await;
            }
        });
        if let Some(previous) = registration.driver.lock().replace(driver) {
            previous.abort();
        }
    }

    fn unarm(&self, token: PollToken) {
        if let Some(registration) = self.registration(token) {
            registration.stop_driver();
        }
    }

    fn retry(&self, token: PollToken, wakeup: bool) {
        let Some(registration) = self.registration(token) else {
            return;
        };
        self.handle.spawn(async move {
            if !wakeup {
                tokio::task::yield_now().await;
            }
            registration.dispatch(PollControl::NONE);
        });
    }

    fn invoker(&self) -> Handle {
        self.handle.clone()
    }
}

impl Drop for TokioPoller {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
