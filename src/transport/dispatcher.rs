//! Shared transport context: pollers, per-network counters, liveness sweep
//! and the process-wide networking switch.
//!
//! One [`Dispatcher`] is created at startup and handed to every client and
//! server. Cloning is cheap; all clones share the same state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::config::DispatcherConfig;
use super::connection::Connection;
use super::counters::{NetworkCounters, Statistics};
use super::poller::{Poller, TokioPoller};
use crate::core::{BusError, TransportError};

const ACCEPTOR_POLLER_NAME: &str = "BusAcceptor";
const XFER_POLLER_NAME: &str = "BusXfer";

/// Shared transport context.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    config: RwLock<DispatcherConfig>,
    handle: Option<Handle>,
    acceptor_poller: Mutex<Option<Arc<TokioPoller>>>,
    xfer_poller: Mutex<Option<Arc<TokioPoller>>>,
    counters: RwLock<HashMap<String, Arc<NetworkCounters>>>,
    connections: Mutex<Vec<Weak<Connection>>>,
    liveness: Mutex<Option<JoinHandle<()>>>,
    networking_disabled: AtomicBool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &*self.inner.config.read())
            .field("shared_runtime", &self.inner.handle.is_some())
            .field("networking_disabled", &self.is_networking_disabled())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher whose pollers own their runtimes.
    pub fn new(config: DispatcherConfig) -> Result<Self, BusError> {
        config.validate()?;
        Ok(Self::build(config, None))
    }

    /// Create a dispatcher whose pollers run on an existing runtime.
    pub fn with_handle(config: DispatcherConfig, handle: Handle) -> Result<Self, BusError> {
        config.validate()?;
        Ok(Self::build(config, Some(handle)))
    }

    fn build(config: DispatcherConfig, handle: Option<Handle>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config: RwLock::new(config),
                handle,
                acceptor_poller: Mutex::new(None),
                xfer_poller: Mutex::new(None),
                counters: RwLock::new(HashMap::new()),
                connections: Mutex::new(Vec::new()),
                liveness: Mutex::new(None),
                networking_disabled: AtomicBool::new(false),
            }),
        }
    }

    /// Current dispatcher configuration.
    pub fn config(&self) -> DispatcherConfig {
        self.inner.config.read().clone()
    }

    /// Apply a new configuration at runtime.
    ///
    /// The liveness sweep picks up the new period on its next tick. A new
    /// thread pool size takes effect for connections created afterwards:
    /// they get a fresh transfer poller while existing ones keep theirs.
    /// Pollers running on a shared runtime are sized by its owner.
    pub fn reconfigure(&self, config: DispatcherConfig) -> Result<(), BusError> {
        config.validate()?;
        let resized = {
            let mut current = self.inner.config.write();
            let resized = current.thread_pool_size != config.thread_pool_size;
            *current = config.clone();
            resized
        };
        if resized && self.inner.handle.is_none() {
            // Connections hold their own reference to the replaced poller.
            self.inner.xfer_poller.lock().take();
        }
        info!(
            thread_pool_size = config.thread_pool_size,
            liveness_check_period = ?config.liveness_check_period,
            "Dispatcher reconfigured"
        );
        Ok(())
    }

    /// Snapshot of one network's counters.
    pub fn statistics(&self, network: &str) -> Statistics {
        self.counters(network).statistics()
    }

    /// Snapshots of every network seen so far.
    pub fn network_statistics(&self) -> BTreeMap<String, Statistics> {
        self.inner
            .counters
            .read()
            .iter()
            .map(|(name, counters)| (name.clone(), counters.statistics()))
            .collect()
    }

    /// Turn every subsequent send and socket operation into an error.
    ///
    /// There is no way back.
    pub fn disable_networking(&self) {
        if !self.inner.networking_disabled.swap(true, Ordering::SeqCst) {
            info!("Networking disabled");
        }
    }

    /// Whether [`disable_networking`](Self::disable_networking) was called.
    pub fn is_networking_disabled(&self) -> bool {
        self.inner.networking_disabled.load(Ordering::Relaxed)
    }

    /// Counters of `network`, created on first use.
    pub(crate) fn counters(&self, network: &str) -> Arc<NetworkCounters> {
        if let Some(counters) = self.inner.counters.read().get(network) {
            return Arc::clone(counters);
        }
        let mut counters = self.inner.counters.write();
        Arc::clone(counters.entry(network.to_string()).or_default())
    }

    /// Poller for listening sockets.
    pub(crate) fn acceptor_poller(&self) -> Result<Arc<dyn Poller>, TransportError> {
        self.poller(&self.inner.acceptor_poller, ACCEPTOR_POLLER_NAME, 1)
    }

    /// Poller for established connections.
    pub(crate) fn xfer_poller(&self) -> Result<Arc<dyn Poller>, TransportError> {
        self.poller(
            &self.inner.xfer_poller,
            XFER_POLLER_NAME,
            self.inner.config.read().thread_pool_size,
        )
    }

    fn poller(
        &self,
        slot: &Mutex<Option<Arc<TokioPoller>>>,
        name: &str,
        threads: usize,
    ) -> Result<Arc<dyn Poller>, TransportError> {
        let mut slot = slot.lock();
        if let Some(poller) = slot.as_ref() {
            return Ok(Arc::clone(poller) as Arc<dyn Poller>);
        }
        let poller = match &self.inner.handle {
            Some(handle) => TokioPoller::with_handle(name, handle.clone()),
            None => TokioPoller::new(name, threads).map_err(|error| TransportError::Runtime {
                name: name.to_string(),
                source: Arc::new(error),
            })?,
        };
        let poller = Arc::new(poller);
        *slot = Some(Arc::clone(&poller));
        Ok(poller as Arc<dyn Poller>)
    }

    /// Track `connection` for liveness checks.
    pub(crate) fn register_connection(&self, connection: &Arc<Connection>, invoker: &Handle) {
        self.inner.connections.lock().push(Arc::downgrade(connection));

        let mut liveness = self.inner.liveness.lock();
        if liveness.is_none() {
            let inner = Arc::downgrade(&self.inner);
            *liveness = Some(invoker.spawn(async move {
                loop {
                    let Some(period) = inner
                        .upgrade()
                        .map(|inner| inner.config.read().liveness_check_period)
                    else {
                        break;
                    };
                    tokio::time::sleep(period).await;
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    inner.check_liveness();
                }
            }));
            debug!("Liveness checker started");
        }
    }
}

impl DispatcherInner {
    fn check_liveness(&self) {
        let live: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock();
            connections.retain(|connection| connection.strong_count() > 0);
            connections.iter().filter_map(Weak::upgrade).collect()
        };
        for connection in live {
            connection.check_liveness();
        }
    }
}

impl Drop for DispatcherInner {
    fn drop(&mut self) {
        if let Some(liveness) = self.liveness.get_mut().take() {
            liveness.abort();
        }
        for slot in [&self.acceptor_poller, &self.xfer_poller] {
            if let Some(poller) = slot.lock().take() {
                poller.shutdown();
            }
        }
    }
}
