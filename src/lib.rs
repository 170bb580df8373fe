//! The Small POS - offline-first core
//!
//! A transactional local store, a cart state machine and a sync engine that
//! pushes locally created sales to the admin dashboard once connectivity is
//! available. The UI talks to [`checkout::Checkout`] (cart actions) and reads
//! [`sync::SyncStatus`]; nothing here renders or prints.
//!
//! [`PosRuntime`] wires the pieces together from a [`config::PosConfig`].

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

pub mod api;
pub mod cart;
pub mod checkout;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod money;
pub mod network;
pub mod queue;
pub mod sync;

pub use cart::{CartAction, CartState, CartStatus, PosState};
pub use checkout::Checkout;
pub use config::{PosConfig, SyncConfig};
pub use db::LocalStore;
pub use error::{PosError, Result};
pub use network::NetworkMonitor;
pub use queue::SyncQueue;
pub use sync::{AutoSyncHandle, DrainOutcome, DrainSummary, SyncEngine, SyncStatus};

use api::{HttpTransport, SyncTransport};
use clock::{Clock, SystemClock};
use logging::LogFormat;
use network::ReachabilityProbe;

/// A running POS core: store, engine, checkout and their background tasks.
pub struct PosRuntime {
    config: PosConfig,
    store: Arc<LocalStore>,
    network: NetworkMonitor,
    engine: Arc<SyncEngine>,
    checkout: Arc<Checkout>,
    tasks: Vec<AutoSyncHandle>,
}

impl PosRuntime {
    /// Install logging under `<data_dir>/logs`, then [`PosRuntime::start`].
    ///
    /// Keep the returned guard alive as long as the runtime; dropping it
    /// flushes and closes the log file. Fails if a global subscriber is
    /// already installed.
    pub fn start_with_logging(config: PosConfig, format: LogFormat) -> Result<(Self, WorkerGuard)> {
        let guard = logging::init_logging(&logging::log_dir_for(&config.data_dir), format)?;
        let runtime = Self::start(config)?;
        Ok((runtime, guard))
    }

    /// Open the store under `config.data_dir` and start syncing against the
    /// configured admin dashboard. Must be called inside a tokio runtime.
    ///
    /// Without an admin URL the runtime stays offline: sales are recorded
    /// and queued, nothing is pushed.
    ///
    /// Does not install a log subscriber; an embedding app that has none of
    /// its own should use [`PosRuntime::start_with_logging`].
    pub fn start(config: PosConfig) -> Result<Self> {
        config.validate()?;
        info!("Starting The Small POS offline core v{}", env!("CARGO_PKG_VERSION"));

        let store = Arc::new(LocalStore::open(&config.data_dir)?);
        let transport = Arc::new(HttpTransport::new(
            &config.api_base_url,
            &config.api_key,
            &config.tenant_id,
        )?);

        let probe: Option<Arc<dyn ReachabilityProbe>> = if config.has_remote() {
            Some(transport.clone() as Arc<dyn ReachabilityProbe>)
        } else {
            warn!("No admin dashboard URL configured; running offline only");
            None
        };

        let mut runtime = Self::assemble(config, store, transport, Arc::new(SystemClock))?;
        runtime.spawn_background(probe);
        Ok(runtime)
    }

    /// Wire components over an existing store and transport without
    /// starting any task. The network starts offline.
    pub fn assemble(
        config: PosConfig,
        store: Arc<LocalStore>,
        transport: Arc<dyn SyncTransport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let network = NetworkMonitor::new(false);
        let engine = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            transport,
            network.clone(),
            Arc::clone(&clock),
            config.sync.clone(),
        )?);
        let checkout = Arc::new(Checkout::new(
            Arc::clone(&store),
            engine.queue().clone(),
            clock,
            config.tenant_id.clone(),
        ));

        if let Err(e) = engine.cleanup_old_records(config.sync.cleanup_after_days) {
            warn!(error = %e, "Startup queue cleanup failed");
        }

        Ok(Self {
            config,
            store,
            network,
            engine,
            checkout,
            tasks: Vec::new(),
        })
    }

    /// Start the periodic drain, the reconnect listener, the cart's status
    /// mirror and, when given, the connectivity probe.
    pub fn spawn_background(&mut self, probe: Option<Arc<dyn ReachabilityProbe>>) {
        self.tasks
            .push(self.engine.start_auto_sync(self.config.sync.auto_sync_interval()));
        self.tasks.push(self.engine.watch_network());

        let cancel = CancellationToken::new();
        let mirror = checkout::mirror_sync_status(
            Arc::clone(&self.checkout),
            self.engine.subscribe_status(),
            cancel.clone(),
        );
        self.tasks.push(AutoSyncHandle::new(cancel, mirror));

        if let Some(probe) = probe {
            let cancel = CancellationToken::new();
            let task = network::spawn_probe(
                self.network.clone(),
                probe,
                self.config.sync.probe_interval(),
                cancel.clone(),
            );
            self.tasks.push(AutoSyncHandle::new(cancel, task));
        }
    }

    pub fn config(&self) -> &PosConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn checkout(&self) -> &Arc<Checkout> {
        &self.checkout
    }

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(self) {
        for task in self.tasks {
            task.stop().await;
        }
        info!("POS offline core stopped");
    }
}
