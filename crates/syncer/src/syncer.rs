//! The reconciliation loop.
//!
//! One worker task drives the whole engine: the first iteration runs
//! immediately on start, then fixed-interval ticks follow. A tick reads a
//! snapshot, classifies DON roles, replaces the peer set, and reconciles
//! the tracked shim map against the snapshot — installing shims for newly
//! relevant capabilities and closing shims whose (capability, DON) pair
//! disappeared. Iterations never overlap.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use capmesh_config::SyncerConfig;
use capmesh_core::{
    CapabilityId, CapabilityRegistry, Don, DonId, RegistryError, RegistryState, Service,
};
use capmesh_network::{Dispatcher, NetworkError, Peer, PeerWrapper};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bootstrap::BootstrapSetup;
use crate::classifier::{classify, DonClassification};
use crate::error::{ShimError, SyncError, SyncResult};
use crate::factory::{BuiltShim, Discovery, ShimFactory, ShimKey};
use crate::reader::StateReader;
use crate::topology::desired_peer_set;

/// Where a tick's snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotSource {
    /// Read from the on-chain registry.
    #[default]
    Chain,
    /// Seeded from the configured bootstrap network description, used until
    /// the first successful on-chain read.
    Bootstrap,
}

/// One capability's setup failure within a tick.
#[derive(Debug)]
pub struct ShimFailure {
    pub capability_id: CapabilityId,
    pub don_id: DonId,
    pub error: ShimError,
}

/// The outcome of one reconciliation tick. Collected by the loop, which
/// decides what to log; embedders calling [`RegistrySyncer::reconcile_now`]
/// get the same value.
#[derive(Debug, Default)]
pub struct TickReport {
    pub source: SnapshotSource,
    /// Size of the peer set handed to `update_connections`.
    pub peer_count: usize,
    pub installed: Vec<ShimKey>,
    pub removed: Vec<ShimKey>,
    /// Registrations skipped because the registry already held the entry.
    pub duplicates: usize,
    pub topology_error: Option<NetworkError>,
    pub shim_failures: Vec<ShimFailure>,
}

impl TickReport {
    /// Whether the tick completed without any recorded failure.
    pub fn is_clean(&self) -> bool {
        self.topology_error.is_none() && self.shim_failures.is_empty()
    }
}

enum Phase {
    Created,
    Started,
    Stopped,
}

struct TrackedShim {
    service: Arc<dyn Service>,
    /// Whether this shim owns an entry in the local capability registry.
    registered: bool,
}

enum ShimPlan {
    Client {
        capability_id: CapabilityId,
        capability_don: Don,
        workflow_don: Don,
    },
    Server {
        capability_id: CapabilityId,
        capability_don: Don,
    },
}

impl ShimPlan {
    fn key(&self) -> ShimKey {
        match self {
            ShimPlan::Client {
                capability_id,
                capability_don,
                ..
            }
            | ShimPlan::Server {
                capability_id,
                capability_don,
            } => (*capability_id, capability_don.id),
        }
    }
}

enum Installed {
    New,
    Duplicate,
}

struct SyncerInner {
    reader: Arc<dyn StateReader>,
    registry: Arc<dyn CapabilityRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    peer_wrapper: Arc<dyn PeerWrapper>,
    config: SyncerConfig,
    bootstrap: BootstrapSetup,
    shims: Mutex<HashMap<ShimKey, TrackedShim>>,
    /// Serializes ticks, including manual `reconcile_now` calls.
    tick_gate: tokio::sync::Mutex<()>,
    /// Set after the first successful on-chain read; bootstrap seeding stops
    /// being offered from then on.
    synced_from_chain: AtomicBool,
    /// Set when bootstrap trigger discovery exhausts its budget, so the
    /// abandoned path is not retried on every bootstrap-seeded tick.
    bootstrap_discovery_abandoned: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

/// Keeps the node's peer set and capability shims in sync with the
/// registry. Lifecycle: created → started → closed, no restart.
pub struct RegistrySyncer {
    inner: Arc<SyncerInner>,
    phase: Mutex<Phase>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RegistrySyncer {
    pub fn new(
        reader: Arc<dyn StateReader>,
        registry: Arc<dyn CapabilityRegistry>,
        dispatcher: Arc<dyn Dispatcher>,
        peer_wrapper: Arc<dyn PeerWrapper>,
        config: SyncerConfig,
        bootstrap: BootstrapSetup,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SyncerInner {
                reader,
                registry,
                dispatcher,
                peer_wrapper,
                config,
                bootstrap,
                shims: Mutex::new(HashMap::new()),
                tick_gate: tokio::sync::Mutex::new(()),
                synced_from_chain: AtomicBool::new(false),
                bootstrap_discovery_abandoned: AtomicBool::new(false),
                stop_tx,
            }),
            phase: Mutex::new(Phase::Created),
            worker: Mutex::new(None),
        }
    }

    /// Starts the reconciliation worker. The first tick runs immediately.
    pub fn start(&self) -> SyncResult<()> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::Created => *phase = Phase::Started,
                Phase::Started | Phase::Stopped => return Err(SyncError::AlreadyStarted),
            }
        }

        let inner = self.inner.clone();
        let mut stop_rx = self.inner.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.tick_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        match inner.sync_once().await {
                            Ok(report) => log_report(&report),
                            Err(e) => warn!(error = %e, "reconciliation tick failed"),
                        }
                    }
                }
            }
            debug!("reconciliation loop stopped");
        });
        *self.worker.lock() = Some(handle);
        info!("registry syncer started");
        Ok(())
    }

    /// Runs one reconciliation tick outside the timer, serialized against
    /// the worker's own ticks.
    pub async fn reconcile_now(&self) -> SyncResult<TickReport> {
        self.inner.sync_once().await
    }

    /// Keys of the currently tracked shims.
    pub fn tracked_shims(&self) -> Vec<ShimKey> {
        self.inner.shims.lock().keys().copied().collect()
    }

    /// Stops the worker, closes every tracked shim, and disconnects all
    /// peers. Individual shim close errors are logged; only the final
    /// peer-disconnect error is returned.
    pub async fn close(&self) -> SyncResult<()> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::Started => *phase = Phase::Stopped,
                Phase::Created | Phase::Stopped => return Err(SyncError::NotStarted),
            }
        }

        let _ = self.inner.stop_tx.send(true);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "reconciliation worker did not exit cleanly");
            }
        }

        let tracked: Vec<(ShimKey, TrackedShim)> =
            self.inner.shims.lock().drain().collect();
        for (key, shim) in tracked {
            if let Err(e) = shim.service.close().await {
                warn!(
                    name = shim.service.name(),
                    capability_id = %key.0.short(),
                    don_id = %key.1,
                    error = %e,
                    "failed to close a sub-service"
                );
            }
        }

        info!("registry syncer closed");
        self.inner
            .peer_wrapper
            .get_peer()
            .update_connections(HashMap::new())
            .await
            .map_err(SyncError::PeerUpdate)
    }
}

impl SyncerInner {
    async fn sync_once(self: &Arc<Self>) -> SyncResult<TickReport> {
        let _gate = self.tick_gate.lock().await;
        let mut report = TickReport::default();

        let state = match self.reader.state().await {
            Ok(state) => {
                self.synced_from_chain.store(true, Ordering::SeqCst);
                report.source = SnapshotSource::Chain;
                state
            }
            Err(e) if !self.synced_from_chain.load(Ordering::SeqCst) => {
                info!(
                    error = %e,
                    "registry not readable yet; seeding from the bootstrap network description"
                );
                report.source = SnapshotSource::Bootstrap;
                self.bootstrap.initial_state()
            }
            Err(e) => return Err(SyncError::Read(e)),
        };

        let peer = self.peer_wrapper.get_peer();
        let my_id = peer.id();

        let classification = classify(&state, &my_id);

        // Peer topology first: peers must be connectable before any shim
        // tries to use them. Exactly one update per tick.
        let peers = desired_peer_set(&state, &self.bootstrap.static_peers);
        report.peer_count = peers.len();
        if let Err(e) = peer.update_connections(peers).await {
            report.topology_error = Some(e);
        }

        let plans = self.plan_shims(&classification, report.source);
        self.remove_stale_shims(&plans, &mut report).await;

        let factory = ShimFactory::new(
            self.registry.clone(),
            self.dispatcher.clone(),
            self.config.clone(),
            my_id,
        );
        for plan in plans {
            let key = plan.key();
            if self.shims.lock().contains_key(&key) {
                continue;
            }
            match self
                .execute_plan(&factory, &state, &classification, report.source, plan)
                .await
            {
                Ok(Installed::New) => report.installed.push(key),
                Ok(Installed::Duplicate) => report.duplicates += 1,
                Err(error) => {
                    if matches!(error, ShimError::DiscoveryExhausted { .. }) {
                        self.bootstrap_discovery_abandoned
                            .store(true, Ordering::SeqCst);
                    }
                    report.shim_failures.push(ShimFailure {
                        capability_id: key.0,
                        don_id: key.1,
                        error,
                    });
                }
            }
        }

        Ok(report)
    }

    /// Computes the desired shim set for this snapshot.
    fn plan_shims(
        &self,
        classification: &DonClassification,
        source: SnapshotSource,
    ) -> Vec<ShimPlan> {
        let mut plans = Vec::new();

        // Client shims: only relevant while this node executes workflows.
        if let Some(workflow_don) = classification.my_workflow_dons.first() {
            for don in &classification.remote_capability_dons {
                for configuration in &don.capability_configurations {
                    plans.push(ShimPlan::Client {
                        capability_id: configuration.capability_id,
                        capability_don: don.clone(),
                        workflow_don: workflow_don.clone(),
                    });
                }
            }
        }

        // Server shims: expose every capability hosted by a DON we belong to.
        for don in &classification.my_capability_dons {
            for configuration in &don.capability_configurations {
                if source == SnapshotSource::Bootstrap
                    && self.bootstrap_discovery_abandoned.load(Ordering::SeqCst)
                {
                    debug!(
                        capability_id = %configuration.capability_id.short(),
                        "bootstrap discovery abandoned; skipping server shim until on-chain sync"
                    );
                    continue;
                }
                plans.push(ShimPlan::Server {
                    capability_id: configuration.capability_id,
                    capability_don: don.clone(),
                });
            }
        }

        plans
    }

    /// Closes and unbinds tracked shims whose key left the snapshot.
    async fn remove_stale_shims(&self, plans: &[ShimPlan], report: &mut TickReport) {
        let desired: HashSet<ShimKey> = plans.iter().map(ShimPlan::key).collect();
        let stale: Vec<(ShimKey, TrackedShim)> = {
            let mut shims = self.shims.lock();
            let keys: Vec<ShimKey> = shims
                .keys()
                .filter(|k| !desired.contains(*k))
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|k| shims.remove(&k).map(|s| (k, s)))
                .collect()
        };

        for (key, shim) in stale {
            info!(
                capability_id = %key.0.short(),
                don_id = %key.1,
                "capability left the registry; closing its shim"
            );
            self.dispatcher.remove_receiver(&key.0, key.1).await;
            if shim.registered {
                self.registry.remove(&key.0).await;
            }
            if let Err(e) = shim.service.close().await {
                warn!(
                    name = shim.service.name(),
                    error = %e,
                    "failed to close a removed shim"
                );
            }
            report.removed.push(key);
        }
    }

    async fn execute_plan(
        self: &Arc<Self>,
        factory: &ShimFactory,
        state: &RegistryState,
        classification: &DonClassification,
        source: SnapshotSource,
        plan: ShimPlan,
    ) -> Result<Installed, ShimError> {
        match plan {
            ShimPlan::Client {
                capability_id,
                capability_don,
                workflow_don,
            } => {
                let capability =
                    state
                        .capability(&capability_id)
                        .ok_or(ShimError::DanglingCapability {
                            capability_id,
                            don_id: capability_don.id,
                        })?;
                let built =
                    factory.build_client_shim(capability, &capability_don, &workflow_don, state)?;
                self.install(built).await
            }
            ShimPlan::Server {
                capability_id,
                capability_don,
            } => {
                let capability =
                    state
                        .capability(&capability_id)
                        .ok_or(ShimError::DanglingCapability {
                            capability_id,
                            don_id: capability_don.id,
                        })?;
                // A locally hosted trigger may not be published yet while
                // the node is still coming up on the bootstrap description;
                // only that path gets the bounded discovery retry.
                let discovery = if source == SnapshotSource::Bootstrap {
                    Discovery::Retry {
                        attempts: self.config.discovery_retry_attempts,
                        delay: self.config.discovery_retry_delay(),
                    }
                } else {
                    Discovery::Single
                };
                let mut stop_rx = self.stop_tx.subscribe();
                let built = factory
                    .build_server_shim(
                        capability,
                        &capability_don,
                        &classification.remote_workflow_dons,
                        state,
                        discovery,
                        &mut stop_rx,
                    )
                    .await?;
                self.install(built).await
            }
        }
    }

    /// The registration chain: register → bind → start → track, in that
    /// order. A failure at any step aborts only this capability's setup.
    async fn install(&self, built: BuiltShim) -> Result<Installed, ShimError> {
        let registered = if let Some(entry) = built.entry {
            match self.registry.add(entry).await {
                Ok(()) => true,
                Err(RegistryError::AlreadyExists(id)) => {
                    // Handled in a previous iteration; not an error.
                    debug!(capability_id = %id.short(), "capability already registered; skipping");
                    return Ok(Installed::Duplicate);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            false
        };

        if let Err(e) = self
            .dispatcher
            .set_receiver(built.key.0, built.key.1, built.receiver)
            .await
        {
            if registered {
                self.registry.remove(&built.key.0).await;
            }
            return Err(e.into());
        }

        if let Err(e) = built.service.start().await {
            self.dispatcher.remove_receiver(&built.key.0, built.key.1).await;
            if registered {
                self.registry.remove(&built.key.0).await;
            }
            return Err(ShimError::Start(e));
        }

        debug!(
            capability_id = %built.key.0.short(),
            don_id = %built.key.1,
            name = built.service.name(),
            "capability shim installed"
        );
        self.shims.lock().insert(
            built.key,
            TrackedShim {
                service: built.service,
                registered,
            },
        );
        Ok(Installed::New)
    }
}

fn log_report(report: &TickReport) {
    if let Some(e) = &report.topology_error {
        warn!(error = %e, "peer topology update failed");
    }
    for failure in &report.shim_failures {
        match &failure.error {
            ShimError::DiscoveryExhausted { .. } => {
                error!(
                    capability_id = %failure.capability_id.short(),
                    don_id = %failure.don_id,
                    error = %failure.error,
                    "abandoning bootstrap trigger discovery"
                );
            }
            ShimError::UnsupportedCapabilityType(t) => {
                warn!(
                    capability_id = %failure.capability_id.short(),
                    don_id = %failure.don_id,
                    capability_type = %t,
                    "no remote shim for this capability type; skipping"
                );
            }
            ShimError::DiscoveryCancelled => {
                debug!(
                    capability_id = %failure.capability_id.short(),
                    "trigger discovery cancelled by shutdown"
                );
            }
            error => {
                warn!(
                    capability_id = %failure.capability_id.short(),
                    don_id = %failure.don_id,
                    error = %error,
                    "capability shim setup failed"
                );
            }
        }
    }
    debug!(
        source = ?report.source,
        peers = report.peer_count,
        installed = report.installed.len(),
        removed = report.removed.len(),
        duplicates = report.duplicates,
        "reconciliation tick complete"
    );
}
