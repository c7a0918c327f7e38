//! End-to-end tests of the reconciliation engine against in-process
//! collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capmesh_config::{BootstrapConfig, DonDescriptor, SyncerConfig};
use capmesh_core::{
    BaseCapability, Capability, CapabilityConfiguration, CapabilityEntry, CapabilityId,
    CapabilityInfo, CapabilityRegistry, CapabilityType, CoreResult, Don, DonId, LocalRegistry,
    NodeInfo, PeerId, RegistryError, TargetCapability, TriggerCapability, TriggerEvent,
    TriggerRegistration, Word32,
};
use capmesh_network::{InProcessNetwork, Peer, PeerWrapper, StreamConfig};
use capmesh_syncer::{
    BootstrapSetup, BoundContract, RegistrySyncer, RemoteRegistryReader, ShimError,
    SimulatedRegistryContract, SnapshotSource, SyncError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

fn peer(tag: u8) -> PeerId {
    PeerId::from_bytes([tag; 32])
}

const SELF: u8 = 1;

fn capability(name: &str, capability_type: CapabilityType) -> Capability {
    Capability {
        labelled_name: Word32::new(name).expect("fits"),
        version: Word32::new("1.0.0").expect("fits"),
        capability_type,
        response_type: 0,
    }
}

fn don(id: u32, members: Vec<PeerId>) -> Don {
    Don {
        id: DonId(id),
        is_public: true,
        accepts_workflows: false,
        f: 1,
        members,
        capability_configurations: Vec::new(),
    }
}

fn workflow_don(id: u32, members: Vec<PeerId>) -> Don {
    let mut d = don(id, members);
    d.accepts_workflows = true;
    d
}

fn hosting(mut d: Don, capabilities: &[&Capability]) -> Don {
    for c in capabilities {
        d.capability_configurations.push(CapabilityConfiguration {
            capability_id: c.id(),
            config: Vec::new(),
        });
    }
    d
}

fn nodes_with_signers(members: &[PeerId]) -> Vec<NodeInfo> {
    members
        .iter()
        .enumerate()
        .map(|(i, peer_id)| NodeInfo {
            peer_id: *peer_id,
            signer: [i as u8 + 1; 20],
        })
        .collect()
}

/// Records every `update_connections` call.
struct RecordingPeer {
    id: PeerId,
    calls: Mutex<Vec<HashMap<PeerId, StreamConfig>>>,
}

impl RecordingPeer {
    fn new(id: PeerId) -> Arc<Self> {
        Arc::new(Self {
            id,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn last_call(&self) -> HashMap<PeerId, StreamConfig> {
        self.calls.lock().last().cloned().expect("at least one call")
    }
}

#[async_trait]
impl Peer for RecordingPeer {
    fn id(&self) -> PeerId {
        self.id
    }

    async fn update_connections(
        &self,
        peers: HashMap<PeerId, StreamConfig>,
    ) -> capmesh_network::NetworkResult<()> {
        self.calls.lock().push(peers);
        Ok(())
    }
}

struct RecordingPeerWrapper(Arc<RecordingPeer>);

impl PeerWrapper for RecordingPeerWrapper {
    fn get_peer(&self) -> Arc<dyn Peer> {
        self.0.clone()
    }
}

/// Counts `get_trigger` lookups on top of a [`LocalRegistry`].
struct CountingRegistry {
    inner: LocalRegistry,
    trigger_gets: AtomicU32,
}

impl CountingRegistry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LocalRegistry::new(),
            trigger_gets: AtomicU32::new(0),
        })
    }

    fn trigger_get_count(&self) -> u32 {
        self.trigger_gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityRegistry for CountingRegistry {
    async fn add(&self, entry: CapabilityEntry) -> Result<(), RegistryError> {
        self.inner.add(entry).await
    }

    async fn get(&self, id: &CapabilityId) -> Result<CapabilityEntry, RegistryError> {
        self.inner.get(id).await
    }

    async fn get_trigger(
        &self,
        id: &CapabilityId,
    ) -> Result<Arc<dyn TriggerCapability>, RegistryError> {
        self.trigger_gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_trigger(id).await
    }

    async fn get_target(
        &self,
        id: &CapabilityId,
    ) -> Result<Arc<dyn TargetCapability>, RegistryError> {
        self.inner.get_target(id).await
    }

    async fn remove(&self, id: &CapabilityId) {
        self.inner.remove(id).await
    }
}

/// Minimal local trigger implementation for the server-side path.
struct LocalFeed {
    info: CapabilityInfo,
    subscribers: Mutex<HashMap<String, mpsc::Sender<TriggerEvent>>>,
}

impl LocalFeed {
    fn new(capability: &Capability) -> Arc<Self> {
        Arc::new(Self {
            info: CapabilityInfo {
                id: capability.id(),
                capability_type: CapabilityType::Trigger,
                description: "local feed".to_string(),
                version: "1.0.0".to_string(),
                don: None,
            },
            subscribers: Mutex::new(HashMap::new()),
        })
    }
}

impl BaseCapability for LocalFeed {
    fn info(&self) -> CapabilityInfo {
        self.info.clone()
    }
}

#[async_trait]
impl TriggerCapability for LocalFeed {
    async fn register_trigger(
        &self,
        registration: TriggerRegistration,
    ) -> CoreResult<mpsc::Receiver<TriggerEvent>> {
        let (tx, rx) = mpsc::channel(16);
        self.subscribers.lock().insert(registration.subscriber_id, tx);
        Ok(rx)
    }

    async fn unregister_trigger(&self, registration: TriggerRegistration) -> CoreResult<()> {
        self.subscribers.lock().remove(&registration.subscriber_id);
        Ok(())
    }
}

struct Harness {
    contract: Arc<SimulatedRegistryContract>,
    registry: Arc<CountingRegistry>,
    network: Arc<InProcessNetwork>,
    peer: Arc<RecordingPeer>,
    syncer: RegistrySyncer,
}

fn bootstrap_config(static_peers: Vec<PeerId>, trigger_members: Vec<PeerId>) -> BootstrapConfig {
    BootstrapConfig {
        static_peers: static_peers.iter().map(PeerId::to_string).collect(),
        workflow_don: DonDescriptor {
            id: 100,
            f: 0,
            members: vec![peer(SELF).to_string()],
        },
        trigger_don: DonDescriptor {
            id: 200,
            f: 0,
            members: trigger_members.iter().map(PeerId::to_string).collect(),
        },
        trigger_don_signers: trigger_members
            .iter()
            .enumerate()
            .map(|(i, _)| format!("0x{}", hex::encode([i as u8 + 1; 20])))
            .collect(),
        trigger_capability_name: "streams-trigger".to_string(),
        trigger_capability_version: "1.0.0".to_string(),
    }
}

fn harness(config: SyncerConfig, bootstrap: BootstrapConfig) -> Harness {
    let contract = Arc::new(SimulatedRegistryContract::new());
    let reader = Arc::new(RemoteRegistryReader::new(
        contract.clone(),
        BoundContract {
            name: "capability_registry".to_string(),
            address: "0x42".to_string(),
        },
    ));
    let registry = CountingRegistry::new();
    let network = InProcessNetwork::new();
    let recording_peer = RecordingPeer::new(peer(SELF));
    let setup = BootstrapSetup::from_config(&bootstrap).expect("valid bootstrap");

    let syncer = RegistrySyncer::new(
        reader,
        registry.clone(),
        network.dispatcher_for(peer(SELF)),
        Arc::new(RecordingPeerWrapper(recording_peer.clone())),
        config,
        setup,
    );
    Harness {
        contract,
        registry,
        network,
        peer: recording_peer,
        syncer,
    }
}

fn default_harness() -> Harness {
    harness(
        SyncerConfig::default(),
        bootstrap_config(Vec::new(), vec![peer(SELF)]),
    )
}

#[tokio::test]
async fn single_workflow_don_scenario() {
    // One public workflow DON containing only this node, no capability
    // configurations anywhere: no shims either way, one connection update
    // with self plus the static peers.
    let h = harness(
        SyncerConfig::default(),
        bootstrap_config(vec![peer(9)], vec![peer(SELF)]),
    );
    h.contract
        .set_dons(vec![workflow_don(1, vec![peer(SELF)])]);

    let report = h.syncer.reconcile_now().await.expect("tick");
    assert_eq!(report.source, SnapshotSource::Chain);
    assert!(report.is_clean());
    assert!(report.installed.is_empty());
    assert!(h.syncer.tracked_shims().is_empty());

    assert_eq!(h.peer.call_count(), 1);
    let peers = h.peer.last_call();
    assert_eq!(peers.len(), 2);
    assert!(peers.contains_key(&peer(SELF)));
    assert!(peers.contains_key(&peer(9)));
}

#[tokio::test]
async fn peer_set_covers_all_public_dons_and_static_peers() {
    let h = harness(
        SyncerConfig::default(),
        bootstrap_config(vec![peer(40)], vec![peer(SELF)]),
    );
    h.contract.set_dons(vec![
        don(1, vec![peer(10), peer(11), peer(12), peer(13)]),
        don(2, vec![peer(20), peer(21), peer(22)]),
    ]);

    let report = h.syncer.reconcile_now().await.expect("tick");
    assert!(report.is_clean());
    assert_eq!(h.peer.call_count(), 1);
    assert_eq!(h.peer.last_call().len(), 8);
    assert_eq!(report.peer_count, 8);
}

fn remote_trigger_topology(h: &Harness, trigger: &Capability) {
    let cap_don = hosting(don(7, vec![peer(21), peer(22), peer(23)]), &[trigger]);
    h.contract.set_dons(vec![
        workflow_don(3, vec![peer(SELF), peer(2)]),
        cap_don.clone(),
    ]);
    h.contract.set_capabilities(vec![raw(trigger)]);
    h.contract.set_nodes(nodes_with_signers(&cap_don.members));
}

fn raw(capability: &Capability) -> capmesh_syncer::RawCapability {
    capmesh_syncer::RawCapability {
        labelled_name: *capability.labelled_name.as_bytes(),
        version: *capability.version.as_bytes(),
        capability_type: capability.capability_type.tag(),
        response_type: capability.response_type,
    }
}

#[tokio::test]
async fn installs_a_client_shim_for_a_remote_trigger() {
    let h = default_harness();
    let trigger = capability("data-streams-report", CapabilityType::Trigger);
    remote_trigger_topology(&h, &trigger);

    let report = h.syncer.reconcile_now().await.expect("tick");
    assert!(report.is_clean());
    assert_eq!(report.installed, vec![(trigger.id(), DonId(7))]);

    // Registered in the local registry, bound in the dispatcher, tracked.
    assert!(h.registry.get_trigger(&trigger.id()).await.is_ok());
    assert_eq!(
        h.network.bindings_for(&peer(SELF)),
        vec![(trigger.id(), DonId(7))]
    );
    assert_eq!(h.syncer.tracked_shims(), vec![(trigger.id(), DonId(7))]);
}

#[tokio::test]
async fn unchanged_snapshot_is_idempotent() {
    let h = default_harness();
    let trigger = capability("data-streams-report", CapabilityType::Trigger);
    remote_trigger_topology(&h, &trigger);

    let first = h.syncer.reconcile_now().await.expect("tick one");
    assert_eq!(first.installed.len(), 1);

    let second = h.syncer.reconcile_now().await.expect("tick two");
    assert!(second.is_clean());
    assert!(second.installed.is_empty());
    assert!(second.removed.is_empty());
    assert_eq!(second.duplicates, 0);

    // No duplicate bindings, one shim, two topology updates (one per tick).
    assert_eq!(h.network.bindings_for(&peer(SELF)).len(), 1);
    assert_eq!(h.syncer.tracked_shims().len(), 1);
    assert_eq!(h.peer.call_count(), 2);
}

#[tokio::test]
async fn removes_shims_when_a_don_leaves_the_registry() {
    let h = default_harness();
    let trigger = capability("data-streams-report", CapabilityType::Trigger);
    remote_trigger_topology(&h, &trigger);

    h.syncer.reconcile_now().await.expect("tick one");
    assert_eq!(h.syncer.tracked_shims().len(), 1);

    h.contract.remove_don(DonId(7));
    let report = h.syncer.reconcile_now().await.expect("tick two");
    assert_eq!(report.removed, vec![(trigger.id(), DonId(7))]);
    assert!(h.syncer.tracked_shims().is_empty());
    assert!(h.network.bindings_for(&peer(SELF)).is_empty());
    assert!(matches!(
        h.registry.get(&trigger.id()).await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn dangling_capability_reference_fails_only_that_capability() {
    let h = default_harness();
    let published = capability("data-streams-report", CapabilityType::Trigger);
    let unpublished = capability("not-on-chain-yet", CapabilityType::Trigger);

    let cap_don = hosting(
        don(7, vec![peer(21), peer(22), peer(23)]),
        &[&published, &unpublished],
    );
    h.contract
        .set_dons(vec![workflow_don(3, vec![peer(SELF)]), cap_don.clone()]);
    // Only one of the two referenced capabilities exists in the snapshot.
    h.contract.set_capabilities(vec![raw(&published)]);
    h.contract.set_nodes(nodes_with_signers(&cap_don.members));

    let report = h.syncer.reconcile_now().await.expect("tick");
    assert_eq!(report.installed, vec![(published.id(), DonId(7))]);
    assert_eq!(report.shim_failures.len(), 1);
    assert!(matches!(
        report.shim_failures[0].error,
        ShimError::DanglingCapability { capability_id, .. } if capability_id == unpublished.id()
    ));
}

#[tokio::test]
async fn action_and_consensus_capabilities_are_skipped() {
    let h = default_harness();
    let trigger = capability("data-streams-report", CapabilityType::Trigger);
    let action = capability("compute-action", CapabilityType::Action);
    let consensus = capability("ocr-consensus", CapabilityType::Consensus);

    let cap_don = hosting(
        don(7, vec![peer(21), peer(22), peer(23)]),
        &[&trigger, &action, &consensus],
    );
    h.contract
        .set_dons(vec![workflow_don(3, vec![peer(SELF)]), cap_don.clone()]);
    h.contract
        .set_capabilities(vec![raw(&trigger), raw(&action), raw(&consensus)]);
    h.contract.set_nodes(nodes_with_signers(&cap_don.members));

    let report = h.syncer.reconcile_now().await.expect("tick");
    assert_eq!(report.installed, vec![(trigger.id(), DonId(7))]);
    let unsupported = report
        .shim_failures
        .iter()
        .filter(|f| matches!(f.error, ShimError::UnsupportedCapabilityType(_)))
        .count();
    assert_eq!(unsupported, 2);
}

#[tokio::test]
async fn read_failure_after_first_sync_skips_the_tick() {
    let h = default_harness();
    let trigger = capability("data-streams-report", CapabilityType::Trigger);
    remote_trigger_topology(&h, &trigger);

    h.syncer.reconcile_now().await.expect("tick one");
    assert_eq!(h.syncer.tracked_shims().len(), 1);

    h.contract.set_fail_reads(true);
    let err = h.syncer.reconcile_now().await.unwrap_err();
    assert!(matches!(err, SyncError::Read(_)));
    // Running state is untouched by the failed tick.
    assert_eq!(h.syncer.tracked_shims().len(), 1);
    assert_eq!(h.peer.call_count(), 1);

    h.contract.set_fail_reads(false);
    let report = h.syncer.reconcile_now().await.expect("tick three");
    assert!(report.is_clean());
}

#[tokio::test(start_paused = true)]
async fn bootstrap_discovery_makes_exactly_sixty_attempts() {
    // Registry unreadable: the tick seeds from the bootstrap description,
    // where this node hosts the trigger capability. The local trigger is
    // never published, so discovery must poll exactly 60 times at 1 s
    // spacing, then give up without failing the process.
    let h = default_harness();
    h.contract.set_fail_reads(true);

    let started = tokio::time::Instant::now();
    let report = h.syncer.reconcile_now().await.expect("bootstrap tick");
    assert_eq!(report.source, SnapshotSource::Bootstrap);
    assert_eq!(h.registry.trigger_get_count(), 60);
    // 59 gaps between 60 attempts.
    assert_eq!(started.elapsed(), Duration::from_secs(59));
    assert_eq!(report.shim_failures.len(), 1);
    assert!(matches!(
        report.shim_failures[0].error,
        ShimError::DiscoveryExhausted { attempts: 60, .. }
    ));
    assert!(h.syncer.tracked_shims().is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_bootstrap_discovery_is_not_retried() {
    let h = default_harness();
    h.contract.set_fail_reads(true);

    h.syncer.reconcile_now().await.expect("first bootstrap tick");
    assert_eq!(h.registry.trigger_get_count(), 60);

    let report = h.syncer.reconcile_now().await.expect("second bootstrap tick");
    assert!(report.shim_failures.is_empty());
    assert_eq!(h.registry.trigger_get_count(), 60);
}

#[tokio::test]
async fn bootstrap_installs_a_publisher_when_the_trigger_is_published() {
    let h = default_harness();
    h.contract.set_fail_reads(true);

    // Publish the local trigger before the tick.
    let trigger = capability("streams-trigger", CapabilityType::Trigger);
    h.registry
        .add(CapabilityEntry::Trigger(LocalFeed::new(&trigger)))
        .await
        .expect("publish local trigger");

    let report = h.syncer.reconcile_now().await.expect("bootstrap tick");
    assert_eq!(report.source, SnapshotSource::Bootstrap);
    assert!(report.is_clean());
    assert_eq!(report.installed, vec![(trigger.id(), DonId(200))]);
    assert_eq!(
        h.network.bindings_for(&peer(SELF)),
        vec![(trigger.id(), DonId(200))]
    );
}

#[tokio::test(start_paused = true)]
async fn close_aborts_an_in_flight_discovery_retry() {
    let h = default_harness();
    h.contract.set_fail_reads(true);

    h.syncer.start().expect("start");
    // Let the immediate first tick enter the discovery retry.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    let before_close = h.registry.trigger_get_count();
    assert!(before_close >= 1);

    h.syncer.close().await.expect("close");
    assert!(
        h.registry.trigger_get_count() < 60,
        "shutdown must abort the retry budget early"
    );
    // Final disconnect: the last connection update is empty.
    assert!(h.peer.last_call().is_empty());
}

#[tokio::test(start_paused = true)]
async fn periodic_loop_ticks_and_shuts_down_cleanly() {
    let h = harness(
        SyncerConfig {
            tick_interval_secs: 12,
            ..SyncerConfig::default()
        },
        bootstrap_config(Vec::new(), vec![peer(SELF)]),
    );
    let trigger = capability("data-streams-report", CapabilityType::Trigger);
    remote_trigger_topology(&h, &trigger);

    h.syncer.start().expect("start");
    tokio::time::sleep(Duration::from_millis(100)).await;
    // The first iteration runs immediately, not after the first interval.
    assert_eq!(h.peer.call_count(), 1);
    assert_eq!(h.syncer.tracked_shims().len(), 1);

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(h.peer.call_count(), 2);
    assert_eq!(h.syncer.tracked_shims().len(), 1);

    h.syncer.close().await.expect("close");
    assert!(h.syncer.tracked_shims().is_empty());
    // One final empty update beyond the per-tick ones.
    assert_eq!(h.peer.call_count(), 3);
    assert!(h.peer.last_call().is_empty());
}

#[tokio::test]
async fn lifecycle_guards() {
    let h = default_harness();
    assert!(matches!(h.syncer.close().await, Err(SyncError::NotStarted)));

    h.syncer.start().expect("start");
    assert!(matches!(h.syncer.start(), Err(SyncError::AlreadyStarted)));

    h.syncer.close().await.expect("close");
    assert!(matches!(h.syncer.close().await, Err(SyncError::NotStarted)));
    assert!(matches!(h.syncer.start(), Err(SyncError::AlreadyStarted)));
}
