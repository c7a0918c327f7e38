//! Remote trigger shims.
//!
//! [`TriggerSubscriber`] is the client side: it runs on workflow-DON nodes,
//! keeps its registration alive on every member of the capability DON, and
//! surfaces events only once a quorum of signed, identical responses has
//! arrived. [`TriggerPublisher`] is the server side: it wraps the local
//! trigger implementation and fans events out to the registered members of
//! authorized remote workflow DONs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capmesh_core::{
    BaseCapability, CapabilityId, CapabilityInfo, CoreError, CoreResult, DonId, DonInfo, PeerId,
    Service, TriggerCapability, TriggerEvent, TriggerRegistration, SIGNER_SIZE,
};
use capmesh_config as config;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::aggregator::SignedAggregator;
use crate::dispatcher::{Dispatcher, Receiver};
use crate::error::NetworkError;
use crate::message::{
    decode, encode, MessageKind, RemoteMessage, SignedTriggerEvent, TriggerRegistrationEnvelope,
};

/// Capacity of the event channel handed to local subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 1_000;

/// Timing and quorum configuration for remote trigger shims.
#[derive(Debug, Clone)]
pub struct RemoteTriggerConfig {
    pub registration_refresh: Duration,
    pub registration_expiry: Duration,
    pub min_responses_to_aggregate: usize,
}

impl Default for RemoteTriggerConfig {
    fn default() -> Self {
        Self {
            registration_refresh: Duration::from_millis(config::DEFAULT_REGISTRATION_REFRESH_MS),
            registration_expiry: Duration::from_millis(config::DEFAULT_REGISTRATION_EXPIRY_MS),
            min_responses_to_aggregate: 1,
        }
    }
}

struct PendingEvent {
    responses: Vec<SignedTriggerEvent>,
    first_seen: Instant,
    delivered: bool,
}

struct SubscriberState {
    running: bool,
    refresh_task: Option<JoinHandle<()>>,
    subscribers: HashMap<String, mpsc::Sender<TriggerEvent>>,
    pending: HashMap<String, PendingEvent>,
}

/// Client-side shim for a trigger capability hosted on a remote DON.
pub struct TriggerSubscriber {
    config: RemoteTriggerConfig,
    info: CapabilityInfo,
    capability_don: DonInfo,
    workflow_don: DonInfo,
    local_peer: PeerId,
    dispatcher: Arc<dyn Dispatcher>,
    aggregator: SignedAggregator,
    state: Mutex<SubscriberState>,
    stop_tx: watch::Sender<bool>,
}

impl TriggerSubscriber {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RemoteTriggerConfig,
        info: CapabilityInfo,
        capability_don: DonInfo,
        workflow_don: DonInfo,
        local_peer: PeerId,
        dispatcher: Arc<dyn Dispatcher>,
        aggregator: SignedAggregator,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            info,
            capability_don,
            workflow_don,
            local_peer,
            dispatcher,
            aggregator,
            state: Mutex::new(SubscriberState {
                running: false,
                refresh_task: None,
                subscribers: HashMap::new(),
                pending: HashMap::new(),
            }),
            stop_tx,
        }
    }

    /// Quorum this subscriber demands before accepting an event.
    pub fn min_responses(&self) -> usize {
        self.aggregator.min_required()
    }

    fn spawn_refresh_loop(&self) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let members = self.capability_don.members.clone();
        let capability_id = self.info.id;
        let don_id = self.capability_don.id;
        let workflow_don = self.workflow_don.id;
        let local_peer = self.local_peer;
        let refresh = self.config.registration_refresh;
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        send_registrations(
                            &*dispatcher,
                            &members,
                            capability_id,
                            don_id,
                            workflow_don,
                            local_peer,
                        )
                        .await;
                    }
                }
            }
        })
    }
}

async fn send_registrations(
    dispatcher: &dyn Dispatcher,
    members: &[PeerId],
    capability_id: CapabilityId,
    don_id: DonId,
    workflow_don: DonId,
    local_peer: PeerId,
) {
    let envelope = TriggerRegistrationEnvelope {
        registration: TriggerRegistration {
            subscriber_id: local_peer.to_string(),
        },
        workflow_don,
    };
    let payload = match encode(&envelope) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "failed to encode trigger registration");
            return;
        }
    };
    for member in members {
        let message = RemoteMessage {
            capability_id,
            don_id,
            sender: local_peer,
            kind: MessageKind::RegisterTrigger,
            payload: payload.clone(),
        };
        if let Err(e) = dispatcher.send(*member, message).await {
            warn!(peer = %member.short(), error = %e, "trigger registration send failed");
        }
    }
}

impl BaseCapability for TriggerSubscriber {
    fn info(&self) -> CapabilityInfo {
        self.info.clone()
    }
}

#[async_trait]
impl TriggerCapability for TriggerSubscriber {
    async fn register_trigger(
        &self,
        registration: TriggerRegistration,
    ) -> CoreResult<mpsc::Receiver<TriggerEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.state
            .lock()
            .subscribers
            .insert(registration.subscriber_id, tx);
        Ok(rx)
    }

    async fn unregister_trigger(&self, registration: TriggerRegistration) -> CoreResult<()> {
        self.state
            .lock()
            .subscribers
            .remove(&registration.subscriber_id);
        Ok(())
    }
}

#[async_trait]
impl Service for TriggerSubscriber {
    fn name(&self) -> &'static str {
        "trigger-subscriber"
    }

    async fn start(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.running {
            return Err(CoreError::AlreadyStarted(self.name()));
        }
        state.running = true;
        state.refresh_task = Some(self.spawn_refresh_loop());
        Ok(())
    }

    async fn close(&self) -> CoreResult<()> {
        let task = {
            let mut state = self.state.lock();
            if !state.running {
                return Err(CoreError::NotRunning(self.name()));
            }
            state.running = false;
            state.subscribers.clear();
            state.pending.clear();
            state.refresh_task.take()
        };
        let _ = self.stop_tx.send(true);
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }
}

#[async_trait]
impl Receiver for TriggerSubscriber {
    async fn receive(&self, message: RemoteMessage) {
        if message.kind != MessageKind::TriggerEvent {
            debug!(kind = ?message.kind, "subscriber ignoring unexpected message kind");
            return;
        }
        if !self.capability_don.members.contains(&message.sender) {
            warn!(
                peer = %message.sender.short(),
                "trigger event from non-member of the capability DON; dropping"
            );
            return;
        }
        let envelope: SignedTriggerEvent = match decode(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "undecodable trigger event payload");
                return;
            }
        };

        let expiry = self.config.registration_expiry;
        let fanout = {
            let mut state = self.state.lock();
            if !state.running {
                return;
            }
            state
                .pending
                .retain(|_, p| p.first_seen.elapsed() < expiry);

            let accepted = {
                let pending = state
                    .pending
                    .entry(envelope.event.event_id.clone())
                    .or_insert_with(|| PendingEvent {
                        responses: Vec::new(),
                        first_seen: Instant::now(),
                        delivered: false,
                    });
                if pending.delivered {
                    None
                } else {
                    pending.responses.push(envelope);
                    match self.aggregator.aggregate(&pending.responses) {
                        Ok(event) => {
                            pending.delivered = true;
                            pending.responses.clear();
                            Some(event)
                        }
                        Err(NetworkError::QuorumNotReached { got, need }) => {
                            debug!(got, need, "trigger event below quorum; holding");
                            None
                        }
                        Err(e) => {
                            warn!(error = %e, "trigger aggregation failed");
                            None
                        }
                    }
                }
            };
            accepted.map(|event| {
                let targets: Vec<_> = state.subscribers.values().cloned().collect();
                (event, targets)
            })
        };

        if let Some((event, targets)) = fanout {
            debug!(event_id = %event.event_id, "trigger event accepted at quorum");
            for tx in targets {
                if tx.send(event.clone()).await.is_err() {
                    debug!("local subscriber went away; dropping event");
                }
            }
        }
    }
}

struct PublisherState {
    running: bool,
    forward_task: Option<JoinHandle<()>>,
}

/// Server-side shim exposing a local trigger capability to remote workflow
/// DONs.
pub struct TriggerPublisher {
    config: RemoteTriggerConfig,
    underlying: Arc<dyn TriggerCapability>,
    info: CapabilityInfo,
    capability_don: DonInfo,
    workflow_dons: HashMap<DonId, DonInfo>,
    dispatcher: Arc<dyn Dispatcher>,
    local_peer: PeerId,
    signer: [u8; SIGNER_SIZE],
    registrations: Arc<Mutex<HashMap<(DonId, PeerId), Instant>>>,
    state: Mutex<PublisherState>,
    stop_tx: watch::Sender<bool>,
}

impl TriggerPublisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RemoteTriggerConfig,
        underlying: Arc<dyn TriggerCapability>,
        info: CapabilityInfo,
        capability_don: DonInfo,
        workflow_dons: HashMap<DonId, DonInfo>,
        dispatcher: Arc<dyn Dispatcher>,
        local_peer: PeerId,
        signer: [u8; SIGNER_SIZE],
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            underlying,
            info,
            capability_don,
            workflow_dons,
            dispatcher,
            local_peer,
            signer,
            registrations: Arc::new(Mutex::new(HashMap::new())),
            state: Mutex::new(PublisherState {
                running: false,
                forward_task: None,
            }),
            stop_tx,
        }
    }

    fn registration_id(&self) -> String {
        format!("remote-publisher-{}", self.capability_don.id)
    }

    /// Number of live remote registrations, for inspection.
    pub fn registration_count(&self) -> usize {
        let expiry = self.config.registration_expiry;
        self.registrations
            .lock()
            .values()
            .filter(|t| t.elapsed() < expiry)
            .count()
    }

    fn spawn_forward_loop(&self, mut events: mpsc::Receiver<TriggerEvent>) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let registrations = self.registrations.clone();
        let capability_id = self.info.id;
        let don_id = self.capability_don.id;
        let local_peer = self.local_peer;
        let signer = self.signer;
        let expiry = self.config.registration_expiry;
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    maybe_event = events.recv() => {
                        let Some(event) = maybe_event else {
                            debug!("underlying trigger stream ended");
                            break;
                        };
                        let envelope = SignedTriggerEvent { event, signer };
                        let payload = match encode(&envelope) {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, "failed to encode trigger event");
                                continue;
                            }
                        };
                        let recipients: Vec<PeerId> = {
                            let mut regs = registrations.lock();
                            regs.retain(|_, t| t.elapsed() < expiry);
                            regs.keys().map(|(_, peer)| *peer).collect()
                        };
                        let sends = recipients.into_iter().map(|peer| {
                            let message = RemoteMessage {
                                capability_id,
                                don_id,
                                sender: local_peer,
                                kind: MessageKind::TriggerEvent,
                                payload: payload.clone(),
                            };
                            let dispatcher = dispatcher.clone();
                            async move {
                                if let Err(e) = dispatcher.send(peer, message).await {
                                    warn!(peer = %peer.short(), error = %e, "trigger fan-out failed");
                                }
                            }
                        });
                        futures::future::join_all(sends).await;
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Service for TriggerPublisher {
    fn name(&self) -> &'static str {
        "trigger-publisher"
    }

    async fn start(&self) -> CoreResult<()> {
        {
            let mut state = self.state.lock();
            if state.running {
                return Err(CoreError::AlreadyStarted(self.name()));
            }
            state.running = true;
        }
        let events = match self
            .underlying
            .register_trigger(TriggerRegistration {
                subscriber_id: self.registration_id(),
            })
            .await
        {
            Ok(events) => events,
            Err(e) => {
                self.state.lock().running = false;
                return Err(e);
            }
        };
        self.state.lock().forward_task = Some(self.spawn_forward_loop(events));
        Ok(())
    }

    async fn close(&self) -> CoreResult<()> {
        let task = {
            let mut state = self.state.lock();
            if !state.running {
                return Err(CoreError::NotRunning(self.name()));
            }
            state.running = false;
            state.forward_task.take()
        };
        let _ = self.stop_tx.send(true);
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Err(e) = self
            .underlying
            .unregister_trigger(TriggerRegistration {
                subscriber_id: self.registration_id(),
            })
            .await
        {
            warn!(error = %e, "failed to unregister from the underlying trigger");
        }
        self.registrations.lock().clear();
        Ok(())
    }
}

#[async_trait]
impl Receiver for TriggerPublisher {
    async fn receive(&self, message: RemoteMessage) {
        match message.kind {
            MessageKind::RegisterTrigger => {
                let envelope: TriggerRegistrationEnvelope = match decode(&message.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "undecodable trigger registration");
                        return;
                    }
                };
                let Some(don) = self.workflow_dons.get(&envelope.workflow_don) else {
                    warn!(
                        don_id = %envelope.workflow_don,
                        peer = %message.sender.short(),
                        "registration from unauthorized workflow DON; dropping"
                    );
                    return;
                };
                if !don.members.contains(&message.sender) {
                    warn!(
                        don_id = %don.id,
                        peer = %message.sender.short(),
                        "registration from non-member of its workflow DON; dropping"
                    );
                    return;
                }
                self.registrations
                    .lock()
                    .insert((envelope.workflow_don, message.sender), Instant::now());
                debug!(
                    don_id = %envelope.workflow_don,
                    peer = %message.sender.short(),
                    "trigger registration accepted"
                );
            }
            MessageKind::UnregisterTrigger => {
                let envelope: TriggerRegistrationEnvelope = match decode(&message.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(error = %e, "undecodable trigger unregistration");
                        return;
                    }
                };
                self.registrations
                    .lock()
                    .remove(&(envelope.workflow_don, message.sender));
            }
            other => {
                debug!(kind = ?other, "publisher ignoring unexpected message kind");
            }
        }
    }
}
