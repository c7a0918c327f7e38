//! Dev-mode streams feed.
//!
//! A stand-in for the real data-streams trigger: emits a small set of
//! synthetic price reports on a fixed interval so the server-side publisher
//! path has something to fan out. Only wired up when this node is a member
//! of the configured trigger DON.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use capmesh_core::{
    BaseCapability, CapabilityInfo, CoreError, CoreResult, Service, TriggerCapability,
    TriggerEvent, TriggerRegistration,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const FEED_INTERVAL: Duration = Duration::from_secs(60);
const EVENT_CHANNEL_CAPACITY: usize = 1_000;

/// One synthetic price report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedReport {
    pub feed_id: String,
    pub benchmark_price: u64,
    pub observation_timestamp: u64,
}

struct FeedState {
    running: bool,
    producer: Option<JoinHandle<()>>,
}

/// Synthetic trigger capability producing price reports.
pub struct DevStreamsFeed {
    info: CapabilityInfo,
    subscribers: Arc<Mutex<HashMap<String, mpsc::Sender<TriggerEvent>>>>,
    state: Mutex<FeedState>,
    stop_tx: watch::Sender<bool>,
}

impl DevStreamsFeed {
    pub fn new(info: CapabilityInfo) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            info,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            state: Mutex::new(FeedState {
                running: false,
                producer: None,
            }),
            stop_tx,
        }
    }

    fn spawn_producer(&self) -> JoinHandle<()> {
        let subscribers = self.subscribers.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FEED_INTERVAL);
            let mut prices: [u64; 3] = [300_000, 40_000, 5_000_000];
            let mut sequence: u64 = 0;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        for price in prices.iter_mut() {
                            *price += 1;
                        }
                        sequence += 1;

                        let timestamp = SystemTime::now()
                            .duration_since(UNIX_EPOCH)
                            .map(|d| d.as_secs())
                            .unwrap_or_default();
                        let reports: Vec<FeedReport> = ["eth-usd", "btc-usd", "link-usd"]
                            .iter()
                            .zip(prices)
                            .map(|(feed_id, benchmark_price)| FeedReport {
                                feed_id: (*feed_id).to_string(),
                                benchmark_price,
                                observation_timestamp: timestamp,
                            })
                            .collect();
                        let payload = match serde_json::to_vec(&reports) {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, "failed to encode feed reports");
                                continue;
                            }
                        };
                        let event = TriggerEvent {
                            event_id: format!("reports-{sequence}"),
                            payload,
                        };

                        let targets: Vec<_> = subscribers.lock().values().cloned().collect();
                        debug!(sequence, subscribers = targets.len(), "emitting feed reports");
                        for tx in targets {
                            if tx.send(event.clone()).await.is_err() {
                                debug!("feed subscriber went away");
                            }
                        }
                    }
                }
            }
        })
    }
}

impl BaseCapability for DevStreamsFeed {
    fn info(&self) -> CapabilityInfo {
        self.info.clone()
    }
}

#[async_trait]
impl TriggerCapability for DevStreamsFeed {
    async fn register_trigger(
        &self,
        registration: TriggerRegistration,
    ) -> CoreResult<mpsc::Receiver<TriggerEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .insert(registration.subscriber_id, tx);
        Ok(rx)
    }

    async fn unregister_trigger(&self, registration: TriggerRegistration) -> CoreResult<()> {
        self.subscribers
            .lock()
            .remove(&registration.subscriber_id);
        Ok(())
    }
}

#[async_trait]
impl Service for DevStreamsFeed {
    fn name(&self) -> &'static str {
        "dev-streams-feed"
    }

    async fn start(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.running {
            return Err(CoreError::AlreadyStarted(self.name()));
        }
        state.running = true;
        state.producer = Some(self.spawn_producer());
        info!("dev streams feed started");
        Ok(())
    }

    async fn close(&self) -> CoreResult<()> {
        let task = {
            let mut state = self.state.lock();
            if !state.running {
                return Err(CoreError::NotRunning(self.name()));
            }
            state.running = false;
            state.producer.take()
        };
        let _ = self.stop_tx.send(true);
        if let Some(task) = task {
            let _ = task.await;
        }
        self.subscribers.lock().clear();
        Ok(())
    }
}

/// Builds the feed capability for the configured bootstrap trigger.
pub fn feed_for(info: CapabilityInfo) -> Arc<DevStreamsFeed> {
    Arc::new(DevStreamsFeed::new(info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use capmesh_core::{CapabilityId, CapabilityType, Word32};

    fn info() -> CapabilityInfo {
        let name = Word32::new("streams-trigger").expect("fits");
        let version = Word32::new("1.0.0").expect("fits");
        CapabilityInfo {
            id: CapabilityId::derive(&name, &version),
            capability_type: CapabilityType::Trigger,
            description: "dev feed".to_string(),
            version: "1.0.0".to_string(),
            don: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_reports_to_subscribers() {
        let feed = DevStreamsFeed::new(info());
        feed.start().await.expect("start");

        let mut events = feed
            .register_trigger(TriggerRegistration {
                subscriber_id: "publisher".to_string(),
            })
            .await
            .expect("register");

        // First tick is immediate, the next after the interval.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let first = events.try_recv().expect("first report batch");
        let reports: Vec<FeedReport> = serde_json::from_slice(&first.payload).expect("decode");
        assert_eq!(reports.len(), 3);

        tokio::time::sleep(FEED_INTERVAL).await;
        let second = events.try_recv().expect("second report batch");
        assert_ne!(first.event_id, second.event_id);

        feed.close().await.expect("close");
    }
}
