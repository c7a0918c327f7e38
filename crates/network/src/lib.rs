//! P2P networking seams and remote capability shims.
//!
//! This crate defines the interfaces the reconciliation engine drives — the
//! peer connection surface and the message dispatcher — together with the
//! shim implementations that proxy capabilities across DON boundaries:
//!
//! - client side: [`TriggerSubscriber`] and [`TargetClient`], registered on
//!   workflow-DON nodes to consume capabilities hosted remotely;
//! - server side: [`TriggerPublisher`] and [`TargetReceiver`], registered on
//!   capability-DON nodes to expose local implementations to remote
//!   workflow DONs.
//!
//! The transport's stream multiplexing and cryptography live behind the
//! [`Peer`] and [`Dispatcher`] traits; an in-process fabric is provided for
//! tests and dev-mode wiring.

pub mod aggregator;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod peer;
pub mod stream;
pub mod target;
pub mod trigger;

pub use aggregator::SignedAggregator;
pub use dispatcher::{Dispatcher, InProcessDispatcher, InProcessNetwork, Receiver};
pub use error::{NetworkError, NetworkResult};
pub use message::{
    decode, encode, ExecuteResponseEnvelope, MessageKind, RemoteMessage, SignedTriggerEvent,
    TriggerRegistrationEnvelope,
};
pub use peer::{InProcessPeer, InProcessPeerWrapper, Peer, PeerWrapper};
pub use stream::{StreamConfig, TokenBucketParams};
pub use target::{TargetClient, TargetReceiver};
pub use trigger::{RemoteTriggerConfig, TriggerPublisher, TriggerSubscriber};
