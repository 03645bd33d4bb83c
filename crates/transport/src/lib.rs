#![deny(unsafe_code)]

//! Pub/sub plumbing for dialog chunk streams: a shared, reference-counted transport
//! connection and per-dialog topic subscriptions on top of it.

pub mod client;
pub mod error;
pub mod memory;
pub mod registry;
pub mod subscription;

pub use client::{
    BoxFuture, ClientOptions, ConnectionStatus, StatusEvent, Subscription, TransportClient,
    TransportFactory, build_ws_url, subject_for,
};
pub use error::{TransportError, TransportResult};
pub use memory::{MemoryBroker, MemoryClient, MemoryTransportFactory};
pub use registry::{ConnectionRegistry, DEFAULT_SHARED_CLOSE_DELAY, SharedConnection};
pub use subscription::{
    DialogListener, DialogSubscription, ListenerCell, SubscriptionOptions, SubscriptionStatus,
};
