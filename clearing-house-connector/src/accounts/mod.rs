//! Polling-based account synchronization.
//!
//! The [`bulk_loader`] polls the cluster for every registered address and
//! dispatches content changes; [`subscriber`] builds typed, cached
//! subscriptions on top of it.

pub mod bulk_loader;
pub mod decode;
pub mod subscriber;
pub mod types;

pub use bulk_loader::{
    AccountChangeCallback, BulkAccountLoader, BulkAccountLoaderHandle, MIN_POLLING_FREQUENCY,
};
pub use decode::{AccountDecoder, AnchorAccountDecoder};
pub use subscriber::{
    AccountSubscriber, PollingAccountSubscriber, SubscriberEvent, SubscriberListener,
};
pub use types::{AccountChange, AccountSnapshot, DataAndSlot, ListenerId, SubscriptionId};
