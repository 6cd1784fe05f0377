//! # Account Subscribers
//!
//! An [`AccountSubscriber<T>`] turns raw account bytes for one or more
//! addresses into decoded `T` values, keeps the latest value per address and
//! notifies its own listeners.
//!
//! [`PollingAccountSubscriber<T>`] is driven by a shared
//! [`BulkAccountLoaderHandle`]: it registers one loader listener per address and
//! decodes whatever the loader dispatches. Listener callbacks of a polling
//! subscriber therefore run on the loader task and must not block.
use crate::{
    accounts::{
        bulk_loader::BulkAccountLoaderHandle,
        decode::AccountDecoder,
        types::{DataAndSlot, ListenerId, SubscriptionId},
    },
    config::ConnectorConfig,
    error::{ConnectorError, DecodeError},
    rpc::AccountReader,
};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::RwLock;
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;

/// What a subscriber tells its listeners.
#[derive(Debug)]
pub enum SubscriberEvent<T> {
    /// A new decoded value was cached, or the account disappeared (`value: None`).
    Updated {
        address: Pubkey,
        value: Option<DataAndSlot<T>>,
        slot: u64,
    },
    /// New bytes could not be decoded. The cached value is unchanged.
    DecodeFailed {
        address: Pubkey,
        slot: u64,
        error: DecodeError,
    },
}

impl<T> Clone for SubscriberEvent<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Updated {
                address,
                value,
                slot,
            } => Self::Updated {
                address: *address,
                value: value.clone(),
                slot: *slot,
            },
            Self::DecodeFailed {
                address,
                slot,
                error,
            } => Self::DecodeFailed {
                address: *address,
                slot: *slot,
                error: error.clone(),
            },
        }
    }
}

pub type SubscriberListener<T> = Box<dyn Fn(&SubscriberEvent<T>) + Send + Sync + 'static>;

type SharedListener<T> = Arc<dyn Fn(&SubscriberEvent<T>) + Send + Sync + 'static>;

/// The consumer-facing contract of a typed account subscription.
#[async_trait]
pub trait AccountSubscriber<T: Send + Sync + 'static>: Send + Sync {
    /// Starts tracking `addresses`, decoding their data with `decoder`.
    ///
    /// The first address is the one [`get_latest`](Self::get_latest) reports.
    async fn subscribe(
        &self,
        addresses: &[Pubkey],
        decoder: Arc<dyn AccountDecoder<T>>,
    ) -> Result<(), ConnectorError>;

    /// Stops tracking and clears the cache. Calling it again is a no-op.
    async fn unsubscribe(&self) -> Result<(), ConnectorError>;

    fn is_subscribed(&self) -> bool;

    /// The latest decoded value of the first subscribed address.
    fn get_latest(&self) -> Result<Option<DataAndSlot<T>>, ConnectorError>;

    fn get_latest_for(&self, address: &Pubkey) -> Result<Option<DataAndSlot<T>>, ConnectorError>;

    fn on_change(&self, listener: SubscriberListener<T>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Loader registrations owned by a live subscription.
struct ActiveSubscription {
    subscriptions: Vec<SubscriptionId>,
    loader_listeners: Vec<ListenerId>,
}

/// State shared between the subscriber and its loader callbacks.
struct Shared<T> {
    subscribed: AtomicBool,
    addresses: RwLock<Vec<Pubkey>>,
    cache: DashMap<Pubkey, DataAndSlot<T>>,
    listeners: RwLock<Vec<(ListenerId, SharedListener<T>)>>,
    next_listener_id: AtomicU64,
    error_tx: broadcast::Sender<Arc<ConnectorError>>,
}

impl<T: Send + Sync + 'static> Shared<T> {
    /// Decodes and caches one observation of `address`.
    ///
    /// Observations older than the cached value are ignored. An absent
    /// account seen by the initial read is not announced.
    fn apply(
        &self,
        address: Pubkey,
        data: Option<&[u8]>,
        slot: u64,
        decoder: &dyn AccountDecoder<T>,
        initial: bool,
    ) {
        if !self.subscribed.load(Ordering::Acquire) {
            return;
        }

        let event = match data {
            None => {
                let removed = self
                    .cache
                    .remove_if(&address, |_, cached| cached.slot <= slot)
                    .is_some();
                if initial && !removed {
                    return;
                }
                SubscriberEvent::Updated {
                    address,
                    value: None,
                    slot,
                }
            }
            Some(bytes) => match decoder.decode(bytes) {
                Ok(decoded) => {
                    let value = DataAndSlot {
                        data: Arc::new(decoded),
                        slot,
                    };
                    match self.cache.entry(address) {
                        Entry::Occupied(mut cached) => {
                            if cached.get().slot > slot {
                                return;
                            }
                            cached.insert(value.clone());
                        }
                        Entry::Vacant(vacant) => {
                            vacant.insert(value.clone());
                        }
                    }
                    SubscriberEvent::Updated {
                        address,
                        value: Some(value),
                        slot,
                    }
                }
                Err(error) => {
                    tracing::warn!(%address, slot, "Failed to decode account: {}", error);
                    let _ = self.error_tx.send(Arc::new(ConnectorError::Decode {
                        address,
                        slot,
                        source: error.clone(),
                    }));
                    SubscriberEvent::DecodeFailed {
                        address,
                        slot,
                        error,
                    }
                }
            },
        };
        self.notify(&event);
    }

    /// Calls every listener outside the lock, so listeners may register or
    /// remove listeners themselves.
    fn notify(&self, event: &SubscriberEvent<T>) {
        let listeners: Vec<(ListenerId, SharedListener<T>)> = self.listeners.read().clone();
        for (id, listener) in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::error!(listener = %id, "Subscriber listener panicked");
            }
        }
    }

    fn add_listener(&self, listener: SubscriberListener<T>) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::from(listener)));
        id
    }
}

/// An [`AccountSubscriber`] fed by a [`BulkAccountLoaderHandle`].
pub struct PollingAccountSubscriber<T> {
    loader: BulkAccountLoaderHandle,
    reader: Arc<dyn AccountReader>,
    commitment: CommitmentConfig,
    update_buffer: usize,
    active: Mutex<Option<ActiveSubscription>>,
    shared: Arc<Shared<T>>,
}

impl<T: Send + Sync + 'static> PollingAccountSubscriber<T> {
    pub fn new(
        config: &ConnectorConfig,
        loader: BulkAccountLoaderHandle,
        reader: Arc<dyn AccountReader>,
    ) -> Self {
        let (error_tx, _) = broadcast::channel(config.channels.subscriber_error_buffer.max(1));
        Self {
            loader,
            reader,
            commitment: config.subscriber.commitment_config(),
            update_buffer: config.channels.subscriber_update_buffer.max(1),
            active: Mutex::new(None),
            shared: Arc::new(Shared {
                subscribed: AtomicBool::new(false),
                addresses: RwLock::new(Vec::new()),
                cache: DashMap::new(),
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                error_tx,
            }),
        }
    }

    /// Decode errors as they happen.
    pub fn errors(&self) -> broadcast::Receiver<Arc<ConnectorError>> {
        self.shared.error_tx.subscribe()
    }

    /// A stream of every event, backed by a channel of `capacity` entries.
    ///
    /// Events are dropped with a warning while the consumer lags.
    pub fn updates(&self, capacity: usize) -> ReceiverStream<SubscriberEvent<T>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.shared.add_listener(Box::new(move |event: &SubscriberEvent<T>| {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                tracing::warn!("Subscriber update stream is full, dropping event");
            }
        }));
        ReceiverStream::new(rx)
    }

    /// [`updates`](Self::updates) with the configured default capacity.
    pub fn default_updates(&self) -> ReceiverStream<SubscriberEvent<T>> {
        self.updates(self.update_buffer)
    }

    /// Releases whatever part of `active` was already registered.
    async fn release(&self, active: ActiveSubscription) -> Result<(), ConnectorError> {
        for id in active.loader_listeners {
            self.loader.remove_account_change_listener(id).await?;
        }
        for id in active.subscriptions {
            self.loader.remove_subscriber(id).await?;
        }
        Ok(())
    }

    /// Populates the cache for `address` before the first dispatch.
    ///
    /// If the read fails, the loader's last snapshot is used instead. The
    /// loader only dispatches on content changes, so an address it already
    /// tracks would otherwise stay empty until its data changes.
    async fn initial_read(&self, address: Pubkey, decoder: &dyn AccountDecoder<T>) {
        let error = match self.reader.read_one(&address, self.commitment).await {
            Ok(response) => {
                let data = response.value.as_ref().map(|account| account.data.as_slice());
                self.shared.apply(address, data, response.slot, decoder, true);
                return;
            }
            Err(e) => e,
        };

        match self.loader.get_account(address).await {
            Ok(Some(snapshot)) if snapshot.slot > 0 => {
                tracing::warn!(
                    %address,
                    slot = snapshot.slot,
                    "Initial account read failed, using loader snapshot: {}",
                    error
                );
                let data = snapshot.account.as_ref().map(|account| account.data.as_slice());
                self.shared.apply(address, data, snapshot.slot, decoder, true);
            }
            // Not read by the loader yet: its first tick dispatches to us.
            _ => tracing::warn!(%address, "Initial account read failed: {}", error),
        }
    }

    async fn register(
        &self,
        addresses: &[Pubkey],
        decoder: &Arc<dyn AccountDecoder<T>>,
        active: &mut ActiveSubscription,
    ) -> Result<(), ConnectorError> {
        for &address in addresses {
            let shared = Arc::clone(&self.shared);
            let decoder = Arc::clone(decoder);
            let listener = self
                .loader
                .on_account_change(address, move |change| {
                    shared.apply(change.address, change.data(), change.slot, decoder.as_ref(), false);
                    Ok(())
                })
                .await?;
            active.loader_listeners.push(listener);
            active.subscriptions.push(self.loader.add_subscriber(address).await?);
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> AccountSubscriber<T> for PollingAccountSubscriber<T> {
    async fn subscribe(
        &self,
        addresses: &[Pubkey],
        decoder: Arc<dyn AccountDecoder<T>>,
    ) -> Result<(), ConnectorError> {
        // Held until the initial reads are applied, so `unsubscribe` cannot
        // interleave with them.
        let mut guard = self.active.lock().await;
        if guard.is_some() {
            return Err(ConnectorError::AlreadySubscribed);
        }

        let mut unique: Vec<Pubkey> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !unique.contains(address) {
                unique.push(*address);
            }
        }
        let addresses = unique.as_slice();

        *self.shared.addresses.write() = addresses.to_vec();
        self.shared.subscribed.store(true, Ordering::Release);

        let mut active = ActiveSubscription {
            subscriptions: Vec::with_capacity(addresses.len()),
            loader_listeners: Vec::with_capacity(addresses.len()),
        };
        if let Err(e) = self.register(addresses, &decoder, &mut active).await {
            self.shared.subscribed.store(false, Ordering::Release);
            self.shared.addresses.write().clear();
            if let Err(release_err) = self.release(active).await {
                tracing::warn!("Failed to roll back partial subscription: {}", release_err);
            }
            return Err(e);
        }
        *guard = Some(active);

        for &address in addresses {
            self.initial_read(address, decoder.as_ref()).await;
        }

        tracing::debug!(accounts = addresses.len(), "Account subscriber subscribed");
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), ConnectorError> {
        let mut guard = self.active.lock().await;
        let Some(active) = guard.take() else {
            return Ok(());
        };

        self.shared.subscribed.store(false, Ordering::Release);
        let released = self.release(active).await;
        self.shared.cache.clear();
        self.shared.addresses.write().clear();
        tracing::debug!("Account subscriber unsubscribed");
        released
    }

    fn is_subscribed(&self) -> bool {
        self.shared.subscribed.load(Ordering::Acquire)
    }

    fn get_latest(&self) -> Result<Option<DataAndSlot<T>>, ConnectorError> {
        if !self.is_subscribed() {
            return Err(ConnectorError::NotSubscribed);
        }
        let primary = self.shared.addresses.read().first().copied();
        Ok(primary.and_then(|address| self.shared.cache.get(&address).map(|v| v.clone())))
    }

    fn get_latest_for(&self, address: &Pubkey) -> Result<Option<DataAndSlot<T>>, ConnectorError> {
        if !self.is_subscribed() {
            return Err(ConnectorError::NotSubscribed);
        }
        if !self.shared.addresses.read().contains(address) {
            return Err(ConnectorError::UnknownAddress(*address));
        }
        Ok(self.shared.cache.get(address).map(|v| v.clone()))
    }

    fn on_change(&self, listener: SubscriberListener<T>) -> ListenerId {
        self.shared.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }
}
