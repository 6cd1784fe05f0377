//! # Bulk Account Loader
//!
//! The `BulkAccountLoader` multiplexes any number of logical account
//! subscriptions onto a bounded number of `getMultipleAccounts` calls.
//!
//! ## Purpose
//! Consumers register the addresses they care about through a
//! [`BulkAccountLoaderHandle`]. The loader keeps one reference-counted slot per
//! address, polls all of them on a fixed cadence in chunks, hashes each
//! account's content and calls the registered listeners only when that
//! content changed.
//!
//! ## Execution model
//! The loader is an actor: [`BulkAccountLoader::run`] owns the slot registry
//! and is the only place that mutates it or invokes listeners. Reads for a
//! poll cycle run in a spawned task so registration commands are served while
//! the cluster answers; the results are applied back on the actor. A handle
//! call returns only after the actor processed it, so once
//! `remove_account_change_listener` or `stop` returns no further callback runs.
use crate::{
    accounts::types::{
        content_hash, AccountChange, AccountSnapshot, ContentHash, ListenerId, SubscriptionId,
    },
    config::{ConnectorConfig, LoaderConfig},
    error::ConnectorError,
    rpc::{AccountReader, Slotted},
};
use futures::{future::OptionFuture, stream, StreamExt};
use solana_sdk::{account::Account, pubkey::Pubkey};
use std::{
    collections::{hash_map::Entry, HashMap},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, Instant},
};

/// A listener invoked on the loader task for every detected change.
///
/// Listeners must return quickly; a slow listener delays the next poll cycle.
pub type AccountChangeCallback =
    Arc<dyn Fn(&AccountChange) -> anyhow::Result<()> + Send + Sync + 'static>;

/// Shortest accepted polling period. Shorter requests are raised to it.
pub const MIN_POLLING_FREQUENCY: Duration = Duration::from_millis(10);

fn clamp_frequency(frequency: Duration) -> Duration {
    if frequency < MIN_POLLING_FREQUENCY {
        tracing::warn!(
            requested = ?frequency,
            "Polling frequency below minimum, using {:?}",
            MIN_POLLING_FREQUENCY
        );
        return MIN_POLLING_FREQUENCY;
    }
    frequency
}

type ChunkResult = (Vec<Pubkey>, Result<Slotted<Vec<Option<Account>>>, ConnectorError>);

/// Loader-internal tracking state for one subscribed address.
#[derive(Debug, Default)]
struct AccountSlot {
    ref_count: usize,
    /// `None` until a value is seen, and again after the account disappears.
    last_seen_hash: Option<ContentHash>,
    account: Option<Arc<Account>>,
    slot: u64,
}

struct Listener {
    id: ListenerId,
    callback: AccountChangeCallback,
}

/// Commands served by the loader task.
pub(crate) enum LoaderCommand {
    AddSubscriber {
        address: Pubkey,
        reply: oneshot::Sender<SubscriptionId>,
    },
    RemoveSubscriber {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    AddListener {
        address: Pubkey,
        callback: AccountChangeCallback,
        reply: oneshot::Sender<ListenerId>,
    },
    RemoveListener {
        id: ListenerId,
        reply: oneshot::Sender<bool>,
    },
    Start {
        frequency: Duration,
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Load {
        force: bool,
        reply: oneshot::Sender<()>,
    },
    GetAccount {
        address: Pubkey,
        reply: oneshot::Sender<Option<AccountSnapshot>>,
    },
    RefCount {
        address: Pubkey,
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// A clonable handle to a running [`BulkAccountLoader`].
#[derive(Clone, Debug)]
pub struct BulkAccountLoaderHandle {
    command_tx: mpsc::Sender<LoaderCommand>,
}

impl BulkAccountLoaderHandle {
    async fn request<R>(
        &self,
        command: impl FnOnce(oneshot::Sender<R>) -> LoaderCommand,
    ) -> Result<R, ConnectorError> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .await
            .map_err(|_| ConnectorError::LoaderStopped)?;
        response.await.map_err(|_| ConnectorError::LoaderStopped)
    }

    /// Registers interest in `address`, creating its slot on first use.
    pub async fn add_subscriber(&self, address: Pubkey) -> Result<SubscriptionId, ConnectorError> {
        self.request(|reply| LoaderCommand::AddSubscriber { address, reply })
            .await
    }

    /// Releases one reference. Returns `false` if `id` was already released.
    pub async fn remove_subscriber(&self, id: SubscriptionId) -> Result<bool, ConnectorError> {
        self.request(|reply| LoaderCommand::RemoveSubscriber { id, reply })
            .await
    }

    /// Registers a listener for content changes of `address`.
    ///
    /// The listener is called on the loader task. An `Err` or a panic is
    /// logged and does not affect the other listeners.
    pub async fn on_account_change<F>(
        &self,
        address: Pubkey,
        callback: F,
    ) -> Result<ListenerId, ConnectorError>
    where
        F: Fn(&AccountChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: AccountChangeCallback = Arc::new(callback);
        self.request(|reply| LoaderCommand::AddListener {
            address,
            callback,
            reply,
        })
        .await
    }

    /// Removes a listener. Once this returns the listener is never called again.
    pub async fn remove_account_change_listener(
        &self,
        id: ListenerId,
    ) -> Result<bool, ConnectorError> {
        self.request(|reply| LoaderCommand::RemoveListener { id, reply })
            .await
    }

    /// Starts periodic polling, or changes the period if already polling.
    pub async fn start(&self, frequency: Duration) -> Result<(), ConnectorError> {
        self.request(|reply| LoaderCommand::Start { frequency, reply })
            .await
    }

    /// Stops periodic polling and cancels any cycle in flight.
    pub async fn stop(&self) -> Result<(), ConnectorError> {
        self.request(|reply| LoaderCommand::Stop { reply }).await
    }

    /// Runs one poll cycle now and waits until its changes were dispatched.
    pub async fn load(&self) -> Result<(), ConnectorError> {
        self.request(|reply| LoaderCommand::Load {
            force: false,
            reply,
        })
        .await
    }

    /// Like [`load`](Self::load), but dispatches every existing account even
    /// if its content did not change.
    pub async fn force_refresh(&self) -> Result<(), ConnectorError> {
        self.request(|reply| LoaderCommand::Load { force: true, reply })
            .await
    }

    /// Returns the raw account last read for `address`, if it is registered.
    pub async fn get_account(
        &self,
        address: Pubkey,
    ) -> Result<Option<AccountSnapshot>, ConnectorError> {
        self.request(|reply| LoaderCommand::GetAccount { address, reply })
            .await
    }

    /// Returns the number of live subscriptions for `address`.
    pub async fn ref_count(&self, address: Pubkey) -> Result<usize, ConnectorError> {
        self.request(|reply| LoaderCommand::RefCount { address, reply })
            .await
    }

    /// Terminates the loader task.
    pub async fn shutdown(&self) {
        if self.command_tx.send(LoaderCommand::Shutdown).await.is_err() {
            tracing::warn!("Failed to send shutdown to bulk account loader: it may already be down");
        }
    }
}

/// The actor owning the slot registry and the polling loop.
pub struct BulkAccountLoader {
    reader: Arc<dyn AccountReader>,
    config: LoaderConfig,
    command_rx: mpsc::Receiver<LoaderCommand>,

    slots: HashMap<Pubkey, AccountSlot>,
    subscriptions: HashMap<SubscriptionId, Pubkey>,
    listeners: HashMap<Pubkey, Vec<Listener>>,
    listener_addresses: HashMap<ListenerId, Pubkey>,
    next_id: u64,
    most_recent_slot: u64,

    polling_frequency: Option<Duration>,
    next_tick: Instant,
    in_flight: Option<JoinHandle<Vec<ChunkResult>>>,
    cycle_started: Instant,
    cycle_forced: bool,
    cycle_waiters: Vec<oneshot::Sender<()>>,
    queued_forced: bool,
    queued_waiters: Vec<oneshot::Sender<()>>,
}

impl BulkAccountLoader {
    /// Creates a new `BulkAccountLoader` and its handle.
    ///
    /// Nothing runs until [`run`](Self::run) is spawned. With
    /// `loader.autostart` set, periodic polling begins as soon as it is.
    pub fn new(
        config: Arc<ConnectorConfig>,
        reader: Arc<dyn AccountReader>,
    ) -> (Self, BulkAccountLoaderHandle) {
        let (command_tx, command_rx) = mpsc::channel(config.channels.loader_command_buffer);
        let loader_config = config.loader.clone();
        let polling_frequency = loader_config
            .autostart
            .then(|| clamp_frequency(loader_config.polling_frequency()));
        let now = Instant::now();

        let loader = Self {
            reader,
            config: loader_config,
            command_rx,
            slots: HashMap::new(),
            subscriptions: HashMap::new(),
            listeners: HashMap::new(),
            listener_addresses: HashMap::new(),
            next_id: 0,
            most_recent_slot: 0,
            polling_frequency,
            next_tick: now,
            in_flight: None,
            cycle_started: now,
            cycle_forced: false,
            cycle_waiters: Vec::new(),
            queued_forced: false,
            queued_waiters: Vec::new(),
        };
        (loader, BulkAccountLoaderHandle { command_tx })
    }

    /// Creates a loader and spawns it on the current runtime.
    pub fn spawn(
        config: Arc<ConnectorConfig>,
        reader: Arc<dyn AccountReader>,
    ) -> BulkAccountLoaderHandle {
        let (loader, handle) = Self::new(config, reader);
        tokio::spawn(async move {
            if let Err(e) = loader.run().await {
                tracing::error!("Bulk account loader exited with an error: {}", e);
            }
        });
        handle
    }

    /// Runs the actor loop until shutdown or until every handle is dropped.
    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(
            polling = ?self.polling_frequency,
            "Bulk account loader started."
        );
        loop {
            let cycle_due = self.in_flight.is_none()
                && (!self.queued_waiters.is_empty() || self.polling_frequency.is_some());
            let deadline = if self.queued_waiters.is_empty() {
                self.next_tick
            } else {
                Instant::now()
            };

            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        tracing::info!("All loader handles dropped. Bulk account loader shutting down.");
                        break;
                    }
                },
                Some(joined) = OptionFuture::from(self.in_flight.as_mut()), if self.in_flight.is_some() => {
                    self.in_flight = None;
                    match joined {
                        Ok(results) => self.apply_cycle(results),
                        Err(e) => {
                            tracing::error!("Poll task failed: {}", e);
                            self.finish_cycle();
                        }
                    }
                },
                _ = sleep_until(deadline), if cycle_due => self.start_cycle(),
            }
        }

        self.cancel_cycles();
        Ok(())
    }

    /// Handles an incoming command. Returns `true` if the loader should shut down.
    fn handle_command(&mut self, command: LoaderCommand) -> bool {
        match command {
            LoaderCommand::AddSubscriber { address, reply } => {
                let id = self.add_subscriber(address);
                let _ = reply.send(id);
            }
            LoaderCommand::RemoveSubscriber { id, reply } => {
                let removed = self.remove_subscriber(id);
                let _ = reply.send(removed);
            }
            LoaderCommand::AddListener {
                address,
                callback,
                reply,
            } => {
                let id = ListenerId(self.next_id());
                self.listeners
                    .entry(address)
                    .or_default()
                    .push(Listener { id, callback });
                self.listener_addresses.insert(id, address);
                let _ = reply.send(id);
            }
            LoaderCommand::RemoveListener { id, reply } => {
                let removed = self.remove_listener(id);
                let _ = reply.send(removed);
            }
            LoaderCommand::Start { frequency, reply } => {
                let frequency = clamp_frequency(frequency);
                if self.polling_frequency.is_none() {
                    tracing::info!(?frequency, "Polling started");
                    self.next_tick = Instant::now();
                }
                self.polling_frequency = Some(frequency);
                let _ = reply.send(());
            }
            LoaderCommand::Stop { reply } => {
                tracing::info!("Polling stopped");
                self.polling_frequency = None;
                self.cancel_cycles();
                let _ = reply.send(());
            }
            LoaderCommand::Load { force, reply } => {
                self.queued_forced |= force;
                self.queued_waiters.push(reply);
            }
            LoaderCommand::GetAccount { address, reply } => {
                let snapshot = self.slots.get(&address).map(|slot| AccountSnapshot {
                    account: slot.account.clone(),
                    slot: slot.slot,
                });
                let _ = reply.send(snapshot);
            }
            LoaderCommand::RefCount { address, reply } => {
                let count = self.slots.get(&address).map_or(0, |slot| slot.ref_count);
                let _ = reply.send(count);
            }
            LoaderCommand::Shutdown => {
                tracing::info!("Received shutdown command. Exiting.");
                return true;
            }
        }
        false
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn add_subscriber(&mut self, address: Pubkey) -> SubscriptionId {
        let id = SubscriptionId(self.next_id());
        let slot = self.slots.entry(address).or_default();
        slot.ref_count += 1;
        if slot.ref_count == 1 {
            tracing::debug!(%address, "Tracking new account");
        }
        self.subscriptions.insert(id, address);
        id
    }

    fn remove_subscriber(&mut self, id: SubscriptionId) -> bool {
        let Some(address) = self.subscriptions.remove(&id) else {
            return false;
        };
        if let Entry::Occupied(mut entry) = self.slots.entry(address) {
            let slot = entry.get_mut();
            slot.ref_count = slot.ref_count.saturating_sub(1);
            if slot.ref_count == 0 {
                entry.remove();
                tracing::debug!(%address, "Stopped tracking account");
            }
        }
        true
    }

    fn remove_listener(&mut self, id: ListenerId) -> bool {
        let Some(address) = self.listener_addresses.remove(&id) else {
            return false;
        };
        if let Entry::Occupied(mut entry) = self.listeners.entry(address) {
            entry.get_mut().retain(|listener| listener.id != id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
        true
    }

    /// Snapshots the registered addresses and spawns the chunked reads.
    fn start_cycle(&mut self) {
        self.cycle_started = Instant::now();
        self.cycle_waiters = std::mem::take(&mut self.queued_waiters);
        self.cycle_forced = std::mem::take(&mut self.queued_forced);

        let addresses: Vec<Pubkey> = self.slots.keys().copied().collect();
        if addresses.is_empty() {
            self.finish_cycle();
            return;
        }

        let reader = Arc::clone(&self.reader);
        let commitment = self.config.commitment_config();
        let chunk_size = self.config.max_accounts_per_request.max(1);
        let concurrency = self.config.max_concurrent_requests.max(1);
        tracing::debug!(accounts = addresses.len(), "Starting poll cycle");

        self.in_flight = Some(tokio::spawn(async move {
            let chunks: Vec<Vec<Pubkey>> = addresses
                .chunks(chunk_size)
                .map(<[Pubkey]>::to_vec)
                .collect();
            stream::iter(chunks)
                .map(|chunk| {
                    let reader = Arc::clone(&reader);
                    async move {
                        let result = reader.read_many(&chunk, commitment).await;
                        (chunk, result)
                    }
                })
                .buffer_unordered(concurrency)
                .collect::<Vec<_>>()
                .await
        }));
    }

    fn apply_cycle(&mut self, mut results: Vec<ChunkResult>) {
        // Chunks of one cycle are read at slightly different slots; applying
        // them oldest first keeps the staleness check from dropping any of them.
        results.sort_by_key(|(_, result)| result.as_ref().map_or(0, |response| response.slot));

        let forced = self.cycle_forced;
        for (addresses, result) in results {
            match result {
                Ok(response) => match self.apply_chunk(&addresses, response, forced) {
                    Ok(dispatched) if dispatched > 0 => {
                        tracing::debug!(dispatched, "Applied account changes");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!("Discarding batch: {}", e),
                },
                Err(e) => {
                    tracing::warn!(accounts = addresses.len(), "Failed to load accounts: {}", e);
                }
            }
        }
        self.finish_cycle();
    }

    /// Applies one atomically read chunk. Returns the number of dispatched changes.
    fn apply_chunk(
        &mut self,
        addresses: &[Pubkey],
        response: Slotted<Vec<Option<Account>>>,
        forced: bool,
    ) -> Result<usize, ConnectorError> {
        if response.slot < self.most_recent_slot {
            return Err(ConnectorError::StaleContext {
                received: response.slot,
                latest: self.most_recent_slot,
            });
        }
        self.most_recent_slot = response.slot;

        let mut dispatched = 0;
        for (address, account) in addresses.iter().zip(response.value) {
            if let Some(change) = self.update_slot(address, account, response.slot, forced) {
                self.dispatch(&change);
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    fn update_slot(
        &mut self,
        address: &Pubkey,
        account: Option<Account>,
        slot: u64,
        forced: bool,
    ) -> Option<AccountChange> {
        // Unsubscribed while the read was in flight.
        let entry = self.slots.get_mut(address)?;

        let hash = account
            .as_ref()
            .map(|account| content_hash(account, self.config.change_detection));
        let changed = hash != entry.last_seen_hash;
        let account = account.map(Arc::new);
        entry.account = account.clone();
        entry.slot = slot;

        if !changed && !(forced && account.is_some()) {
            return None;
        }
        entry.last_seen_hash = hash;
        Some(AccountChange {
            address: *address,
            account,
            slot,
        })
    }

    fn dispatch(&self, change: &AccountChange) {
        let Some(listeners) = self.listeners.get(&change.address) else {
            return;
        };
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| (listener.callback)(change))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    address = %change.address,
                    listener = %listener.id,
                    "Account change listener failed: {:#}",
                    e
                ),
                Err(_) => tracing::error!(
                    address = %change.address,
                    listener = %listener.id,
                    "Account change listener panicked"
                ),
            }
        }
    }

    fn finish_cycle(&mut self) {
        for waiter in self.cycle_waiters.drain(..) {
            let _ = waiter.send(());
        }
        self.cycle_forced = false;
        if let Some(frequency) = self.polling_frequency {
            // Never overlap: a slow cycle pushes the next one back.
            self.next_tick = (self.cycle_started + frequency).max(Instant::now());
        }
    }

    /// Aborts the cycle in flight and releases every pending `load` caller.
    fn cancel_cycles(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
        for waiter in self
            .cycle_waiters
            .drain(..)
            .chain(self.queued_waiters.drain(..))
        {
            let _ = waiter.send(());
        }
        self.cycle_forced = false;
        self.queued_forced = false;
    }
}
