//! # Polling Client
//!
//! The [`PollingClient`] wires the connector together for a single cluster:
//! it spawns one [`BulkAccountLoader`] shared by every subscriber it hands
//! out, and builds the [`TransactionSender`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use clearing_house_connector::{client::PollingClient, config::ConnectorConfig};
//! # async fn example() -> anyhow::Result<()> {
//! let config = Arc::new(ConnectorConfig::default());
//! let client = PollingClient::from_config(config);
//! let subscriber = client.account_subscriber::<Vec<u8>>();
//! # Ok(())
//! # }
//! ```

use crate::{
    accounts::{
        bulk_loader::{BulkAccountLoader, BulkAccountLoaderHandle},
        decode::AccountDecoder,
        subscriber::{AccountSubscriber, PollingAccountSubscriber},
    },
    config::ConnectorConfig,
    error::ConnectorError,
    rpc::{AccountReader, TransactionSubmitter},
    tx::sender::TransactionSender,
};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{commitment_config::CommitmentConfig, pubkey::Pubkey};
use std::sync::Arc;

/// Entry point for applications: a loader, a sender and a subscriber factory
/// sharing one configuration.
///
/// Must be created inside a Tokio runtime, since the loader task is spawned
/// immediately.
#[derive(Clone)]
pub struct PollingClient {
    config: Arc<ConnectorConfig>,
    reader: Arc<dyn AccountReader>,
    loader: BulkAccountLoaderHandle,
    sender: TransactionSender<dyn TransactionSubmitter>,
}

impl PollingClient {
    /// Creates a client talking to `config.solana.rpc_url`.
    pub fn from_config(config: Arc<ConnectorConfig>) -> Self {
        let rpc_client = Arc::new(RpcClient::new_with_commitment(
            config.solana.rpc_url.clone(),
            CommitmentConfig {
                commitment: config.solana.commitment,
            },
        ));
        Self::new(config, rpc_client)
    }

    /// Creates a client on top of an existing `RpcClient`.
    pub fn new(config: Arc<ConnectorConfig>, rpc_client: Arc<RpcClient>) -> Self {
        let reader: Arc<dyn AccountReader> = rpc_client.clone();
        let submitter: Arc<dyn TransactionSubmitter> = rpc_client;
        Self::with_backends(config, reader, submitter)
    }

    /// Creates a client from arbitrary read and write backends.
    pub fn with_backends(
        config: Arc<ConnectorConfig>,
        reader: Arc<dyn AccountReader>,
        submitter: Arc<dyn TransactionSubmitter>,
    ) -> Self {
        let loader = BulkAccountLoader::spawn(config.clone(), reader.clone());
        let sender = TransactionSender::new(submitter, &config.sender);
        tracing::info!(rpc_url = %config.solana.rpc_url, "Polling client created");
        Self {
            config,
            reader,
            loader,
            sender,
        }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn loader(&self) -> &BulkAccountLoaderHandle {
        &self.loader
    }

    pub fn sender(&self) -> &TransactionSender<dyn TransactionSubmitter> {
        &self.sender
    }

    /// A new, unsubscribed subscriber bound to the shared loader.
    pub fn account_subscriber<T: Send + Sync + 'static>(&self) -> PollingAccountSubscriber<T> {
        PollingAccountSubscriber::new(&self.config, self.loader.clone(), self.reader.clone())
    }

    /// A subscriber already subscribed to `address`.
    pub async fn subscribe_account<T: Send + Sync + 'static>(
        &self,
        address: Pubkey,
        decoder: Arc<dyn AccountDecoder<T>>,
    ) -> Result<PollingAccountSubscriber<T>, ConnectorError> {
        let subscriber = self.account_subscriber();
        subscriber.subscribe(&[address], decoder).await?;
        Ok(subscriber)
    }

    /// Stops the shared loader task. Subscribers created by this client stop
    /// receiving updates.
    pub async fn shutdown(&self) {
        self.loader.shutdown().await;
    }
}
