//! A Rust library that keeps local copies of Solana accounts in sync with a
//! cluster by polling, and submits transactions with confirmation and retry.
//!
//! # Key Components
//!
//! *   [`accounts::BulkAccountLoader`]: A background actor that polls every
//!     registered account in batched `getMultipleAccounts` calls and dispatches
//!     content changes to listeners.
//! *   [`accounts::PollingAccountSubscriber`]: A typed, cached view of one or
//!     more accounts, driven by the loader.
//! *   [`tx::TransactionSender`]: Signs, submits once, confirms and reports a
//!     [`tx::TxOutcome`], including the ambiguous `Timeout`.
//! *   [`client::PollingClient`]: Wires the above together from a [`config::ConnectorConfig`].

/// Account synchronization: bulk loader, subscribers and decoders.
pub mod accounts;
pub mod client;
/// Defines configuration structures for the connector.
pub mod config;
pub mod error;
/// The read and write seams to the cluster.
pub mod rpc;
/// Transaction submission and confirmation.
pub mod tx;

pub use error::{ConnectorError, ConnectorResult, DecodeError};
