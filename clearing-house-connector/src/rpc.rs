//! Traits abstracting the two cluster primitives the connector relies on.
//!
//! [`AccountReader`] is the pull-only read side used by the bulk loader and the
//! subscribers, [`TransactionSubmitter`] the write side used by the
//! transaction sender. Both are implemented for the nonblocking `RpcClient`
//! and can be implemented by in-memory mocks for tests.

use crate::error::ConnectorError;
use async_trait::async_trait;
use solana_client::{
    client_error::ClientError, nonblocking::rpc_client::RpcClient,
    rpc_config::RpcSendTransactionConfig,
};
use solana_sdk::{
    account::Account,
    commitment_config::{CommitmentConfig, CommitmentLevel},
    hash::Hash,
    pubkey::Pubkey,
    signature::Signature,
    transaction::{Transaction, TransactionError},
};
use thiserror::Error;

/// A value read from the cluster together with the context slot it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slotted<T> {
    pub slot: u64,
    pub value: T,
}

/// Read access to on-chain accounts.
#[async_trait]
pub trait AccountReader: Send + Sync {
    /// Reads all `addresses` atomically at a single context slot.
    ///
    /// The returned vector has one entry per requested address, in order;
    /// `None` means the account does not exist.
    async fn read_many(
        &self,
        addresses: &[Pubkey],
        commitment: CommitmentConfig,
    ) -> Result<Slotted<Vec<Option<Account>>>, ConnectorError>;

    async fn read_one(
        &self,
        address: &Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<Slotted<Option<Account>>, ConnectorError>;
}

#[async_trait]
impl AccountReader for RpcClient {
    async fn read_many(
        &self,
        addresses: &[Pubkey],
        commitment: CommitmentConfig,
    ) -> Result<Slotted<Vec<Option<Account>>>, ConnectorError> {
        let response = self
            .get_multiple_accounts_with_commitment(addresses, commitment)
            .await?;
        Ok(Slotted {
            slot: response.context.slot,
            value: response.value,
        })
    }

    async fn read_one(
        &self,
        address: &Pubkey,
        commitment: CommitmentConfig,
    ) -> Result<Slotted<Option<Account>>, ConnectorError> {
        let response = self
            .get_account_with_commitment(address, commitment)
            .await?;
        Ok(Slotted {
            slot: response.context.slot,
            value: response.value,
        })
    }
}

/// Per-submission options forwarded to the cluster.
#[derive(Debug, Clone, Copy)]
pub struct SubmitConfig {
    pub skip_preflight: bool,
    pub preflight_commitment: CommitmentLevel,
}

/// Why a submission failed.
///
/// The distinction matters for retries: a `Rejected` transaction never
/// reached the ledger, an `Unknown` one may have.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The node refused the transaction (e.g. preflight failure).
    #[error("Transaction rejected: {reason}")]
    Rejected { reason: String, retryable: bool },

    /// The request failed in a way that does not tell whether the node
    /// received it.
    #[error("Submission outcome unknown: {0}")]
    Unknown(String),
}

/// Status of a previously submitted signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// Not (yet) observed at the requested commitment.
    Pending,
    Succeeded { slot: u64 },
    Failed { slot: u64, error: String },
}

/// Write access to the cluster.
#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    async fn latest_blockhash(&self, commitment: CommitmentConfig) -> Result<Hash, ConnectorError>;

    /// Sends a signed transaction once.
    async fn submit(
        &self,
        transaction: &Transaction,
        config: &SubmitConfig,
    ) -> Result<Signature, SubmitError>;

    async fn status(
        &self,
        signature: &Signature,
        commitment: CommitmentConfig,
    ) -> Result<SubmissionStatus, ConnectorError>;
}

#[async_trait]
impl TransactionSubmitter for RpcClient {
    async fn latest_blockhash(&self, commitment: CommitmentConfig) -> Result<Hash, ConnectorError> {
        let (blockhash, _) = self
            .get_latest_blockhash_with_commitment(commitment)
            .await?;
        Ok(blockhash)
    }

    async fn submit(
        &self,
        transaction: &Transaction,
        config: &SubmitConfig,
    ) -> Result<Signature, SubmitError> {
        let send_config = RpcSendTransactionConfig {
            skip_preflight: config.skip_preflight,
            preflight_commitment: Some(config.preflight_commitment),
            ..RpcSendTransactionConfig::default()
        };
        self.send_transaction_with_config(transaction, send_config)
            .await
            .map_err(classify_send_error)
    }

    async fn status(
        &self,
        signature: &Signature,
        commitment: CommitmentConfig,
    ) -> Result<SubmissionStatus, ConnectorError> {
        let response = self.get_signature_statuses(&[*signature]).await?;
        let status = match response.value.into_iter().next().flatten() {
            Some(status) if status.satisfies_commitment(commitment) => match status.err {
                None => SubmissionStatus::Succeeded { slot: status.slot },
                Some(err) => SubmissionStatus::Failed {
                    slot: status.slot,
                    error: err.to_string(),
                },
            },
            _ => SubmissionStatus::Pending,
        };
        Ok(status)
    }
}

/// Maps a `sendTransaction` failure onto [`SubmitError`].
///
/// A transaction error in the response means the node simulated and refused
/// the transaction, so nothing was forwarded to the leader. Anything else
/// (I/O, timeouts, malformed responses) leaves the outcome unknown.
fn classify_send_error(err: ClientError) -> SubmitError {
    match err.get_transaction_error() {
        Some(TransactionError::BlockhashNotFound) => SubmitError::Rejected {
            reason: TransactionError::BlockhashNotFound.to_string(),
            retryable: true,
        },
        Some(tx_err) => SubmitError::Rejected {
            reason: tx_err.to_string(),
            retryable: false,
        },
        None => SubmitError::Unknown(err.to_string()),
    }
}
