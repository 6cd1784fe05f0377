//! # Transaction Sender
//!
//! The [`TransactionSender`] signs caller-built instructions, submits the
//! transaction once and waits for it to land.
//!
//! ## Retry policy
//! Only failures that prove the transaction never reached the cluster are
//! retried, each time with a fresh blockhash and after one
//! `confirm_poll_interval`: a failed blockhash fetch or a `BlockhashNotFound`
//! rejection. Once a submission may have been forwarded
//! the sender only polls its status, so a transaction is never executed twice.
//! If no status arrives in time the outcome is [`TxOutcome::Timeout`] and the
//! caller has to reconcile.
use crate::{
    config::SenderConfig,
    rpc::{SubmissionStatus, SubmitConfig, SubmitError, TransactionSubmitter},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use solana_sdk::{
    commitment_config::CommitmentConfig, instruction::Instruction, pubkey::Pubkey,
    signature::Signature, signer::signers::Signers, transaction::Transaction,
};
use std::{sync::Arc, time::Duration};
use tokio::time::{sleep, sleep_until, timeout_at, Instant};

/// Per-call submission policy.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub timeout: Duration,
    pub confirm_poll_interval: Duration,
    pub max_presubmission_attempts: u32,
    pub commitment: CommitmentConfig,
    pub skip_preflight: bool,
}

impl From<&SenderConfig> for SendOptions {
    fn from(config: &SenderConfig) -> Self {
        Self {
            timeout: config.timeout(),
            confirm_poll_interval: config.confirm_poll_interval(),
            max_presubmission_attempts: config.max_presubmission_attempts,
            commitment: config.commitment_config(),
            skip_preflight: config.skip_preflight,
        }
    }
}

impl Default for SendOptions {
    fn default() -> Self {
        Self::from(&SenderConfig::default())
    }
}

/// The result of [`TransactionSender::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Confirmed {
        signature: Signature,
        slot: u64,
    },
    /// The transaction landed but its execution failed. Never retried.
    ConfirmedFailure {
        signature: Signature,
        slot: u64,
        error: String,
    },
    /// The transaction may or may not have landed.
    Timeout { signature: Signature },
    /// Nothing reached the cluster.
    RejectedBeforeSubmission { reason: String, attempts: u32 },
}

impl TxOutcome {
    pub fn signature(&self) -> Option<&Signature> {
        match self {
            Self::Confirmed { signature, .. }
            | Self::ConfirmedFailure { signature, .. }
            | Self::Timeout { signature } => Some(signature),
            Self::RejectedBeforeSubmission { .. } => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }
}

/// A submitted transaction awaiting a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransaction {
    pub signature: Signature,
    pub payer: Pubkey,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
}

pub struct TransactionSender<W: TransactionSubmitter + ?Sized> {
    submitter: Arc<W>,
    defaults: SendOptions,
    pending: Arc<DashMap<Signature, PendingTransaction>>,
}

impl<W: TransactionSubmitter + ?Sized> Clone for TransactionSender<W> {
    fn clone(&self) -> Self {
        Self {
            submitter: Arc::clone(&self.submitter),
            defaults: self.defaults.clone(),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<W: TransactionSubmitter + ?Sized> TransactionSender<W> {
    pub fn new(submitter: Arc<W>, config: &SenderConfig) -> Self {
        Self {
            submitter,
            defaults: SendOptions::from(config),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn default_options(&self) -> &SendOptions {
        &self.defaults
    }

    /// Transactions submitted through this sender (or its clones) that have
    /// no outcome yet.
    pub fn pending(&self) -> Vec<PendingTransaction> {
        self.pending.iter().map(|entry| entry.value().clone()).collect()
    }

    /// [`send`](Self::send) with the options derived from the sender's config.
    pub async fn send_with_defaults<S: Signers + Sync + ?Sized>(
        &self,
        instructions: &[Instruction],
        payer: &Pubkey,
        signers: &S,
    ) -> TxOutcome {
        let options = self.defaults.clone();
        self.send(instructions, payer, signers, &options).await
    }

    /// Builds, signs and submits a transaction, then waits for its outcome.
    pub async fn send<S: Signers + Sync + ?Sized>(
        &self,
        instructions: &[Instruction],
        payer: &Pubkey,
        signers: &S,
        options: &SendOptions,
    ) -> TxOutcome {
        let max_attempts = options.max_presubmission_attempts.max(1);
        let submit_config = SubmitConfig {
            skip_preflight: options.skip_preflight,
            preflight_commitment: options.commitment.commitment,
        };
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                sleep(options.confirm_poll_interval).await;
            }
            let blockhash = match self.submitter.latest_blockhash(options.commitment).await {
                Ok(blockhash) => blockhash,
                Err(e) => {
                    tracing::warn!(attempt, "Failed to fetch a recent blockhash: {}", e);
                    last_reason = e.to_string();
                    continue;
                }
            };

            let mut transaction = Transaction::new_with_payer(instructions, Some(payer));
            if let Err(e) = transaction.try_sign(signers, blockhash) {
                return TxOutcome::RejectedBeforeSubmission {
                    reason: format!("Failed to sign transaction: {}", e),
                    attempts: attempt,
                };
            }

            match self.submitter.submit(&transaction, &submit_config).await {
                Ok(signature) => {
                    tracing::info!(%signature, attempt, "Transaction submitted");
                    return self.confirm(signature, payer, attempt, options).await;
                }
                Err(SubmitError::Unknown(reason)) => {
                    let Some(&signature) = transaction.signatures.first() else {
                        return TxOutcome::RejectedBeforeSubmission {
                            reason,
                            attempts: attempt,
                        };
                    };
                    tracing::warn!(%signature, "Submission outcome unknown ({}), confirming", reason);
                    return self.confirm(signature, payer, attempt, options).await;
                }
                Err(SubmitError::Rejected {
                    reason,
                    retryable: true,
                }) => {
                    tracing::warn!(attempt, "Transaction rejected, retrying: {}", reason);
                    last_reason = reason;
                }
                Err(SubmitError::Rejected {
                    reason,
                    retryable: false,
                }) => {
                    tracing::warn!(attempt, "Transaction rejected: {}", reason);
                    return TxOutcome::RejectedBeforeSubmission {
                        reason,
                        attempts: attempt,
                    };
                }
            }
        }

        TxOutcome::RejectedBeforeSubmission {
            reason: last_reason,
            attempts: max_attempts,
        }
    }

    /// Polls the signature status until a terminal status or the deadline.
    async fn confirm(
        &self,
        signature: Signature,
        payer: &Pubkey,
        attempts: u32,
        options: &SendOptions,
    ) -> TxOutcome {
        self.pending.insert(
            signature,
            PendingTransaction {
                signature,
                payer: *payer,
                created_at: Utc::now(),
                attempts,
            },
        );

        let deadline = Instant::now() + options.timeout;
        let outcome = loop {
            match timeout_at(deadline, self.submitter.status(&signature, options.commitment)).await {
                Ok(Ok(SubmissionStatus::Succeeded { slot })) => {
                    break TxOutcome::Confirmed { signature, slot };
                }
                Ok(Ok(SubmissionStatus::Failed { slot, error })) => {
                    break TxOutcome::ConfirmedFailure {
                        signature,
                        slot,
                        error,
                    };
                }
                Ok(Ok(SubmissionStatus::Pending)) => {}
                Ok(Err(e)) => tracing::debug!(%signature, "Status check failed: {}", e),
                Err(_) => break TxOutcome::Timeout { signature },
            }

            let now = Instant::now();
            if now >= deadline {
                break TxOutcome::Timeout { signature };
            }
            sleep_until((now + options.confirm_poll_interval).min(deadline)).await;
        };

        self.pending.remove(&signature);
        match &outcome {
            TxOutcome::Confirmed { slot, .. } => {
                tracing::info!(%signature, slot, "Transaction confirmed");
            }
            TxOutcome::ConfirmedFailure { slot, error, .. } => {
                tracing::warn!(%signature, slot, "Transaction failed: {}", error);
            }
            TxOutcome::Timeout { .. } => {
                tracing::warn!(%signature, "Transaction not confirmed before timeout");
            }
            TxOutcome::RejectedBeforeSubmission { .. } => {}
        }
        outcome
    }
}
