#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use clearing_house_logger::LogConfig;
use solana_sdk::commitment_config::{CommitmentConfig, CommitmentLevel};
use std::time::Duration;

/// The top-level configuration for the `clearing-house-connector` library.
///
/// This struct aggregates the cluster endpoint and the tuning knobs of the
/// bulk loader, the account subscribers and the transaction sender. It is
/// typically deserialized from a TOML file with [`load_config`] and passed to
/// [`crate::client::PollingClient`].
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct ConnectorConfig {
    #[cfg_attr(feature = "serde", serde(default))]
    pub solana: Solana,
    #[cfg_attr(feature = "serde", serde(default))]
    pub loader: LoaderConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub subscriber: SubscriberConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub sender: SenderConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub channels: ChannelConfig,
    #[cfg_attr(feature = "serde", serde(default))]
    pub log: LogConfig,
}

/// Defines the connection settings for the Solana cluster.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct Solana {
    pub rpc_url: String,
    /// Commitment of the underlying `RpcClient` for calls that take none.
    #[cfg_attr(feature = "serde", serde(with = "serde_commitment"))]
    pub commitment: CommitmentLevel,
}

/// Whether the loader compares only account data or the whole account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ChangeDetection {
    /// Hash of the data bytes only. Lamport-only changes are not dispatched.
    #[default]
    Data,
    /// Hash of data, lamports, owner and executable flag.
    Account,
}

/// Behaviour of the `BulkAccountLoader` polling loop.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct LoaderConfig {
    /// Target period between the starts of consecutive poll cycles. A cycle
    /// that overruns it delays the next one until it completes. Values below
    /// 10 ms are raised to 10 ms.
    pub polling_frequency_ms: u64,
    /// The maximum number of addresses in a single `getMultipleAccounts` call.
    pub max_accounts_per_request: usize,
    /// The maximum number of `getMultipleAccounts` calls in flight per cycle.
    pub max_concurrent_requests: usize,
    #[cfg_attr(feature = "serde", serde(with = "serde_commitment"))]
    pub commitment: CommitmentLevel,
    pub change_detection: ChangeDetection,
    /// Start the periodic loop as soon as the loader task is spawned.
    pub autostart: bool,
}

/// Settings for `PollingAccountSubscriber`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct SubscriberConfig {
    /// Commitment of the one-shot read performed on `subscribe`.
    #[cfg_attr(feature = "serde", serde(with = "serde_commitment"))]
    pub commitment: CommitmentLevel,
}

/// Submission and confirmation policy of the `TransactionSender`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct SenderConfig {
    /// How long to wait for confirmation after submission.
    pub timeout_ms: u64,
    /// Interval between signature status checks.
    pub confirm_poll_interval_ms: u64,
    /// Attempts allowed while the transaction has not reached the cluster.
    pub max_presubmission_attempts: u32,
    #[cfg_attr(feature = "serde", serde(with = "serde_commitment"))]
    pub commitment: CommitmentLevel,
    pub skip_preflight: bool,
}

/// Defines capacities for the MPSC and broadcast channels within the connector.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case"))]
pub struct ChannelConfig {
    /// The buffer capacity for the command channel to the loader task.
    pub loader_command_buffer: usize,
    /// The buffer capacity of each subscriber's decode-error broadcast channel.
    pub subscriber_error_buffer: usize,
    /// The default buffer capacity of a subscriber's `updates` stream.
    pub subscriber_update_buffer: usize,
}

impl Default for Solana {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8899".to_string(),
            commitment: CommitmentLevel::Confirmed,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            polling_frequency_ms: 1000,
            max_accounts_per_request: 99,
            max_concurrent_requests: 10,
            commitment: CommitmentLevel::Confirmed,
            change_detection: ChangeDetection::Data,
            autostart: true,
        }
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            commitment: CommitmentLevel::Confirmed,
        }
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            confirm_poll_interval_ms: 500,
            max_presubmission_attempts: 3,
            commitment: CommitmentLevel::Confirmed,
            skip_preflight: false,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            loader_command_buffer: 128,
            subscriber_error_buffer: 64,
            subscriber_update_buffer: 128,
        }
    }
}

impl LoaderConfig {
    pub fn polling_frequency(&self) -> Duration {
        Duration::from_millis(self.polling_frequency_ms)
    }

    pub fn commitment_config(&self) -> CommitmentConfig {
        CommitmentConfig {
            commitment: self.commitment,
        }
    }
}

impl SubscriberConfig {
    pub fn commitment_config(&self) -> CommitmentConfig {
        CommitmentConfig {
            commitment: self.commitment,
        }
    }
}

impl SenderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn confirm_poll_interval(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_interval_ms)
    }

    pub fn commitment_config(&self) -> CommitmentConfig {
        CommitmentConfig {
            commitment: self.commitment,
        }
    }
}

/// Loads the connector configuration from a TOML file.
///
/// Values can be overridden from the environment with the `CLEARING_HOUSE`
/// prefix and `__` as the section separator, e.g.
/// `CLEARING_HOUSE__SOLANA__COMMITMENT=finalized`.
#[cfg(feature = "serde")]
pub fn load_config(path: &str) -> anyhow::Result<ConnectorConfig> {
    use anyhow::Context;

    let builder = ::config::Config::builder()
        .add_source(::config::File::with_name(path))
        .add_source(::config::Environment::with_prefix("CLEARING_HOUSE").separator("__"));

    let settings: ConnectorConfig = builder
        .build()
        .context(format!("Failed to build configuration from '{}'", path))?
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    Ok(settings)
}

#[cfg(feature = "serde")]
mod serde_commitment {

    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(c: &CommitmentLevel, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = match c {
            CommitmentLevel::Processed => "processed",
            CommitmentLevel::Confirmed => "confirmed",
            CommitmentLevel::Finalized => "finalized",
        };
        serializer.serialize_str(s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<CommitmentLevel, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        match s.to_lowercase().as_str() {
            "processed" => Ok(CommitmentLevel::Processed),
            "confirmed" => Ok(CommitmentLevel::Confirmed),
            "finalized" => Ok(CommitmentLevel::Finalized),
            other => Err(serde::de::Error::unknown_variant(
                other,
                &["processed", "confirmed", "finalized"],
            )),
        }
    }
}
