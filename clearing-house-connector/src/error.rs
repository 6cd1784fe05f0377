use solana_client::client_error::ClientError;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

/// Errors surfaced by the account synchronization side of the connector.
///
/// Transaction submission never returns these to the caller; its outcomes are
/// values of [`crate::tx::TxOutcome`].
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// The cluster could not be reached or answered with a transient error.
    /// Recovered by the next poll tick.
    #[error("Remote unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("RPC client error: {0}")]
    Rpc(#[from] ClientError),

    /// A read returned an older context slot than one already applied.
    #[error("Stale context: received slot {received}, already applied slot {latest}")]
    StaleContext { received: u64, latest: u64 },

    #[error("Failed to decode account {address} at slot {slot}: {source}")]
    Decode {
        address: Pubkey,
        slot: u64,
        #[source]
        source: DecodeError,
    },

    #[error("Subscriber is not subscribed")]
    NotSubscribed,

    #[error("Subscriber is already subscribed")]
    AlreadySubscribed,

    #[error("Account {0} is not part of this subscription")]
    UnknownAddress(Pubkey),

    /// The bulk loader task has exited and no longer accepts commands.
    #[error("Bulk account loader is not running")]
    LoaderStopped,
}

/// Errors produced while turning raw account bytes into a typed record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Account data too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Account discriminator mismatch")]
    DiscriminatorMismatch,

    #[error("Invalid account data: {0}")]
    Invalid(String),
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;
