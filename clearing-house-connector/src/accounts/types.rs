use crate::config::ChangeDetection;
use sha2::{Digest, Sha256};
use solana_sdk::{account::Account, pubkey::Pubkey};
use std::{fmt, sync::Arc};

/// Token returned by `add_subscriber`, used to release one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

/// Token returned when registering a change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// A content change detected by the bulk loader for one address.
///
/// `account` is `None` when the account no longer exists. Listeners get no
/// previous value and must keep their own copy if they need to diff.
#[derive(Debug, Clone)]
pub struct AccountChange {
    pub address: Pubkey,
    pub account: Option<Arc<Account>>,
    pub slot: u64,
}

impl AccountChange {
    pub fn data(&self) -> Option<&[u8]> {
        self.account.as_deref().map(|account| account.data.as_slice())
    }
}

/// The raw state the loader currently holds for a registered address.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub account: Option<Arc<Account>>,
    /// Context slot of the read that produced `account`, 0 before the first read.
    pub slot: u64,
}

/// A decoded record and the context slot it was read at.
#[derive(Debug)]
pub struct DataAndSlot<T> {
    pub data: Arc<T>,
    pub slot: u64,
}

impl<T> Clone for DataAndSlot<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
            slot: self.slot,
        }
    }
}

pub(crate) type ContentHash = [u8; 32];

/// Hashes the parts of `account` selected by `mode`.
pub(crate) fn content_hash(account: &Account, mode: ChangeDetection) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(&account.data);
    if mode == ChangeDetection::Account {
        hasher.update(account.lamports.to_le_bytes());
        hasher.update(account.owner.as_ref());
        hasher.update([account.executable as u8]);
    }
    hasher.finalize().into()
}
