#![allow(dead_code)]

use async_trait::async_trait;
use clearing_house_connector::{
    config::ConnectorConfig,
    error::ConnectorError,
    rpc::{AccountReader, Slotted, SubmissionStatus, SubmitConfig, SubmitError, TransactionSubmitter},
};
use parking_lot::Mutex;
use solana_sdk::{
    account::Account, commitment_config::CommitmentConfig, hash::Hash, pubkey::Pubkey,
    signature::Signature, transaction::Transaction,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

/// Config with periodic polling disabled so tests drive cycles with `load`.
pub fn manual_config() -> ConnectorConfig {
    let mut config = ConnectorConfig::default();
    config.loader.autostart = false;
    config
}

pub fn account_with_data(data: Vec<u8>) -> Account {
    Account {
        lamports: 1_000_000,
        data,
        owner: Pubkey::default(),
        executable: false,
        rent_epoch: 0,
    }
}

struct ReaderState {
    accounts: HashMap<Pubkey, Account>,
    slot: u64,
    auto_advance: bool,
    fail: bool,
    read_many_calls: usize,
    read_one_calls: usize,
}

/// An in-memory cluster for the read side.
///
/// Every read advances the context slot by one unless a slot was pinned with
/// [`MockAccountReader::set_slot`].
pub struct MockAccountReader {
    state: Mutex<ReaderState>,
    gate: Arc<RwLock<()>>,
}

impl MockAccountReader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ReaderState {
                accounts: HashMap::new(),
                slot: 0,
                auto_advance: true,
                fail: false,
                read_many_calls: 0,
                read_one_calls: 0,
            }),
            gate: Arc::new(RwLock::new(())),
        })
    }

    pub fn set_data(&self, address: Pubkey, data: Vec<u8>) {
        self.set_account(address, account_with_data(data));
    }

    pub fn set_account(&self, address: Pubkey, account: Account) {
        self.state.lock().accounts.insert(address, account);
    }

    pub fn remove(&self, address: &Pubkey) {
        self.state.lock().accounts.remove(address);
    }

    pub fn set_slot(&self, slot: u64) {
        let mut state = self.state.lock();
        state.slot = slot;
        state.auto_advance = false;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail = fail;
    }

    pub fn read_many_calls(&self) -> usize {
        self.state.lock().read_many_calls
    }

    pub fn read_one_calls(&self) -> usize {
        self.state.lock().read_one_calls
    }

    /// Holds every read until the guard is dropped.
    pub async fn block_reads(&self) -> OwnedRwLockWriteGuard<()> {
        self.gate.clone().write_owned().await
    }

    fn next_slot(state: &mut ReaderState) -> u64 {
        if state.auto_advance {
            state.slot += 1;
        }
        state.slot
    }
}

#[async_trait]
impl AccountReader for MockAccountReader {
    async fn read_many(
        &self,
        addresses: &[Pubkey],
        _commitment: CommitmentConfig,
    ) -> Result<Slotted<Vec<Option<Account>>>, ConnectorError> {
        self.state.lock().read_many_calls += 1;
        let _pass = self.gate.read().await;

        let mut state = self.state.lock();
        if state.fail {
            return Err(ConnectorError::RemoteUnavailable("mock outage".to_string()));
        }
        let slot = Self::next_slot(&mut state);
        let value = addresses
            .iter()
            .map(|address| state.accounts.get(address).cloned())
            .collect();
        Ok(Slotted { slot, value })
    }

    async fn read_one(
        &self,
        address: &Pubkey,
        _commitment: CommitmentConfig,
    ) -> Result<Slotted<Option<Account>>, ConnectorError> {
        self.state.lock().read_one_calls += 1;
        let _pass = self.gate.read().await;

        let mut state = self.state.lock();
        if state.fail {
            return Err(ConnectorError::RemoteUnavailable("mock outage".to_string()));
        }
        let slot = Self::next_slot(&mut state);
        Ok(Slotted {
            slot,
            value: state.accounts.get(address).cloned(),
        })
    }
}

struct SubmitterState {
    blockhash_failures: u32,
    submit_script: VecDeque<Result<(), SubmitError>>,
    pending_polls: u32,
    final_status: SubmissionStatus,
    submissions: Vec<Signature>,
    status_calls: usize,
}

/// An in-memory cluster for the write side.
///
/// Submissions succeed unless scripted otherwise; statuses stay `Pending`
/// unless [`MockSubmitter::confirm_after`] was called.
pub struct MockSubmitter {
    state: Mutex<SubmitterState>,
}

impl MockSubmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SubmitterState {
                blockhash_failures: 0,
                submit_script: VecDeque::new(),
                pending_polls: 0,
                final_status: SubmissionStatus::Pending,
                submissions: Vec::new(),
                status_calls: 0,
            }),
        })
    }

    pub fn fail_blockhash(&self, times: u32) {
        self.state.lock().blockhash_failures = times;
    }

    pub fn script_submissions(&self, script: Vec<Result<(), SubmitError>>) {
        self.state.lock().submit_script = script.into();
    }

    /// Reports `Pending` for `polls` status checks, then `status`.
    pub fn confirm_after(&self, polls: u32, status: SubmissionStatus) {
        let mut state = self.state.lock();
        state.pending_polls = polls;
        state.final_status = status;
    }

    pub fn submissions(&self) -> Vec<Signature> {
        self.state.lock().submissions.clone()
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().status_calls
    }
}

#[async_trait]
impl TransactionSubmitter for MockSubmitter {
    async fn latest_blockhash(&self, _commitment: CommitmentConfig) -> Result<Hash, ConnectorError> {
        let mut state = self.state.lock();
        if state.blockhash_failures > 0 {
            state.blockhash_failures -= 1;
            return Err(ConnectorError::RemoteUnavailable("blockhash unavailable".to_string()));
        }
        Ok(Hash::new_unique())
    }

    async fn submit(
        &self,
        transaction: &Transaction,
        _config: &SubmitConfig,
    ) -> Result<Signature, SubmitError> {
        let signature = transaction.signatures[0];
        let mut state = self.state.lock();
        state.submissions.push(signature);
        match state.submit_script.pop_front() {
            Some(Err(e)) => Err(e),
            _ => Ok(signature),
        }
    }

    async fn status(
        &self,
        _signature: &Signature,
        _commitment: CommitmentConfig,
    ) -> Result<SubmissionStatus, ConnectorError> {
        let mut state = self.state.lock();
        state.status_calls += 1;
        if state.pending_polls > 0 {
            state.pending_polls -= 1;
            return Ok(SubmissionStatus::Pending);
        }
        Ok(state.final_status.clone())
    }
}
