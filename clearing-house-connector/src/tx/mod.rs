//! Transaction submission with confirmation and bounded pre-submission retry.

pub mod sender;

pub use sender::{PendingTransaction, SendOptions, TransactionSender, TxOutcome};
