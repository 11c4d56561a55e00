pub mod entities;
mod ledger;
mod seaorm;

pub use ledger::{
    CostMicros, CreditAggregate, CreditWindow, LedgerEntry, LedgerOwner, LedgerStatus,
    LedgerStore, PricingRow, RecordOutcome, StorageError, StorageResult,
};
pub use seaorm::SeaOrmStorage;
