pub mod backoff;
pub mod encryption;
pub mod ledger;
pub mod ledger_store;
pub mod registrar;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod transfer;
