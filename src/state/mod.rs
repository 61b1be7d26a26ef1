//! Transaction state and persistence
//!
//! Handles:
//! - The bridge transaction record and its state machine
//! - Guarded, atomic status transitions
//! - In-memory and PostgreSQL repositories

mod postgres;
mod repository;
mod store;
mod transaction;

pub use postgres::PostgresRepository;
pub use repository::{MemoryRepository, TransactionRepository, TransactionStats};
pub use store::TransactionStore;
pub use transaction::{BridgeTransaction, TransactionId, TransactionStatus, ValidatorSignature};
