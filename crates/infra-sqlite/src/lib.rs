// pkgtxn Infrastructure - SQLite Adapter
// Implements: TransactionStore

mod connection;
mod migration;
mod transaction_store;

pub use connection::create_pool;
pub use migration::run_migrations;
pub use transaction_store::SqliteTransactionStore;

// Note: sqlx::Error conversion is handled by wrapping in helper functions
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for AppError here)
