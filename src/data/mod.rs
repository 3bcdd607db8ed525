//! Data layer module
//!
//! SQLite persistence for accounts, statuses, relationships and the
//! federation bookkeeping tables.

mod database;
mod models;

pub use database::Database;
pub use models::*;
