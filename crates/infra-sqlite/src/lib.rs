// Conveyor SQLite Infrastructure - JobStore implementation over sqlx

mod connection;
mod job_store;
mod migration;
mod queries;
mod transaction;

pub use connection::create_pool;
pub use job_store::SqliteJobStore;
pub use migration::run_migrations;
