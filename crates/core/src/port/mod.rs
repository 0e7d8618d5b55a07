// Port Layer - Interfaces for external dependencies

pub mod event;
pub mod job_store;
pub mod time_provider;
pub mod transaction;

// Re-exports
pub use event::{EventDispatcher, ListenerDispatcher, StateChangeEvent, JOB_STATE_CHANGE};
pub use job_store::JobStore;
pub use time_provider::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
pub use transaction::{JobStoreTransaction, Transaction};
