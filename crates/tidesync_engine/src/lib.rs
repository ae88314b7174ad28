//! # TideSync Engine
//!
//! Offline sync engine for a mobile-backend client SDK.
//!
//! This crate provides:
//! - A durable operation queue with mutation condensation
//! - The `SyncContext` coordinator with a serialized writer domain
//! - Push draining in strict enqueue order with per-op error isolation
//! - Paged pull with optional delta-token incrementality
//! - Safe purge in the presence of pending operations
//!
//! The local store and the remote endpoint are external collaborators behind
//! the [`DataSource`] and [`RemoteClient`] traits; in-memory implementations
//! ship alongside the traits for embedding tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod config_store;
pub mod context;
pub mod error;
pub mod executor;
pub mod operation;
mod pull;
mod purge;
pub mod push;
pub mod queue;
pub mod remote;
pub mod store;
pub mod table;

pub use config::SyncConfig;
pub use config_store::ConfigStore;
pub use context::{SyncContext, SyncContextBuilder};
pub use error::{SyncError, SyncResult, TableOperationError};
pub use executor::{CallbackPool, CancelToken, SerialExecutor};
pub use operation::{
    condense, CondenseAction, OperationError, OperationKind, OperationState, TableOperation,
};
pub use push::PushHandler;
pub use queue::OperationQueue;
pub use remote::{Features, MockRemoteClient, RemoteCall, RemoteClient, RemoteError};
pub use store::{DataSource, InMemoryDataSource, QueryPage, StoreError};
pub use table::SyncTable;
