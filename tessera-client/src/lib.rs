//! # tessera-client
//!
//! Client library for the tessera replicated key-value store.
//!
//! This crate provides:
//! - Connection multiplexing with many requests in flight per socket
//! - Rendezvous-hashed replica selection with failure marking
//! - Retry policies for transport failures
//! - Get, commit, confirm and iterate operations plus buffered transactions

pub mod client;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod replica;
pub mod request;
pub mod retry;
pub mod txn;

pub use client::{IteratePage, KvClient};
pub use config::{ClientConfig, ConnectionConfig, RetryKind};
pub use connection::{Completion, ConnectionManager, Request};
pub use endpoint::Endpoint;
pub use error::{ClientError, ConfigError};
pub use replica::{coarse_shard_hint, shard_hint, HintGranularity, ReplicaSelector, ReplicaSet};
pub use request::KvRequest;
pub use retry::{ExponentialBackoff, FixedRetry, RetryPolicy};
pub use txn::Txn;
