//! # rill-exit: Account transaction-chain cache for the Rill exit node.
//!
//! Serves wallets that track a set of accounts without running a node:
//! - [`chain`]: merges account histories into one hash-chained ledger
//! - [`cache::ChainCache`]: single-flight cache of chains, keyed by handle
//! - [`live::LiveUpdateRouter`]: applies ledger deltas to cached chains
//! - [`pagination`]: locator-based incremental reads
//! - [`fanout::NotificationFanout`]: push messages for live sessions
//! - [`service::AccountChainService`]: the caller-facing operations
//! - [`rpc`]: JSON-RPC server for external access
//! - [`memory::MemoryLedger`]: in-memory store and ledger
//! - [`config::ExitConfig`]: exit node configuration

pub mod address;
pub mod cache;
pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod fanout;
pub mod live;
pub mod memory;
pub mod pagination;
pub mod render;
pub mod rpc;
pub mod service;
pub mod traits;
pub mod types;

pub use cache::ChainCache;
pub use chain::{ChainData, ChainEvent};
pub use config::ExitConfig;
pub use error::{ExitError, StoreError};
pub use fanout::{NotificationFanout, PushMessage, Session};
pub use memory::MemoryLedger;
pub use rpc::start_rpc_server;
pub use service::{AccountChainService, ServiceConfig};
pub use traits::{AccountStore, Ledger};
