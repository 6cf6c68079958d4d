//! Brume RPC
//!
//! Ethereum JSON-RPC over Tor circuits, sent down several independent paths
//! at once and cross-checked.
//!
//! ## Layout
//!
//! - Every configured endpoint of a chain gets a connection pool, whose
//!   connections each own a circuit taken from the shared circuit pool.
//! - A chain's connection pools form a pool of pools ([`ChainPools`]).
//! - [`fetch_or_fail`] asks every connection of every pool, then elects the
//!   answer by [`consensus`]: first within each pool, then across pools.

pub mod connection;
pub mod consensus;
pub mod cooldown;
pub mod coordinator;
pub mod counter;
pub mod fetcher;
pub mod pools;
pub mod socket;

pub use connection::{RpcConnection, RpcConnectionEntry};
pub use consensus::{elect, Verdict};
pub use cooldown::Cooldown;
pub use coordinator::{fetch_or_fail, EthereumContext, MIN_ATTEMPT_TIMEOUT};
pub use counter::RpcCounter;
pub use fetcher::{Fetcher, FetcherMore, JsonRequest};
pub use pools::{create_brume, create_chain_pools, create_connection_pool, create_socket_connection_pool, ChainPools};
pub use socket::{MessageSocket, RpcSocket, SocketConnector};

use std::time::Duration;

use brume_core::{ChainId, RpcErrorObject};
use brume_pool::{Interrupted, PoolError};
use brume_tor::TorError;
use thiserror::Error;

/// Failure of one request over one connection
#[derive(Error, Debug)]
pub enum RpcFetchError {
    #[error(transparent)]
    Tor(#[from] TorError),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Invalid JSON-RPC response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JSON-RPC error: {0}")]
    Rpc(RpcErrorObject),

    #[error("Socket closed")]
    SocketClosed,

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Failure of a multi-path fetch, or of one of its branches
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Unknown chain {0}")]
    UnknownChain(ChainId),

    #[error("Unknown fetch key {0}")]
    UnknownKey(String),

    #[error("Aborted")]
    Aborted,

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Pool(PoolError),

    #[error(transparent)]
    Attempt(#[from] RpcFetchError),

    #[error("All {} attempts failed", .0.len())]
    Exhausted(Vec<FetchError>),
}

impl From<PoolError> for FetchError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Aborted => Self::Aborted,
            PoolError::TimedOut(after) => Self::TimedOut(after),
            other => Self::Pool(other),
        }
    }
}

impl From<Interrupted> for FetchError {
    fn from(interrupted: Interrupted) -> Self {
        match interrupted {
            Interrupted::Aborted => Self::Aborted,
            Interrupted::TimedOut(after) => Self::TimedOut(after),
        }
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
