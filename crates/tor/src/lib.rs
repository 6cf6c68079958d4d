//! Brume Tor
//!
//! Layered, self-healing pools of Tor resources:
//!
//! - [`sockets::create_socket_pool`] dials transports to the bridge
//! - [`tors::create_tor_pool`] wraps transports into handshaked Tor clients
//!   holding a directory consensus
//! - [`circuits::create_circuit_pool`] builds middle + exit circuits over the
//!   clients and self-tests them before handing them out
//! - [`circuits::create_circuit_subpool`] steals circuits for private use
//!
//! The Tor protocol itself (link handshake, cell crypto, directory documents,
//! TLS) sits behind the traits in [`traits`].

pub mod circuits;
pub mod connectivity;
pub mod directory;
pub mod ping;
pub mod session;
pub mod sockets;
pub mod tors;
pub mod traits;

#[cfg(any(test, feature = "stub"))]
pub mod stub;

pub use circuits::{create_circuit_pool, create_circuit_subpool, CircuitInfo, TorCircuit};
pub use connectivity::{Connectivity, ConnectivityHandle};
pub use directory::{
    Consensus, MemoryStorage, Microdesc, MicrodescHead, MicrodescQuery, RelayFlag, Storage,
    MICRODESCS_KEY,
};
pub use ping::{PingEstimate, MIN_PING};
pub use session::{open_as, HttpResponse, HttpSession, Target};
pub use sockets::create_socket_pool;
pub use tors::{create_tor_pool, TorSession};
pub use traits::{
    AsyncStream, BoxedStream, Circuit, CloseReason, Dialer, TorClient, TorConnector, Transport,
};

use brume_pool::{Interrupted, PoolError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("No {0} relay in consensus")]
    NoCandidates(&'static str),

    #[error("Could not extend to {hop} after {attempts} attempts: {last}")]
    ExtendExhausted {
        hop: &'static str,
        attempts: u32,
        last: String,
    },

    #[error("Self-test failed: {0}")]
    SelfTest(String),

    #[error("Unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Invalid HTTP request: {0}")]
    HttpRequest(#[from] http::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl TorError {
    /// Whether the caller's token fired, as opposed to a failure
    pub fn is_aborted(&self) -> bool {
        matches!(
            self,
            Self::Interrupted(Interrupted::Aborted) | Self::Pool(PoolError::Aborted)
        )
    }
}

impl From<TorError> for PoolError {
    fn from(e: TorError) -> Self {
        match e {
            TorError::Interrupted(interrupted) => interrupted.into(),
            TorError::Pool(e) => e,
            other => PoolError::Failed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, TorError>;
