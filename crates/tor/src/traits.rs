//! Tor collaborators
//!
//! Everything speaking the Tor protocol lives behind these traits. Futures
//! returned here must be safe to drop: callers bound each call with a
//! timeout and a cancellation token.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::directory::{Consensus, Microdesc, MicrodescHead};
use crate::session::Target;
use crate::Result;

/// Why a resource stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Closed,
    Error(String),
}

/// Raw byte transport to the bridge
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve once the transport closed or errored
    async fn closed(&self) -> CloseReason;

    fn close(&self);
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, endpoint: &str) -> io::Result<Arc<dyn Transport>>;
}

/// Wraps a transport into a Tor client
#[async_trait]
pub trait TorConnector: Send + Sync {
    async fn handshake(&self, transport: Arc<dyn Transport>) -> Result<Arc<dyn TorClient>>;
}

#[async_trait]
pub trait TorClient: Send + Sync {
    /// Download the microdescriptor consensus from the network
    async fn fetch_consensus(&self) -> Result<Consensus>;

    /// Create a circuit with no hops yet
    async fn create_circuit(&self) -> Result<Arc<dyn Circuit>>;

    async fn closed(&self) -> CloseReason;

    fn close(&self);
}

#[async_trait]
pub trait Circuit: Send + Sync {
    async fn fetch_microdesc(&self, head: &MicrodescHead) -> Result<Microdesc>;

    /// Add one hop
    async fn extend(&self, relay: &Microdesc) -> Result<()>;

    /// Open a stream to `target` through the last hop, TLS included when
    /// the target asks for it
    async fn open(&self, target: &Target) -> Result<BoxedStream>;

    async fn closed(&self) -> CloseReason;

    fn close(&self);
}

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<S: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for S {}

pub type BoxedStream = Box<dyn AsyncStream>;
