//! Ethereum connections and the single-request transport

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use brume_core::{RpcRequest, RpcResponse};
use brume_pool::{abortable, Interrupted};
use brume_tor::{open_as, HttpSession, TorCircuit};
use http::Uri;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cooldown::Cooldown;
use crate::counter::RpcCounter;
use crate::socket::RpcSocket;
use crate::RpcFetchError;

/// One path to an RPC endpoint
pub enum RpcConnection {
    /// HTTP(S) endpoint, one stream through `circuit` per request
    Url { url: Uri, circuit: Arc<TorCircuit> },
    /// Long-lived socket endpoint
    Socket { socket: Arc<RpcSocket>, cooldown: Cooldown },
}

impl RpcConnection {
    /// Send one request, bounded by `timeout` and `cancel`.
    ///
    /// A socket connection trips its cooldown when the request fails or
    /// times out; an error object returned by the server is not a failure of
    /// the connection.
    pub async fn fetch_or_throw(
        &self,
        request: &RpcRequest,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Value, RpcFetchError> {
        match self {
            Self::Url { url, circuit } => {
                let response = abortable(cancel, timeout, post(circuit, url, request)).await??;
                response.into_result().map_err(RpcFetchError::Rpc)
            }
            Self::Socket { socket, cooldown } => {
                cooldown.wait(cancel).await?;
                match abortable(cancel, timeout, socket.request(request)).await {
                    Ok(Ok(response)) => response.into_result().map_err(RpcFetchError::Rpc),
                    Ok(Err(e)) => {
                        debug!("Socket request {} failed, cooling down: {}", request.id, e);
                        cooldown.trip();
                        Err(e)
                    }
                    Err(Interrupted::TimedOut(after)) => {
                        debug!("Socket request {} timed out, cooling down", request.id);
                        cooldown.trip();
                        Err(Interrupted::TimedOut(after).into())
                    }
                    Err(Interrupted::Aborted) => Err(Interrupted::Aborted.into()),
                }
            }
        }
    }

    /// Resolve once the underlying circuit or socket is gone
    pub async fn closed(&self) {
        match self {
            Self::Url { circuit, .. } => {
                circuit.closed().await;
            }
            Self::Socket { socket, .. } => socket.closed().await,
        }
    }

    pub fn close(&self) {
        match self {
            Self::Url { .. } => {}
            Self::Socket { socket, .. } => socket.close(),
        }
    }
}

impl fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url { url, circuit } => f
                .debug_struct("Url")
                .field("url", url)
                .field("circuit", &circuit.info().index)
                .finish(),
            Self::Socket { cooldown, .. } => f
                .debug_struct("Socket")
                .field("cooling", &cooldown.is_cooling())
                .finish(),
        }
    }
}

/// A pooled connection and the ids it assigns
#[derive(Debug)]
pub struct RpcConnectionEntry {
    pub counter: RpcCounter,
    pub connection: RpcConnection,
}

impl RpcConnectionEntry {
    pub fn new(connection: RpcConnection) -> Self {
        Self {
            counter: RpcCounter::new(),
            connection,
        }
    }
}

async fn post(circuit: &TorCircuit, url: &Uri, request: &RpcRequest) -> Result<RpcResponse, RpcFetchError> {
    let stream = open_as(&**circuit, url).await?;
    let mut session = HttpSession::handshake(stream).await?;
    let response = session.post_json(url, request).await?;
    if !response.is_success() {
        return Err(RpcFetchError::HttpStatus(response.status.as_u16()));
    }
    Ok(serde_json::from_slice(&response.body)?)
}
