//! JSON-RPC over a duplex message socket
//!
//! Responses arrive in any order. A reader task routes each one to the
//! request that is waiting on its id.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use brume_core::{RpcRequest, RpcResponse};
use brume_tor::TorCircuit;
use http::Uri;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::RpcFetchError;

/// Text-message socket, e.g. a WebSocket over a circuit stream
#[async_trait]
pub trait MessageSocket: Send + Sync {
    async fn send(&self, text: String) -> io::Result<()>;

    /// Next message, `None` once the peer closed
    async fn recv(&self) -> io::Result<Option<String>>;

    fn close(&self);
}

/// Opens message sockets through a circuit
#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, circuit: Arc<TorCircuit>, url: &Uri) -> io::Result<Arc<dyn MessageSocket>>;
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

/// Removes a waiter whose caller went away
struct PendingGuard {
    pending: Pending,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

pub struct RpcSocket {
    socket: Arc<dyn MessageSocket>,
    pending: Pending,
    closed: CancellationToken,
    reader: JoinHandle<()>,
}

impl RpcSocket {
    /// Start routing responses from `socket`
    pub fn new(socket: Arc<dyn MessageSocket>) -> Self {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();
        let reader = tokio::spawn(read_responses(socket.clone(), pending.clone(), closed.clone()));
        Self {
            socket,
            pending,
            closed,
            reader,
        }
    }

    /// Send `request` and wait for the response carrying its id
    pub async fn request(&self, request: &RpcRequest) -> Result<RpcResponse, RpcFetchError> {
        let (tx, rx) = oneshot::channel();
        {
            // The reader clears the waiters after marking the socket closed
            let mut pending = self.pending.lock();
            if self.is_closed() {
                return Err(RpcFetchError::SocketClosed);
            }
            pending.insert(request.id, tx);
        }
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id: request.id,
        };

        self.socket.send(serde_json::to_string(request)?).await?;
        rx.await.map_err(|_| RpcFetchError::SocketClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolve once the peer closed or the socket failed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn close(&self) {
        self.socket.close();
        self.closed.cancel();
    }
}

impl Drop for RpcSocket {
    fn drop(&mut self) {
        self.reader.abort();
        self.socket.close();
    }
}

async fn read_responses(socket: Arc<dyn MessageSocket>, pending: Pending, closed: CancellationToken) {
    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = socket.recv() => message,
        };

        match message {
            Ok(Some(text)) => {
                let response: RpcResponse = match serde_json::from_str(&text) {
                    Ok(response) => response,
                    Err(e) => {
                        debug!("Ignoring non-response message: {}", e);
                        continue;
                    }
                };
                let Some(id) = response.id_u64() else {
                    debug!("Ignoring response without numeric id");
                    continue;
                };
                match pending.lock().remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => debug!("No request waiting for response {}", id),
                }
            }
            Ok(None) => {
                debug!("RPC socket closed by peer");
                break;
            }
            Err(e) => {
                warn!("RPC socket failed: {}", e);
                break;
            }
        }
    }

    closed.cancel();
    // Dropping the senders fails every waiter with SocketClosed
    pending.lock().clear();
}
