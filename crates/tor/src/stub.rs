//! In-memory Tor collaborators
//!
//! Transports, clients and circuits that succeed instantly unless scripted
//! to fail. Circuit streams are `tokio::io::duplex` pipes answered by a
//! hyper server running a caller-supplied responder.

use std::collections::HashSet;
use std::convert::Infallible;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::directory::{Consensus, Microdesc, MicrodescHead, RelayFlag};
use crate::session::Target;
use crate::traits::{BoxedStream, Circuit, CloseReason, Dialer, TorClient, TorConnector, Transport};
use crate::{Result, TorError};

const STREAM_BUFFER: usize = 64 * 1024;

/// `middles` middle-only relays followed by `exits` exit-only relays
pub fn consensus(middles: usize, exits: usize) -> Consensus {
    use RelayFlag::*;
    let middle = (0..middles).map(|i| relay(format!("middle{}", i), &[Fast, Stable, V2Dir, Running]));
    let exit = (0..exits).map(|i| relay(format!("exit{}", i), &[Fast, Stable, Exit, Running]));
    Consensus {
        microdescs: middle.chain(exit).collect(),
    }
}

fn relay(nickname: String, flags: &[RelayFlag]) -> MicrodescHead {
    MicrodescHead {
        identity: format!("{}-identity", nickname),
        digest: format!("{}-digest", nickname),
        nickname,
        flags: flags.to_vec(),
    }
}

/// A transport nobody dialed
pub fn transport() -> Arc<dyn Transport> {
    Arc::new(StubTransport::default())
}

/// Closes when told to
#[derive(Debug, Default)]
pub struct StubTransport {
    closed: CancellationToken,
}

impl StubTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn closed(&self) -> CloseReason {
        self.closed.cancelled().await;
        CloseReason::Closed
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[derive(Debug, Default)]
pub struct StubDialer {
    dials: AtomicUsize,
    failures: AtomicUsize,
    transports: Mutex<Vec<Arc<StubTransport>>>,
}

impl StubDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` dials
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Every transport handed out so far
    pub fn transports(&self) -> Vec<Arc<StubTransport>> {
        self.transports.lock().clone()
    }
}

#[async_trait]
impl Dialer for StubDialer {
    async fn dial(&self, _endpoint: &str) -> io::Result<Arc<dyn Transport>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failures) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "bridge refused"));
        }
        let transport = Arc::new(StubTransport::default());
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Reply produced by a [`Responder`]
#[derive(Debug, Clone)]
pub struct StubReply {
    pub status: StatusCode,
    pub body: String,
}

impl StubReply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            body: body.into(),
        }
    }

    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

/// Answers every HTTP request sent over a stub circuit stream
pub type Responder = Arc<dyn Fn(&Target, &[u8]) -> StubReply + Send + Sync>;

fn success(_target: &Target, _body: &[u8]) -> StubReply {
    StubReply::ok("success")
}

struct Shared {
    consensus: Consensus,
    responder: Mutex<Responder>,
    handshake_failures: AtomicUsize,
    extend_failures: AtomicUsize,
    unreachable: Mutex<HashSet<String>>,
    handshakes: AtomicUsize,
    consensus_fetches: AtomicUsize,
    extends: AtomicUsize,
    opened: Mutex<Vec<Target>>,
    clients: Mutex<Vec<Arc<StubClient>>>,
    circuits: Mutex<Vec<Arc<StubCircuit>>>,
}

/// Connector producing stub clients that share one scripted network
#[derive(Clone)]
pub struct StubTor {
    shared: Arc<Shared>,
}

impl StubTor {
    /// Every request answered `200 success`
    pub fn new(consensus: Consensus) -> Self {
        Self {
            shared: Arc::new(Shared {
                consensus,
                responder: Mutex::new(Arc::new(success)),
                handshake_failures: AtomicUsize::new(0),
                extend_failures: AtomicUsize::new(0),
                unreachable: Mutex::new(HashSet::new()),
                handshakes: AtomicUsize::new(0),
                consensus_fetches: AtomicUsize::new(0),
                extends: AtomicUsize::new(0),
                opened: Mutex::new(Vec::new()),
                clients: Mutex::new(Vec::new()),
                circuits: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_responder(self, responder: Responder) -> Self {
        self.set_responder(responder);
        self
    }

    /// Applies to streams opened from now on
    pub fn set_responder(&self, responder: Responder) {
        *self.shared.responder.lock() = responder;
    }

    pub fn fail_next_handshakes(&self, n: usize) {
        self.shared.handshake_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_extends(&self, n: usize) {
        self.shared.extend_failures.store(n, Ordering::SeqCst);
    }

    /// Extending to `nickname` always fails
    pub fn unreachable(&self, nickname: &str) {
        self.shared.unreachable.lock().insert(nickname.to_string());
    }

    pub fn handshakes(&self) -> usize {
        self.shared.handshakes.load(Ordering::SeqCst)
    }

    pub fn consensus_fetches(&self) -> usize {
        self.shared.consensus_fetches.load(Ordering::SeqCst)
    }

    pub fn extends(&self) -> usize {
        self.shared.extends.load(Ordering::SeqCst)
    }

    /// Targets of every stream opened so far
    pub fn opened(&self) -> Vec<Target> {
        self.shared.opened.lock().clone()
    }

    pub fn clients(&self) -> Vec<Arc<StubClient>> {
        self.shared.clients.lock().clone()
    }

    pub fn circuits(&self) -> Vec<Arc<StubCircuit>> {
        self.shared.circuits.lock().clone()
    }
}

#[async_trait]
impl TorConnector for StubTor {
    async fn handshake(&self, transport: Arc<dyn Transport>) -> Result<Arc<dyn TorClient>> {
        self.shared.handshakes.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.shared.handshake_failures) {
            return Err(TorError::Protocol("handshake rejected".to_string()));
        }
        let client = Arc::new(StubClient {
            shared: self.shared.clone(),
            transport,
            closed: CancellationToken::new(),
        });
        self.shared.clients.lock().push(client.clone());
        Ok(client)
    }
}

pub struct StubClient {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    closed: CancellationToken,
}

impl StubClient {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl TorClient for StubClient {
    async fn fetch_consensus(&self) -> Result<Consensus> {
        self.shared.consensus_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.shared.consensus.clone())
    }

    async fn create_circuit(&self) -> Result<Arc<dyn Circuit>> {
        if self.is_closed() {
            return Err(TorError::Protocol("client closed".to_string()));
        }
        let circuit = Arc::new(StubCircuit {
            shared: self.shared.clone(),
            closed: self.closed.child_token(),
            hops: Mutex::new(Vec::new()),
        });
        self.shared.circuits.lock().push(circuit.clone());
        Ok(circuit)
    }

    async fn closed(&self) -> CloseReason {
        tokio::select! {
            _ = self.closed.cancelled() => CloseReason::Closed,
            reason = self.transport.closed() => reason,
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Closed with its client
pub struct StubCircuit {
    shared: Arc<Shared>,
    closed: CancellationToken,
    hops: Mutex<Vec<String>>,
}

impl StubCircuit {
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Nicknames of the relays extended to, in order
    pub fn hops(&self) -> Vec<String> {
        self.hops.lock().clone()
    }
}

#[async_trait]
impl Circuit for StubCircuit {
    async fn fetch_microdesc(&self, head: &MicrodescHead) -> Result<Microdesc> {
        Ok(Microdesc {
            nickname: head.nickname.clone(),
            identity: head.identity.clone(),
            ntor_onion_key: format!("{}-ntor", head.nickname),
        })
    }

    async fn extend(&self, relay: &Microdesc) -> Result<()> {
        self.shared.extends.fetch_add(1, Ordering::SeqCst);
        if self.is_closed() {
            return Err(TorError::Protocol("circuit closed".to_string()));
        }
        if take_one(&self.shared.extend_failures) || self.shared.unreachable.lock().contains(&relay.nickname) {
            return Err(TorError::Protocol(format!("{} refused extend", relay.nickname)));
        }
        self.hops.lock().push(relay.nickname.clone());
        Ok(())
    }

    async fn open(&self, target: &Target) -> Result<BoxedStream> {
        if self.is_closed() {
            return Err(TorError::Protocol("circuit closed".to_string()));
        }
        self.shared.opened.lock().push(target.clone());

        let (client, server) = tokio::io::duplex(STREAM_BUFFER);
        let responder = self.shared.responder.lock().clone();
        let target = target.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<Incoming>| {
                let responder = responder.clone();
                let target = target.clone();
                async move {
                    let body = match request.into_body().collect().await {
                        Ok(collected) => collected.to_bytes(),
                        Err(_) => Bytes::new(),
                    };
                    let reply = responder(&target, &body);
                    let mut response = Response::new(Full::new(Bytes::from(reply.body)));
                    *response.status_mut() = reply.status;
                    Ok::<_, Infallible>(response)
                }
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(server), service)
                .await;
        });

        Ok(Box::new(client))
    }

    async fn closed(&self) -> CloseReason {
        self.closed.cancelled().await;
        CloseReason::Closed
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Decrement `counter` if positive, reporting whether it was
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
