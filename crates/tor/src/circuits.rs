//! Circuit pool and circuit sub-pools
//!
//! A circuit is built over a pooled Tor client: one middle hop, one exit
//! hop, then a self-test against a plain HTTP endpoint. Only circuits that
//! pass the self-test are handed out.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use brume_core::TorConfig;
use brume_pool::{abortable, Entry, Interrupted, Pool, PoolError, PoolParams, RebuildGate};
use http::Uri;
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::directory::MicrodescHead;
use crate::ping::PingEstimate;
use crate::session::{open_as, HttpSession};
use crate::tors::TorSession;
use crate::traits::Circuit;
use crate::{Result, TorError};

/// Diagnostics of a built circuit
#[derive(Debug, Clone)]
pub struct CircuitInfo {
    /// Circuit pool slot that built it
    pub index: usize,
    pub middle: String,
    pub exit: String,
    pub created: Instant,
    /// When the self-test passed
    pub ready: Instant,
}

impl CircuitInfo {
    pub fn build_time(&self) -> Duration {
        self.ready.duration_since(self.created)
    }
}

/// A self-tested circuit
pub struct TorCircuit {
    circuit: Arc<dyn Circuit>,
    info: CircuitInfo,
}

impl TorCircuit {
    pub fn new(circuit: Arc<dyn Circuit>, info: CircuitInfo) -> Self {
        Self { circuit, info }
    }

    pub fn info(&self) -> &CircuitInfo {
        &self.info
    }

    pub fn circuit(&self) -> &Arc<dyn Circuit> {
        &self.circuit
    }
}

impl Deref for TorCircuit {
    type Target = dyn Circuit;

    fn deref(&self) -> &Self::Target {
        self.circuit.as_ref()
    }
}

impl fmt::Debug for TorCircuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorCircuit").field("info", &self.info).finish()
    }
}

/// Closes a circuit under construction unless disarmed
struct CircuitGuard(Option<Arc<dyn Circuit>>);

impl CircuitGuard {
    fn disarm(mut self) -> Option<Arc<dyn Circuit>> {
        self.0.take()
    }
}

impl Drop for CircuitGuard {
    fn drop(&mut self) {
        if let Some(circuit) = self.0.take() {
            circuit.close();
        }
    }
}

/// Pool of self-tested circuits over clients from `tors`.
///
/// Slot *i* uses client slot `i % tors.capacity()`. Failed build steps are
/// logged and retried with fresh relays until the slot is cancelled; only a
/// failure to obtain the client itself can fail the slot. Self-test round
/// trips feed `ping`.
pub fn create_circuit_pool(tors: &Pool<TorSession>, config: &TorConfig, ping: PingEstimate) -> Pool<TorCircuit> {
    let gate = RebuildGate::new();
    let upstream = tors.clone();
    let config = config.clone();
    let slots = gate.clone();

    let pool = Pool::named(
        "circuits",
        config.circuit_pool_capacity,
        move |params: PoolParams<TorCircuit>| {
            let tors = upstream.clone();
            let config = config.clone();
            let ping = ping.clone();
            let gate = slots.clone();
            async move {
                let label = format!("Circuit #{}", params.index);
                let circuit = gate
                    .retry(&label, || build_until_ready(&params, &tors, &config, &ping))
                    .await
                    .map_err(PoolError::from)?;
                Ok(circuit_entry(&params, Arc::new(circuit)))
            }
        },
    );

    pool.follow(tors, gate);
    pool
}

/// Pool of `capacity` circuits taken out of `circuits` for exclusive use.
///
/// Each slot removes a random ready circuit from the shared pool, which then
/// rebuilds that slot. A taken circuit that closes restarts the sub-pool
/// slot, not the shared one.
pub fn create_circuit_subpool(circuits: &Pool<TorCircuit>, capacity: usize) -> Pool<TorCircuit> {
    let gate = RebuildGate::new();
    let shared = circuits.clone();
    let slots = gate.clone();

    let pool = Pool::named(
        "circuit subpool",
        capacity,
        move |params: PoolParams<TorCircuit>| {
            let shared = shared.clone();
            let gate = slots.clone();
            async move {
                let label = format!("Subcircuit #{}", params.index);
                let taken = gate
                    .retry(&label, || shared.take_crypto_random(&params.cancel))
                    .await?;
                let circuit = taken.detach();
                debug!("Subcircuit #{} took circuit #{}", params.index, circuit.info().index);
                Ok(circuit_entry(&params, circuit))
            }
        },
    );

    pool.follow(circuits, gate);
    pool
}

fn circuit_entry(params: &PoolParams<TorCircuit>, circuit: Arc<TorCircuit>) -> Entry<TorCircuit> {
    let index = params.index;
    let closing = circuit.clone();
    let watched = circuit.clone();
    let entry = Entry::new(circuit).on_close(move || closing.close());

    params.restart_on(entry, async move {
        let reason = watched.closed().await;
        debug!("Circuit #{} closed: {:?}", index, reason);
    })
}

async fn build_until_ready(
    params: &PoolParams<TorCircuit>,
    tors: &Pool<TorSession>,
    config: &TorConfig,
    ping: &PingEstimate,
) -> Result<TorCircuit> {
    let index = params.index;

    loop {
        let session = tors.get(index % tors.capacity(), &params.cancel).await?;

        match build_circuit(index, &session, config, ping, &params.cancel).await {
            Ok(circuit) => return Ok(circuit),
            Err(e) if e.is_aborted() => return Err(e),
            Err(e @ TorError::NoCandidates(_)) => return Err(e),
            Err(e) => {
                warn!("Circuit #{} attempt failed: {}", index, e);
                tokio::task::yield_now().await;
            }
        }
    }
}

async fn build_circuit(
    index: usize,
    session: &TorSession,
    config: &TorConfig,
    ping: &PingEstimate,
    cancel: &CancellationToken,
) -> Result<TorCircuit> {
    let created = Instant::now();
    let middles = session.consensus.middles();
    let exits = session.consensus.exits();

    let circuit = abortable(cancel, config.create_timeout(), session.client.create_circuit()).await??;
    let guard = CircuitGuard(Some(circuit.clone()));
    debug!("Circuit #{} created in {}ms", index, created.elapsed().as_millis());

    let middle = extend_with_retry(circuit.as_ref(), "middle", &middles, config, cancel).await?;
    debug!("Circuit #{} extended to middle {} in {}ms", index, middle, created.elapsed().as_millis());
    let exit = extend_with_retry(circuit.as_ref(), "exit", &exits, config, cancel).await?;
    debug!("Circuit #{} extended to exit {} in {}ms", index, exit, created.elapsed().as_millis());

    self_test(circuit.as_ref(), config, ping, cancel).await?;

    let info = CircuitInfo {
        index,
        middle,
        exit,
        created,
        ready: Instant::now(),
    };
    debug!("Circuit #{} self-tested in {}ms", index, info.build_time().as_millis());

    let circuit = guard.disarm().unwrap_or(circuit);
    Ok(TorCircuit::new(circuit, info))
}

/// Extend `circuit` by one hop, picking a fresh random relay per attempt.
///
/// Gives up after `config.extend_attempts` failures, returning the nickname
/// of the relay reached otherwise.
pub(crate) async fn extend_with_retry(
    circuit: &dyn Circuit,
    hop: &'static str,
    candidates: &[&MicrodescHead],
    config: &TorConfig,
    cancel: &CancellationToken,
) -> Result<String> {
    let mut last = None;

    for attempt in 1..=config.extend_attempts {
        let head = *candidates
            .choose(&mut rand::thread_rng())
            .ok_or(TorError::NoCandidates(hop))?;

        match extend_once(circuit, head, config, cancel).await {
            Ok(()) => return Ok(head.nickname.clone()),
            Err(e) if e.is_aborted() => return Err(e),
            Err(e) => {
                debug!(
                    "Extend to {} {} failed (attempt {}/{}): {}",
                    hop, head.nickname, attempt, config.extend_attempts, e
                );
                last = Some(e);
            }
        }
    }

    Err(TorError::ExtendExhausted {
        hop,
        attempts: config.extend_attempts,
        last: last.map(|e| e.to_string()).unwrap_or_default(),
    })
}

async fn extend_once(
    circuit: &dyn Circuit,
    head: &MicrodescHead,
    config: &TorConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let microdesc = abortable(cancel, config.microdesc_timeout(), circuit.fetch_microdesc(head)).await??;
    abortable(cancel, config.extend_timeout(), circuit.extend(&microdesc)).await??;
    Ok(())
}

/// Open one stream to the self-test URL and GET it `config.self_test_rounds`
/// times over that stream. Opening and every round are each bounded by
/// `config.self_test_timeout()`.
async fn self_test(
    circuit: &dyn Circuit,
    config: &TorConfig,
    ping: &PingEstimate,
    cancel: &CancellationToken,
) -> Result<()> {
    let uri: Uri = config
        .self_test_url
        .parse()
        .map_err(|_| TorError::InvalidUri(config.self_test_url.clone()))?;

    let mut session = abortable(cancel, config.self_test_timeout(), async {
        let stream = open_as(circuit, &uri).await?;
        HttpSession::handshake(stream).await
    })
    .await
    .map_err(|e| self_test_interrupted(e, "open"))??;

    for round in 1..=config.self_test_rounds {
        let start = Instant::now();
        let response = abortable(cancel, config.self_test_timeout(), session.get(&uri))
            .await
            .map_err(|e| self_test_interrupted(e, &format!("round {}", round)))??;

        if !response.is_success() {
            return Err(TorError::SelfTest(format!("round {} returned {}", round, response.status)));
        }
        ping.record(start.elapsed());
    }

    Ok(())
}

fn self_test_interrupted(e: Interrupted, step: &str) -> TorError {
    match e {
        Interrupted::Aborted => TorError::Interrupted(e),
        Interrupted::TimedOut(after) => TorError::SelfTest(format!("{} timed out after {:?}", step, after)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::Connectivity;
    use crate::directory::MemoryStorage;
    use crate::sockets::create_socket_pool;
    use crate::stub::{self, StubDialer, StubReply, StubTor};
    use crate::session::Target;
    use crate::tors::create_tor_pool;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(circuits: usize) -> TorConfig {
        TorConfig {
            socket_pool_capacity: 1,
            tor_pool_capacity: 1,
            circuit_pool_capacity: circuits,
            ..TorConfig::default()
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition never became true");
    }

    struct Stack {
        tors: Pool<TorSession>,
        circuits: Pool<TorCircuit>,
        ping: PingEstimate,
    }

    fn stack(tor: &StubTor, config: &TorConfig) -> Stack {
        let online = Connectivity::always_online();
        let sockets = create_socket_pool(StubDialer::new(), online.clone(), config);
        let tors = create_tor_pool(&sockets, Arc::new(tor.clone()), Arc::new(MemoryStorage::new()), online, config);
        let ping = PingEstimate::new(Duration::from_millis(1000));
        let circuits = create_circuit_pool(&tors, config, ping.clone());
        Stack {
            tors,
            circuits,
            ping,
        }
    }

    #[tokio::test]
    async fn test_fills_with_two_hop_self_tested_circuits() {
        brume_logging::init_test();
        let requests = Arc::new(AtomicUsize::new(0));
        let counted = requests.clone();
        let tor = StubTor::new(stub::consensus(3, 3)).with_responder(Arc::new(move |_: &Target, _: &[u8]| {
            counted.fetch_add(1, Ordering::SeqCst);
            StubReply::ok("success")
        }));
        let stack = stack(&tor, &config(3));
        let cancel = CancellationToken::new();

        for index in 0..3 {
            let circuit = stack.circuits.get(index, &cancel).await.unwrap();
            assert!(circuit.info().middle.starts_with("middle"));
            assert!(circuit.info().exit.starts_with("exit"));
        }
        for circuit in tor.circuits() {
            assert_eq!(circuit.hops().len(), 2);
        }
        // One stream per circuit carries every self-test round
        let streams = tor.opened();
        assert_eq!(streams.len(), 3);
        assert!(streams.iter().all(|t| *t == Target::new("detectportal.firefox.com", 80, false)));
        assert_eq!(requests.load(Ordering::SeqCst), 9);
        assert!(stack.ping.get() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_extend_gives_up_after_bounded_attempts() {
        let tor = StubTor::new(stub::consensus(2, 2));
        tor.unreachable("middle0");
        tor.unreachable("middle1");
        let client = crate::traits::TorConnector::handshake(&tor, stub::transport()).await.unwrap();
        let circuit = client.create_circuit().await.unwrap();
        let consensus = stub::consensus(2, 2);
        let middles = consensus.middles();

        let err = extend_with_retry(circuit.as_ref(), "middle", &middles, &config(1), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TorError::ExtendExhausted { hop: "middle", attempts: 3, .. }));
        assert_eq!(tor.extends(), 3);
    }

    #[tokio::test]
    async fn test_extend_recovers_within_attempts() {
        let tor = StubTor::new(stub::consensus(2, 2));
        tor.fail_next_extends(2);
        let client = crate::traits::TorConnector::handshake(&tor, stub::transport()).await.unwrap();
        let circuit = client.create_circuit().await.unwrap();
        let consensus = stub::consensus(2, 2);

        let exit = extend_with_retry(circuit.as_ref(), "exit", &consensus.exits(), &config(1), &CancellationToken::new())
            .await
            .unwrap();

        assert!(exit.starts_with("exit"));
        assert_eq!(tor.extends(), 3);
    }

    #[tokio::test]
    async fn test_extend_without_candidates() {
        let tor = StubTor::new(stub::consensus(0, 0));
        let client = crate::traits::TorConnector::handshake(&tor, stub::transport()).await.unwrap();
        let circuit = client.create_circuit().await.unwrap();

        let err = extend_with_retry(circuit.as_ref(), "exit", &[], &config(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TorError::NoCandidates("exit")));
        assert_eq!(tor.extends(), 0);
    }

    #[tokio::test]
    async fn test_failed_self_test_closes_circuit_and_retries() {
        let tor = StubTor::new(stub::consensus(2, 2));
        let requests = Arc::new(AtomicUsize::new(0));
        let counted = requests.clone();
        tor.set_responder(Arc::new(move |_: &Target, _: &[u8]| {
            if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                StubReply::status(StatusCode::SERVICE_UNAVAILABLE)
            } else {
                StubReply::ok("success")
            }
        }));
        let stack = stack(&tor, &config(1));

        stack.circuits.get(0, &CancellationToken::new()).await.unwrap();

        let circuits = tor.circuits();
        assert_eq!(circuits.len(), 2);
        assert!(circuits[0].is_closed());
        assert!(!circuits[1].is_closed());
        assert_eq!(requests.load(Ordering::SeqCst), 4);
        assert_eq!(tor.opened().len(), 2);
    }

    #[tokio::test]
    async fn test_closed_circuit_restarts_its_slot() {
        let tor = StubTor::new(stub::consensus(2, 2));
        let stack = stack(&tor, &config(2));
        eventually(|| stack.circuits.size() == 2).await;

        tor.circuits()[0].close();
        eventually(|| tor.circuits().len() == 3 && stack.circuits.size() == 2).await;
    }

    #[tokio::test]
    async fn test_client_restart_cascades_to_failed_circuits() {
        let tor = StubTor::new(stub::consensus(2, 2));
        tor.fail_next_handshakes(1);
        let stack = stack(&tor, &config(2));
        eventually(|| {
            (0..2).all(|i| matches!(stack.circuits.try_get_sync(i), Some(brume_pool::SlotState::Failed(_))))
        })
        .await;
        assert!(tor.circuits().is_empty());

        stack.tors.restart(0);
        eventually(|| stack.circuits.size() == 2).await;
        assert_eq!(tor.handshakes(), 2);
        assert_eq!(tor.circuits().len(), 2);
    }

    #[tokio::test]
    async fn test_subpool_takes_from_shared_pool() {
        let tor = StubTor::new(stub::consensus(2, 2));
        let stack = stack(&tor, &config(2));
        eventually(|| stack.circuits.size() == 2).await;

        let subpool = create_circuit_subpool(&stack.circuits, 1);
        let cancel = CancellationToken::new();
        let mine = subpool.get(0, &cancel).await.unwrap();

        // The shared pool rebuilds the slot it lost
        eventually(|| tor.circuits().len() == 3 && stack.circuits.size() == 2).await;
        for index in 0..2 {
            let shared = stack.circuits.get(index, &cancel).await.unwrap();
            assert!(!Arc::ptr_eq(&shared, &mine));
        }
        assert!(!tor.circuits().iter().any(|c| c.is_closed()));
    }

    #[tokio::test]
    async fn test_subpool_circuit_close_restarts_subpool_slot() {
        let tor = StubTor::new(stub::consensus(2, 2));
        let stack = stack(&tor, &config(2));
        let subpool = create_circuit_subpool(&stack.circuits, 1);
        let cancel = CancellationToken::new();
        let mine = subpool.get(0, &cancel).await.unwrap();

        mine.close();
        eventually(|| matches!(subpool.try_get_sync(0), Some(brume_pool::SlotState::Ready(ref c)) if !Arc::ptr_eq(c, &mine))).await;
    }
}
