//! Tor client pool

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use brume_core::TorConfig;
use brume_pool::{abortable, Entry, Pool, PoolError, PoolParams, RebuildGate};
use tracing::debug;

use crate::connectivity::Connectivity;
use crate::directory::{Consensus, MicrodescQuery, Storage};
use crate::traits::{TorClient, TorConnector, Transport};
use crate::Result;

/// A handshaked client and the consensus it builds circuits from
pub struct TorSession {
    pub client: Arc<dyn TorClient>,
    pub consensus: Consensus,
}

impl fmt::Debug for TorSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorSession")
            .field("relays", &self.consensus.microdescs.len())
            .finish()
    }
}

/// Pool of Tor clients over transports from `sockets`.
///
/// Each slot picks any ready transport at random, so two clients may share
/// one transport. When a socket slot starts rebuilding, failed client slots
/// are restarted.
pub fn create_tor_pool(
    sockets: &Pool<dyn Transport>,
    connector: Arc<dyn TorConnector>,
    storage: Arc<dyn Storage>,
    connectivity: Connectivity,
    config: &TorConfig,
) -> Pool<TorSession> {
    let gate = RebuildGate::new();
    let upstream = sockets.clone();
    let config = config.clone();
    let slots = gate.clone();

    let pool = Pool::named(
        "tors",
        config.tor_pool_capacity,
        move |params: PoolParams<TorSession>| {
            let sockets = upstream.clone();
            let connector = connector.clone();
            let storage = storage.clone();
            let connectivity = connectivity.clone();
            let config = config.clone();
            let gate = slots.clone();
            async move {
                let label = format!("Tor #{}", params.index);
                let session = gate
                    .retry(&label, || open_session(&params, &sockets, connector.as_ref(), &storage, &config))
                    .await
                    .map_err(PoolError::from)?;
                Ok(session_entry(&params, session, connectivity))
            }
        },
    );

    pool.follow(sockets, gate);
    pool
}

async fn open_session(
    params: &PoolParams<TorSession>,
    sockets: &Pool<dyn Transport>,
    connector: &dyn TorConnector,
    storage: &Arc<dyn Storage>,
    config: &TorConfig,
) -> Result<TorSession> {
    let index = params.index;
    let start = Instant::now();

    let transport = sockets.get_crypto_random(&params.cancel).await?;
    let client = abortable(&params.cancel, config.handshake_timeout(), connector.handshake(transport)).await??;
    debug!("Tor #{} handshaked in {}ms", index, start.elapsed().as_millis());

    let query = MicrodescQuery::new(client.clone(), storage.clone());
    match query.resolve(&params.cancel).await {
        Ok(consensus) => {
            debug!("Tor #{} ready in {}ms", index, start.elapsed().as_millis());
            Ok(TorSession { client, consensus })
        }
        Err(e) => {
            client.close();
            Err(e)
        }
    }
}

fn session_entry(
    params: &PoolParams<TorSession>,
    session: TorSession,
    connectivity: Connectivity,
) -> Entry<TorSession> {
    let index = params.index;
    let closing = session.client.clone();
    let watched = session.client.clone();
    let entry = Entry::new(Arc::new(session)).on_close(move || closing.close());

    params.restart_on(entry, async move {
        tokio::select! {
            reason = watched.closed() => debug!("Tor #{} closed: {:?}", index, reason),
            _ = connectivity.offline() => debug!("Offline, dropping Tor #{}", index),
        }
    })
}
