//! Connection pools per endpoint, and per chain

use std::collections::HashMap;
use std::sync::Arc;

use brume_core::{ChainData, ChainId, FetchConfig};
use brume_pool::{abortable, Entry, Pool, PoolError, PoolParams, RebuildGate};
use brume_tor::{create_circuit_subpool, TorCircuit};
use http::Uri;
use tracing::{debug, warn};

use crate::connection::{RpcConnection, RpcConnectionEntry};
use crate::cooldown::Cooldown;
use crate::socket::{RpcSocket, SocketConnector};

/// Every configured chain's pool of connection pools
pub type ChainPools = HashMap<ChainId, Pool<Pool<RpcConnectionEntry>>>;

/// HTTP(S) connections to `url`, one per circuit of a private sub-pool of
/// `circuits`. A connection restarts when its circuit closes.
pub fn create_connection_pool(
    circuits: &Pool<TorCircuit>,
    url: Uri,
    config: &FetchConfig,
) -> Pool<RpcConnectionEntry> {
    let subpool = create_circuit_subpool(circuits, config.connections_per_endpoint);
    let gate = RebuildGate::new();
    let upstream = subpool.clone();
    let slots = gate.clone();

    let pool = Pool::named(
        format!("connections {}", url),
        config.connections_per_endpoint,
        move |params: PoolParams<RpcConnectionEntry>| {
            let circuits = upstream.clone();
            let url = url.clone();
            let gate = slots.clone();
            async move {
                let label = format!("Connection #{} to {}", params.index, url);
                let circuit = gate
                    .retry(&label, || circuits.get(params.index, &params.cancel))
                    .await?;
                let entry = Arc::new(RpcConnectionEntry::new(RpcConnection::Url { url, circuit }));
                let watched = entry.clone();

                Ok(params.restart_on(Entry::new(entry), async move {
                    watched.connection.closed().await;
                }))
            }
        },
    );

    pool.follow(&subpool, gate);
    pool
}

/// Socket connections to `url` opened by `connector`, one per circuit of a
/// private sub-pool of `circuits`. A connection restarts when its socket or
/// circuit closes.
pub fn create_socket_connection_pool(
    circuits: &Pool<TorCircuit>,
    url: Uri,
    connector: Arc<dyn SocketConnector>,
    config: &FetchConfig,
) -> Pool<RpcConnectionEntry> {
    let subpool = create_circuit_subpool(circuits, config.connections_per_endpoint);
    let gate = RebuildGate::new();
    let upstream = subpool.clone();
    let slots = gate.clone();
    let config = config.clone();

    let pool = Pool::named(
        format!("sockets {}", url),
        config.connections_per_endpoint,
        move |params: PoolParams<RpcConnectionEntry>| {
            let circuits = upstream.clone();
            let url = url.clone();
            let connector = connector.clone();
            let config = config.clone();
            let gate = slots.clone();
            async move {
                let label = format!("Socket #{} to {}", params.index, url);
                let circuit = gate
                    .retry(&label, || circuits.get(params.index, &params.cancel))
                    .await?;

                let socket = abortable(&params.cancel, config.connect_timeout(), connector.connect(circuit.clone(), &url))
                    .await?
                    .map_err(|e| PoolError::Failed(format!("connect to {}: {}", url, e)))?;
                debug!("Socket #{} connected to {}", params.index, url);

                let entry = Arc::new(RpcConnectionEntry::new(RpcConnection::Socket {
                    socket: Arc::new(RpcSocket::new(socket)),
                    cooldown: Cooldown::new(config.socket_cooldown()),
                }));
                let closing = entry.clone();
                let watched = entry.clone();

                let entry = Entry::new(entry).on_close(move || closing.connection.close());
                Ok(params.restart_on(entry, async move {
                    tokio::select! {
                        _ = watched.connection.closed() => {}
                        _ = circuit.closed() => {}
                    }
                }))
            }
        },
    );

    pool.follow(&subpool, gate);
    pool
}

/// One connection pool per endpoint of `chain`.
///
/// `ws`/`wss` endpoints need a `sockets` connector; without one, or with an
/// unparsable URL, that endpoint's slot fails.
pub fn create_chain_pools(
    circuits: &Pool<TorCircuit>,
    chain: &ChainData,
    config: &FetchConfig,
    sockets: Option<Arc<dyn SocketConnector>>,
) -> Pool<Pool<RpcConnectionEntry>> {
    let circuits = circuits.clone();
    let urls = chain.urls.clone();
    let config = config.clone();
    let chain_id = chain.chain_id;

    Pool::named(
        format!("chain {}", chain_id),
        urls.len(),
        move |params: PoolParams<Pool<RpcConnectionEntry>>| {
            let pool = endpoint_pool(&circuits, &urls[params.index], &config, sockets.as_ref());
            async move {
                let pool = pool?;
                let closing = pool.clone();
                Ok(Entry::new(Arc::new(pool)).on_close(move || closing.close()))
            }
        },
    )
}

/// Chain pools for every chain in `chains`
pub fn create_brume(
    circuits: &Pool<TorCircuit>,
    chains: &[ChainData],
    config: &FetchConfig,
    sockets: Option<Arc<dyn SocketConnector>>,
) -> ChainPools {
    chains
        .iter()
        .map(|chain| {
            let pools = create_chain_pools(circuits, chain, config, sockets.clone());
            (chain.chain_id, pools)
        })
        .collect()
}

fn endpoint_pool(
    circuits: &Pool<TorCircuit>,
    url: &str,
    config: &FetchConfig,
    sockets: Option<&Arc<dyn SocketConnector>>,
) -> Result<Pool<RpcConnectionEntry>, PoolError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| PoolError::Failed(format!("invalid RPC URL {}: {}", url, e)))?;

    match (uri.scheme_str(), sockets) {
        (Some("http") | Some("https"), _) => Ok(create_connection_pool(circuits, uri, config)),
        (Some("ws") | Some("wss"), Some(connector)) => {
            Ok(create_socket_connection_pool(circuits, uri, connector.clone(), config))
        }
        (Some("ws") | Some("wss"), None) => {
            warn!("No socket connector for {}, skipping endpoint", url);
            Err(PoolError::Failed(format!("no socket connector for {}", url)))
        }
        _ => Err(PoolError::Failed(format!("unsupported RPC URL {}", url))),
    }
}
