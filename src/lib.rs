//! Brume
//!
//! Tor-routed, multi-path Ethereum JSON-RPC.
//!
//! [`Engine`] wires the layers together:
//!
//! ```text
//! sockets → Tor clients → circuits → connection pools per chain → fetch
//! ```
//!
//! Every layer is a self-healing [`Pool`]: a slot that fails or whose
//! resource closes is rebuilt on its own, and failures cascade downward
//! through pool events.

pub use brume_core as core;
pub use brume_logging as logging;
pub use brume_pool as pool;
pub use brume_rpc as rpc;
pub use brume_tor as tor;

pub use brume_core::{BrumeConfig, ChainData, ChainId, FetchParams, Fetched, RpcRequestInit};
pub use brume_pool::{Pool, PoolError};
pub use brume_rpc::{EthereumContext, FetchError, Fetcher, FetcherMore, JsonRequest};

use std::sync::Arc;

use brume_core::ConfigError;
use brume_rpc::{create_brume, fetch_or_fail, ChainPools, SocketConnector};
use brume_tor::{
    create_circuit_pool, create_socket_pool, create_tor_pool, Connectivity, Dialer, PingEstimate, Storage,
    TorCircuit, TorConnector, TorSession, Transport,
};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// External implementations the engine runs on
#[derive(Clone)]
pub struct Collaborators {
    pub dialer: Arc<dyn Dialer>,
    pub connector: Arc<dyn TorConnector>,
    pub storage: Arc<dyn Storage>,
    pub connectivity: Connectivity,
    /// Needed only for `ws`/`wss` RPC endpoints
    pub sockets: Option<Arc<dyn SocketConnector>>,
}

impl Collaborators {
    /// Always-online collaborators without WebSocket support
    pub fn new(dialer: Arc<dyn Dialer>, connector: Arc<dyn TorConnector>, storage: Arc<dyn Storage>) -> Self {
        Self {
            dialer,
            connector,
            storage,
            connectivity: Connectivity::always_online(),
            sockets: None,
        }
    }

    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn with_socket_connector(mut self, sockets: Arc<dyn SocketConnector>) -> Self {
        self.sockets = Some(sockets);
        self
    }
}

/// Every pool of a running engine
pub struct Engine {
    config: BrumeConfig,
    ping: PingEstimate,
    sockets: Pool<dyn Transport>,
    tors: Pool<TorSession>,
    circuits: Pool<TorCircuit>,
    chains: ChainPools,
}

impl Engine {
    /// Validate `config` and start building every pool.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(config: BrumeConfig, collaborators: Collaborators) -> Result<Self, EngineError> {
        config.validate()?;

        let ping = PingEstimate::new(config.fetch.initial_ping());
        let sockets = create_socket_pool(collaborators.dialer, collaborators.connectivity.clone(), &config.tor);
        let tors = create_tor_pool(
            &sockets,
            collaborators.connector,
            collaborators.storage,
            collaborators.connectivity,
            &config.tor,
        );
        let circuits = create_circuit_pool(&tors, &config.tor, ping.clone());
        let chains = create_brume(&circuits, &config.chains, &config.fetch, collaborators.sockets);

        info!(
            "Started engine: {} socket(s), {} client(s), {} circuit(s), {} chain(s)",
            sockets.capacity(),
            tors.capacity(),
            circuits.capacity(),
            chains.len()
        );

        Ok(Self {
            config,
            ping,
            sockets,
            tors,
            circuits,
            chains,
        })
    }

    pub fn config(&self) -> &BrumeConfig {
        &self.config
    }

    pub fn ping(&self) -> &PingEstimate {
        &self.ping
    }

    pub fn sockets(&self) -> &Pool<dyn Transport> {
        &self.sockets
    }

    pub fn tors(&self) -> &Pool<TorSession> {
        &self.tors
    }

    pub fn circuits(&self) -> &Pool<TorCircuit> {
        &self.circuits
    }

    /// Fetch context of a configured chain
    pub fn context(&self, chain_id: ChainId) -> Result<EthereumContext, FetchError> {
        let chain = self
            .config
            .chains
            .iter()
            .find(|chain| chain.chain_id == chain_id)
            .ok_or(FetchError::UnknownChain(chain_id))?;
        EthereumContext::from_brume(&self.chains, chain, self.ping.clone(), self.config.fetch.clone())
    }

    /// Fetch `init` on `chain_id`, cross-checked unless `params.no_check`
    pub async fn fetch(
        &self,
        chain_id: ChainId,
        init: &RpcRequestInit,
        params: &FetchParams,
        cancel: &CancellationToken,
    ) -> Result<Value, FetchError> {
        let ctx = self.context(chain_id)?;
        fetch_or_fail(&ctx, init, params, cancel).await
    }

    /// Close every pool, downstream first
    pub fn close(&self) {
        for pools in self.chains.values() {
            pools.close();
        }
        self.circuits.close();
        self.tors.close();
        self.sockets.close();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.close();
    }
}
