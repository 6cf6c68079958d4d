//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use brume::core::{ChainData, FetchConfig, RpcRequest, RpcResponse, TorConfig};
use brume::tor::stub::{self, Responder, StubDialer, StubReply, StubTor};
use brume::tor::{Connectivity, MemoryStorage, Target};
use brume::{BrumeConfig, Collaborators, Engine};
use http::StatusCode;
use serde_json::Value;

pub const CHAIN: u64 = 1;

/// Answers circuit self-tests, and JSON-RPC posts with `answer(host)`;
/// `None` becomes a 502
pub fn rpc_responder(answer: impl Fn(&str) -> Option<Value> + Send + Sync + 'static) -> Responder {
    Arc::new(move |target: &Target, body: &[u8]| {
        if target.host == "detectportal.firefox.com" {
            return StubReply::ok("success");
        }
        let Ok(request) = serde_json::from_slice::<RpcRequest>(body) else {
            return StubReply::status(StatusCode::BAD_REQUEST);
        };
        match answer(&target.host) {
            Some(value) => StubReply::ok(serde_json::to_string(&RpcResponse::ok(request.id, value)).unwrap()),
            None => StubReply::status(StatusCode::BAD_GATEWAY),
        }
    })
}

pub fn config(hosts: &[&str]) -> BrumeConfig {
    let urls = hosts.iter().map(|host| format!("https://{}", host)).collect();
    BrumeConfig {
        tor: TorConfig {
            socket_pool_capacity: 1,
            tor_pool_capacity: 1,
            circuit_pool_capacity: 4,
            ..TorConfig::default()
        },
        fetch: FetchConfig {
            connections_per_endpoint: 1,
            ..FetchConfig::default()
        },
        chains: vec![ChainData::new(CHAIN, "Ethereum", urls)],
    }
}

pub struct Harness {
    pub engine: Engine,
    pub tor: StubTor,
    pub dialer: Arc<StubDialer>,
}

pub fn start(config: BrumeConfig, tor: StubTor, connectivity: Connectivity) -> Harness {
    brume::logging::init_test();
    let dialer = StubDialer::new();
    let collaborators = Collaborators::new(dialer.clone(), Arc::new(tor.clone()), Arc::new(MemoryStorage::new()))
        .with_connectivity(connectivity);
    let engine = Engine::start(config, collaborators).unwrap();
    Harness { engine, tor, dialer }
}

/// Engine over `hosts`, each answering `answer(host)`
pub fn engine(hosts: &[&str], answer: impl Fn(&str) -> Option<Value> + Send + Sync + 'static) -> Harness {
    let tor = StubTor::new(stub::consensus(3, 3)).with_responder(rpc_responder(answer));
    start(config(hosts), tor, Connectivity::always_online())
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
