//! Fetcher contract used by the query cache

use async_trait::async_trait;
use brume_core::{Data, Fail, FetchParams, Fetched, RpcRequestInit};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::coordinator::{fetch_or_fail, EthereumContext};
use crate::FetchError;

/// Extra context the cache hands to a fetcher
#[derive(Debug, Clone, Default)]
pub struct FetcherMore {
    pub cancel: CancellationToken,
}

impl FetcherMore {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

/// Cache key of an RPC query: the chain's cache URL plus the call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonRequest {
    pub url: String,
    pub init: RpcRequestInit,
    #[serde(default)]
    pub params: FetchParams,
}

impl JsonRequest {
    pub fn new(url: impl Into<String>, init: RpcRequestInit) -> Self {
        Self {
            url: url.into(),
            init,
            params: FetchParams::default(),
        }
    }

    pub fn with_params(mut self, params: FetchParams) -> Self {
        self.params = params;
        self
    }
}

/// Produces the value stored under a cache key. Never fails outright: a
/// failure is returned as [`Fetched::Fail`].
#[async_trait]
pub trait Fetcher<K: Send + Sync>: Send + Sync {
    type Value: Send;
    type Error: Send;

    async fn fetch(&self, key: &K, more: &FetcherMore) -> Fetched<Self::Value, Self::Error>;
}

#[async_trait]
impl Fetcher<JsonRequest> for EthereumContext {
    type Value = Value;
    type Error = FetchError;

    async fn fetch(&self, key: &JsonRequest, more: &FetcherMore) -> Fetched<Value, FetchError> {
        if key.url != self.chain.cache_url() {
            return Fetched::Fail(Fail::new(FetchError::UnknownKey(key.url.clone())));
        }
        if let Some(chain_id) = key.params.chain_id {
            if chain_id != self.chain.chain_id {
                return Fetched::Fail(Fail::new(FetchError::UnknownChain(chain_id)));
            }
        }

        match fetch_or_fail(self, &key.init, &key.params, &more.cancel).await {
            Ok(value) => Fetched::Data(
                Data::new(value)
                    .with_cooldown(self.config.data_cooldown())
                    .with_expiration(self.config.data_expiration()),
            ),
            Err(e) => Fetched::Fail(Fail::new(e)),
        }
    }
}
