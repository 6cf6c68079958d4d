//! Multi-path fetch coordinator
//!
//! One request goes to every connection of every endpoint pool of a chain.
//! Answers are elected within each pool first, then across the per-pool
//! winners, so a provider cannot outvote the others by holding more
//! connections.

use std::future::Future;
use std::time::{Duration, Instant};

use brume_core::{ChainData, FetchConfig, FetchParams, RpcRequestInit};
use brume_pool::{abortable, Pool};
use brume_tor::PingEstimate;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::RpcConnectionEntry;
use crate::consensus::elect;
use crate::pools::ChainPools;
use crate::{FetchError, Result};

/// Lowest bound on a single attempt
pub const MIN_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(100);

/// Everything needed to fetch from one chain
#[derive(Clone)]
pub struct EthereumContext {
    pub chain: ChainData,
    pub pools: Pool<Pool<RpcConnectionEntry>>,
    pub ping: PingEstimate,
    pub config: FetchConfig,
}

impl EthereumContext {
    pub fn new(chain: ChainData, pools: Pool<Pool<RpcConnectionEntry>>, ping: PingEstimate, config: FetchConfig) -> Self {
        Self {
            chain,
            pools,
            ping,
            config,
        }
    }

    /// Context for `chain`, using its pools from `brume`
    pub fn from_brume(brume: &ChainPools, chain: &ChainData, ping: PingEstimate, config: FetchConfig) -> Result<Self> {
        let pools = brume
            .get(&chain.chain_id)
            .cloned()
            .ok_or(FetchError::UnknownChain(chain.chain_id))?;
        Ok(Self::new(chain.clone(), pools, ping, config))
    }

    /// Bound on a single attempt, scaled from the current ping estimate
    pub fn attempt_timeout(&self) -> Duration {
        (self.ping.get() * self.config.ping_multiplier).max(MIN_ATTEMPT_TIMEOUT)
    }
}

/// Fetch `init` from the chain of `ctx`.
///
/// With `params.no_check` the first successful answer is returned as soon as
/// it arrives. Otherwise every attempt is awaited and the answer is elected.
pub async fn fetch_or_fail(
    ctx: &EthereumContext,
    init: &RpcRequestInit,
    params: &FetchParams,
    cancel: &CancellationToken,
) -> Result<Value> {
    let start = Instant::now();
    let timeout = ctx.attempt_timeout();
    let pools = ctx.pools.capacity();

    let result = if params.no_check {
        first_success((0..pools).map(|p| pool_first(ctx, p, init, cancel, timeout))).await
    } else {
        let verdicts = futures::future::join_all((0..pools).map(|p| pool_verdict(ctx, p, init, cancel, timeout))).await;
        decide(&format!("{} {}", ctx.chain.name, init.method), verdicts)
    };

    if cancel.is_cancelled() {
        return Err(FetchError::Aborted);
    }

    match &result {
        Ok(_) => debug!(
            "Fetched {} on {} in {}ms",
            init.method,
            ctx.chain.name,
            start.elapsed().as_millis()
        ),
        Err(e) => warn!("Could not fetch {} on {}: {}", init.method, ctx.chain.name, e),
    }
    result
}

/// Answer elected among the connections of pool `index`
async fn pool_verdict(
    ctx: &EthereumContext,
    index: usize,
    init: &RpcRequestInit,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<Value> {
    let pool = abortable(cancel, ctx.config.acquire_timeout(), ctx.pools.get(index, cancel)).await??;
    let attempts = (0..pool.capacity()).map(|c| attempt(&pool, c, init, cancel, &ctx.config, timeout));
    let results = futures::future::join_all(attempts).await;
    decide(&format!("{} #{}", pool.name(), index), results)
}

/// First answer from any connection of pool `index`
async fn pool_first(
    ctx: &EthereumContext,
    index: usize,
    init: &RpcRequestInit,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<Value> {
    let pool = abortable(cancel, ctx.config.acquire_timeout(), ctx.pools.get(index, cancel)).await??;
    first_success((0..pool.capacity()).map(|c| attempt(&pool, c, init, cancel, &ctx.config, timeout))).await
}

async fn attempt(
    pool: &Pool<RpcConnectionEntry>,
    index: usize,
    init: &RpcRequestInit,
    cancel: &CancellationToken,
    config: &FetchConfig,
    timeout: Duration,
) -> Result<Value> {
    let entry = abortable(cancel, config.acquire_timeout(), pool.get(index, cancel)).await??;
    let request = entry.counter.prepare(init);
    match entry.connection.fetch_or_throw(&request, cancel, timeout).await {
        Ok(value) => Ok(value),
        Err(e) => {
            debug!("{} #{} failed {}: {}", pool.name(), index, request.method, e);
            Err(e.into())
        }
    }
}

/// Resolve with the first success; the others are dropped unfinished
async fn first_success<F>(attempts: impl IntoIterator<Item = F>) -> Result<Value>
where
    F: Future<Output = Result<Value>>,
{
    let mut pending: FuturesUnordered<F> = attempts.into_iter().collect();
    let mut errors = Vec::new();
    while let Some(result) = pending.next().await {
        match result {
            Ok(value) => return Ok(value),
            Err(e) => errors.push(e),
        }
    }
    Err(FetchError::Exhausted(errors))
}

/// Elect among the successes of `results`
fn decide(label: &str, results: Vec<Result<Value>>) -> Result<Value> {
    let mut values = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(e) => errors.push(e),
        }
    }

    let Some(verdict) = elect(values, &mut rand::thread_rng()) else {
        return Err(FetchError::Exhausted(errors));
    };

    if verdict.tied {
        warn!("{}: tie broken at random to {} among [{}]", label, verdict.value, verdict.describe());
    } else if !verdict.is_unanimous() {
        warn!("{}: providers disagree, using {} from [{}]", label, verdict.value, verdict.describe());
    }
    Ok(verdict.value)
}
