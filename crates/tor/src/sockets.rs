//! Socket pool: raw transports to the bridge

use std::sync::Arc;
use std::time::Instant;

use brume_core::TorConfig;
use brume_pool::{abortable, cancellable, sleep, Entry, Interrupted, Pool, PoolError, PoolParams};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connectivity::Connectivity;
use crate::traits::{Dialer, Transport};

/// Pool of transports dialed to `config.bridge_endpoint`.
///
/// A slot waits for the host to be online, then retries failed dials after
/// a flat delay until it is cancelled. A ready slot restarts when its
/// transport closes or the host goes offline.
pub fn create_socket_pool(
    dialer: Arc<dyn Dialer>,
    connectivity: Connectivity,
    config: &TorConfig,
) -> Pool<dyn Transport> {
    let config = config.clone();
    Pool::named(
        "sockets",
        config.socket_pool_capacity,
        move |params: PoolParams<dyn Transport>| {
            let dialer = dialer.clone();
            let connectivity = connectivity.clone();
            let config = config.clone();
            async move {
                let transport =
                    dial_until_open(dialer.as_ref(), &connectivity, &config, params.index, &params.cancel).await?;
                Ok(transport_entry(&params, transport, connectivity))
            }
        },
    )
}

async fn dial_until_open(
    dialer: &dyn Dialer,
    connectivity: &Connectivity,
    config: &TorConfig,
    index: usize,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Transport>, PoolError> {
    loop {
        if !connectivity.is_online() {
            debug!("Socket #{} waiting for connectivity", index);
            cancellable(cancel, connectivity.online()).await?;
        }

        let start = Instant::now();
        match abortable(cancel, config.dial_timeout(), dialer.dial(&config.bridge_endpoint)).await {
            Ok(Ok(transport)) => {
                debug!("Socket #{} open in {}ms", index, start.elapsed().as_millis());
                return Ok(transport);
            }
            Ok(Err(e)) => warn!("Socket #{} dial failed: {}", index, e),
            Err(Interrupted::TimedOut(after)) => warn!("Socket #{} dial timed out after {:?}", index, after),
            Err(Interrupted::Aborted) => return Err(PoolError::Aborted),
        }

        sleep(cancel, config.dial_retry_delay()).await?;
    }
}

fn transport_entry(
    params: &PoolParams<dyn Transport>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
) -> Entry<dyn Transport> {
    let index = params.index;
    let closing = transport.clone();
    let watched = transport.clone();
    let entry = Entry::new(transport).on_close(move || closing.close());

    params.restart_on(entry, async move {
        tokio::select! {
            reason = watched.closed() => debug!("Socket #{} closed: {:?}", index, reason),
            _ = connectivity.offline() => debug!("Offline, dropping socket #{}", index),
        }
    })
}
