//! Staleness gate for rebuild loops
//!
//! A build attempt that fails is retried only when a cascade sweep happened
//! while it ran: the failure most likely came from the upstream resource that
//! the sweep is replacing. Otherwise the failure belongs to the slot.
//!
//! Sweeps are counted, not timestamped, so two sweeps inside the same clock
//! tick are still told apart.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Monotonic count of cascade sweeps, shared by one pool's build tasks
#[derive(Debug, Clone, Default)]
pub struct RebuildGate {
    sweeps: Arc<AtomicU64>,
}

/// Sweep count observed when an attempt began
#[derive(Debug, Clone)]
pub struct Ticket {
    gate: RebuildGate,
    seen: u64,
}

impl RebuildGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cascade sweep, returning the new count
    pub fn bump(&self) -> u64 {
        self.sweeps.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::SeqCst)
    }

    /// Mark the start of an attempt
    pub fn ticket(&self) -> Ticket {
        Ticket {
            gate: self.clone(),
            seen: self.sweeps(),
        }
    }

    /// Run `attempt` until it succeeds or fails without being superseded
    pub async fn retry<T, E, F, Fut>(&self, label: &str, mut attempt: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            let ticket = self.ticket();
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if ticket.superseded() => {
                    debug!("{} superseded by a rebuild sweep, retrying: {}", label, e);
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Ticket {
    /// Whether a sweep happened since this ticket was taken
    pub fn superseded(&self) -> bool {
        self.gate.sweeps() > self.seen
    }
}
