//! Per-connection JSON-RPC id assignment

use std::sync::atomic::{AtomicU64, Ordering};

use brume_core::{RpcRequest, RpcRequestInit};

/// Hands out request ids, starting at 1
#[derive(Debug)]
pub struct RpcCounter {
    next_id: AtomicU64,
}

impl RpcCounter {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// Stamp `init` with the next id
    pub fn prepare(&self, init: &RpcRequestInit) -> RpcRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        RpcRequest::new(id, init)
    }
}

impl Default for RpcCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_increase_from_one() {
        let counter = RpcCounter::new();
        let init = RpcRequestInit::new("eth_blockNumber", vec![]);

        let ids: Vec<u64> = (0..3).map(|_| counter.prepare(&init).id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(counter.prepare(&init).method, "eth_blockNumber");
    }
}
