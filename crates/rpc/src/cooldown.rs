//! Cooldown gate for socket connections

use std::sync::Arc;
use std::time::Duration;

use brume_pool::{cancellable, Interrupted};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// After a failure the next user of the connection waits out `period`.
#[derive(Debug, Clone)]
pub struct Cooldown {
    until: Arc<Mutex<Option<Instant>>>,
    period: Duration,
}

impl Cooldown {
    pub fn new(period: Duration) -> Self {
        Self {
            until: Arc::new(Mutex::new(None)),
            period,
        }
    }

    pub fn trip(&self) {
        *self.until.lock() = Some(Instant::now() + self.period);
    }

    pub fn is_cooling(&self) -> bool {
        self.until.lock().map_or(false, |until| until > Instant::now())
    }

    /// Wait until the gate is open, or `cancel` fires
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), Interrupted> {
        let until = *self.until.lock();
        match until {
            Some(until) if until > Instant::now() => {
                cancellable(cancel, tokio::time::sleep_until(until)).await
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_after_trip() {
        let cooldown = Cooldown::new(Duration::from_secs(1));
        let cancel = CancellationToken::new();

        let start = Instant::now();
        cooldown.wait(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        cooldown.trip();
        assert!(cooldown.is_cooling());
        cooldown.wait(&cancel).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(!cooldown.is_cooling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancellable() {
        let cooldown = Cooldown::new(Duration::from_secs(60));
        cooldown.trip();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(cooldown.wait(&cancel).await, Err(Interrupted::Aborted));
    }
}
