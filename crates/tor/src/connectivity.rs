//! Online/offline signal

use tokio::sync::watch;

/// Read side of the host's connectivity state
#[derive(Debug, Clone)]
pub struct Connectivity {
    online: watch::Receiver<bool>,
}

/// Write side, owned by whatever observes the network
#[derive(Debug)]
pub struct ConnectivityHandle {
    online: watch::Sender<bool>,
}

impl Connectivity {
    pub fn channel(online: bool) -> (ConnectivityHandle, Self) {
        let (tx, rx) = watch::channel(online);
        (ConnectivityHandle { online: tx }, Self { online: rx })
    }

    /// A signal that never goes offline
    pub fn always_online() -> Self {
        Self::channel(true).1
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Resolve the next time the host is offline (immediately if it is now).
    /// Never resolves once the handle is gone.
    pub async fn offline(&self) {
        let mut online = self.online.clone();
        let gone = online.wait_for(|online| !*online).await.is_err();
        if gone {
            std::future::pending::<()>().await;
        }
    }

    /// Resolve once the host is online (immediately if it is now).
    /// Never resolves if the handle went away while offline.
    pub async fn online(&self) {
        let mut online = self.online.clone();
        let gone = online.wait_for(|online| *online).await.is_err();
        if gone {
            std::future::pending::<()>().await;
        }
    }
}

impl ConnectivityHandle {
    pub fn set_online(&self, online: bool) {
        self.online.send_replace(online);
    }
}
