//! Directory consensus, relay selection and the consensus cache

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use brume_pool::cancellable;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::traits::TorClient;
use crate::{Result, TorError};

/// Storage key of the cached consensus
pub const MICRODESCS_KEY: &str = "tor/microdescs";

/// Relay flags as voted by the directory authorities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayFlag {
    Authority,
    BadExit,
    Exit,
    Fast,
    Guard,
    HSDir,
    Running,
    Stable,
    V2Dir,
    Valid,
    #[serde(other)]
    Other,
}

/// One consensus line: enough to pick a relay and fetch its microdesc
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrodescHead {
    pub nickname: String,
    pub identity: String,
    pub digest: String,
    pub flags: Vec<RelayFlag>,
}

impl MicrodescHead {
    pub fn has(&self, flag: RelayFlag) -> bool {
        self.flags.contains(&flag)
    }

    pub fn is_middle(&self) -> bool {
        self.has(RelayFlag::Fast) && self.has(RelayFlag::Stable) && self.has(RelayFlag::V2Dir)
    }

    pub fn is_exit(&self) -> bool {
        self.has(RelayFlag::Fast)
            && self.has(RelayFlag::Stable)
            && self.has(RelayFlag::Exit)
            && !self.has(RelayFlag::BadExit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consensus {
    pub microdescs: Vec<MicrodescHead>,
}

impl Consensus {
    pub fn middles(&self) -> Vec<&MicrodescHead> {
        self.microdescs.iter().filter(|head| head.is_middle()).collect()
    }

    pub fn exits(&self) -> Vec<&MicrodescHead> {
        self.microdescs.iter().filter(|head| head.is_exit()).collect()
    }
}

/// Full relay descriptor needed to extend a circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Microdesc {
    pub nickname: String,
    pub identity: String,
    pub ntor_onion_key: String,
}

/// Key-value store shared with the host application
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }
}

/// Stale-while-revalidate lookup of the consensus.
///
/// A stored copy is returned at once and refreshed in the background; a
/// store miss blocks on the network fetch.
pub struct MicrodescQuery {
    client: Arc<dyn TorClient>,
    storage: Arc<dyn Storage>,
}

impl MicrodescQuery {
    pub fn new(client: Arc<dyn TorClient>, storage: Arc<dyn Storage>) -> Self {
        Self { client, storage }
    }

    /// The refresh of a stored copy stops when `cancel` fires
    pub async fn resolve(&self, cancel: &CancellationToken) -> Result<Consensus> {
        match self.stored().await {
            Ok(Some(consensus)) => {
                debug!("Using stored consensus ({} relays)", consensus.microdescs.len());
                self.refresh_in_background(cancel.clone());
                return Ok(consensus);
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable stored consensus: {}", e),
        }

        let consensus = cancellable(cancel, fetch(self.client.as_ref(), self.storage.as_ref())).await??;
        debug!("Fetched consensus ({} relays)", consensus.microdescs.len());
        Ok(consensus)
    }

    async fn stored(&self) -> Result<Option<Consensus>> {
        match self.storage.get(MICRODESCS_KEY).await? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn refresh_in_background(&self, cancel: CancellationToken) {
        let client = self.client.clone();
        let storage = self.storage.clone();
        tokio::spawn(async move {
            match cancellable(&cancel, fetch(client.as_ref(), storage.as_ref())).await {
                Ok(Ok(consensus)) => debug!("Refreshed consensus ({} relays)", consensus.microdescs.len()),
                Ok(Err(e)) => warn!("Consensus refresh failed: {}", e),
                Err(_) => {}
            }
        });
    }
}

async fn fetch(client: &dyn TorClient, storage: &dyn Storage) -> Result<Consensus> {
    let consensus = client.fetch_consensus().await?;
    let text = serde_json::to_string(&consensus)?;
    storage
        .set(MICRODESCS_KEY, text)
        .await
        .map_err(|e| TorError::Storage(e.to_string()))?;
    Ok(consensus)
}
