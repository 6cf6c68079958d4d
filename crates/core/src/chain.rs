//! Chains and their RPC endpoints

use serde::{Deserialize, Serialize};

/// EIP-155 chain id
pub type ChainId = u64;

/// A chain the wallet talks to, with every RPC endpoint it cross-checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainData {
    pub chain_id: ChainId,
    pub name: String,
    /// HTTP(S) or WebSocket endpoints; one connection pool is built per entry
    pub urls: Vec<String>,
}

impl ChainData {
    pub fn new(chain_id: ChainId, name: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            chain_id,
            name: name.into(),
            urls,
        }
    }

    /// Key under which the query cache files this chain's requests
    pub fn cache_url(&self) -> String {
        format!("app:/ethereum/{}", self.chain_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_url() {
        let chain = ChainData::new(1, "Ethereum", vec![]);
        assert_eq!(chain.cache_url(), "app:/ethereum/1");
    }

    #[test]
    fn test_deserialize_camel_case() {
        let chain: ChainData = serde_json::from_str(
            r#"{"chainId":100,"name":"Gnosis","urls":["https://rpc.gnosischain.com"]}"#,
        )
        .unwrap();
        assert_eq!(chain.chain_id, 100);
        assert_eq!(chain.urls.len(), 1);
    }
}
