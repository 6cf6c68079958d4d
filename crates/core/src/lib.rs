//! Brume Core
//!
//! Types shared by the pool, Tor and RPC layers:
//!
//! - JSON-RPC 2.0 request/response wire types
//! - Chain descriptions and their RPC endpoints
//! - The `Fetched` envelope handed to the query cache
//! - Engine configuration

pub mod chain;
pub mod config;
pub mod fetched;
pub mod rpc;

pub use chain::{ChainData, ChainId};
pub use config::{BrumeConfig, ConfigError, FetchConfig, TorConfig};
pub use fetched::{Data, Fail, Fetched};
pub use rpc::{FetchParams, RpcErrorObject, RpcRequest, RpcRequestInit, RpcResponse};
