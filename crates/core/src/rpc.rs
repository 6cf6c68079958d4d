//! JSON-RPC 2.0 wire types

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ChainId;

/// Method and parameters of a call, before an id is assigned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequestInit {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl RpcRequestInit {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Transport hints travelling with a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchParams {
    /// Return the first successful answer instead of cross-checking providers
    #[serde(default)]
    pub no_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<ChainId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_uuid: Option<String>,
}

impl FetchParams {
    /// Hints for a request that trusts the first provider to answer
    pub fn no_check() -> Self {
        Self {
            no_check: true,
            ..Default::default()
        }
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(id: u64, init: &RpcRequestInit) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: init.method.clone(),
            params: init.params.clone(),
        }
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Value::from(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: RpcErrorObject) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Value::from(id),
            result: None,
            error: Some(error),
        }
    }

    /// Numeric id, if the server echoed one
    pub fn id_u64(&self) -> Option<u64> {
        self.id.as_u64()
    }

    /// A missing `result` without an `error` is a JSON `null` result
    pub fn into_result(self) -> Result<Value, RpcErrorObject> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code: {})", self.message, self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_carries_init() {
        let init = RpcRequestInit::new("eth_getBalance", vec![json!("0xabc"), json!("latest")]);
        let request = RpcRequest::new(7, &init);

        let text = serde_json::to_value(&request).unwrap();
        assert_eq!(
            text,
            json!({"jsonrpc": "2.0", "id": 7, "method": "eth_getBalance", "params": ["0xabc", "latest"]})
        );
    }

    #[test]
    fn test_response_with_error_is_err() {
        let response: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"header not found"}}"#,
        )
        .unwrap();

        let error = response.into_result().unwrap_err();
        assert_eq!(error.code, -32000);
        assert_eq!(error.to_string(), "header not found (code: -32000)");
    }

    #[test]
    fn test_response_null_result_is_ok() {
        let response: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":null}"#).unwrap();
        assert_eq!(response.id_u64(), Some(3));
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_fetch_params_camel_case() {
        let params: FetchParams =
            serde_json::from_str(r#"{"noCheck":true,"chainId":1,"connectionUuid":"abc"}"#).unwrap();
        assert!(params.no_check);
        assert_eq!(params.chain_id, Some(1));
        assert_eq!(params.connection_uuid.as_deref(), Some("abc"));

        let defaults: FetchParams = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, FetchParams::default());
    }
}
