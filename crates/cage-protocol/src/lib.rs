//! Wire types shared between the cage client and the engine daemon.
//!
//! The engine speaks a small JSON-RPC 2.0 dialect over a unix-domain socket
//! (or an HTTP POST carrying the same envelope): one request per connection,
//! responses correlated by `id`.

pub mod events;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version sent with every request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Remote operations understood by the engine.
pub mod methods {
    pub const RUN_CONTAINER: &str = "run_container";
    pub const STOP_CONTAINER: &str = "stop_container";
    pub const WAIT_CONTAINER: &str = "wait_container";
    pub const GET_TTY: &str = "get_tty";
}

/// Outbound request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: RpcParams,
    pub id: String,
}

/// Request parameters. The engine expects the call payload under `body`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcParams {
    pub body: Value,
}

impl RpcRequest {
    /// Build a request with a freshly generated correlation id.
    pub fn new(method: impl Into<String>, body: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params: RpcParams { body },
            id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Inbound response envelope. Exactly one of `result` / `error` is set by a
/// well-behaved engine; both are kept optional so a half-formed response can
/// still be inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl RpcResponse {
    /// A successful response for the given request id.
    pub fn result(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            result: Some(result),
            error: None,
        }
    }

    /// An error response. `id` may be absent or stale; see the client's
    /// correlation rules.
    pub fn error(id: Option<String>, error: Value) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A low-level isolation/capability rule value. Values are carried verbatim:
/// booleans stay booleans, strings stay strings, and unknown keys pass
/// through untouched for forward compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleValue {
    Bool(bool),
    Str(String),
}

impl From<bool> for RuleValue {
    fn from(value: bool) -> Self {
        RuleValue::Bool(value)
    }
}

impl From<&str> for RuleValue {
    fn from(value: &str) -> Self {
        RuleValue::Str(value.to_string())
    }
}

impl From<String> for RuleValue {
    fn from(value: String) -> Self {
        RuleValue::Str(value)
    }
}

/// A host-path to container-path binding, as consumed by the engine.
/// Both sides are absolute. List position is override precedence downstream:
/// the engine deduplicates by destination with later entries winning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountBinding {
    pub src: PathBuf,
    pub dst: PathBuf,
}

/// Fully resolved launch body sent to the engine to start a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub name: String,
    /// Container dataset mount point (holds `rootfs` and the manifest).
    pub path: PathBuf,
    pub rootfs: PathBuf,
    pub workdir: String,
    pub command: String,
    pub entry: String,
    pub env: BTreeMap<String, String>,
    /// Ordered bindings: resolved volumes first, explicit mounts last.
    pub mounts: Vec<MountBinding>,
    pub rules: BTreeMap<String, RuleValue>,
    /// Network-interface hint for the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

/// Stream endpoints returned by `get_tty`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtyEndpoints {
    /// Channel carrying local keystrokes toward the container.
    pub input: PathBuf,
    /// Channel carrying container output and control-path events.
    pub output: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_shape() {
        let req = RpcRequest::new(methods::WAIT_CONTAINER, json!({"name": "web1"}));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "wait_container");
        assert_eq!(value["params"]["body"]["name"], "web1");
        assert!(value["id"].is_string());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = RpcRequest::new("run_container", json!({}));
        let b = RpcRequest::new("run_container", json!({}));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_response_without_id() {
        let resp: RpcResponse = serde_json::from_str(r#"{"error":{"code":500}}"#).unwrap();
        assert!(resp.id.is_none());
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap()["code"], 500);
    }

    #[test]
    fn test_rule_value_not_coerced() {
        let rules: BTreeMap<String, RuleValue> =
            serde_json::from_str(r#"{"persist":true,"vnet":"new","host.hostname":"a.local"}"#)
                .unwrap();
        assert_eq!(rules["persist"], RuleValue::Bool(true));
        assert_eq!(rules["vnet"], RuleValue::Str("new".to_string()));
        // Round-trips without type changes.
        let text = serde_json::to_string(&rules).unwrap();
        let again: BTreeMap<String, RuleValue> = serde_json::from_str(&text).unwrap();
        assert_eq!(rules, again);
    }

    #[test]
    fn test_launch_request_omits_absent_interface() {
        let body = LaunchRequest {
            name: "web1".into(),
            path: "/containers/web1".into(),
            rootfs: "/containers/web1/rootfs".into(),
            workdir: "/".into(),
            command: String::new(),
            entry: "/bin/sh".into(),
            env: BTreeMap::new(),
            mounts: vec![],
            rules: BTreeMap::new(),
            interface: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("interface").is_none());
        assert_eq!(value["rootfs"], "/containers/web1/rootfs");
    }
}
