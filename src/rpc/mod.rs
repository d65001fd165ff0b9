//! JSON-RPC 2.0 dispatcher.
//!
//! Methods are named `namespace:method`; the namespace is the permission
//! group. The registry is populated explicitly at startup so dispatch order
//! and the available surface are deterministic. Requests arrive as a single
//! object or a batch array over `POST /api/rpc2`, or framed over the
//! persistent upgrade channel on the same path.

pub mod methods;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::server::AppState;
use crate::web::error::AppError;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const PERMISSION_DENIED: i64 = -32001;
pub const UNAUTHENTICATED: i64 = -32002;

/// Caller rank, resolved before dispatch. Precedence at the transport:
/// api key, then admin session, then agent token, then guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Guest,
    Client,
    Admin,
}

/// Request context handed to every handler.
#[derive(Clone)]
pub struct RpcContext {
    pub state: Arc<AppState>,
    pub permission: Permission,
    pub client_uuid: Option<String>,
    pub user_uuid: Option<String>,
    pub remote_ip: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    /// Absent id marks a notification; no response element is produced.
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(detail: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {detail}"))
    }

    pub fn internal(detail: impl std::fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, format!("Internal error: {detail}"))
    }
}

impl From<AppError> for RpcError {
    fn from(err: AppError) -> Self {
        match &err {
            AppError::InvalidInput(_) | AppError::Conflict(_) | AppError::NotFound(_) => {
                Self::new(INVALID_PARAMS, err.to_string())
            }
            AppError::Unauthorized => Self::new(UNAUTHENTICATED, "Unauthenticated"),
            AppError::Forbidden(_) => Self::new(PERMISSION_DENIED, "Permission denied"),
            AppError::Database(_) | AppError::Internal(_) => {
                Self::new(INTERNAL_ERROR, "Internal error")
            }
        }
    }
}

impl From<sea_orm::DbErr> for RpcError {
    fn from(_: sea_orm::DbErr) -> Self {
        Self::new(INTERNAL_ERROR, "Internal error")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id: id.unwrap_or(Value::Null),
        }
    }

    pub fn failure(id: Option<Value>, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(error),
            id: id.unwrap_or(Value::Null),
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;
type Handler = Arc<dyn Fn(RpcContext, Option<Value>) -> HandlerFuture + Send + Sync>;

struct MethodEntry {
    handler: Handler,
    summary: &'static str,
}

#[derive(Default)]
pub struct RpcRegistry {
    methods: RwLock<HashMap<String, MethodEntry>>,
}

impl RpcRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<F, Fut>(&self, name: &str, summary: &'static str, f: F)
    where
        F: Fn(RpcContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx, params| Box::pin(f(ctx, params)));
        self.methods
            .write()
            .insert(name.to_owned(), MethodEntry { handler, summary });
    }

    /// Registered method names with their summaries, sorted.
    pub fn list(&self) -> Vec<(String, &'static str)> {
        let mut names: Vec<(String, &'static str)> = self
            .methods
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.summary))
            .collect();
        names.sort();
        names
    }

    fn handler_for(&self, method: &str) -> Option<Handler> {
        self.methods.read().get(method).map(|e| e.handler.clone())
    }
}

/// Namespace gate. A method without a namespace dispatches as `common`.
pub fn check_permission(method: &str, permission: Permission) -> Result<(), RpcError> {
    let namespace = match method.split_once(':') {
        Some((ns, _)) => ns,
        None => "common",
    };
    match namespace {
        "" | "guest" | "rpc" | "common" => Ok(()),
        "client" => {
            if matches!(permission, Permission::Client | Permission::Admin) {
                Ok(())
            } else {
                Err(RpcError::new(PERMISSION_DENIED, "Permission denied"))
            }
        }
        "admin" => {
            if permission == Permission::Admin {
                Ok(())
            } else {
                Err(RpcError::new(PERMISSION_DENIED, "Permission denied"))
            }
        }
        _ => Err(RpcError::new(UNAUTHENTICATED, "Unauthenticated")),
    }
}

fn validate(request: &RpcRequest) -> Result<&str, RpcError> {
    if request.jsonrpc.as_deref() != Some("2.0") {
        return Err(RpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""));
    }
    match request.method.as_deref() {
        Some(method) if !method.is_empty() => Ok(method),
        _ => Err(RpcError::new(INVALID_REQUEST, "method is required")),
    }
}

/// The request body of `POST /api/rpc2`: either one object or a non-empty
/// array of objects. The boolean reports whether the input was a batch.
pub fn parse_body(body: &[u8]) -> Result<(Vec<Value>, bool), RpcError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RpcError::new(PARSE_ERROR, format!("parse error: {e}")))?;
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                Err(RpcError::new(INVALID_REQUEST, "empty batch"))
            } else {
                Ok((items, true))
            }
        }
        object @ Value::Object(_) => Ok((vec![object], false)),
        _ => Err(RpcError::new(
            INVALID_REQUEST,
            "request must be an object or an array",
        )),
    }
}

/// Dispatch one raw batch element. Returns `None` for notifications.
pub async fn dispatch_value(ctx: RpcContext, element: Value) -> Option<RpcResponse> {
    let request: RpcRequest = match serde_json::from_value(element) {
        Ok(request) => request,
        Err(e) => {
            return Some(RpcResponse::failure(
                None,
                RpcError::new(INVALID_REQUEST, format!("bad request: {e}")),
            ))
        }
    };
    dispatch(ctx, request).await
}

/// Validate, gate and run one request. Returns `None` for notifications.
pub async fn dispatch(ctx: RpcContext, request: RpcRequest) -> Option<RpcResponse> {
    let id = request.id.clone();
    let is_notification = id.is_none();

    let method = match validate(&request) {
        Ok(method) => method.to_owned(),
        Err(e) => {
            return (!is_notification).then(|| RpcResponse::failure(id, e));
        }
    };
    if let Err(e) = check_permission(&method, ctx.permission) {
        return (!is_notification).then(|| RpcResponse::failure(id, e));
    }
    let Some(handler) = ctx.state.rpc.handler_for(&method) else {
        return (!is_notification).then(|| {
            RpcResponse::failure(id, RpcError::new(METHOD_NOT_FOUND, "Method not found"))
        });
    };

    let outcome = handler(ctx, request.params).await;
    if is_notification {
        return None;
    }
    Some(match outcome {
        Ok(result) => RpcResponse::success(id, result),
        Err(error) => RpcResponse::failure(id, error),
    })
}

/// Typed parameter extraction; `null`/absent params deserialize into types
/// with defaults.
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null)).map_err(RpcError::invalid_params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_gate_matches_the_permission_table() {
        for method in ["common:ping", "ping", "guest:x", "rpc:methods"] {
            assert!(check_permission(method, Permission::Guest).is_ok());
        }
        assert_eq!(
            check_permission("client:uploadBasicInfo", Permission::Guest)
                .unwrap_err()
                .code,
            PERMISSION_DENIED
        );
        assert!(check_permission("client:uploadBasicInfo", Permission::Client).is_ok());
        assert!(check_permission("client:uploadBasicInfo", Permission::Admin).is_ok());
        assert_eq!(
            check_permission("admin:listClients", Permission::Client)
                .unwrap_err()
                .code,
            PERMISSION_DENIED
        );
        assert!(check_permission("admin:listClients", Permission::Admin).is_ok());
        assert_eq!(
            check_permission("nonsense:method", Permission::Admin)
                .unwrap_err()
                .code,
            UNAUTHENTICATED
        );
    }

    #[test]
    fn body_parsing_distinguishes_single_and_batch() {
        let (single, batch) = parse_body(br#"{"jsonrpc":"2.0","method":"common:ping","id":1}"#).unwrap();
        assert_eq!(single.len(), 1);
        assert!(!batch);

        let (elements, batch) =
            parse_body(br#"[{"jsonrpc":"2.0","method":"common:ping","id":1}]"#).unwrap();
        assert_eq!(elements.len(), 1);
        assert!(batch);

        assert_eq!(parse_body(b"[]").unwrap_err().code, INVALID_REQUEST);
        assert_eq!(parse_body(b"not json").unwrap_err().code, PARSE_ERROR);
        assert_eq!(parse_body(b"42").unwrap_err().code, INVALID_REQUEST);
    }

    #[test]
    fn requests_round_trip_through_serde() {
        let raw = r#"{"jsonrpc":"2.0","method":"admin:listClients","params":{"x":1},"id":7}"#;
        let request: RpcRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(request.jsonrpc.as_deref(), Some("2.0"));
        assert_eq!(request.method.as_deref(), Some("admin:listClients"));
        assert_eq!(request.id, Some(serde_json::json!(7)));
        assert!(validate(&request).is_ok());

        let missing_version: RpcRequest =
            serde_json::from_str(r#"{"method":"common:ping","id":1}"#).unwrap();
        assert_eq!(validate(&missing_version).unwrap_err().code, INVALID_REQUEST);
    }

    #[test]
    fn responses_serialize_per_json_rpc() {
        let ok = RpcResponse::success(Some(serde_json::json!(1)), serde_json::json!("pong"));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["result"], "pong");
        assert!(value.get("error").is_none());

        let err = RpcResponse::failure(None, RpcError::new(PERMISSION_DENIED, "Permission denied"));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error"]["code"], PERMISSION_DENIED);
        assert_eq!(value["id"], Value::Null);
    }
}
