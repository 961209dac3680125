// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire-level message types for the linch-mind IPC protocol.
//!
//! Every frame carries one JSON document: a request
//! `{method, path, data, headers, query_params, request_id}` or a response
//! `{success, data, error, metadata}`. The envelope is independent of HTTP;
//! methods and paths are only a familiar addressing scheme.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: &str = "2.0";
pub const SERVICE_NAME: &str = "linch-mind-daemon";

/// Stable error code strings. The enum-to-string mapping is part of the wire
/// contract; clients match on `error.code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpcErrorCode {
    #[serde(rename = "IPC_CONNECTION_FAILED")]
    ConnectionFailed,
    #[serde(rename = "IPC_CLIENT_DISCONNECTED")]
    ClientDisconnected,
    #[serde(rename = "IPC_AUTH_REQUIRED")]
    AuthRequired,
    #[serde(rename = "IPC_AUTH_FAILED")]
    AuthFailed,
    #[serde(rename = "IPC_INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "IPC_MISSING_PARAMETER")]
    MissingParameter,
    #[serde(rename = "IPC_INVALID_PARAMETER")]
    InvalidParameter,
    #[serde(rename = "IPC_REQUEST_TIMEOUT")]
    RequestTimeout,
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    #[serde(rename = "RESOURCE_NOT_FOUND")]
    ResourceNotFound,
    #[serde(rename = "INSUFFICIENT_PERMISSIONS")]
    InsufficientPermissions,
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "SERVICE_UNAVAILABLE")]
    ServiceUnavailable,
}

impl IpcErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpcErrorCode::ConnectionFailed => "IPC_CONNECTION_FAILED",
            IpcErrorCode::ClientDisconnected => "IPC_CLIENT_DISCONNECTED",
            IpcErrorCode::AuthRequired => "IPC_AUTH_REQUIRED",
            IpcErrorCode::AuthFailed => "IPC_AUTH_FAILED",
            IpcErrorCode::InvalidRequest => "IPC_INVALID_REQUEST",
            IpcErrorCode::MissingParameter => "IPC_MISSING_PARAMETER",
            IpcErrorCode::InvalidParameter => "IPC_INVALID_PARAMETER",
            IpcErrorCode::RequestTimeout => "IPC_REQUEST_TIMEOUT",
            IpcErrorCode::RateLimited => "RATE_LIMITED",
            IpcErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            IpcErrorCode::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            IpcErrorCode::InternalError => "INTERNAL_ERROR",
            IpcErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }
}

impl fmt::Display for IpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcMetadata {
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IpcMetadata {
    /// Stamps the current time and echoes the request id, generating a fresh
    /// opaque one when the request carried none.
    pub fn create(request_id: Option<String>) -> Self {
        IpcMetadata {
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: request_id.or_else(|| Some(new_request_id())),
        }
    }
}

pub fn new_request_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

fn null_to_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One inbound frame. `method` and `path` are mandatory; everything else
/// defaults when missing or JSON `null`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IpcRequest {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, deserialize_with = "null_to_default")]
    pub headers: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_to_default")]
    pub query_params: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub path_params: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IpcRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        IpcRequest {
            method: method.into(),
            path: path.into(),
            request_id: Some(new_request_id()),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Header lookup; injected header names are all lower case.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn get_query(&self, name: &str) -> Option<&Value> {
        self.query_params.get(name)
    }

    pub fn get_path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(String::as_str)
    }

    /// Size of the serialized `data` payload, as counted by the request
    /// validator and the access log.
    pub fn data_len(&self) -> usize {
        self.data
            .as_ref()
            .map(|d| d.to_string().len())
            .unwrap_or(0)
    }
}

/// One outbound frame. `data` and `error` are serialized explicitly as
/// `null` when absent; clients rely on both keys being present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<IpcError>,
    pub metadata: IpcMetadata,
}

impl IpcResponse {
    pub fn success(data: Value, request_id: Option<String>) -> Self {
        IpcResponse {
            success: true,
            data: Some(data),
            error: None,
            metadata: IpcMetadata::create(request_id),
        }
    }

    pub fn error(
        code: IpcErrorCode,
        message: impl Into<String>,
        details: Option<Value>,
        request_id: Option<String>,
    ) -> Self {
        IpcResponse {
            success: false,
            data: None,
            error: Some(IpcError {
                code: code.as_str().to_string(),
                message: message.into(),
                details,
            }),
            metadata: IpcMetadata::create(request_id),
        }
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}
