//! Control endpoint: named tools callable over JSON-RPC.
//!
//! This module contains:
//! - `Tool` trait and `ToolRegistry`
//! - Built-in tools: `ping`, `broadcastMessage`
//! - HTTP surface (`server`)

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

pub mod server;
pub mod tools;

pub use server::router;
pub use tools::{BroadcastMessageTool, PingTool};

/// JSON-RPC error codes used by the control surface.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Errors from resolving or running a tool.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool failed: {0}")]
    Failed(String),
}

impl ToolError {
    /// JSON-RPC error code for this failure.
    pub fn code(&self) -> i64 {
        match self {
            ToolError::NotFound(_) | ToolError::InvalidArguments(_) => codes::INVALID_PARAMS,
            ToolError::Failed(_) => codes::INTERNAL_ERROR,
        }
    }
}

/// A named operation exposed to the control layer.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the accepted arguments.
    fn input_schema(&self) -> Value;

    /// Run the tool and return a human-readable result.
    async fn call(&self, args: Value) -> Result<String, ToolError>;
}

/// Parse tool arguments, treating absent arguments as an empty object.
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Tools by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// `tools/list` result body.
    pub fn list(&self) -> Value {
        let tools: Vec<Value> = self
            .names()
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": tool.input_schema(),
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    pub async fn call(&self, name: &str, args: Value) -> Result<String, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.call(args).await
    }
}
