//! Tool registry and protocol dispatch.
//!
//! The router owns the name→handler mapping, checks handler coverage at
//! construction, and answers `tools/list` / `tools/call`. Two entry points
//! with deliberately different failure behavior: [`Router::call_tool`]
//! throws, [`Router::handle`] always returns a well-formed response.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::RouterContext;
use tabbridge_core::protocol::{codes, methods, CallToolParams, ToolDefinition, ToolResult};
use tabbridge_core::{Error, Result};

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: &RouterContext) -> Result<ToolResult>;
}

pub type HandlerMap = HashMap<String, Arc<dyn ToolHandler>>;

pub struct Router {
    definitions: Vec<ToolDefinition>,
    handlers: HandlerMap,
    base_context: RouterContext,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("definitions", &self.definitions)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Fails immediately when any definition lacks a handler. This is a
    /// configuration invariant, not a runtime error.
    pub fn new(
        definitions: Vec<ToolDefinition>,
        handlers: HandlerMap,
        base_context: RouterContext,
    ) -> Result<Self> {
        for def in &definitions {
            if !handlers.contains_key(&def.name) {
                return Err(Error::Config(format!(
                    "no handler registered for tool '{}'",
                    def.name
                )));
            }
        }
        Ok(Self {
            definitions,
            handlers,
            base_context,
        })
    }

    pub fn tool_definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    /// Throwing primitive: unknown tools and handler failures surface as
    /// `Err`. Callers composing their own error handling use this;
    /// everything transport-facing goes through [`Router::handle`].
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        ctx_override: Option<&RouterContext>,
    ) -> Result<ToolResult> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        let ctx = match ctx_override {
            Some(overlay) => self.base_context.merged(overlay),
            None => self.base_context.clone(),
        };

        debug!(tool = name, "dispatching tool call");
        handler
            .call(args, &ctx)
            .await
            .map_err(|e| Error::ToolExecution {
                tool: name.to_string(),
                message: e.to_string(),
            })
    }

    /// Top-level protocol entry point. Never fails: every input, however
    /// malformed, maps to a response object. Handler failures become
    /// `isError` tool results rather than error envelopes.
    pub async fn handle(&self, message: Value, ctx_override: Option<&RouterContext>) -> Value {
        let method = match message.get("method").and_then(|m| m.as_str()) {
            Some(m) => m.to_string(),
            None => {
                return error_response(codes::INVALID_REQUEST, "message has no method field");
            }
        };

        match method.as_str() {
            methods::TOOLS_LIST => {
                let tools: Vec<Value> = self
                    .definitions
                    .iter()
                    .map(|d| {
                        json!({
                            "name": d.name,
                            "description": d.description,
                            "inputSchema": d.input_schema,
                        })
                    })
                    .collect();
                json!({ "tools": tools })
            }
            methods::TOOLS_CALL => {
                let params = match message
                    .get("params")
                    .cloned()
                    .map(serde_json::from_value::<CallToolParams>)
                {
                    Some(Ok(p)) => p,
                    _ => {
                        return error_response(
                            codes::INVALID_REQUEST,
                            "tools/call requires params with a tool name",
                        );
                    }
                };

                let args = params.arguments.unwrap_or_else(|| json!({}));
                match self.call_tool(&params.name, args, ctx_override).await {
                    Ok(result) => serde_json::to_value(result)
                        .unwrap_or_else(|e| error_response(codes::EXECUTION_ERROR, e.to_string())),
                    Err(e) => {
                        warn!(tool = %params.name, error = %e, "tool call failed");
                        serde_json::to_value(ToolResult::error_text(e.to_string()))
                            .unwrap_or_else(|_| error_response(codes::EXECUTION_ERROR, "tool call failed"))
                    }
                }
            }
            other => error_response(
                codes::METHOD_NOT_FOUND,
                format!("unknown method: {}", other),
            ),
        }
    }
}

fn error_response(code: i64, message: impl Into<String>) -> Value {
    json!({
        "error": {
            "code": code,
            "message": message.into(),
        }
    })
}
