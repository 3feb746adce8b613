//! Extension-storage tools.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::require_str;
use tabbridge_core::protocol::{ToolDefinition, ToolResult};
use tabbridge_core::Result;
use tabbridge_router::{RouterContext, ToolHandler};

pub struct StorageGetTool;

impl StorageGetTool {
    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(
            "storage_get",
            "Read a value from extension storage by key. Returns null when the key is unset.",
            json!({
                "type": "object",
                "properties": {
                    "key": {
                        "type": "string",
                        "description": "Storage key"
                    }
                },
                "required": ["key"]
            }),
        )
    }
}

#[async_trait]
impl ToolHandler for StorageGetTool {
    async fn call(&self, args: Value, ctx: &RouterContext) -> Result<ToolResult> {
        let key = require_str(&args, "key")?;
        let value = ctx.browser()?.storage_get(key).await?;
        Ok(ToolResult::text(value.to_string()))
    }
}

pub struct StorageSetTool;

impl StorageSetTool {
    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(
            "storage_set",
            "Write a value into extension storage.",
            json!({
                "type": "object",
                "properties": {
                    "key": {
                        "type": "string",
                        "description": "Storage key"
                    },
                    "value": {
                        "description": "Any JSON value to store"
                    }
                },
                "required": ["key", "value"]
            }),
        )
    }
}

#[async_trait]
impl ToolHandler for StorageSetTool {
    async fn call(&self, args: Value, ctx: &RouterContext) -> Result<ToolResult> {
        let key = require_str(&args, "key")?;
        let value = args
            .get("value")
            .cloned()
            .ok_or_else(|| tabbridge_core::Error::Other("missing required argument 'value'".to_string()))?;
        ctx.browser()?.storage_set(key, value).await?;
        Ok(ToolResult::text(format!("Stored '{}'", key)))
    }
}
