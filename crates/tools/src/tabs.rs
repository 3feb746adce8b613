//! Tab and navigation tools.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::require_str;
use tabbridge_core::protocol::{ToolAnnotations, ToolDefinition, ToolResult};
use tabbridge_core::Result;
use tabbridge_router::{RouterContext, ToolHandler};

pub struct NavigateTool;

impl NavigateTool {
    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(
            "navigate",
            "Navigate a tab to a URL. Uses the active tab unless tab_id is given.",
            json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "Destination URL (http or https)"
                    },
                    "tab_id": {
                        "type": "integer",
                        "description": "Target tab id, default: active tab"
                    }
                },
                "required": ["url"]
            }),
        )
        .with_annotations(ToolAnnotations {
            category: Some("navigation".to_string()),
            read_only_hint: Some(false),
        })
    }
}

#[async_trait]
impl ToolHandler for NavigateTool {
    async fn call(&self, args: Value, ctx: &RouterContext) -> Result<ToolResult> {
        let url = require_str(&args, "url")?;
        let tab_id = args.get("tab_id").and_then(|v| v.as_i64());
        let tab = ctx.browser()?.navigate(tab_id, url).await?;
        Ok(ToolResult::text(format!("Navigated to {}", tab.url)))
    }
}

pub struct TabsListTool;

impl TabsListTool {
    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(
            "tabs_list",
            "List all open tabs with id, url, title and active flag.",
            json!({
                "type": "object",
                "properties": {}
            }),
        )
        .with_annotations(ToolAnnotations {
            category: Some("tabs".to_string()),
            read_only_hint: Some(true),
        })
    }
}

#[async_trait]
impl ToolHandler for TabsListTool {
    async fn call(&self, _args: Value, ctx: &RouterContext) -> Result<ToolResult> {
        let tabs = ctx.browser()?.list_tabs().await?;
        Ok(ToolResult::text(serde_json::to_string_pretty(&tabs)?))
    }
}

pub struct TabCreateTool;

impl TabCreateTool {
    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(
            "tab_create",
            "Open a new tab at the given URL.",
            json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "URL to open in the new tab"
                    }
                },
                "required": ["url"]
            }),
        )
        .with_annotations(ToolAnnotations {
            category: Some("tabs".to_string()),
            read_only_hint: Some(false),
        })
    }
}

#[async_trait]
impl ToolHandler for TabCreateTool {
    async fn call(&self, args: Value, ctx: &RouterContext) -> Result<ToolResult> {
        let url = require_str(&args, "url")?;
        let tab = ctx.browser()?.create_tab(url).await?;
        Ok(ToolResult::text(format!("Opened tab {} at {}", tab.id, tab.url)))
    }
}

pub struct TabCloseTool;

impl TabCloseTool {
    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(
            "tab_close",
            "Close a tab by id.",
            json!({
                "type": "object",
                "properties": {
                    "tab_id": {
                        "type": "integer",
                        "description": "Id of the tab to close"
                    }
                },
                "required": ["tab_id"]
            }),
        )
    }
}

#[async_trait]
impl ToolHandler for TabCloseTool {
    async fn call(&self, args: Value, ctx: &RouterContext) -> Result<ToolResult> {
        let tab_id = args
            .get("tab_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| tabbridge_core::Error::Other("missing required argument 'tab_id'".to_string()))?;
        ctx.browser()?.close_tab(tab_id).await?;
        Ok(ToolResult::text(format!("Closed tab {}", tab_id)))
    }
}

pub struct TabActivateTool;

impl TabActivateTool {
    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(
            "tab_activate",
            "Bring a tab to the foreground by id.",
            json!({
                "type": "object",
                "properties": {
                    "tab_id": {
                        "type": "integer",
                        "description": "Id of the tab to activate"
                    }
                },
                "required": ["tab_id"]
            }),
        )
    }
}

#[async_trait]
impl ToolHandler for TabActivateTool {
    async fn call(&self, args: Value, ctx: &RouterContext) -> Result<ToolResult> {
        let tab_id = args
            .get("tab_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| tabbridge_core::Error::Other("missing required argument 'tab_id'".to_string()))?;
        ctx.browser()?.activate_tab(tab_id).await?;
        Ok(ToolResult::text(format!("Activated tab {}", tab_id)))
    }
}
