//! Script, style and capture tools.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::require_str;
use tabbridge_core::protocol::{ToolAnnotations, ToolDefinition, ToolResult};
use tabbridge_core::Result;
use tabbridge_router::{RouterContext, ToolHandler};

pub struct ExecuteScriptTool;

impl ExecuteScriptTool {
    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(
            "execute_script",
            "Evaluate JavaScript in a tab and return the JSON-serializable result. Uses the active tab unless tab_id is given.",
            json!({
                "type": "object",
                "properties": {
                    "code": {
                        "type": "string",
                        "description": "JavaScript source to evaluate"
                    },
                    "tab_id": {
                        "type": "integer",
                        "description": "Target tab id, default: active tab"
                    }
                },
                "required": ["code"]
            }),
        )
        .with_annotations(ToolAnnotations {
            category: Some("scripting".to_string()),
            read_only_hint: Some(false),
        })
    }
}

#[async_trait]
impl ToolHandler for ExecuteScriptTool {
    async fn call(&self, args: Value, ctx: &RouterContext) -> Result<ToolResult> {
        let code = require_str(&args, "code")?;
        let tab_id = args.get("tab_id").and_then(|v| v.as_i64());
        let result = ctx.browser()?.execute_script(tab_id, code).await?;
        Ok(ToolResult::text(result.to_string()))
    }
}

pub struct InsertCssTool;

impl InsertCssTool {
    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(
            "insert_css",
            "Inject a CSS stylesheet into a tab. Uses the active tab unless tab_id is given.",
            json!({
                "type": "object",
                "properties": {
                    "css": {
                        "type": "string",
                        "description": "CSS text to inject"
                    },
                    "tab_id": {
                        "type": "integer",
                        "description": "Target tab id, default: active tab"
                    }
                },
                "required": ["css"]
            }),
        )
    }
}

#[async_trait]
impl ToolHandler for InsertCssTool {
    async fn call(&self, args: Value, ctx: &RouterContext) -> Result<ToolResult> {
        let css = require_str(&args, "css")?;
        let tab_id = args.get("tab_id").and_then(|v| v.as_i64());
        ctx.browser()?.insert_css(tab_id, css).await?;
        Ok(ToolResult::text("Stylesheet injected"))
    }
}

pub struct ScreenshotTool;

impl ScreenshotTool {
    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(
            "screenshot",
            "Capture the visible viewport of the active tab as a PNG image.",
            json!({
                "type": "object",
                "properties": {}
            }),
        )
        .with_annotations(ToolAnnotations {
            category: Some("capture".to_string()),
            read_only_hint: Some(true),
        })
    }
}

#[async_trait]
impl ToolHandler for ScreenshotTool {
    async fn call(&self, _args: Value, ctx: &RouterContext) -> Result<ToolResult> {
        let data = ctx.browser()?.screenshot().await?;
        Ok(ToolResult::image(data, "image/png"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBrowser;
    use std::sync::Arc;
    use tabbridge_core::protocol::ContentItem;

    fn ctx() -> RouterContext {
        RouterContext::new().with_browser(Arc::new(FakeBrowser::with_tab("https://start.test")))
    }

    #[tokio::test]
    async fn execute_script_returns_result_text() {
        let result = ExecuteScriptTool
            .call(json!({"code": "1 + 1"}), &ctx())
            .await
            .unwrap();
        match &result.content[0] {
            ContentItem::Text { text } => assert!(text.contains("1 + 1")),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn screenshot_returns_png_image() {
        let result = ScreenshotTool.call(json!({}), &ctx()).await.unwrap();
        match &result.content[0] {
            ContentItem::Image { mime_type, data } => {
                assert_eq!(mime_type, "image/png");
                assert!(!data.is_empty());
            }
            other => panic!("expected image, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_browser_capability_fails() {
        let bare = RouterContext::new();
        assert!(ScreenshotTool.call(json!({}), &bare).await.is_err());
    }
}
