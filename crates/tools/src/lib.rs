//! Browser tool pack.
//!
//! Thin handlers over the [`BrowserOps`] capability the router context
//! carries. Each tool is a definition (name, description, input schema)
//! plus a handler; [`tool_pack`] assembles the full set for registration.

pub mod page;
pub mod storage;
pub mod tabs;

use std::collections::HashMap;
use std::sync::Arc;

use tabbridge_core::protocol::ToolDefinition;
use tabbridge_router::HandlerMap;

use crate::page::{ExecuteScriptTool, InsertCssTool, ScreenshotTool};
use crate::storage::{StorageGetTool, StorageSetTool};
use crate::tabs::{NavigateTool, TabActivateTool, TabCloseTool, TabCreateTool, TabsListTool};

/// Every browser tool with its handler, ready for `Router::new`.
pub fn tool_pack() -> (Vec<ToolDefinition>, HandlerMap) {
    let definitions = vec![
        NavigateTool::definition(),
        TabsListTool::definition(),
        TabCreateTool::definition(),
        TabCloseTool::definition(),
        TabActivateTool::definition(),
        ExecuteScriptTool::definition(),
        InsertCssTool::definition(),
        ScreenshotTool::definition(),
        StorageGetTool::definition(),
        StorageSetTool::definition(),
    ];

    let mut handlers: HandlerMap = HashMap::new();
    handlers.insert("navigate".to_string(), Arc::new(NavigateTool));
    handlers.insert("tabs_list".to_string(), Arc::new(TabsListTool));
    handlers.insert("tab_create".to_string(), Arc::new(TabCreateTool));
    handlers.insert("tab_close".to_string(), Arc::new(TabCloseTool));
    handlers.insert("tab_activate".to_string(), Arc::new(TabActivateTool));
    handlers.insert("execute_script".to_string(), Arc::new(ExecuteScriptTool));
    handlers.insert("insert_css".to_string(), Arc::new(InsertCssTool));
    handlers.insert("screenshot".to_string(), Arc::new(ScreenshotTool));
    handlers.insert("storage_get".to_string(), Arc::new(StorageGetTool));
    handlers.insert("storage_set".to_string(), Arc::new(StorageSetTool));

    (definitions, handlers)
}

/// Required string argument, as a tool-level error when absent.
pub(crate) fn require_str<'a>(
    args: &'a serde_json::Value,
    key: &str,
) -> tabbridge_core::Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| tabbridge_core::Error::Other(format!("missing required argument '{}'", key)))
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted in-memory browser used by the tool tests.

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tabbridge_core::{Error, Result};
    use tabbridge_router::{BrowserOps, TabInfo};

    #[derive(Default)]
    pub struct FakeBrowser {
        pub tabs: Mutex<Vec<TabInfo>>,
        pub storage: Mutex<HashMap<String, Value>>,
        pub next_id: Mutex<i64>,
    }

    impl FakeBrowser {
        pub fn with_tab(url: &str) -> Self {
            let browser = Self::default();
            browser.tabs.lock().unwrap().push(TabInfo {
                id: 1,
                url: url.to_string(),
                title: "tab".to_string(),
                active: true,
            });
            *browser.next_id.lock().unwrap() = 2;
            browser
        }
    }

    #[async_trait]
    impl BrowserOps for FakeBrowser {
        async fn active_tab(&self) -> Result<TabInfo> {
            self.tabs
                .lock()
                .unwrap()
                .iter()
                .find(|t| t.active)
                .cloned()
                .ok_or_else(|| Error::Other("no active tab".to_string()))
        }

        async fn list_tabs(&self) -> Result<Vec<TabInfo>> {
            Ok(self.tabs.lock().unwrap().clone())
        }

        async fn create_tab(&self, url: &str) -> Result<TabInfo> {
            let mut next = self.next_id.lock().unwrap();
            let tab = TabInfo {
                id: *next,
                url: url.to_string(),
                title: String::new(),
                active: false,
            };
            *next += 1;
            self.tabs.lock().unwrap().push(tab.clone());
            Ok(tab)
        }

        async fn close_tab(&self, tab_id: i64) -> Result<()> {
            let mut tabs = self.tabs.lock().unwrap();
            let before = tabs.len();
            tabs.retain(|t| t.id != tab_id);
            if tabs.len() == before {
                return Err(Error::Other(format!("no tab {}", tab_id)));
            }
            Ok(())
        }

        async fn activate_tab(&self, tab_id: i64) -> Result<()> {
            let mut tabs = self.tabs.lock().unwrap();
            if !tabs.iter().any(|t| t.id == tab_id) {
                return Err(Error::Other(format!("no tab {}", tab_id)));
            }
            for t in tabs.iter_mut() {
                t.active = t.id == tab_id;
            }
            Ok(())
        }

        async fn navigate(&self, tab_id: Option<i64>, url: &str) -> Result<TabInfo> {
            let mut tabs = self.tabs.lock().unwrap();
            let tab = match tab_id {
                Some(id) => tabs.iter_mut().find(|t| t.id == id),
                None => tabs.iter_mut().find(|t| t.active),
            }
            .ok_or_else(|| Error::Other("tab not found".to_string()))?;
            tab.url = url.to_string();
            Ok(tab.clone())
        }

        async fn execute_script(&self, _tab_id: Option<i64>, code: &str) -> Result<Value> {
            Ok(json!({"evaluated": code}))
        }

        async fn insert_css(&self, _tab_id: Option<i64>, _css: &str) -> Result<()> {
            Ok(())
        }

        async fn storage_get(&self, key: &str) -> Result<Value> {
            Ok(self
                .storage
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .unwrap_or(Value::Null))
        }

        async fn storage_set(&self, key: &str, value: Value) -> Result<()> {
            self.storage.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }

        async fn screenshot(&self) -> Result<String> {
            use base64::Engine;
            Ok(base64::engine::general_purpose::STANDARD.encode(b"png-bytes"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabbridge_router::{Router, RouterContext};

    #[test]
    fn pack_covers_every_definition() {
        let (defs, handlers) = tool_pack();
        for def in &defs {
            assert!(handlers.contains_key(&def.name), "missing {}", def.name);
        }
        assert_eq!(defs.len(), 10);
    }

    #[test]
    fn pack_constructs_a_router() {
        let (defs, handlers) = tool_pack();
        assert!(Router::new(defs, handlers, RouterContext::new()).is_ok());
    }
}
