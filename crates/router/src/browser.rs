//! The narrow browser capability surface exposed through [`RouterContext`].
//!
//! Concrete implementations live with whatever hosts the router (an
//! extension shim, a CDP adapter, a test double). Tool handlers only ever
//! see this trait, so the browser side stays swappable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use tabbridge_core::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub id: i64,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub active: bool,
}

#[async_trait]
pub trait BrowserOps: Send + Sync {
    /// The currently focused tab.
    async fn active_tab(&self) -> Result<TabInfo>;

    async fn list_tabs(&self) -> Result<Vec<TabInfo>>;

    async fn create_tab(&self, url: &str) -> Result<TabInfo>;

    async fn close_tab(&self, tab_id: i64) -> Result<()>;

    async fn activate_tab(&self, tab_id: i64) -> Result<()>;

    /// Navigate a tab (the active tab when `tab_id` is `None`).
    async fn navigate(&self, tab_id: Option<i64>, url: &str) -> Result<TabInfo>;

    /// Evaluate script in a tab and return its JSON-serializable result.
    async fn execute_script(&self, tab_id: Option<i64>, code: &str) -> Result<Value>;

    async fn insert_css(&self, tab_id: Option<i64>, css: &str) -> Result<()>;

    async fn storage_get(&self, key: &str) -> Result<Value>;

    async fn storage_set(&self, key: &str, value: Value) -> Result<()>;

    /// Capture the visible viewport as base64-encoded PNG data.
    async fn screenshot(&self) -> Result<String>;
}

pub type BrowserHandle = Arc<dyn BrowserOps>;
