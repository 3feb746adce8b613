use serde_json::Value;
use std::collections::HashMap;

use crate::browser::BrowserHandle;
use tabbridge_core::{Error, Result};

/// Per-call execution context handed to tool handlers.
///
/// Built by merging the router's base context with a per-call override;
/// the override wins on every collision. The router treats this as
/// read-only data; it is populated by the transport/server layer.
#[derive(Clone, Default)]
pub struct RouterContext {
    pub browser: Option<BrowserHandle>,
    pub values: HashMap<String, Value>,
}

impl RouterContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_browser(mut self, browser: BrowserHandle) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn with_value(mut self, key: &str, value: Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    /// Merge `overlay` over `self`; overlay wins on key collision.
    pub fn merged(&self, overlay: &RouterContext) -> RouterContext {
        let mut values = self.values.clone();
        for (k, v) in &overlay.values {
            values.insert(k.clone(), v.clone());
        }
        RouterContext {
            browser: overlay.browser.clone().or_else(|| self.browser.clone()),
            values,
        }
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// The browser capability, or a tool-level error when the hosting layer
    /// did not provide one.
    pub fn browser(&self) -> Result<&BrowserHandle> {
        self.browser
            .as_ref()
            .ok_or_else(|| Error::Other("browser capability not available in context".to_string()))
    }
}
