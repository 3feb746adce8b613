pub mod browser;
pub mod context;
pub mod router;

pub use browser::{BrowserHandle, BrowserOps, TabInfo};
pub use context::RouterContext;
pub use router::{HandlerMap, Router, ToolHandler};
