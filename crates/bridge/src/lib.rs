pub mod auth;
pub mod server;
pub mod session;
pub mod upstream;

pub use auth::ApiKeyValidator;
pub use server::BridgeServer;
pub use session::{Session, SessionCommand, SessionTable};
pub use upstream::{ToolProvider, UpstreamClient};
