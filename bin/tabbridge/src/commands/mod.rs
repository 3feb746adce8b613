pub mod bridge;
pub mod status;
pub mod tools_cmd;
