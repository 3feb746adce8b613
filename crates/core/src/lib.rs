pub mod config;
pub mod error;
pub mod protocol;

pub use config::{BridgeConfig, Config, UpstreamConfig};
pub use error::{Error, Result};

/// Current wall-clock time as epoch milliseconds.
///
/// Rate-limit windows, idle sweeps and pong timestamps all use this clock.
/// It is not monotonic: a backwards system-clock step can stretch a rate
/// window or postpone an idle expiry.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
