//! Flat API-key allow-list.

use tabbridge_core::{Error, Result};

/// Constant-time string comparison; never early-exits on a mismatch.
fn secure_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&x, &y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub struct ApiKeyValidator {
    keys: Vec<String>,
}

impl ApiKeyValidator {
    /// An empty key list is a configuration error, caught before serving.
    pub fn new(keys: Vec<String>) -> Result<Self> {
        if keys.is_empty() {
            return Err(Error::Config(
                "at least one API key must be configured".to_string(),
            ));
        }
        Ok(Self { keys })
    }

    pub fn validate(&self, candidate: &str) -> bool {
        self.keys.iter().any(|k| secure_eq(k, candidate))
    }
}
