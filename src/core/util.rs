// src/core/util.rs

//! Small helpers shared across the agent.

use crate::core::errors::AgentError;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::HashSet;
use std::net::TcpListener;

/// Milliseconds since the Unix epoch, as carried in health heartbeats.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Random alphanumeric identifier/password material.
pub fn random_string(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Finds a free TCP port in `[start, end]`, skipping `exclude`. A zero start
/// picks a random origin in the ephemeral-ish 10000..20000 band first.
pub fn find_available_port(
    start: u16,
    end: u16,
    exclude: &HashSet<u16>,
) -> Result<u16, AgentError> {
    let start = if start == 0 {
        rand::thread_rng().gen_range(10000..20000)
    } else {
        start
    };
    if end < start {
        return Err(AgentError::InvalidArgument(
            "end port must not be below start port".to_string(),
        ));
    }
    for port in start..=end {
        if exclude.contains(&port) {
            continue;
        }
        if is_port_available(port) {
            return Ok(port);
        }
    }
    Err(AgentError::Internal(format!(
        "no available ports between {start} and {end}"
    )))
}

/// Hex SHA-256 digest used for direct-token comparison.
pub fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
