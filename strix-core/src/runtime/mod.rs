//! Sandbox runtime: per-scan containers and the in-container tool server

mod client;
mod docker;

pub use client::SandboxClient;
pub use docker::SandboxRuntime;

use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Handle to a running sandbox container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub container_id: String,
    pub scan_id: String,
    /// Base URL of the in-container tool server
    pub url: String,
    /// Per-scan bearer token
    pub token: String,
    pub port: u16,
}

/// Mint a sandbox bearer token: 32 random bytes, URL-safe base64.
pub fn mint_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
