//! Transport selection
//!
//! `push`: a sidecar delivers events over HTTP to `/events/<topic>`.
//! `pull`: the service consumes from the broker itself.
//! `auto`: probe the sidecar once at startup; push when it answers, pull otherwise.

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Push,
    Pull,
    Auto,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Push => "push",
            TransportMode::Pull => "pull",
            TransportMode::Auto => "auto",
        }
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(TransportMode::Push),
            "pull" => Ok(TransportMode::Pull),
            "auto" => Ok(TransportMode::Auto),
            other => Err(format!("expected push, pull or auto, got {other:?}")),
        }
    }
}

/// Transport actually in use after resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveTransport {
    Push,
    Pull,
}

impl ActiveTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveTransport::Push => "push",
            ActiveTransport::Pull => "pull",
        }
    }
}

/// Resolve `auto` by probing the sidecar health endpoint
pub async fn resolve(mode: TransportMode, sidecar_health_url: &str, timeout: Duration) -> ActiveTransport {
    match mode {
        TransportMode::Push => ActiveTransport::Push,
        TransportMode::Pull => ActiveTransport::Pull,
        TransportMode::Auto => {
            if sidecar_reachable(sidecar_health_url, timeout).await {
                tracing::info!(url = %sidecar_health_url, "Push sidecar reachable; using push transport");
                ActiveTransport::Push
            } else {
                tracing::info!(url = %sidecar_health_url, "Push sidecar unreachable; using pull transport");
                ActiveTransport::Pull
            }
        }
    }
}

async fn sidecar_reachable(url: &str, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to build probe client");
            return false;
        }
    };

    match client.get(url).send().await {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            tracing::debug!(error = %e, "Sidecar probe failed");
            false
        }
    }
}
