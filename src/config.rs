use clap::Parser;
use std::time::Duration;

use crate::normalize::EffortPolicy;
use crate::registry::KeyBackend;
use crate::upstream::{DEFAULT_MODEL, DEFAULT_UPSTREAM_URL};

/// Command-line and environment configuration for the gateway binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "lxd-gateway", version, about)]
pub struct GatewayConfig {
    /// Address the HTTP server binds to.
    #[arg(long = "bind", env = "LXD_BIND_ADDR", default_value = "0.0.0.0:8088")]
    pub bind_addr: String,

    /// Inference worker URL.
    #[arg(long, env = "LXD_UPSTREAM_URL", default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream_url: String,

    /// Model identifier sent upstream.
    #[arg(long, env = "LXD_UPSTREAM_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Upstream timeout in seconds. Bounds the whole buffered exchange and the header wait of a stream.
    #[arg(long, env = "LXD_UPSTREAM_TIMEOUT_SECONDS", default_value_t = 60)]
    pub upstream_timeout_secs: u64,

    /// Key registry backend: "redis://...", "sled:<path>" or "memory".
    #[arg(long, env = "LXD_KEYS_BACKEND", default_value = "sled:./data/keys.db")]
    pub keys_backend: String,

    /// Keys loaded into the memory backend at startup (development only).
    #[arg(long, env = "LXD_SEED_KEYS", value_delimiter = ',')]
    pub seed_keys: Vec<String>,

    /// "passthrough", "fixed:<level>" or "ceiling:<level>".
    #[arg(long, env = "LXD_EFFORT_POLICY", default_value = "passthrough")]
    pub effort_policy: String,
}

impl GatewayConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs.max(1))
    }

    pub fn key_backend(&self) -> anyhow::Result<KeyBackend> {
        let backend = KeyBackend::from_spec(&self.keys_backend)
            .ok_or_else(|| anyhow::anyhow!("unsupported keys backend: {}", self.keys_backend))?;
        match backend {
            KeyBackend::Memory { .. } => Ok(KeyBackend::Memory {
                seed: self
                    .seed_keys
                    .iter()
                    .map(|k| k.trim().to_string())
                    .filter(|k| !k.is_empty())
                    .collect(),
            }),
            other => {
                if !self.seed_keys.is_empty() {
                    tracing::warn!("LXD_SEED_KEYS is ignored for persistent key backends");
                }
                Ok(other)
            }
        }
    }

    pub fn effort_policy(&self) -> anyhow::Result<EffortPolicy> {
        EffortPolicy::from_spec(&self.effort_policy)
            .ok_or_else(|| anyhow::anyhow!("invalid effort policy: {}", self.effort_policy))
    }
}
