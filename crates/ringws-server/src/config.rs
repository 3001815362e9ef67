use ringws::Config;
use serde::Deserialize;

/// Server-level configuration, loadable from a TOML file. The sizing knobs
/// mirror the core [`Config`]; the app count comes from the apps actually
/// registered, not from the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the listening socket binds to.
    pub listen: String,
    /// Number of socket I/O worker threads.
    pub worker_c: usize,
    /// Initial byte size of each app-to-worker ring.
    pub outbound_ring_buf_size: usize,
    /// Initial byte size of each worker-to-app ring.
    pub inbound_ring_buf_size: usize,
    /// Growth factor for rings and app scratch buffers.
    pub realloc_multiplier: usize,
    /// Cursor publications batched per app before a forced flush.
    pub update_queue_size: usize,
    /// Per-message payload cap, inbound and outbound.
    pub max_ws_msg_size: usize,
    /// Alignment for ring buffer allocations.
    pub cache_line_size: usize,
    /// PEM certificate chain; together with `key_path` turns on TLS.
    pub cert_path: Option<String>,
    /// PEM private key.
    pub key_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let core = Config::default();
        Self {
            listen: "127.0.0.1:8080".into(),
            worker_c: 1,
            outbound_ring_buf_size: core.outbound_ring_buf_size,
            inbound_ring_buf_size: core.inbound_ring_buf_size,
            realloc_multiplier: core.realloc_multiplier,
            update_queue_size: core.update_queue_size,
            max_ws_msg_size: core.max_ws_msg_size,
            cache_line_size: core.cache_line_size,
            cert_path: None,
            key_path: None,
        }
    }
}

impl ServerConfig {
    /// Parses a TOML config file.
    pub fn load(path: &str) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config file {path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| format!("cannot parse config file {path}: {e}"))
    }

    /// The core data-plane configuration for `app_c` registered apps.
    pub fn core(&self, app_c: usize) -> Config {
        Config {
            worker_c: self.worker_c,
            app_c,
            outbound_ring_buf_size: self.outbound_ring_buf_size,
            inbound_ring_buf_size: self.inbound_ring_buf_size,
            realloc_multiplier: self.realloc_multiplier,
            update_queue_size: self.update_queue_size,
            max_ws_msg_size: self.max_ws_msg_size,
            cache_line_size: self.cache_line_size,
        }
    }
}
