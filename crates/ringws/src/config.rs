/// Configuration shared by workers, apps and the rings between them.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker (socket I/O) threads.
    pub worker_c: usize,
    /// Number of app threads.
    pub app_c: usize,
    /// Initial byte size of each app-to-worker ring.
    pub outbound_ring_buf_size: usize,
    /// Initial byte size of each worker-to-app ring.
    pub inbound_ring_buf_size: usize,
    /// Growth factor applied when a ring (or an app scratch buffer) must be
    /// enlarged to fit a contiguous write.
    pub realloc_multiplier: usize,
    /// Number of pending cursor publications an app batches up before
    /// flushing them to the shared cells.
    pub update_queue_size: usize,
    /// Upper bound on a single WebSocket message payload, inbound and
    /// outbound.
    pub max_ws_msg_size: usize,
    /// Cache line size used to align ring buffers. Pass the target's real
    /// LEVEL1_DCACHE_LINESIZE; an inaccurate guess costs throughput, not
    /// correctness.
    pub cache_line_size: usize,
}

impl Config {
    /// Creates a configuration with the given thread counts and the default
    /// sizing knobs.
    ///
    /// # Panics
    ///
    /// Panics if either count is 0 or exceeds 1024.
    pub fn new(worker_c: usize, app_c: usize) -> Self {
        assert!(
            worker_c > 0 && worker_c <= 1024,
            "worker_c must be between 1 and 1024"
        );
        assert!(app_c > 0 && app_c <= 1024, "app_c must be between 1 and 1024");
        Self {
            worker_c,
            app_c,
            ..Self::default()
        }
    }

    /// Validates the sizing knobs. Called once at server construction so the
    /// hot paths can assume a sane configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.worker_c == 0 || self.app_c == 0 {
            return Err("worker_c and app_c must both be at least 1");
        }
        if self.outbound_ring_buf_size < 64 || self.inbound_ring_buf_size < 64 {
            return Err("ring buffer sizes must be at least 64 bytes");
        }
        if self.realloc_multiplier < 2 {
            return Err("realloc_multiplier must be at least 2");
        }
        if self.update_queue_size == 0 {
            return Err("update_queue_size must be at least 1");
        }
        if self.max_ws_msg_size == 0 {
            return Err("max_ws_msg_size must be at least 1");
        }
        if !self.cache_line_size.is_power_of_two() {
            return Err("cache_line_size must be a power of two");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_c: 1,
            app_c: 1,
            outbound_ring_buf_size: 1 << 20,
            inbound_ring_buf_size: 1 << 20,
            realloc_multiplier: 2,
            update_queue_size: 64,
            max_ws_msg_size: 1 << 24,
            cache_line_size: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_degenerate_knobs() {
        let mut config = Config::default();
        config.realloc_multiplier = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache_line_size = 48;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.update_queue_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[should_panic(expected = "worker_c")]
    fn test_zero_workers_panics() {
        let _ = Config::new(0, 1);
    }
}
