use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Q CLI binary, invoked as `<q_command> chat`.
    pub q_command: String,
    pub max_instances: usize,
    /// Quiet period after which buffered output counts as a complete reply.
    pub response_idle_timeout: Duration,
    /// How long the aggregator waits for the next output line per poll.
    pub read_poll_interval: Duration,
    /// How often a delivery loop drains an instance's output queue.
    pub bridge_poll_interval: Duration,
    /// Grace period between SIGTERM and SIGKILL when stopping an instance.
    pub stop_grace_period: Duration,
    /// Retained entries per in-memory history store.
    pub history_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            q_command: "q".to_string(),
            max_instances: 5,
            response_idle_timeout: Duration::from_secs(3),
            read_poll_interval: Duration::from_millis(100),
            bridge_poll_interval: Duration::from_millis(500),
            stop_grace_period: Duration::from_secs(5),
            history_limit: 1000,
        }
    }
}

impl Config {
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
