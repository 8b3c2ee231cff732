use std::time::Duration;

use crate::{A_PARAM, EVENT_QUEUE_LEN, K_PARAM, ROUND_TIMEOUT, TIMEOUT};

/// Tunables of a node. [Config::default] gives the classic Kademlia values.
#[derive(Clone, Debug)]
pub struct Config {
    /// Bucket capacity and size of lookup results.
    pub k: usize,
    /// Concurrent calls per lookup round.
    pub alpha: usize,
    /// Upper bound for a single outbound call.
    pub rpc_timeout: Duration,
    /// Upper bound for one lookup round; late answers are ignored.
    pub round_timeout: Duration,
    /// Capacity of the coordinator's event queue.
    pub event_queue_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            k: K_PARAM,
            alpha: A_PARAM,
            rpc_timeout: Duration::from_millis(TIMEOUT),
            round_timeout: Duration::from_millis(ROUND_TIMEOUT),
            event_queue_len: EVENT_QUEUE_LEN,
        }
    }
}

impl Config {
    pub fn k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha.max(1);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = timeout;
        self
    }

    pub fn event_queue_len(mut self, len: usize) -> Self {
        self.event_queue_len = len.max(1);
        self
    }
}
