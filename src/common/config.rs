use std::time::Duration;

use clap::{builder::RangedU64ValueParser, Args};

pub const DEFAULT_ANTI_ENTROPY_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_KV_SERVICE: &str = "seq-kv";
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

#[derive(Debug, Clone, Args)]
pub struct NodeConfig {
    /// Period of the counter anti-entropy round, in milliseconds
    #[arg(long, default_value_t = DEFAULT_ANTI_ENTROPY_INTERVAL_MS)]
    pub anti_entropy_interval_ms: u64,

    /// How long an RPC waits for its reply, in milliseconds
    #[arg(long, default_value_t = DEFAULT_RPC_TIMEOUT_MS)]
    pub rpc_timeout_ms: u64,

    /// Node id of the key-value service
    #[arg(long, default_value = DEFAULT_KV_SERVICE)]
    pub kv_service: String,

    /// Capacity of the outbound message queue, at least 1
    #[arg(
        long,
        default_value_t = DEFAULT_CHANNEL_CAPACITY,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub channel_capacity: usize,
}

impl NodeConfig {
    pub fn anti_entropy_interval(&self) -> Duration {
        Duration::from_millis(self.anti_entropy_interval_ms.max(1))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// A zero-capacity channel cannot be built, so a config assembled in code
    /// gets at least one slot.
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            anti_entropy_interval_ms: DEFAULT_ANTI_ENTROPY_INTERVAL_MS,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
            kv_service: DEFAULT_KV_SERVICE.to_owned(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}
