pub mod memory;
pub mod seq_kv;

use async_trait::async_trait;

use crate::common::Result;

pub use memory::MemoryKv;
pub use seq_kv::SeqKv;

/// Integer key-value store, sequentially consistent per key. No cross-key
/// transactions.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fails with `KeyDoesNotExist` when the key was never written.
    async fn read_int(&self, key: &str) -> Result<u64>;

    async fn write_int(&self, key: &str, value: u64) -> Result<()>;

    /// Sets `key` to `to` only if it currently holds `from`. A missing key is
    /// created with `to` when `create_if_missing` is set. Fails with
    /// `PreconditionFailed` when the current value differs.
    async fn compare_and_swap(
        &self,
        key: &str,
        from: u64,
        to: u64,
        create_if_missing: bool,
    ) -> Result<()>;
}
