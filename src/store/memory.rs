use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::KvStore;
use crate::common::{Error, Result};

/// Process-local store with the same semantics as `seq-kv`.
#[derive(Default)]
pub struct MemoryKv {
    values: Mutex<HashMap<String, u64>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        MemoryKv::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn read_int(&self, key: &str) -> Result<u64> {
        self.values
            .lock()
            .await
            .get(key)
            .copied()
            .ok_or_else(|| Error::KeyDoesNotExist(key.to_owned()))
    }

    async fn write_int(&self, key: &str, value: u64) -> Result<()> {
        self.values.lock().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        from: u64,
        to: u64,
        create_if_missing: bool,
    ) -> Result<()> {
        let mut values = self.values.lock().await;
        match values.get_mut(key) {
            Some(current) if *current == from => {
                *current = to;
                Ok(())
            }
            Some(current) => Err(Error::PreconditionFailed(format!(
                "expected {from}, found {current}"
            ))),
            None if create_if_missing => {
                values.insert(key.to_owned(), to);
                Ok(())
            }
            None => Err(Error::KeyDoesNotExist(key.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_missing() {
        let kv = MemoryKv::new();
        assert!(matches!(kv.read_int("n1").await, Err(Error::KeyDoesNotExist(_))));

        kv.write_int("n1", 4).await.unwrap();
        assert_eq!(kv.read_int("n1").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let kv = MemoryKv::new();

        assert!(matches!(
            kv.compare_and_swap("n1", 0, 1, false).await,
            Err(Error::KeyDoesNotExist(_))
        ));
        kv.compare_and_swap("n1", 0, 1, true).await.unwrap();
        kv.compare_and_swap("n1", 1, 5, false).await.unwrap();
        assert!(matches!(
            kv.compare_and_swap("n1", 1, 6, true).await,
            Err(Error::PreconditionFailed(_))
        ));
        assert_eq!(kv.read_int("n1").await.unwrap(), 5);
    }
}
