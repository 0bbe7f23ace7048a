use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::KvStore;
use crate::{
    common::{Error, Result},
    network::{message::Body, node::Node},
};

/// Client for the sequentially consistent key-value service reachable as an
/// ordinary node (usually `seq-kv`).
pub struct SeqKv {
    node: Arc<Node>,
    service: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadRequest {
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadOk {
    pub value: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WriteRequest {
    pub key: String,
    pub value: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CasRequest {
    pub key: String,
    pub from: u64,
    pub to: u64,
    #[serde(default)]
    pub create_if_not_exists: bool,
}

impl SeqKv {
    pub fn new(node: Arc<Node>, service: impl Into<String>) -> Self {
        SeqKv {
            node,
            service: service.into(),
        }
    }

    async fn call<T: Serialize>(&self, key: &str, kind: &str, request: &T) -> Result<Body> {
        let reply = self
            .node
            .rpc(&self.service, Body::from_payload(kind, request)?)
            .await?;

        if reply.is_error() {
            return Err(Error::from_reply(key, &reply));
        }
        let expected = format!("{kind}_ok");
        if reply.kind != expected {
            return Err(Error::malformed(format!(
                "expected `{expected}` from {}, got `{}`",
                self.service, reply.kind
            )));
        }
        Ok(reply)
    }
}

#[async_trait]
impl KvStore for SeqKv {
    async fn read_int(&self, key: &str) -> Result<u64> {
        let request = ReadRequest { key: key.to_owned() };
        let reply = self.call(key, "read", &request).await?;
        Ok(reply.parse::<ReadOk>()?.value)
    }

    async fn write_int(&self, key: &str, value: u64) -> Result<()> {
        let request = WriteRequest {
            key: key.to_owned(),
            value,
        };
        self.call(key, "write", &request).await.map(|_| ())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        from: u64,
        to: u64,
        create_if_missing: bool,
    ) -> Result<()> {
        let request = CasRequest {
            key: key.to_owned(),
            from,
            to,
            create_if_not_exists: create_if_missing,
        };
        self.call(key, "cas", &request).await.map(|_| ())
    }
}
