use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    payload::{
        ReadMessages, TopologyRequest, Value, ValueNotice, BROADCAST, BROADCAST_OK, PROPAGATE,
        READ, READ_OK, TOPOLOGY, TOPOLOGY_OK,
    },
    FanOut, Service,
};
use crate::{
    common::{Error, Result},
    network::{
        message::{Body, Message},
        node::Node,
    },
};

/*
    Values enter through `broadcast`, get recorded once and are pushed to
    every other node as `propagate` notices. Receivers record and stop there:
    there is one round of dissemination and no relaying, so a dropped notice
    is never repaired. Supplied topologies are accepted and ignored; fan-out
    always covers the whole roster.
*/

pub struct BroadcastEngine {
    node: Arc<Node>,
    seen: Mutex<BTreeSet<Value>>,
}

impl BroadcastEngine {
    pub fn new(node: Arc<Node>) -> Self {
        BroadcastEngine {
            node,
            seen: Mutex::new(BTreeSet::new()),
        }
    }

    /// Records a locally submitted value and, if it is new, pushes it to every
    /// peer. Sends are not acknowledged or retried.
    pub async fn submit(&self, value: Value) -> Result<FanOut> {
        let fresh = self.seen.lock().await.insert(value);
        if !fresh {
            debug!(value, "value already seen, not propagating");
            return Ok(FanOut::default());
        }

        let notice = Body::from_payload(PROPAGATE, &ValueNotice { message: value })?;
        let mut fan_out = FanOut::default();
        for peer in self.node.peers().others() {
            match self.node.send(peer, notice.clone()).await {
                Ok(()) => fan_out.sent += 1,
                Err(err) => {
                    warn!(value, peer, %err, "failed to propagate value");
                    fan_out.failed += 1;
                }
            }
        }
        debug!(value, sent = fan_out.sent, failed = fan_out.failed, "propagated value");

        Ok(fan_out)
    }

    /// Returns whether the value was new to this node.
    pub async fn receive_propagate(&self, value: Value) -> bool {
        self.seen.lock().await.insert(value)
    }

    pub async fn read(&self) -> Vec<Value> {
        self.seen.lock().await.iter().copied().collect()
    }

    pub fn configure_topology(&self, request: &TopologyRequest) {
        debug!(
            neighbours = request.topology.get(self.node.id()).map(Vec::len).unwrap_or(0),
            "ignoring topology, fanning out to the full roster"
        );
    }
}

#[async_trait]
impl Service for BroadcastEngine {
    async fn handle(&self, request: &Message) -> Result<Option<Body>> {
        match request.body.kind.as_str() {
            BROADCAST => {
                let notice: ValueNotice = request.body.parse()?;
                self.submit(notice.message).await?;
                Ok(Some(Body::new(BROADCAST_OK)))
            }
            PROPAGATE => {
                let notice: ValueNotice = request.body.parse()?;
                if self.receive_propagate(notice.message).await {
                    debug!(value = notice.message, src = %request.src, "recorded propagated value");
                }
                Ok(None)
            }
            READ => {
                let messages = self.read().await;
                Ok(Some(Body::from_payload(READ_OK, &ReadMessages { messages })?))
            }
            TOPOLOGY => {
                let topology: TopologyRequest = request.body.parse()?;
                self.configure_topology(&topology);
                Ok(Some(Body::new(TOPOLOGY_OK)))
            }
            other => Err(Error::NotSupported(other.to_owned())),
        }
    }
}
