use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use tokio::sync::mpsc::{self, Receiver};
use tracing::debug;

use super::{
    message::{Body, ErrorCode, Message},
    node::Node,
    runtime::dispatch,
};
use crate::{
    common::{Error, NodeConfig, Result},
    protocol::{peers::Peers, Service},
};

/// What the simulated links do to messages in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Faults {
    pub drop_rate: f64,
    pub duplicate_rate: f64,
    pub reorder: bool,
}

/// Runs several nodes inside one process. Nothing moves until `deliver` is
/// called, so tests decide exactly when a round of messages lands.
pub struct MemoryNetwork {
    nodes: BTreeMap<String, Arc<Node>>,
    outbound: BTreeMap<String, Receiver<Message>>,
    services: BTreeMap<String, Arc<dyn Service>>,
    faults: Faults,
    rng: StdRng,
    undeliverable: Vec<Message>,
    next_client_msg_id: AtomicU64,
}

impl MemoryNetwork {
    pub fn new(ids: &[&str], config: &NodeConfig) -> Self {
        let members: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let mut nodes = BTreeMap::new();
        let mut outbound = BTreeMap::new();

        for id in &members {
            let (tx, rx) = mpsc::channel(config.channel_capacity());
            let peers = Peers::new(id.clone(), members.clone());
            nodes.insert(id.clone(), Arc::new(Node::new(peers, tx, config.rpc_timeout())));
            outbound.insert(id.clone(), rx);
        }

        MemoryNetwork {
            nodes,
            outbound,
            services: BTreeMap::new(),
            faults: Faults::default(),
            rng: StdRng::seed_from_u64(0),
            undeliverable: Vec::new(),
            next_client_msg_id: AtomicU64::new(1),
        }
    }

    pub fn with_faults(mut self, faults: Faults, seed: u64) -> Self {
        self.faults = faults;
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn set_faults(&mut self, faults: Faults) {
        self.faults = faults;
    }

    pub fn node(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes.get(id).cloned()
    }

    pub fn register(&mut self, id: &str, service: Arc<dyn Service>) {
        self.services.insert(id.to_owned(), service);
    }

    /// Calls `dest`'s service directly, the way a client request would arrive.
    /// Returns the body the node would have replied with.
    pub async fn request(&self, client: &str, dest: &str, mut body: Body) -> Result<Option<Body>> {
        let service = self.services.get(dest).ok_or_else(|| Error::Remote {
            code: ErrorCode::NodeNotFound,
            text: format!("no node `{dest}`"),
        })?;
        body.msg_id = Some(self.next_client_msg_id.fetch_add(1, Ordering::Relaxed));

        service.handle(&Message::new(client, dest, body)).await
    }

    /// Takes every message the nodes have sent since the last drain, without
    /// delivering them.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut batch = Vec::new();
        for rx in self.outbound.values_mut() {
            while let Ok(message) = rx.try_recv() {
                batch.push(message);
            }
        }
        batch
    }

    /// Messages addressed to something other than a registered node, such as
    /// replies to clients.
    pub fn undeliverable(&self) -> &[Message] {
        &self.undeliverable
    }

    /// Delivers one round: everything sent so far, after faults are applied.
    /// Messages sent while handling this round wait for the next one. Returns
    /// the number of messages handed to a node.
    pub async fn deliver(&mut self) -> usize {
        let batch = self.drain();
        let batch = self.perturb(batch);

        let mut delivered = 0;
        for message in batch {
            let (Some(node), Some(service)) =
                (self.nodes.get(&message.dest), self.services.get(&message.dest))
            else {
                self.undeliverable.push(message);
                continue;
            };

            delivered += 1;
            if message.is_reply() {
                node.resolve(message).await;
            } else {
                dispatch(node, service.as_ref(), message).await;
            }
        }
        delivered
    }

    /// Delivers rounds until the network is quiet or `max_rounds` is reached.
    pub async fn settle(&mut self, max_rounds: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_rounds {
            let delivered = self.deliver().await;
            if delivered == 0 {
                break;
            }
            total += delivered;
        }
        total
    }

    fn perturb(&mut self, batch: Vec<Message>) -> Vec<Message> {
        let drop_rate = self.faults.drop_rate.clamp(0.0, 1.0);
        let duplicate_rate = self.faults.duplicate_rate.clamp(0.0, 1.0);

        let mut out = Vec::with_capacity(batch.len());
        for message in batch {
            if self.rng.gen_bool(drop_rate) {
                debug!(src = %message.src, dest = %message.dest, kind = %message.body.kind, "dropped");
                continue;
            }
            if self.rng.gen_bool(duplicate_rate) {
                out.push(message.clone());
            }
            out.push(message);
        }
        if self.faults.reorder {
            out.shuffle(&mut self.rng);
        }
        out
    }
}
