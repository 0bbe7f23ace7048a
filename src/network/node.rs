use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{
    sync::{mpsc::Sender, oneshot, Mutex},
    time::timeout,
};
use tracing::{debug, warn};

use super::message::{Body, Message};
use crate::{
    common::{Error, Result},
    protocol::peers::Peers,
};

/// Handle a running node uses to talk to the rest of the cluster.
///
/// Outbound messages go into `outbound`; whoever owns the other end (the
/// stdout writer, or the in-memory network in tests) delivers them.
pub struct Node {
    peers: Peers,
    outbound: Sender<Message>,
    next_msg_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Body>>>,
    rpc_timeout: Duration,
}

impl Node {
    pub fn new(peers: Peers, outbound: Sender<Message>, rpc_timeout: Duration) -> Self {
        Node {
            peers,
            outbound,
            next_msg_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            rpc_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.peers.local
    }

    pub fn peers(&self) -> &Peers {
        &self.peers
    }

    /// Fire-and-forget. An `Err` only means the message never left this node.
    pub async fn send(&self, dest: &str, body: Body) -> Result<()> {
        let message = Message::new(self.id(), dest, body);
        self.outbound
            .send(message)
            .await
            .map_err(|_| Error::TransportClosed)
    }

    pub async fn reply(&self, request: &Message, mut body: Body) -> Result<()> {
        let Some(msg_id) = request.body.msg_id else {
            debug!(kind = %request.body.kind, src = %request.src, "request has no msg_id, not replying");
            return Ok(());
        };
        body.in_reply_to = Some(msg_id);
        self.send(&request.src, body).await
    }

    /// Sends a request and waits for its reply. Error replies come back as
    /// ordinary bodies; interpreting them is up to the caller.
    pub async fn rpc(&self, dest: &str, mut body: Body) -> Result<Body> {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        body.msg_id = Some(msg_id);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(msg_id, tx);

        if let Err(err) = self.send(dest, body).await {
            self.pending.lock().await.remove(&msg_id);
            return Err(err);
        }

        match timeout(self.rpc_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::TransportClosed),
            Err(_) => {
                self.pending.lock().await.remove(&msg_id);
                Err(Error::Timeout {
                    dest: dest.to_owned(),
                })
            }
        }
    }

    /// Hands an inbound reply to the rpc waiting on it. Returns false when
    /// nobody is waiting (late reply after a timeout, or a stray id).
    pub async fn resolve(&self, reply: Message) -> bool {
        let Some(in_reply_to) = reply.body.in_reply_to else {
            return false;
        };

        match self.pending.lock().await.remove(&in_reply_to) {
            Some(waiter) => waiter.send(reply.body).is_ok(),
            None => {
                warn!(in_reply_to, src = %reply.src, "no rpc waiting for reply");
                false
            }
        }
    }
}
