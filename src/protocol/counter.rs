use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use super::{
    gcounter::{merge_slot, GCounter},
    payload::{AddRequest, CounterNotice, ReadValue, ADD, ADD_OK, PROPAGATE, READ, READ_OK},
    FanOut, Service,
};
use crate::{
    common::{Error, Result},
    network::{
        message::{Body, Message},
        node::Node,
    },
    store::KvStore,
};

/// Attempts at a single slot update before giving up under contention.
pub const MAX_CAS_ATTEMPTS: usize = 32;

/*
    One G-Counter slot per node, kept in the key-value store under the node's
    id. Nothing is cached here: every read goes back to the store.

    `add` only ever touches the local slot. A periodic anti-entropy round reads
    the whole vector and pushes it to every peer, which raise their slots to
    the pointwise maximum. Slots only move through compare-and-swap, so
    neither a concurrent `add` nor a stale merge (possibly from another node
    sharing the store) can lower a slot or drop an increment.
*/

pub struct CounterEngine {
    node: Arc<Node>,
    store: Arc<dyn KvStore>,
    merge_lock: Mutex<()>,
    interval: Duration,
}

impl CounterEngine {
    pub fn new(node: Arc<Node>, store: Arc<dyn KvStore>, interval: Duration) -> Self {
        CounterEngine {
            node,
            store,
            merge_lock: Mutex::new(()),
            interval,
        }
    }

    /// A slot that was never written counts as zero. Any other failure is
    /// returned rather than guessed at.
    async fn slot(&self, node: &str) -> Result<u64> {
        match self.store.read_int(node).await {
            Ok(value) => Ok(value),
            Err(Error::KeyDoesNotExist(_)) => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Compare-and-swap loop over one slot. `step` maps the current value to
    /// the next one, or `None` to leave the slot alone.
    async fn update_slot<F>(&self, node: &str, step: F) -> Result<Option<u64>>
    where
        F: Fn(u64) -> Result<Option<u64>> + Send + Sync,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.slot(node).await?;
            let Some(next) = step(current)? else {
                return Ok(None);
            };

            match self.store.compare_and_swap(node, current, next, true).await {
                Ok(()) => return Ok(Some(next)),
                Err(Error::PreconditionFailed(reason)) => {
                    debug!(node, attempt, %reason, "slot changed underneath us, retrying");
                }
                Err(err) => return Err(err),
            }
        }

        Err(Error::PreconditionFailed(format!(
            "slot `{node}` still contended after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    /// Adds `delta` to this node's own slot and returns the new slot value.
    pub async fn add(&self, delta: u64) -> Result<u64> {
        let local = self.node.id();
        if delta == 0 {
            return self.slot(local).await;
        }

        let next = self
            .update_slot(local, |current| {
                current
                    .checked_add(delta)
                    .map(Some)
                    .ok_or_else(|| Error::Overflow(local.to_owned()))
            })
            .await?;

        // `step` always yields a value for a non-zero delta.
        next.ok_or_else(|| Error::Overflow(local.to_owned()))
    }

    /// Raises each known slot to at least the value in `vector`. Returns the
    /// number of slots that moved.
    pub async fn merge(&self, vector: &GCounter) -> Result<usize> {
        let _guard = self.merge_lock.lock().await;

        let incoming: GCounter = vector
            .iter()
            .filter(|(node, _)| {
                let known = self.node.peers().is_member(node);
                if !known {
                    warn!(node, "ignoring counter for node outside the roster");
                }
                known
            })
            .map(|(node, slot)| (node.to_owned(), slot))
            .collect();

        let current = self.vector().await?;
        let mut target = current.clone();
        if target.merge(&incoming) == 0 {
            return Ok(0);
        }

        // Another writer may have moved a slot since `current` was read, so
        // each raise is still a compare-and-swap against the live value.
        let mut raised = 0;
        for (node, goal) in target.iter() {
            if goal == current.get(node) {
                continue;
            }
            if self
                .update_slot(node, |mine| Ok(merge_slot(mine, goal)))
                .await?
                .is_some()
            {
                raised += 1;
            }
        }

        Ok(raised)
    }

    /// Current slot of every node in the roster.
    pub async fn vector(&self) -> Result<GCounter> {
        let mut slots = Vec::with_capacity(self.node.peers().len());
        for member in &self.node.peers().members {
            slots.push((member.clone(), self.slot(member).await?));
        }
        Ok(slots.into_iter().collect())
    }

    pub async fn read(&self) -> Result<u64> {
        self.vector().await?.value()
    }

    /// One anti-entropy round: push the full vector to every peer.
    pub async fn gossip(&self) -> Result<FanOut> {
        let counters = self.vector().await?;
        let notice = Body::from_payload(PROPAGATE, &CounterNotice { counters })?;

        let mut fan_out = FanOut::default();
        for peer in self.node.peers().others() {
            match self.node.send(peer, notice.clone()).await {
                Ok(()) => fan_out.sent += 1,
                Err(err) => {
                    warn!(peer, %err, "failed to send counters");
                    fan_out.failed += 1;
                }
            }
        }

        Ok(fan_out)
    }

    /// Runs `gossip` every `interval` until the task is aborted. The first
    /// round happens one interval after start.
    pub fn spawn_anti_entropy(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(node = self.node.id(), interval = ?self.interval, "anti-entropy started");

            loop {
                ticker.tick().await;
                match self.gossip().await {
                    Ok(fan_out) => {
                        debug!(sent = fan_out.sent, failed = fan_out.failed, "anti-entropy round")
                    }
                    Err(err) => warn!(%err, "anti-entropy round failed"),
                }
            }
        })
    }
}

#[async_trait]
impl Service for CounterEngine {
    async fn handle(&self, request: &Message) -> Result<Option<Body>> {
        match request.body.kind.as_str() {
            ADD => {
                let add: AddRequest = request.body.parse()?;
                let slot = self.add(add.delta).await?;
                debug!(delta = add.delta, slot, "added");
                Ok(Some(Body::new(ADD_OK)))
            }
            PROPAGATE => {
                let notice: CounterNotice = request.body.parse()?;
                let raised = self.merge(&notice.counters).await?;
                debug!(src = %request.src, raised, "merged counters");
                Ok(None)
            }
            READ => {
                let value = self.read().await?;
                Ok(Some(Body::from_payload(READ_OK, &ReadValue { value })?))
            }
            other => Err(Error::NotSupported(other.to_owned())),
        }
    }

    fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![self.spawn_anti_entropy()]
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tokio::sync::mpsc::{self, Receiver};

    use super::*;
    use crate::{
        network::message::ErrorCode,
        protocol::peers::Peers,
        store::{KvStore, MemoryKv},
    };

    fn engine(store: Arc<MemoryKv>, interval: Duration) -> (Arc<CounterEngine>, Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        let peers = Peers::new("n1", vec!["n1".into(), "n2".into(), "n3".into()]);
        let node = Arc::new(Node::new(peers, tx, Duration::from_secs(1)));
        (Arc::new(CounterEngine::new(node, store, interval)), rx)
    }

    fn counters(slots: &[(&str, u64)]) -> GCounter {
        slots.iter().map(|(n, v)| (n.to_string(), *v)).collect()
    }

    #[tokio::test]
    async fn test_add_then_read() {
        let (engine, _rx) = engine(Arc::new(MemoryKv::new()), Duration::from_secs(5));

        assert_eq!(engine.read().await.unwrap(), 0);
        assert_eq!(engine.add(5).await.unwrap(), 5);
        assert_eq!(engine.add(0).await.unwrap(), 5);
        assert_eq!(engine.add(2).await.unwrap(), 7);
        assert_eq!(engine.read().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_concurrent_adds_are_not_lost() {
        let (engine, _rx) = engine(Arc::new(MemoryKv::new()), Duration::from_secs(5));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.add(1).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(engine.read().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_merge_takes_pointwise_max() {
        let store = Arc::new(MemoryKv::new());
        let (engine, _rx) = engine(store.clone(), Duration::from_secs(5));
        engine.add(4).await.unwrap();
        store.write_int("n2", 10).await.unwrap();

        let raised = engine.merge(&counters(&[("n1", 1), ("n2", 6), ("n3", 3)])).await.unwrap();
        assert_eq!(raised, 1);
        assert_eq!(engine.vector().await.unwrap(), counters(&[("n1", 4), ("n2", 10), ("n3", 3)]));

        // Same vector again changes nothing.
        assert_eq!(engine.merge(&counters(&[("n3", 3)])).await.unwrap(), 0);
        assert_eq!(engine.read().await.unwrap(), 17);
    }

    #[tokio::test]
    async fn test_read_overflow_is_an_error() {
        let store = Arc::new(MemoryKv::new());
        let (engine, _rx) = engine(store.clone(), Duration::from_secs(5));
        store.write_int("n2", u64::MAX).await.unwrap();
        engine.add(1).await.unwrap();

        let err = engine.read().await.unwrap_err();
        assert!(matches!(err, Error::Overflow(_)));
        assert_eq!(err.code(), ErrorCode::Crash);
    }

    #[tokio::test]
    async fn test_merge_ignores_unknown_nodes() {
        let store = Arc::new(MemoryKv::new());
        let (engine, _rx) = engine(store.clone(), Duration::from_secs(5));

        assert_eq!(engine.merge(&counters(&[("n9", 100)])).await.unwrap(), 0);
        assert!(store.read_int("n9").await.is_err());
        assert_eq!(engine.read().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_gossip_sends_vector_to_peers() {
        let (engine, mut rx) = engine(Arc::new(MemoryKv::new()), Duration::from_secs(5));
        engine.add(3).await.unwrap();

        assert_eq!(engine.gossip().await.unwrap(), FanOut { sent: 2, failed: 0 });
        for dest in ["n2", "n3"] {
            let message = rx.recv().await.unwrap();
            assert_eq!(message.dest, dest);
            assert_eq!(message.body.kind, PROPAGATE);
            let notice: CounterNotice = message.body.parse().unwrap();
            assert_eq!(notice.counters, counters(&[("n1", 3), ("n2", 0), ("n3", 0)]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_anti_entropy_ticks() {
        let (engine, mut rx) = engine(Arc::new(MemoryKv::new()), Duration::from_secs(5));
        engine.add(2).await.unwrap();

        let started = Instant::now();
        let task = engine.clone().start().pop().unwrap();

        let first = rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(first.body.parse::<CounterNotice>().unwrap().counters.get("n1"), 2);
        rx.recv().await.unwrap();

        engine.add(1).await.unwrap();
        let next = rx.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(next.body.parse::<CounterNotice>().unwrap().counters.get("n1"), 3);

        task.abort();
    }

    #[tokio::test]
    async fn test_handle_requests() {
        let (engine, _rx) = engine(Arc::new(MemoryKv::new()), Duration::from_secs(5));

        let request = Message::new("c1", "n1", Body::new(ADD).with("delta", 5));
        assert_eq!(engine.handle(&request).await.unwrap().unwrap().kind, ADD_OK);

        let request = Message::new(
            "n2",
            "n1",
            Body::new(PROPAGATE).with("counters", serde_json::json!({"n2": 4})),
        );
        assert_eq!(engine.handle(&request).await.unwrap(), None);

        let request = Message::new("c1", "n1", Body::new(READ));
        let reply = engine.handle(&request).await.unwrap().unwrap();
        assert_eq!(reply.parse::<ReadValue>().unwrap().value, 9);

        let request = Message::new("c1", "n1", Body::new(ADD).with("delta", -2));
        let err = engine.handle(&request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedRequest);

        let request = Message::new("n2", "n1", Body::new(PROPAGATE).with("counters", 4));
        let err = engine.handle(&request).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedRequest);
    }

    struct FailingKv;

    #[async_trait]
    impl KvStore for FailingKv {
        async fn read_int(&self, key: &str) -> Result<u64> {
            Err(Error::Timeout { dest: format!("seq-kv/{key}") })
        }

        async fn write_int(&self, _key: &str, _value: u64) -> Result<()> {
            Err(Error::TransportClosed)
        }

        async fn compare_and_swap(
            &self,
            _key: &str,
            _from: u64,
            _to: u64,
            _create_if_missing: bool,
        ) -> Result<()> {
            Err(Error::TransportClosed)
        }
    }

    #[tokio::test]
    async fn test_store_failures_propagate() {
        let (tx, _rx) = mpsc::channel(8);
        let peers = Peers::new("n1", vec!["n1".into(), "n2".into()]);
        let node = Arc::new(Node::new(peers, tx, Duration::from_secs(1)));
        let engine = CounterEngine::new(node, Arc::new(FailingKv), Duration::from_secs(5));

        assert_eq!(engine.read().await.unwrap_err().code(), ErrorCode::Timeout);
        assert_eq!(engine.add(1).await.unwrap_err().code(), ErrorCode::Timeout);
        assert!(engine.gossip().await.is_err());
    }

    fn arb_vectors() -> impl Strategy<Value = Vec<GCounter>> {
        let slot = (
            prop::sample::select(vec!["n1", "n2", "n3", "n9"]).prop_map(String::from),
            0u64..1_000,
        );
        prop::collection::vec(
            prop::collection::vec(slot, 0..4).prop_map(|slots| slots.into_iter().collect::<GCounter>()),
            0..6,
        )
    }

    proptest! {
        #[test]
        fn prop_merge_order_does_not_matter(vectors in arb_vectors()) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let (forward, backward) = runtime.block_on(async {
                let (a, _rx_a) = engine(Arc::new(MemoryKv::new()), Duration::from_secs(5));
                let (b, _rx_b) = engine(Arc::new(MemoryKv::new()), Duration::from_secs(5));
                for vector in &vectors {
                    a.merge(vector).await.unwrap();
                }
                for vector in vectors.iter().rev() {
                    b.merge(vector).await.unwrap();
                    // Redelivery is harmless.
                    b.merge(vector).await.unwrap();
                }
                (a.vector().await.unwrap(), b.vector().await.unwrap())
            });

            let mut expected = counters(&[("n1", 0), ("n2", 0), ("n3", 0)]);
            for vector in &vectors {
                let known: GCounter = vector
                    .iter()
                    .filter(|(node, _)| *node != "n9")
                    .map(|(node, slot)| (node.to_owned(), slot))
                    .collect();
                expected.merge(&known);
            }

            prop_assert_eq!(&forward, &backward);
            prop_assert_eq!(forward, expected);
        }
    }
}
