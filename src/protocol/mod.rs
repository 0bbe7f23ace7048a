pub mod broadcast;
pub mod counter;
pub mod gcounter;
pub mod payload;
pub mod peers;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::{
    common::Result,
    network::message::{Body, Message},
};

pub use broadcast::BroadcastEngine;
pub use counter::CounterEngine;
pub use gcounter::GCounter;
pub use peers::Peers;

/// A replicated service driven by inbound messages.
///
/// `handle` is called concurrently, once per request, from independent tasks.
/// `Ok(Some(body))` is sent back to the requester, `Ok(None)` means the
/// message needs no answer, and `Err` becomes an `error` reply.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn handle(&self, request: &Message) -> Result<Option<Body>>;

    /// Spawns the service's background tasks, if any. Called once, right after
    /// the node is initialized.
    fn start(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        Vec::new()
    }
}

/// Outcome of pushing one message to every peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    pub sent: usize,
    pub failed: usize,
}
