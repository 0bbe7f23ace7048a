use std::sync::Arc;

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc::{self, Receiver, Sender},
    task::JoinSet,
};
use tracing::{debug, info, warn};

use super::{
    message::{Body, InitRequest, Message, INIT, INIT_OK},
    node::Node,
};
use crate::{
    common::{Error, NodeConfig, Result},
    protocol::{peers::Peers, Service},
};

/*
    Lifecycle of a node process:

    1. Wait for `init`, answer `init_ok`, fix the roster.
    2. Build the service and start its background tasks.
    3. For every inbound line: replies go to the rpc waiting on them, anything
       else is handled in its own task.
    4. At end of input, let in-flight handlers finish, stop background tasks
       and flush whatever is still queued for output.
*/

pub struct Runtime {
    config: NodeConfig,
}

impl Runtime {
    pub fn new(config: NodeConfig) -> Self {
        Runtime { config }
    }

    pub async fn run<R, W, F>(&self, reader: R, writer: W, build: F) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
        F: FnOnce(Arc<Node>) -> Arc<dyn Service>,
    {
        let mut lines = InputLines::new(reader);
        let (tx, rx) = mpsc::channel(self.config.channel_capacity());
        let writer_task = tokio::spawn(write_loop(writer, rx));

        let Some(node) = self.await_init(&mut lines, tx).await? else {
            info!("input closed before init");
            return join_writer(writer_task).await;
        };
        info!(node = node.id(), members = node.peers().len(), "node initialized");

        let service = build(node.clone());
        let background = service.clone().start();
        let mut handlers = JoinSet::new();

        while let Some(line) = lines.next().await? {
            let Some(message) = decode(&line) else {
                continue;
            };

            if message.is_reply() {
                node.resolve(message).await;
                continue;
            }

            let node = node.clone();
            let service = service.clone();
            handlers.spawn(async move { dispatch(&node, service.as_ref(), message).await });

            while let Some(finished) = handlers.try_join_next() {
                if let Err(err) = finished {
                    warn!(%err, "handler task failed");
                }
            }
        }

        debug!(in_flight = handlers.len(), "input closed, draining handlers");
        while let Some(finished) = handlers.join_next().await {
            if let Err(err) = finished {
                warn!(%err, "handler task failed");
            }
        }
        for task in &background {
            task.abort();
        }
        for task in background {
            let _ = task.await;
        }

        // The writer stops once the last sender, owned by the node, is gone.
        drop(service);
        drop(node);
        join_writer(writer_task).await
    }

    async fn await_init<R>(
        &self,
        lines: &mut InputLines<R>,
        tx: Sender<Message>,
    ) -> Result<Option<Arc<Node>>>
    where
        R: AsyncBufRead + Unpin,
    {
        while let Some(line) = lines.next().await? {
            let Some(message) = decode(&line) else {
                continue;
            };
            if message.body.kind != INIT {
                warn!(kind = %message.body.kind, src = %message.src, "dropping message received before init");
                continue;
            }

            match message.body.parse::<InitRequest>() {
                Ok(init) => {
                    let peers = Peers::new(init.node_id, init.node_ids);
                    let node = Arc::new(Node::new(peers, tx, self.config.rpc_timeout()));
                    node.reply(&message, Body::new(INIT_OK)).await?;
                    return Ok(Some(node));
                }
                Err(err) => {
                    warn!(%err, "rejecting init");
                    let mut body = err.to_body();
                    body.in_reply_to = message.body.msg_id;
                    tx.send(Message::new(message.dest, message.src, body))
                        .await
                        .map_err(|_| Error::TransportClosed)?;
                }
            }
        }

        Ok(None)
    }
}

/// Newline-delimited input. Lines that are not valid UTF-8 are skipped like
/// any other undecodable line; only I/O errors end the stream.
struct InputLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> InputLines<R> {
    fn new(reader: R) -> Self {
        InputLines {
            reader,
            buf: Vec::new(),
        }
    }

    async fn next(&mut self) -> Result<Option<String>> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
                return Ok(None);
            }
            match String::from_utf8(std::mem::take(&mut self.buf)) {
                Ok(mut line) => {
                    line.truncate(line.trim_end_matches(['\n', '\r']).len());
                    return Ok(Some(line));
                }
                Err(err) => {
                    warn!(err = %err.utf8_error(), "skipping line that is not valid UTF-8");
                    self.buf = err.into_bytes();
                }
            }
        }
    }
}

/// Runs one request through `service` and sends back whatever it answers.
/// Failures become `error` replies; requests without a `msg_id` get nothing.
pub async fn dispatch(node: &Node, service: &dyn Service, request: Message) {
    debug!(kind = %request.body.kind, src = %request.src, "handling");

    let body = match service.handle(&request).await {
        Ok(Some(body)) => body,
        Ok(None) => return,
        Err(err) => {
            warn!(kind = %request.body.kind, src = %request.src, %err, "request failed");
            err.to_body()
        }
    };

    if let Err(err) = node.reply(&request, body).await {
        warn!(kind = %request.body.kind, src = %request.src, %err, "failed to reply");
    }
}

fn decode(line: &str) -> Option<Message> {
    if line.trim().is_empty() {
        return None;
    }
    match Message::from_line(line) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(%err, "skipping undecodable line");
            None
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: Receiver<Message>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = message.to_line()?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn join_writer(task: tokio::task::JoinHandle<Result<()>>) -> Result<()> {
    task.await.map_err(|err| Error::Io(std::io::Error::other(err)))?
}
