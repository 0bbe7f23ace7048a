use std::{env::var, sync::Arc};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{stdin, stdout, BufReader};
use tracing_subscriber::{fmt::layer, prelude::*, registry, EnvFilter};

use gossip_node::{
    common::NodeConfig,
    network::Runtime,
    protocol::{BroadcastEngine, CounterEngine, Service},
    store::SeqKv,
};

#[derive(Parser)]
#[command(name = "gossip-node")]
#[command(about = "Replicated broadcast and grow-only counter node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    workload: Workload,

    #[command(flatten)]
    config: NodeConfig,
}

#[derive(Subcommand)]
enum Workload {
    /// Disseminate values to every node and serve reads of the seen set
    Broadcast,
    /// Grow-only counter with periodic anti-entropy
    Counter,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let cli = Cli::parse();
    let runtime = Runtime::new(cli.config.clone());
    let input = BufReader::new(stdin());

    match cli.workload {
        Workload::Broadcast => {
            runtime
                .run(input, stdout(), |node| {
                    Arc::new(BroadcastEngine::new(node)) as Arc<dyn Service>
                })
                .await?
        }
        Workload::Counter => {
            let config = cli.config;
            runtime
                .run(input, stdout(), move |node| {
                    let store = Arc::new(SeqKv::new(node.clone(), config.kv_service.clone()));
                    Arc::new(CounterEngine::new(
                        node,
                        store,
                        config.anti_entropy_interval(),
                    )) as Arc<dyn Service>
                })
                .await?
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout carries the protocol.
fn setup() -> Result<()> {
    let directives = match var("RUST_LOG") {
        Ok(value) if !value.trim().is_empty() => value,
        _ => "gossip_node=info".to_owned(),
    };

    registry()
        .with(EnvFilter::builder().parse(directives)?)
        .with(layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
