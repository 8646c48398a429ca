use clap::Parser;
use cotas_client::{Consumer, ConsumerConfig, MessageCatalog};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

/// Simulated application: searches the broker, then addresses the match
#[derive(Parser, Debug)]
#[command(name = "cotas-consumer")]
#[command(version)]
struct Args {
    /// Message catalog (firstMessages / updateMessages / requestMessages)
    #[arg(long)]
    catalog: PathBuf,

    /// Broker address
    #[arg(long, default_value = "127.0.0.1:5683")]
    broker: SocketAddr,

    /// Local address to send from
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Application category, indexes the catalog's request messages
    #[arg(short, long, default_value = "0")]
    category: usize,

    /// Milliseconds between requests
    #[arg(short, long, default_value = "1000")]
    interval: u64,

    /// Requests to send, 0 for no limit
    #[arg(long, default_value = "0")]
    max_sends: u32,

    /// Ticks skipped after an error reply
    #[arg(long, default_value = "0")]
    backoff_ticks: u32,

    /// Search again after this many unanswered direct requests
    #[arg(long)]
    research_after: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let catalog = Arc::new(MessageCatalog::load(&args.catalog)?);
    let consumer = Consumer::spawn(
        ConsumerConfig {
            broker: args.broker,
            bind: args.bind,
            category: args.category,
            interval: Duration::from_millis(args.interval),
            max_sends: args.max_sends,
            backoff_ticks: args.backoff_ticks,
            research_after: args.research_after,
            ..Default::default()
        },
        catalog,
    )
    .await
    .map_err(|e| {
        log::error!("Error starting consumer {e:}");
        e
    })?;

    let mut state = consumer.subscribe_state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            res = state.changed() => {
                if res.is_err() {
                    break;
                }
                log::info!("Consumer state {:?}", *state.borrow());
            }
        }
    }
    Ok(())
}
