use clap::Parser;
use cotas_client::{MessageCatalog, Provider, ProviderConfig};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

/// Simulated smart object: subscribes to the broker and pushes state updates
#[derive(Parser, Debug)]
#[command(name = "cotas-provider")]
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

    /// Port of the object server, 0 for any free port
    #[arg(long, default_value = "0")]
    object_port: u16,

    /// Object category, indexes the catalog
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

    /// Number of providers to run in this process
    #[arg(long, default_value = "1")]
    count: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let catalog = Arc::new(MessageCatalog::load(&args.catalog)?);

    let mut providers = Vec::with_capacity(args.count);
    for _ in 0..args.count {
        let config = ProviderConfig {
            broker: args.broker,
            bind: args.bind,
            // A fixed port can only be bound once
            object_port: if args.count > 1 { 0 } else { args.object_port },
            category: args.category,
            interval: Duration::from_millis(args.interval),
            max_sends: args.max_sends,
            backoff_ticks: args.backoff_ticks,
            ..Default::default()
        };
        let provider = Provider::spawn(config, catalog.clone())
            .await
            .map_err(|e| {
                log::error!("Error starting provider {e:}");
                e
            })?;
        log::info!("Provider serving state on {}", provider.object_addr());
        providers.push(provider);
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Stopping {} providers", providers.len());
    Ok(())
}
