use clap::Parser;
use cotas_broker::{store::FusekiConfig, BrokerConfig, StoreConfig};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

/// cotas context broker
#[derive(Parser, Debug)]
#[command(name = "cotas-broker")]
#[command(version)]
struct Args {
    /// Address to serve requests on
    #[arg(long, default_value = "0.0.0.0:5683")]
    bind: SocketAddr,

    /// Fuseki server root
    #[arg(long, default_value = "http://localhost:3030")]
    store_url: String,

    /// Fuseki dataset name
    #[arg(long, default_value = "dataset")]
    dataset: String,

    /// Keep the graph in process instead of using Fuseki
    #[arg(long)]
    memory_store: bool,

    /// Store request timeout in seconds
    #[arg(long, default_value = "10")]
    store_timeout: u64,

    /// Id samples tried before a subscribe fails
    #[arg(long, default_value = "1000")]
    max_id_attempts: u32,

    /// Fixed seed for the object id sequence
    #[arg(long)]
    id_seed: Option<u64>,

    /// JSON file of objects to register at start-up
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Largest PDU sent or accepted, in bytes
    #[arg(long, default_value = "1152")]
    max_pdu: usize,

    /// Requests dispatched concurrently
    #[arg(long, default_value = "64")]
    concurrency: usize,
}

#[actix::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let store = if args.memory_store {
        StoreConfig::Memory
    } else {
        StoreConfig::Fuseki(FusekiConfig {
            base_url: args.store_url,
            dataset: args.dataset,
            timeout: Duration::from_secs(args.store_timeout),
        })
    };

    let seed_documents = match &args.seed {
        Some(path) => cotas_broker::load_seed_file(path)?,
        None => Vec::new(),
    };

    let broker = cotas_broker::broker(BrokerConfig {
        bind: args.bind,
        store,
        max_pdu_size: args.max_pdu,
        concurrency: args.concurrency,
        max_id_attempts: args.max_id_attempts,
        id_seed: args.id_seed,
        seed_documents,
    })
    .await
    .map_err(|e| {
        log::error!("Error creating broker {e:}");
        e
    })?;

    log::info!("Broker up on {}", broker.local_addr());
    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    Ok(())
}
