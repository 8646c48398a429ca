use clap::Parser;
use cotas_client::MessageCatalog;
use cotas_tests::Scenario;
use std::{path::PathBuf, sync::Arc};

/// Run a broker with provider and consumer populations over loopback
#[derive(Parser, Debug)]
#[command(name = "cotas-scenario")]
struct Args {
    /// Scenario description (TOML)
    #[arg(long, default_value = "cotas-tests/data/scenario.toml")]
    scenario: PathBuf,

    /// Message catalog (JSON)
    #[arg(long, default_value = "cotas-tests/data/messages.json")]
    catalog: PathBuf,
}

#[actix::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    log::info!("Loading scenario {}", args.scenario.display());
    let scenario = Scenario::load(&args.scenario).map_err(|e| {
        log::error!("Error loading scenario {e:}");
        e
    })?;
    let catalog = Arc::new(MessageCatalog::load(&args.catalog)?);

    let report = cotas_tests::run(&scenario, catalog).await?;
    println!("{report:?}");
    Ok(())
}
