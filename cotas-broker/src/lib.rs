//! The `cotas-broker` crate is the context broker of the cotas system. Smart
//! objects subscribe to it and push their state, applications ask it which
//! objects match a criterion and then talk to those objects directly.
//!
//! The broker is built from the following pieces:
//! 1. A [`Registry`] actor that issues object ids, deduplicates subscriptions
//!    by source address and answers ownership checks for updates.
//! 2. A compiler ([`compiler`]) turning flat, path-keyed update documents
//!    into single atomic graph updates.
//! 3. A [`TripleStore`] adapter executing those updates and search queries,
//!    either against a Fuseki dataset ([`FusekiStore`]) or in process
//!    ([`MemoryStore`]).
//! 4. The [`Dispatcher`], mapping request paths to handlers, and the
//!    [`BrokerServer`], the datagram endpoint feeding it.
//!
//! # Examples
//! ```no_run
//! #[actix::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = cotas_broker::broker(cotas_broker::BrokerConfig::default())
//!         .await
//!         .map_err(|e| {
//!             log::error!("Error creating broker {e:}");
//!             e
//!         })?;
//!     log::info!("Serving on {}", broker.local_addr());
//!     tokio::signal::ctrl_c().await?;
//!     Ok(())
//! }
//! ```

pub mod compiler;
mod config;
mod registry;
mod router;
mod server;
pub mod store;

use actix::{Actor, Addr};
use std::{net::SocketAddr, sync::Arc};
use thiserror::Error;

pub use config::{load_seed_file, BrokerConfig, StoreConfig};
pub use registry::{
    Adopt, CheckOwnership, Confirm, Enroll, Enrollment, ObjectRegistration, Registry,
    RegistryError, Release,
};
pub use router::{DispatchError, Dispatcher};
pub use server::BrokerServer;
pub use store::{FusekiStore, MemoryStore, StoreError, TripleStore};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Store Error")]
    Store(#[from] StoreError),
    #[error("Dispatch Error")]
    Dispatch(#[from] DispatchError),
    #[error("JSON Error")]
    Json(#[from] serde_json::Error),
    #[error("Config Error {0}")]
    Config(String),
}

/// A running broker: the registry actor plus the server answering on
/// [`Broker::local_addr`]. Dropping it stops serving
pub struct Broker {
    server: BrokerServer,
    registry: Addr<Registry>,
    dispatcher: Dispatcher,
}

impl Broker {
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn registry(&self) -> Addr<Registry> {
        self.registry.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

/// Start a broker with the store named in `config`. Must run inside an
/// actix system
pub async fn broker(config: BrokerConfig) -> Result<Broker, BrokerError> {
    let store: Arc<dyn TripleStore> = match &config.store {
        StoreConfig::Memory => {
            log::info!("Using in-memory triple store");
            Arc::new(MemoryStore::new())
        }
        StoreConfig::Fuseki(fuseki) => {
            log::info!("Using Fuseki dataset {} at {}", fuseki.dataset, fuseki.base_url);
            Arc::new(FusekiStore::new(fuseki.clone())?)
        }
    };
    broker_with_store(config, store).await
}

/// Start a broker on a caller-provided store
pub async fn broker_with_store(
    config: BrokerConfig,
    store: Arc<dyn TripleStore>,
) -> Result<Broker, BrokerError> {
    let registry = match config.id_seed {
        Some(seed) => Registry::seeded(seed, config.max_id_attempts),
        None => Registry::new(config.max_id_attempts),
    }
    .start();
    let dispatcher = Dispatcher::new(registry.clone(), store);

    if !config.seed_documents.is_empty() {
        dispatcher
            .seed(&config.seed_documents)
            .await
            .map_err(|e| {
                log::error!("Unable to load seed graph {e:}");
                e
            })?;
    }

    let server = BrokerServer::bind(
        config.bind,
        config.max_pdu_size,
        config.concurrency,
        dispatcher.clone(),
    )
    .await?;

    Ok(Broker {
        server,
        registry,
        dispatcher,
    })
}
