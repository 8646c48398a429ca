use cotas_pdu::{BROKER_PORT, DEFAULT_MAX_PDU_SIZE};
use serde_json::Value;
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::Path,
};

use crate::{store::FusekiConfig, BrokerError};

/// Which triple store backs the broker
#[derive(Debug, Clone)]
pub enum StoreConfig {
    Memory,
    Fuseki(FusekiConfig),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind: SocketAddr,
    pub store: StoreConfig,
    pub max_pdu_size: usize,
    /// Requests dispatched at once; the rest wait in the receive queue
    pub concurrency: usize,
    /// Bound on id resampling before a subscribe fails
    pub max_id_attempts: u32,
    /// Fixed rng seed for the id sequence
    pub id_seed: Option<u64>,
    /// Objects loaded into the registry and store before serving
    pub seed_documents: Vec<Value>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, BROKER_PORT)),
            store: StoreConfig::Memory,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            concurrency: 64,
            max_id_attempts: 1000,
            id_seed: None,
            seed_documents: Vec::new(),
        }
    }
}

/// Read seed documents: a JSON array of objects, or a single object
pub fn load_seed_file(path: impl AsRef<Path>) -> Result<Vec<Value>, BrokerError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        log::error!("Unable to read seed file {}: {e:}", path.display());
        e
    })?;
    match serde_json::from_str(&text)? {
        Value::Array(documents) => Ok(documents),
        document @ Value::Object(_) => Ok(vec![document]),
        _ => Err(BrokerError::Config(format!(
            "{} must hold a JSON array or object",
            path.display()
        ))),
    }
}
