//! Clients of the cotas broker.
//!
//! A [`Provider`] is a smart object: it subscribes with the document its
//! category prescribes, then keeps pushing state updates, and serves its
//! current state to applications on its own [`ObjectServer`]. A [`Consumer`]
//! is an application: it searches the broker until an object matches, then
//! talks to that object directly.
//!
//! Both are split into a pure state machine ([`ProviderMachine`],
//! [`ConsumerMachine`]) and an async driver owning the socket and the tick
//! timer. Request documents come from a shared [`MessageCatalog`].
//!
//! # Examples
//! ```no_run
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = Arc::new(cotas_client::MessageCatalog::load("messages.json")?);
//!     let provider = cotas_client::Provider::spawn(
//!         cotas_client::ProviderConfig::default(),
//!         catalog,
//!     )
//!     .await?;
//!
//!     let mut state = provider.subscribe_state();
//!     state.changed().await?;
//!     log::info!("Provider is now {:?}", *state.borrow());
//!     Ok(())
//! }
//! ```

mod catalog;
mod consumer;
mod correlation;
mod object_server;
mod provider;

use cotas_pdu::{Correlation, Method, Pdu, PduError};
use serde_json::Value;
use thiserror::Error;

pub use catalog::{CatalogError, MessageCatalog};
pub use consumer::{Consumer, ConsumerConfig, ConsumerMachine, ConsumerState, Target};
pub use correlation::Outstanding;
pub use object_server::ObjectServer;
pub use provider::{Provider, ProviderConfig, ProviderMachine, ProviderState};

/// Route applications use when addressing an object directly
pub const OBJECT_PATH: &str = "/object";

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("PDU Error")]
    Pdu(#[from] PduError),
    #[error("Catalog Error")]
    Catalog(#[from] CatalogError),
    #[error("JSON Error")]
    Json(#[from] serde_json::Error),
}

/// A request a state machine wants sent
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub method: Method,
    pub path: &'static str,
    pub payload: Value,
}

impl Outbound {
    pub fn encode(&self, correlation: Correlation, max_pdu_size: usize) -> Result<Vec<u8>, ClientError> {
        let payload = serde_json::to_vec(&self.payload)?;
        Ok(Pdu::request(self.method, self.path, correlation, payload).encode(max_pdu_size)?)
    }
}
