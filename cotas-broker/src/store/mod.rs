//! Triple-store boundary. The broker only ever talks to the store through
//! [`TripleStore`]: select queries for search, and one [`GraphUpdate`] per
//! subscribe or update request. Implementations must apply an update as a
//! single atomic unit.

mod fuseki;
mod memory;

use async_trait::async_trait;
use std::{collections::HashMap, fmt};
use thiserror::Error;

use crate::compiler::{CompiledUpdate, GraphInsert, SelectQuery};

pub use fuseki::{FusekiConfig, FusekiStore};
pub use memory::MemoryStore;

/// One solution of a select query: variable name -> lexical value
pub type Row = HashMap<String, String>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Triple store unreachable")]
    Unavailable(#[from] reqwest::Error),
    #[error("Triple store rejected the request with {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Unparseable store response: {0}")]
    Parse(String),
    #[error("Unsupported by this store: {0}")]
    Unsupported(String),
}

/// A write against the graph
#[derive(Debug, Clone)]
pub enum GraphUpdate {
    InsertData(GraphInsert),
    Modify(CompiledUpdate),
}

impl fmt::Display for GraphUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphUpdate::InsertData(insert) => write!(f, "{insert}"),
            GraphUpdate::Modify(update) => write!(f, "{update}"),
        }
    }
}

#[async_trait]
pub trait TripleStore: Send + Sync {
    async fn run_query(&self, query: &SelectQuery) -> Result<Vec<Row>, StoreError>;

    async fn run_update(&self, update: &GraphUpdate) -> Result<(), StoreError>;

    /// Seed the graph at start-up
    async fn load_initial_graph(&self, graphs: &[GraphInsert]) -> Result<(), StoreError> {
        for graph in graphs {
            self.run_update(&GraphUpdate::InsertData(graph.clone()))
                .await?;
        }
        Ok(())
    }
}
