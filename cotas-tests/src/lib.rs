//! In-process scenarios: one broker on an in-memory store plus populations of
//! providers and consumers, all over loopback UDP.

use cotas_broker::{BrokerConfig, BrokerError, MemoryStore};
use cotas_client::{
    ClientError, Consumer, ConsumerConfig, ConsumerState, MessageCatalog, Provider,
    ProviderConfig, ProviderState,
};
use serde::Deserialize;
use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),
    #[error("Scenario file Error")]
    Toml(#[from] toml::de::Error),
    #[error("Broker Error")]
    Broker(#[from] BrokerError),
    #[error("Client Error")]
    Client(#[from] ClientError),
}

fn default_interval_ms() -> u64 {
    500
}

fn default_count() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderGroup {
    pub category: usize,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub max_sends: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerGroup {
    pub category: usize,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub max_sends: u32,
    #[serde(default)]
    pub research_after: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub duration_secs: u64,
    #[serde(default)]
    pub id_seed: Option<u64>,
    #[serde(default)]
    pub providers: Vec<ProviderGroup>,
    #[serde(default)]
    pub consumers: Vec<ConsumerGroup>,
}

impl Scenario {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&text)?)
    }
}

/// What the population looked like when the scenario ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioReport {
    pub providers: usize,
    pub registered: usize,
    pub consumers: usize,
    pub found: usize,
}

/// The running population of a scenario
pub struct Population {
    pub broker: cotas_broker::Broker,
    pub store: Arc<MemoryStore>,
    pub providers: Vec<Provider>,
    pub consumers: Vec<Consumer>,
}

impl Population {
    /// Start everything on loopback. Must run inside an actix system
    pub async fn start(
        scenario: &Scenario,
        catalog: Arc<MessageCatalog>,
    ) -> Result<Self, ScenarioError> {
        let store = Arc::new(MemoryStore::new());
        let broker = cotas_broker::broker_with_store(
            BrokerConfig {
                bind: loopback(),
                id_seed: scenario.id_seed,
                ..Default::default()
            },
            store.clone(),
        )
        .await?;
        let broker_addr = broker.local_addr();

        let mut providers = Vec::new();
        for group in &scenario.providers {
            for _ in 0..group.count {
                providers.push(
                    Provider::spawn(
                        ProviderConfig {
                            broker: broker_addr,
                            bind: loopback(),
                            category: group.category,
                            interval: Duration::from_millis(group.interval_ms),
                            max_sends: group.max_sends,
                            ..Default::default()
                        },
                        catalog.clone(),
                    )
                    .await?,
                );
            }
        }

        let mut consumers = Vec::new();
        for group in &scenario.consumers {
            for _ in 0..group.count {
                consumers.push(
                    Consumer::spawn(
                        ConsumerConfig {
                            broker: broker_addr,
                            bind: loopback(),
                            category: group.category,
                            interval: Duration::from_millis(group.interval_ms),
                            max_sends: group.max_sends,
                            research_after: group.research_after,
                            ..Default::default()
                        },
                        catalog.clone(),
                    )
                    .await?,
                );
            }
        }

        log::info!(
            "Scenario started: broker {broker_addr:}, {} providers, {} consumers",
            providers.len(),
            consumers.len()
        );
        Ok(Self {
            broker,
            store,
            providers,
            consumers,
        })
    }

    pub fn report(&self) -> ScenarioReport {
        ScenarioReport {
            providers: self.providers.len(),
            registered: self
                .providers
                .iter()
                .filter(|p| matches!(p.state(), ProviderState::Registered(_)))
                .count(),
            consumers: self.consumers.len(),
            found: self
                .consumers
                .iter()
                .filter(|c| matches!(c.state(), ConsumerState::Found(_)))
                .count(),
        }
    }
}

/// Run `scenario` for its full duration and report the final states
pub async fn run(
    scenario: &Scenario,
    catalog: Arc<MessageCatalog>,
) -> Result<ScenarioReport, ScenarioError> {
    let population = Population::start(scenario, catalog).await?;
    tokio::time::sleep(Duration::from_secs(scenario.duration_secs)).await;
    let report = population.report();
    log::info!(
        "Scenario done: {}/{} providers registered, {}/{} consumers found a peer, {} triples",
        report.registered,
        report.providers,
        report.found,
        report.consumers,
        population.store.len().await
    );
    Ok(report)
}

pub fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_fills_defaults() {
        let scenario: Scenario = toml::from_str(
            r#"
            duration_secs = 3

            [[providers]]
            category = 1
            count = 4

            [[consumers]]
            category = 0
            research_after = 3
            "#,
        )
        .unwrap();
        assert_eq!(scenario.providers[0].count, 4);
        assert_eq!(scenario.providers[0].interval_ms, 500);
        assert_eq!(scenario.consumers[0].count, 1);
        assert_eq!(scenario.consumers[0].research_after, Some(3));
        assert_eq!(scenario.id_seed, None);
    }

    #[test]
    fn bundled_scenario_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("data/scenario.toml");
        let scenario = Scenario::load(path).unwrap();
        assert!(!scenario.providers.is_empty());
        assert!(!scenario.consumers.is_empty());
    }
}
