use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Deserialize;
use std::{collections::HashMap, time::Duration};

use super::{GraphUpdate, Row, StoreError, TripleStore};
use crate::compiler::SelectQuery;

const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";

#[derive(Debug, Clone)]
pub struct FusekiConfig {
    /// Server root, e.g. `http://localhost:3030`
    pub base_url: String,
    pub dataset: String,
    pub timeout: Duration,
}

impl Default for FusekiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3030".to_string(),
            dataset: "dataset".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// SPARQL 1.1 protocol client for an Apache Jena Fuseki dataset
pub struct FusekiStore {
    client: Client,
    query_url: String,
    update_url: String,
}

impl FusekiStore {
    pub fn new(config: FusekiConfig) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        let root = format!(
            "{}/{}",
            config.base_url.trim_end_matches('/'),
            config.dataset.trim_matches('/')
        );
        Ok(Self {
            client,
            query_url: format!("{root}/query"),
            update_url: format!("{root}/update"),
        })
    }

    async fn post_form(
        &self,
        url: &str,
        field: &str,
        body: String,
        accept: Option<&str>,
    ) -> Result<reqwest::Response, StoreError> {
        let mut request = self.client.post(url).form(&[(field, body)]);
        if let Some(accept) = accept {
            request = request.header(header::ACCEPT, accept);
        }

        let response = request.send().await.map_err(|e| {
            log::error!("Unable to reach triple store at {url:}: {e:}");
            e
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            log::error!("Triple store at {url:} returned {status:}: {body:}");
            Err(StoreError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            })
        }
    }
}

#[async_trait]
impl TripleStore for FusekiStore {
    async fn run_query(&self, query: &SelectQuery) -> Result<Vec<Row>, StoreError> {
        let text = query.to_string();
        log::trace!("SPARQL query:\n{text}");
        let response = self
            .post_form(&self.query_url, "query", text, Some(SPARQL_RESULTS_JSON))
            .await?;
        let body = response.text().await?;
        parse_results(&body)
    }

    async fn run_update(&self, update: &GraphUpdate) -> Result<(), StoreError> {
        let text = update.to_string();
        log::trace!("SPARQL update:\n{text}");
        self.post_form(&self.update_url, "update", text, None)
            .await?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct SparqlResults {
    results: SparqlBindings,
}

#[derive(Deserialize)]
struct SparqlBindings {
    bindings: Vec<HashMap<String, SparqlValue>>,
}

#[derive(Deserialize)]
struct SparqlValue {
    value: String,
}

fn parse_results(body: &str) -> Result<Vec<Row>, StoreError> {
    let results: SparqlResults =
        serde_json::from_str(body).map_err(|e| StoreError::Parse(e.to_string()))?;
    Ok(results
        .results
        .bindings
        .into_iter()
        .map(|solution| {
            solution
                .into_iter()
                .map(|(var, term)| (var, term.value))
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_built_from_base_and_dataset() {
        let store = FusekiStore::new(FusekiConfig {
            base_url: "http://store:3030/".into(),
            dataset: "/cot/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(store.query_url, "http://store:3030/cot/query");
        assert_eq!(store.update_url, "http://store:3030/cot/update");
    }

    #[test]
    fn result_bindings_flatten_to_rows() {
        let body = r#"{
            "head": {"vars": ["ip", "port"]},
            "results": {"bindings": [
                {"ip": {"type": "literal", "value": "10.1.1.3"},
                 "port": {"type": "literal",
                          "datatype": "http://www.w3.org/2001/XMLSchema#integer",
                          "value": "19"}},
                {"ip": {"type": "literal", "value": "10.1.1.4"}}
            ]}
        }"#;
        let rows = parse_results(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["ip"], "10.1.1.3");
        assert_eq!(rows[0]["port"], "19");
        assert!(!rows[1].contains_key("port"));
    }

    #[test]
    fn non_json_body_is_a_parse_error() {
        assert!(matches!(
            parse_results("<html>oops</html>"),
            Err(StoreError::Parse(_))
        ));
    }
}
