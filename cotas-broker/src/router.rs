use actix::{Addr, MailboxError};
use cotas_pdu::{Endpoint, ObjectId, Reply, Route, Status};
use serde_json::{Map, Value};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use thiserror::Error;

use crate::{
    compiler::{
        compile_registration, compile_search, compile_update, CompileError, ObjectDescription,
    },
    registry::{
        Adopt, CheckOwnership, Confirm, Enroll, Enrollment, ObjectRegistration, Registry,
        RegistryError, Release,
    },
    store::{GraphUpdate, StoreError, TripleStore},
};

/// Fields of an update document that are not graph state
const UPDATE_CONTROL_FIELDS: [&str; 3] = ["id", "req", "object"];

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No route for {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unknown object id {0}")]
    UnknownId(ObjectId),
    #[error("Registration of object {0} could not be completed")]
    RegistrationFailed(ObjectId),
    #[error("Payload is not valid JSON")]
    Payload(#[from] serde_json::Error),
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Actix mailbox Error")]
    MailError(#[from] MailboxError),
}

impl DispatchError {
    /// Status the requester sees for this failure
    pub fn status(&self) -> Status {
        match self {
            DispatchError::NotFound(_) => Status::NotFound,
            DispatchError::BadRequest(_)
            | DispatchError::Payload(_)
            | DispatchError::Compile(_) => Status::BadRequest,
            DispatchError::UnknownId(_) => Status::Unauthorized,
            DispatchError::RegistrationFailed(_)
            | DispatchError::Registry(_)
            | DispatchError::Store(_)
            | DispatchError::MailError(_) => Status::InternalError,
        }
    }
}

fn document(payload: &[u8]) -> Result<Map<String, Value>, DispatchError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice(payload)? {
        Value::Object(map) => Ok(map),
        _ => Err(DispatchError::BadRequest(
            "payload must be a JSON object".to_string(),
        )),
    }
}

fn port_field(doc: &Map<String, Value>) -> Result<Option<u16>, DispatchError> {
    match doc.get("port") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .map(Some)
            .ok_or_else(|| DispatchError::BadRequest(format!("invalid port {v}"))),
    }
}

fn category_field(doc: &Map<String, Value>) -> Result<Option<String>, DispatchError> {
    match doc.get("type") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(v) => Err(DispatchError::BadRequest(format!("invalid type {v}"))),
    }
}

/// Path keys of a subscribe or seed document
fn state_fields(doc: &Map<String, Value>, control: &[&str]) -> Map<String, Value> {
    doc.iter()
        .filter(|(k, _)| !control.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Routes decoded requests to the subscribe, update and search handlers.
/// Every outcome, failures included, becomes a [`Reply`]
#[derive(Clone)]
pub struct Dispatcher {
    registry: Addr<Registry>,
    store: Arc<dyn TripleStore>,
}

impl Dispatcher {
    pub fn new(registry: Addr<Registry>, store: Arc<dyn TripleStore>) -> Self {
        Self { registry, store }
    }

    pub async fn dispatch(&self, path: &str, source: SocketAddr, payload: &[u8]) -> Reply {
        let result = match Route::from_path(path) {
            Some(Route::SubscribeObject) | Some(Route::SubscribeApplication) => {
                self.subscribe(source, payload).await
            }
            Some(Route::UpdateObject) => self.update(payload).await,
            Some(Route::Search) => self.search(payload).await,
            None => Err(DispatchError::NotFound(path.to_string())),
        };

        result.unwrap_or_else(|e| {
            log::warn!("Request {path:} from {source:} failed: {e:}");
            Reply::new(e.status()).with_info(e.to_string())
        })
    }

    async fn subscribe(&self, source: SocketAddr, payload: &[u8]) -> Result<Reply, DispatchError> {
        let doc = document(payload)?;
        let category = category_field(&doc)?;
        let endpoint = SocketAddr::new(source.ip(), port_field(&doc)?.unwrap_or(source.port()));

        let registration = match self
            .registry
            .send(Enroll {
                source,
                endpoint,
                category,
            })
            .await??
        {
            Enrollment::Existing(registration) => {
                return Ok(Reply::new(Status::Created).with_id(registration.id))
            }
            // An earlier subscribe from this source is still storing its state
            Enrollment::Pending(registration, outcome) => {
                return match outcome.await {
                    Ok(true) => Ok(Reply::new(Status::Created).with_id(registration.id)),
                    _ => Err(DispatchError::RegistrationFailed(registration.id)),
                };
            }
            Enrollment::Fresh(registration) => registration,
        };

        let id = registration.id;
        if let Err(e) = self.store_registration(&registration, &doc).await {
            log::error!("Unable to store initial state of object {id:}: {e:}");
            self.registry.send(Release(id)).await?;
            return Err(e);
        }
        self.registry.send(Confirm(id)).await?;
        Ok(Reply::new(Status::Created).with_id(id))
    }

    async fn store_registration(
        &self,
        registration: &ObjectRegistration,
        doc: &Map<String, Value>,
    ) -> Result<(), DispatchError> {
        let state = state_fields(doc, &["req", "id", "type", "port"]);
        let insert = compile_registration(&ObjectDescription {
            id: registration.id,
            ip: registration.endpoint.ip(),
            port: registration.endpoint.port(),
            category: registration.category.as_deref(),
            state: &state,
        })?;
        self.store
            .run_update(&GraphUpdate::InsertData(insert))
            .await?;
        Ok(())
    }

    async fn update(&self, payload: &[u8]) -> Result<Reply, DispatchError> {
        let mut doc = document(payload)?;
        let id = doc
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|id| ObjectId::try_from(id).ok())
            .ok_or_else(|| DispatchError::BadRequest("missing or invalid id".to_string()))?;

        if !self.registry.send(CheckOwnership(id)).await? {
            return Err(DispatchError::UnknownId(id));
        }

        for field in UPDATE_CONTROL_FIELDS {
            doc.remove(field);
        }
        let update = compile_update(id, &doc)?;
        self.store.run_update(&GraphUpdate::Modify(update)).await?;

        log::debug!("Object {id:} updated {} fields", doc.len());
        Ok(Reply::new(Status::Changed).with_id(id))
    }

    async fn search(&self, payload: &[u8]) -> Result<Reply, DispatchError> {
        let doc = document(payload)?;
        let criteria = match doc.get("query") {
            Some(Value::Object(query)) if !query.is_empty() => query,
            _ => {
                return Err(DispatchError::BadRequest(
                    "query must be a non-empty object".to_string(),
                ))
            }
        };

        let query = compile_search(criteria)?;
        let rows = self.store.run_query(&query).await?;

        let matches: Vec<Endpoint> = rows
            .into_iter()
            .filter_map(|row| {
                let port = row.get("port")?.parse::<u16>().ok()?;
                Some(Endpoint {
                    ip: row.get("ip")?.clone(),
                    port,
                })
            })
            .collect();
        log::debug!("Search matched {} objects", matches.len());

        Ok(Reply::new(Status::Content).with_response(serde_json::to_value(matches)?))
    }

    /// Register seed objects and load their state into the store. Returns the
    /// number of objects seeded. On failure every id adopted so far is
    /// released again
    pub async fn seed(&self, documents: &[Value]) -> Result<usize, DispatchError> {
        let mut adopted = Vec::with_capacity(documents.len());
        let result = self.seed_documents(documents, &mut adopted).await;
        if let Err(e) = &result {
            log::error!("Seeding failed, releasing {} adopted ids: {e:}", adopted.len());
            for id in adopted {
                self.registry.send(Release(id)).await?;
            }
        }
        result
    }

    async fn seed_documents(
        &self,
        documents: &[Value],
        adopted: &mut Vec<ObjectId>,
    ) -> Result<usize, DispatchError> {
        let mut graphs = Vec::with_capacity(documents.len());
        for value in documents {
            let Value::Object(doc) = value else {
                return Err(DispatchError::BadRequest(
                    "seed document must be an object".to_string(),
                ));
            };
            let id = doc
                .get("id")
                .and_then(Value::as_u64)
                .and_then(|id| ObjectId::try_from(id).ok())
                .ok_or_else(|| DispatchError::BadRequest("seed without id".to_string()))?;
            let ip: IpAddr = doc
                .get("ip")
                .and_then(Value::as_str)
                .and_then(|ip| ip.parse().ok())
                .ok_or_else(|| DispatchError::BadRequest(format!("seed {id:} without ip")))?;
            let port = port_field(doc)?
                .ok_or_else(|| DispatchError::BadRequest(format!("seed {id:} without port")))?;
            let category = category_field(doc)?;
            let state = state_fields(doc, &["id", "ip", "port", "type", "req"]);

            graphs.push(compile_registration(&ObjectDescription {
                id,
                ip,
                port,
                category: category.as_deref(),
                state: &state,
            })?);

            let endpoint = SocketAddr::new(ip, port);
            self.registry
                .send(Adopt(ObjectRegistration {
                    id,
                    source: endpoint,
                    endpoint,
                    category,
                    registered_at: chrono::Local::now(),
                }))
                .await??;
            adopted.push(id);
        }

        self.store.load_initial_graph(&graphs).await?;
        log::info!("Seeded {} objects", graphs.len());
        Ok(graphs.len())
    }
}
