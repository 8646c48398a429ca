use cotas_pdu::{
    Method, ObjectId, Pdu, Reply, Route, Status, BROKER_PORT, DEFAULT_MAX_PDU_SIZE,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde_json::{Map, Value};
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{net::UdpSocket, sync::watch, task::JoinHandle};

use crate::{
    correlation::Outstanding, ClientError, MessageCatalog, ObjectServer, Outbound,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Unregistered,
    Registered(ObjectId),
}

impl ProviderState {
    /// Object id, `0` while unregistered
    pub fn object_id(&self) -> ObjectId {
        match self {
            ProviderState::Unregistered => 0,
            ProviderState::Registered(id) => *id,
        }
    }
}

/// Protocol logic of a smart object, free of any I/O: ticks produce the
/// next request, replies move the state
pub struct ProviderMachine {
    state: ProviderState,
    subscribe: Map<String, Value>,
    updates: Vec<Value>,
    rng: StdRng,
    backoff_ticks: u32,
    backoff_remaining: u32,
}

impl ProviderMachine {
    /// `object_port` is advertised to the broker as the port applications
    /// should use to reach this object
    pub fn new(
        catalog: &MessageCatalog,
        category: usize,
        object_port: u16,
        backoff_ticks: u32,
    ) -> Result<Self, ClientError> {
        let mut subscribe = catalog.subscribe_template(category)?.clone();
        subscribe.insert("port".to_string(), Value::from(object_port));
        Ok(Self {
            state: ProviderState::Unregistered,
            subscribe,
            updates: catalog.update_templates(category)?.to_vec(),
            rng: StdRng::from_entropy(),
            backoff_ticks,
            backoff_remaining: 0,
        })
    }

    pub fn state(&self) -> ProviderState {
        self.state
    }

    /// Request to send on this tick, `None` while backing off
    pub fn on_tick(&mut self) -> Option<Outbound> {
        if self.backoff_remaining > 0 {
            self.backoff_remaining -= 1;
            return None;
        }

        Some(match self.state {
            ProviderState::Unregistered => Outbound {
                method: Method::Post,
                path: Route::SubscribeObject.path(),
                payload: Value::Object(self.subscribe.clone()),
            },
            ProviderState::Registered(id) => {
                let mut update = self
                    .updates
                    .choose(&mut self.rng)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new()));
                if let Value::Object(fields) = &mut update {
                    fields.insert("id".to_string(), Value::from(id));
                }
                Outbound {
                    method: Method::Put,
                    path: Route::UpdateObject.path(),
                    payload: update,
                }
            }
        })
    }

    pub fn on_reply(&mut self, reply: &Reply) {
        match reply.status() {
            Some(Status::Created) => match reply.id {
                Some(id) => {
                    if self.state != ProviderState::Registered(id) {
                        log::info!("Registered as object {id:}");
                    }
                    self.state = ProviderState::Registered(id);
                }
                None => log::warn!("Created reply without an id"),
            },
            Some(Status::Changed) => {}
            Some(Status::Unauthorized) => {
                log::warn!(
                    "Broker does not know object {}, subscribing again",
                    self.state.object_id()
                );
                self.state = ProviderState::Unregistered;
            }
            Some(Status::InternalError) => {
                log::warn!("Broker error {:?}, backing off", reply.info);
                self.backoff_remaining = self.backoff_ticks;
            }
            Some(Status::BadRequest) => log::warn!("Bad request {:?}", reply.info),
            other => log::debug!("Unexpected reply status {other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub broker: SocketAddr,
    /// Local address for the broker socket and the object server
    pub bind: SocketAddr,
    /// Object server port, `0` for any free port
    pub object_port: u16,
    pub category: usize,
    pub interval: Duration,
    /// Stop sending after this many requests, `0` for no limit
    pub max_sends: u32,
    pub backoff_ticks: u32,
    pub reply_timeout: Duration,
    pub max_pdu_size: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            broker: SocketAddr::from((Ipv4Addr::LOCALHOST, BROKER_PORT)),
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            object_port: 0,
            category: 0,
            interval: Duration::from_secs(1),
            max_sends: 0,
            backoff_ticks: 0,
            reply_timeout: Duration::from_secs(5),
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
        }
    }
}

/// A running provider. Dropping the handle stops it: the pending tick is
/// cancelled and both sockets are closed
pub struct Provider {
    state: watch::Receiver<ProviderState>,
    object_addr: SocketAddr,
    driver: JoinHandle<()>,
    _object_server: ObjectServer,
}

impl Provider {
    pub async fn spawn(
        config: ProviderConfig,
        catalog: Arc<MessageCatalog>,
    ) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind(config.bind).await.map_err(|e| {
            log::error!("Unable to bind to socket at addr {}", config.bind);
            e
        })?;
        let object_server = ObjectServer::bind(
            SocketAddr::new(config.bind.ip(), config.object_port),
            catalog.clone(),
            config.category,
            config.max_pdu_size,
        )
        .await?;
        let object_addr = object_server.local_addr();

        let machine = ProviderMachine::new(
            &catalog,
            config.category,
            object_addr.port(),
            config.backoff_ticks,
        )?;
        let (state_tx, state) = watch::channel(machine.state());

        let driver = tokio::spawn(async move {
            Self::drive(config, socket, machine, state_tx).await;
        });

        Ok(Self {
            state,
            object_addr,
            driver,
            _object_server: object_server,
        })
    }

    pub fn state(&self) -> ProviderState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ProviderState> {
        self.state.clone()
    }

    pub fn object_addr(&self) -> SocketAddr {
        self.object_addr
    }

    async fn drive(
        config: ProviderConfig,
        socket: UdpSocket,
        mut machine: ProviderMachine,
        state_tx: watch::Sender<ProviderState>,
    ) {
        let mut tick = tokio::time::interval(config.interval);
        let mut outstanding = Outstanding::<&'static str>::new();
        let mut buffer = vec![0u8; config.max_pdu_size];
        let mut sent = 0u32;

        loop {
            let sending = config.max_sends == 0 || sent < config.max_sends;
            tokio::select! {
                _ = tick.tick(), if sending => {
                    let expired = outstanding.expire(config.reply_timeout);
                    if expired > 0 {
                        log::debug!("{expired:} requests went unanswered");
                    }
                    let Some(outbound) = machine.on_tick() else {
                        continue;
                    };
                    let correlation = outstanding.issue(outbound.path);
                    match outbound.encode(correlation, config.max_pdu_size) {
                        Ok(bytes) => {
                            if let Err(e) = socket.send_to(&bytes, config.broker).await {
                                log::error!("Error sending to {}: {e:}", config.broker);
                            }
                            sent += 1;
                        }
                        Err(e) => log::error!("Unable to encode {}: {e:}", outbound.path),
                    }
                }
                res = socket.recv_from(&mut buffer) => {
                    let (len, from) = match res {
                        Ok(res) => res,
                        Err(e) => {
                            log::error!("Error receiving from socket: {e:}");
                            continue;
                        }
                    };
                    let response = match Pdu::decode(&buffer[..len]) {
                        Ok(pdu) => pdu,
                        Err(e) => {
                            log::warn!("Dropping malformed PDU from {from:}: {e:}");
                            continue;
                        }
                    };
                    let Some((rtt, path)) = outstanding.complete(&response.correlation) else {
                        log::debug!("Reply from {from:} matches no request");
                        continue;
                    };
                    log::info!("RTT {path:} {:.6} s", rtt.as_secs_f64());
                    match response.json::<Reply>() {
                        Ok(reply) => {
                            machine.on_reply(&reply);
                            state_tx.send_if_modified(|state| {
                                let changed = *state != machine.state();
                                *state = machine.state();
                                changed
                            });
                        }
                        Err(e) => log::warn!("Unreadable reply from {from:}: {e:}"),
                    }
                }
            };
        }
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::CATALOG;

    fn machine(backoff_ticks: u32) -> ProviderMachine {
        let catalog = MessageCatalog::from_json(CATALOG).unwrap();
        ProviderMachine::new(&catalog, 0, 19, backoff_ticks).unwrap()
    }

    #[test]
    fn unregistered_sends_subscribe_with_port() {
        let mut m = machine(0);
        let out = m.on_tick().unwrap();
        assert_eq!(out.path, "/subscribe/object");
        assert_eq!(out.payload["port"], 19);
        assert_eq!(out.payload["type"], "Lamp");
        // Keeps subscribing until a reply arrives
        assert_eq!(m.on_tick().unwrap().path, "/subscribe/object");
    }

    #[test]
    fn created_registers_and_updates_carry_id() {
        let mut m = machine(0);
        m.on_reply(&Reply::new(Status::Created).with_id(20_123));
        assert_eq!(m.state(), ProviderState::Registered(20_123));

        let out = m.on_tick().unwrap();
        assert_eq!(out.path, "/update/object");
        assert_eq!(out.method, Method::Put);
        assert_eq!(out.payload["id"], 20_123);
        assert!(out.payload.get("color").is_some());
    }

    #[test]
    fn unauthorized_resubscribes() {
        let mut m = machine(0);
        m.on_reply(&Reply::new(Status::Created).with_id(20_123));
        m.on_reply(&Reply::new(Status::Unauthorized));
        assert_eq!(m.state(), ProviderState::Unregistered);
        assert_eq!(m.on_tick().unwrap().path, "/subscribe/object");
    }

    #[test]
    fn internal_error_backs_off() {
        let mut m = machine(2);
        m.on_reply(&Reply::new(Status::InternalError));
        assert!(m.on_tick().is_none());
        assert!(m.on_tick().is_none());
        assert!(m.on_tick().is_some());
    }

    #[test]
    fn changed_keeps_state() {
        let mut m = machine(0);
        m.on_reply(&Reply::new(Status::Created).with_id(20_001));
        m.on_reply(&Reply::new(Status::Changed).with_id(20_001));
        assert_eq!(m.state().object_id(), 20_001);
    }
}
