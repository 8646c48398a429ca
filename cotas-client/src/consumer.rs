use cotas_pdu::{Method, Pdu, Reply, Route, Status, BROKER_PORT, DEFAULT_MAX_PDU_SIZE};
use serde_json::{Map, Value};
use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{net::UdpSocket, sync::watch, task::JoinHandle};

use crate::{correlation::Outstanding, ClientError, MessageCatalog, Outbound, OBJECT_PATH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Searching,
    /// A matching object was resolved; requests now go to it directly
    Found(SocketAddr),
}

/// Who a request is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Broker,
    Peer(SocketAddr),
}

/// Protocol logic of an application: search through the broker until an
/// object matches, then address that object directly
pub struct ConsumerMachine {
    state: ConsumerState,
    request: Map<String, Value>,
    backoff_ticks: u32,
    backoff_remaining: u32,
    /// Consecutive direct requests without a reply before searching again.
    /// `None` keeps the resolved peer for good
    research_after: Option<u32>,
    unanswered: u32,
}

impl ConsumerMachine {
    pub fn new(
        catalog: &MessageCatalog,
        category: usize,
        backoff_ticks: u32,
        research_after: Option<u32>,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            state: ConsumerState::Searching,
            request: catalog.request_template(category)?.clone(),
            backoff_ticks,
            backoff_remaining: 0,
            research_after,
            unanswered: 0,
        })
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn on_tick(&mut self) -> Option<(Target, Outbound)> {
        if self.backoff_remaining > 0 {
            self.backoff_remaining -= 1;
            return None;
        }

        if let (ConsumerState::Found(peer), Some(limit)) = (self.state, self.research_after) {
            if self.unanswered >= limit {
                log::warn!("{peer:} stopped answering, searching again");
                self.state = ConsumerState::Searching;
                self.unanswered = 0;
            }
        }

        let payload = Value::Object(self.request.clone());
        Some(match self.state {
            ConsumerState::Searching => (
                Target::Broker,
                Outbound {
                    method: Method::Post,
                    path: Route::Search.path(),
                    payload,
                },
            ),
            ConsumerState::Found(peer) => {
                self.unanswered += 1;
                (
                    Target::Peer(peer),
                    Outbound {
                        method: Method::Get,
                        path: OBJECT_PATH,
                        payload,
                    },
                )
            }
        })
    }

    /// Feed a reply to the request that was sent to `target`
    pub fn on_reply(&mut self, target: Target, reply: &Reply) {
        match (reply.status(), target) {
            (Some(Status::Content), Target::Broker) => {
                if self.state != ConsumerState::Searching {
                    log::debug!("Late search result ignored");
                    return;
                }
                match reply.matches().first() {
                    Some(endpoint) => match endpoint.socket_addr() {
                        Some(peer) => {
                            log::info!("Search matched {peer:}");
                            self.state = ConsumerState::Found(peer);
                            self.unanswered = 0;
                        }
                        None => log::warn!("Unusable match {endpoint:?}"),
                    },
                    None => log::debug!("No object matches the search yet"),
                }
            }
            (Some(Status::Content), Target::Peer(peer)) => {
                self.unanswered = 0;
                log::debug!("{peer:} answered {:?}", reply.response);
            }
            (Some(Status::InternalError), _) => {
                log::warn!("Error reply {:?}, backing off", reply.info);
                self.backoff_remaining = self.backoff_ticks;
            }
            (Some(Status::BadRequest), _) => log::warn!("Bad request {:?}", reply.info),
            (Some(Status::Unauthorized), _) => log::warn!("Request refused as unauthorized"),
            (other, _) => log::debug!("Unexpected reply status {other:?}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub broker: SocketAddr,
    pub bind: SocketAddr,
    pub category: usize,
    pub interval: Duration,
    /// Stop sending after this many requests, `0` for no limit
    pub max_sends: u32,
    pub backoff_ticks: u32,
    pub research_after: Option<u32>,
    pub reply_timeout: Duration,
    pub max_pdu_size: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            broker: SocketAddr::from((Ipv4Addr::LOCALHOST, BROKER_PORT)),
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            category: 0,
            interval: Duration::from_secs(1),
            max_sends: 0,
            backoff_ticks: 0,
            research_after: None,
            reply_timeout: Duration::from_secs(5),
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
        }
    }
}

/// A running application. Dropping the handle stops it
pub struct Consumer {
    state: watch::Receiver<ConsumerState>,
    driver: JoinHandle<()>,
}

impl Consumer {
    pub async fn spawn(
        config: ConsumerConfig,
        catalog: Arc<MessageCatalog>,
    ) -> Result<Self, ClientError> {
        let machine = ConsumerMachine::new(
            &catalog,
            config.category,
            config.backoff_ticks,
            config.research_after,
        )?;
        let socket = UdpSocket::bind(config.bind).await.map_err(|e| {
            log::error!("Unable to bind to socket at addr {}", config.bind);
            e
        })?;
        let (state_tx, state) = watch::channel(machine.state());

        let driver = tokio::spawn(async move {
            Self::drive(config, socket, machine, state_tx).await;
        });

        Ok(Self { state, driver })
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    async fn drive(
        config: ConsumerConfig,
        socket: UdpSocket,
        mut machine: ConsumerMachine,
        state_tx: watch::Sender<ConsumerState>,
    ) {
        let mut tick = tokio::time::interval(config.interval);
        let mut outstanding = Outstanding::<Target>::new();
        let mut buffer = vec![0u8; config.max_pdu_size];
        let mut sent = 0u32;

        loop {
            let sending = config.max_sends == 0 || sent < config.max_sends;
            tokio::select! {
                _ = tick.tick(), if sending => {
                    outstanding.expire(config.reply_timeout);
                    let Some((target, outbound)) = machine.on_tick() else {
                        continue;
                    };
                    state_tx.send_if_modified(|state| {
                        let changed = *state != machine.state();
                        *state = machine.state();
                        changed
                    });

                    let to = match target {
                        Target::Broker => config.broker,
                        Target::Peer(peer) => peer,
                    };
                    let correlation = outstanding.issue(target);
                    match outbound.encode(correlation, config.max_pdu_size) {
                        Ok(bytes) => {
                            if let Err(e) = socket.send_to(&bytes, to).await {
                                log::error!("Error sending to {to:}: {e:}");
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
                    let Some((rtt, target)) = outstanding.complete(&response.correlation) else {
                        log::debug!("Reply from {from:} matches no request");
                        continue;
                    };
                    log::info!("RTT {target:?} {:.6} s", rtt.as_secs_f64());

                    match response.json::<Reply>() {
                        Ok(reply) => {
                            machine.on_reply(target, &reply);
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

impl Drop for Consumer {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cotas_pdu::Endpoint;
    use serde_json::json;
    use crate::catalog::tests::CATALOG;

    fn machine(research_after: Option<u32>) -> ConsumerMachine {
        let catalog = MessageCatalog::from_json(CATALOG).unwrap();
        ConsumerMachine::new(&catalog, 1, 1, research_after).unwrap()
    }

    fn found(ip: &str, port: u16) -> Reply {
        Reply::new(Status::Content).with_response(
            serde_json::to_value(vec![Endpoint {
                ip: ip.into(),
                port,
            }])
            .unwrap(),
        )
    }

    #[test]
    fn empty_search_keeps_searching() {
        let mut m = machine(None);
        let (target, out) = m.on_tick().unwrap();
        assert_eq!(target, Target::Broker);
        assert_eq!(out.path, "/search");
        assert_eq!(out.payload["query"]["type"], "Camera");

        m.on_reply(Target::Broker, &Reply::new(Status::Content).with_response(json!([])));
        assert_eq!(m.state(), ConsumerState::Searching);
    }

    #[test]
    fn first_match_is_addressed_directly() {
        let mut m = machine(None);
        m.on_tick();
        let reply = Reply::new(Status::Content).with_response(json!([
            {"ip": "10.0.0.8", "port": 19},
            {"ip": "10.0.0.9", "port": 19}
        ]));
        m.on_reply(Target::Broker, &reply);

        let peer: SocketAddr = "10.0.0.8:19".parse().unwrap();
        assert_eq!(m.state(), ConsumerState::Found(peer));
        let (target, out) = m.on_tick().unwrap();
        assert_eq!(target, Target::Peer(peer));
        assert_eq!(out.path, OBJECT_PATH);
    }

    #[test]
    fn without_policy_found_is_final() {
        let mut m = machine(None);
        m.on_reply(Target::Broker, &found("10.0.0.8", 19));
        for _ in 0..50 {
            assert!(matches!(m.on_tick(), Some((Target::Peer(_), _))));
        }
    }

    #[test]
    fn silent_peer_triggers_research() {
        let mut m = machine(Some(2));
        m.on_reply(Target::Broker, &found("10.0.0.8", 19));
        let peer = Target::Peer("10.0.0.8:19".parse().unwrap());

        assert_eq!(m.on_tick().unwrap().0, peer);
        m.on_reply(peer, &Reply::new(Status::Content));
        assert_eq!(m.on_tick().unwrap().0, peer);
        assert_eq!(m.on_tick().unwrap().0, peer);
        // Two direct requests went unanswered
        assert_eq!(m.on_tick().unwrap().0, Target::Broker);
        assert_eq!(m.state(), ConsumerState::Searching);
    }

    #[test]
    fn late_search_result_does_not_move_peer() {
        let mut m = machine(None);
        m.on_reply(Target::Broker, &found("10.0.0.8", 19));
        m.on_reply(Target::Broker, &found("10.0.0.9", 19));
        assert_eq!(
            m.state(),
            ConsumerState::Found("10.0.0.8:19".parse().unwrap())
        );
    }

    #[test]
    fn internal_error_backs_off() {
        let mut m = machine(None);
        m.on_reply(Target::Broker, &Reply::new(Status::InternalError));
        assert!(m.on_tick().is_none());
        assert!(m.on_tick().is_some());
    }
}
