use cotas_pdu::{Code, Pdu, PduError, Reply, Status};
use futures::prelude::*;
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::UdpSocket, sync::mpsc::unbounded_channel, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{router::Dispatcher, BrokerError};

/// The broker's datagram endpoint. One task drains the socket into a queue,
/// a second dispatches queued requests concurrently so a slow store call
/// does not hold up other peers
pub struct BrokerServer {
    local_addr: SocketAddr,
    receive_task: JoinHandle<()>,
    dispatch_task: JoinHandle<()>,
}

impl BrokerServer {
    pub async fn bind(
        addr: SocketAddr,
        max_pdu_size: usize,
        concurrency: usize,
        dispatcher: Dispatcher,
    ) -> Result<Self, BrokerError> {
        let socket = Arc::new(UdpSocket::bind(addr).await.map_err(|e| {
            log::error!("Unable to bind to socket at addr {addr:}");
            e
        })?);
        let local_addr = socket.local_addr()?;
        log::info!("Broker listening on {local_addr:}");

        let (queue_tx, queue_rx) = unbounded_channel::<(Vec<u8>, SocketAddr)>();

        let recv_socket = socket.clone();
        let receive_task = tokio::spawn(async move {
            // One byte over the limit, so a truncated datagram is detectable
            let mut buffer = vec![0u8; max_pdu_size + 1];
            loop {
                tokio::select! {
                    _ = queue_tx.closed() => {
                        break;
                    }
                    res = recv_socket.recv_from(&mut buffer) => {
                        match res {
                            Ok((len, from)) => {
                                if len > max_pdu_size {
                                    log::warn!("Dropping oversized datagram from {from:}");
                                    continue;
                                }
                                if queue_tx.send((buffer[..len].to_vec(), from)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                log::error!("Error receiving from socket: {e:}");
                            }
                        }
                    }
                };
            }
            log::warn!("Broker receive task exiting");
        });

        let dispatch_task = tokio::spawn(async move {
            UnboundedReceiverStream::new(queue_rx)
                .for_each_concurrent(concurrency.max(1), |(datagram, from)| {
                    let dispatcher = dispatcher.clone();
                    let socket = socket.clone();
                    async move {
                        Self::serve(&socket, &dispatcher, &datagram, from, max_pdu_size).await
                    }
                })
                .await;
            log::warn!("Broker dispatch task exiting");
        });

        Ok(Self {
            local_addr,
            receive_task,
            dispatch_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn serve(
        socket: &UdpSocket,
        dispatcher: &Dispatcher,
        datagram: &[u8],
        from: SocketAddr,
        max_pdu_size: usize,
    ) {
        let request = match Pdu::decode(datagram) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Dropping malformed PDU from {from:}: {e:}");
                return;
            }
        };
        if !matches!(request.code, Code::Request(_)) {
            log::debug!("Ignoring non-request PDU from {from:}");
            return;
        }

        let path = request.uri_path.as_deref().unwrap_or("/");
        log::trace!("{path:} from {from:}");
        let reply = dispatcher.dispatch(path, from, &request.payload).await;

        let bytes = match Self::encode_fitted(reply, &request, max_pdu_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Unable to encode reply to {from:}: {e:}");
                let fallback = Reply::new(Status::InternalError).with_info(e.to_string());
                match Self::encode_reply(&fallback, &request, max_pdu_size) {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                }
            }
        };

        if let Err(e) = socket.send_to(&bytes, from).await {
            log::error!("Error sending to {from:}: {e:}");
        }
    }

    fn encode_reply(reply: &Reply, request: &Pdu, max_pdu_size: usize) -> Result<Vec<u8>, PduError> {
        let status = reply.status().unwrap_or(Status::InternalError);
        Pdu::reply_to(request, status, serde_json::to_vec(reply)?).encode(max_pdu_size)
    }

    /// Encode `reply`, dropping trailing search matches until it fits in one
    /// PDU. `info` then says how many of the matches were kept
    fn encode_fitted(
        mut reply: Reply,
        request: &Pdu,
        max_pdu_size: usize,
    ) -> Result<Vec<u8>, PduError> {
        let total = match &reply.response {
            Some(Value::Array(matches)) => matches.len(),
            _ => return Self::encode_reply(&reply, request, max_pdu_size),
        };
        loop {
            let (size, max) = match Self::encode_reply(&reply, request, max_pdu_size) {
                Err(PduError::TooLarge { size, max }) => (size, max),
                other => return other,
            };
            let Some(Value::Array(matches)) = reply.response.as_mut() else {
                return Err(PduError::TooLarge { size, max });
            };
            if matches.is_empty() {
                return Err(PduError::TooLarge { size, max });
            }
            let keep = (matches.len() * max / size.max(1)).min(matches.len() - 1);
            matches.truncate(keep);
            log::debug!("Search reply of {size:} bytes truncated to {keep:} of {total:} matches");
            reply.info = Some(format!("truncated to {keep} of {total} matches"));
        }
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        self.receive_task.abort();
        self.dispatch_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{registry::Registry, store::MemoryStore};
    use actix::Actor;
    use cotas_pdu::{Correlation, MessageType, Method, Route, DEFAULT_MAX_PDU_SIZE};
    use serde_json::json;
    use std::time::Duration;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Registry::seeded(1, 16).start(),
            Arc::new(MemoryStore::new()),
        )
    }

    async fn server() -> BrokerServer {
        serve_with(dispatcher()).await
    }

    async fn serve_with(dispatcher: Dispatcher) -> BrokerServer {
        BrokerServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            DEFAULT_MAX_PDU_SIZE,
            4,
            dispatcher,
        )
        .await
        .unwrap()
    }

    async fn exchange(client: &UdpSocket, to: SocketAddr, bytes: &[u8]) -> Option<Pdu> {
        client.send_to(bytes, to).await.unwrap();
        let mut buffer = [0u8; 2048];
        match tokio::time::timeout(Duration::from_millis(500), client.recv_from(&mut buffer)).await
        {
            Ok(Ok((len, _))) => Some(Pdu::decode(&buffer[..len]).unwrap()),
            _ => None,
        }
    }

    #[actix::test]
    async fn reply_echoes_correlation() {
        let server = server().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let correlation = Correlation::new(0x4242, 0xbeef);
        let request = Pdu::request(
            Method::Post,
            Route::SubscribeObject.path(),
            correlation,
            br#"{"type":"Lamp"}"#.to_vec(),
        );

        let response = exchange(
            &client,
            server.local_addr(),
            &request.encode(DEFAULT_MAX_PDU_SIZE).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.correlation, correlation);
        assert_eq!(response.status(), Some(Status::Created));
        let reply: Reply = response.json().unwrap();
        assert!(reply.id.is_some());
    }

    #[actix::test]
    async fn malformed_datagram_is_dropped_and_serving_continues() {
        let server = server().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        assert!(exchange(&client, server.local_addr(), &[0xff, 0x01, 0x02])
            .await
            .is_none());

        let request = Pdu::request(
            Method::Get,
            "/nowhere",
            Correlation::new(1, 1),
            Vec::new(),
        );
        let response = exchange(
            &client,
            server.local_addr(),
            &request.encode(DEFAULT_MAX_PDU_SIZE).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), Some(Status::NotFound));
    }

    #[actix::test]
    async fn non_confirmable_request_gets_non_confirmable_reply() {
        let server = server().await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut request = Pdu::request(
            Method::Post,
            Route::Search.path(),
            Correlation::new(77, 0x77),
            br#"{"query":{"type":"Lamp"}}"#.to_vec(),
        );
        request.kind = MessageType::NonConfirmable;

        let response = exchange(
            &client,
            server.local_addr(),
            &request.encode(DEFAULT_MAX_PDU_SIZE).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.kind, MessageType::NonConfirmable);
        assert_eq!(response.correlation, request.correlation);
        assert_eq!(response.status(), Some(Status::Content));
    }

    #[actix::test]
    async fn oversized_search_result_is_truncated_to_fit() {
        let dispatcher = dispatcher();
        for n in 0..80u16 {
            let source: SocketAddr = format!("10.0.{}.{}:5683", n / 200, n % 200 + 1)
                .parse()
                .unwrap();
            let reply = dispatcher
                .dispatch(
                    Route::SubscribeObject.path(),
                    source,
                    br#"{"type":"Lamp","port":19}"#,
                )
                .await;
            assert_eq!(reply.status(), Some(Status::Created));
        }
        let server = serve_with(dispatcher).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = Pdu::request(
            Method::Post,
            Route::Search.path(),
            Correlation::new(5, 5),
            br#"{"query":{"type":"Lamp"}}"#.to_vec(),
        );

        let response = exchange(
            &client,
            server.local_addr(),
            &request.encode(DEFAULT_MAX_PDU_SIZE).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), Some(Status::Content));
        let reply: Reply = response.json().unwrap();
        let matches = reply.matches();
        assert!(!matches.is_empty());
        assert!(matches.len() < 80);
        assert!(reply.info.unwrap().ends_with("of 80 matches"));
    }

    #[test]
    fn fitting_keeps_small_replies_and_rejects_unsplittable_ones() {
        let request = Pdu::request(Method::Post, Route::Search.path(), Correlation::new(1, 1), vec![]);
        let small =
            Reply::new(Status::Content).with_response(json!([{"ip": "10.0.0.1", "port": 19}]));
        let bytes = BrokerServer::encode_fitted(small.clone(), &request, DEFAULT_MAX_PDU_SIZE).unwrap();
        let reply: Reply = Pdu::decode(&bytes).unwrap().json().unwrap();
        assert_eq!(reply, small);

        let wordy = Reply::new(Status::BadRequest).with_info("x".repeat(2000));
        assert!(matches!(
            BrokerServer::encode_fitted(wordy, &request, DEFAULT_MAX_PDU_SIZE),
            Err(PduError::TooLarge { .. })
        ));
    }
}
