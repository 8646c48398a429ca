use cotas_pdu::{Code, Pdu, Reply, Status};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::UdpSocket, task::JoinHandle};

use crate::{ClientError, MessageCatalog};

/// A provider's own endpoint. Applications that found the provider through
/// a search address it here directly and get back a current state document
pub struct ObjectServer {
    local_addr: SocketAddr,
    handler: JoinHandle<()>,
}

impl ObjectServer {
    pub async fn bind(
        addr: SocketAddr,
        catalog: Arc<MessageCatalog>,
        category: usize,
        max_pdu_size: usize,
    ) -> Result<Self, ClientError> {
        // Fail at start-up, not on the first request
        catalog.update_templates(category)?;

        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            log::error!("Unable to bind object server to {addr:}");
            e
        })?;
        let local_addr = socket.local_addr()?;
        log::debug!("Object server on {local_addr:}");

        let handler = tokio::spawn(async move {
            let mut buffer = vec![0u8; max_pdu_size];
            loop {
                let (len, from) = match socket.recv_from(&mut buffer).await {
                    Ok(res) => res,
                    Err(e) => {
                        log::error!("Object server socket error {e:}");
                        continue;
                    }
                };

                let request = match Pdu::decode(&buffer[..len]) {
                    Ok(pdu) if matches!(pdu.code, Code::Request(_)) => pdu,
                    Ok(_) => continue,
                    Err(e) => {
                        log::warn!("Dropping malformed PDU from {from:}: {e:}");
                        continue;
                    }
                };

                let state = catalog
                    .update_templates(category)
                    .ok()
                    .and_then(|pool| pool.choose(&mut rand::thread_rng()).cloned())
                    .unwrap_or(Value::Null);
                let reply = Reply::new(Status::Content).with_response(state);

                let bytes = serde_json::to_vec(&reply)
                    .map_err(Into::into)
                    .and_then(|payload| {
                        Pdu::reply_to(&request, Status::Content, payload)
                            .encode(max_pdu_size)
                    });
                match bytes {
                    Ok(bytes) => {
                        if let Err(e) = socket.send_to(&bytes, from).await {
                            log::error!("Error sending to {from:}: {e:}");
                        }
                    }
                    Err(e) => log::error!("Unable to encode object state: {e:}"),
                }
            }
        });

        Ok(Self {
            local_addr,
            handler,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for ObjectServer {
    fn drop(&mut self) {
        self.handler.abort();
    }
}
