use coap_lite::{
    error::MessageError, CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType,
};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::Status;

/// Upper bound on an encoded PDU. Keeps a datagram well under the IPv6
/// minimum MTU once UDP/IP headers are added
pub const DEFAULT_MAX_PDU_SIZE: usize = 1152;

#[derive(Error, Debug)]
pub enum PduError {
    #[error("Malformed PDU: {0}")]
    Malformed(String),
    #[error("PDU of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("CoAP Msg Error")]
    CoAPMsgError(#[from] MessageError),
    #[error("Payload is not valid JSON")]
    Payload(#[from] serde_json::Error),
}

/// Request methods the broker protocol uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl From<Method> for RequestType {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => RequestType::Get,
            Method::Post => RequestType::Post,
            Method::Put => RequestType::Put,
        }
    }
}

/// The CoAP code field is overloaded: a method on requests, a status on
/// responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    Empty,
    Request(Method),
    Response(Status),
}

impl From<Code> for MessageClass {
    fn from(code: Code) -> Self {
        match code {
            Code::Empty => MessageClass::Empty,
            Code::Request(method) => MessageClass::Request(method.into()),
            Code::Response(status) => MessageClass::Response(status.into()),
        }
    }
}

impl TryFrom<MessageClass> for Code {
    type Error = PduError;

    fn try_from(class: MessageClass) -> Result<Self, Self::Error> {
        match class {
            MessageClass::Empty => Ok(Code::Empty),
            MessageClass::Request(RequestType::Get) => Ok(Code::Request(Method::Get)),
            MessageClass::Request(RequestType::Post) => Ok(Code::Request(Method::Post)),
            MessageClass::Request(RequestType::Put) => Ok(Code::Request(Method::Put)),
            MessageClass::Response(response) => Status::try_from(response).map(Code::Response),
            other => Err(PduError::Malformed(format!("unsupported code {other:?}"))),
        }
    }
}

/// Ties a response to the request that caused it. The message id is the
/// CoAP header id, the token travels in the token field (at most 8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Correlation {
    pub message_id: u16,
    pub token: u64,
}

impl Correlation {
    pub fn new(message_id: u16, token: u64) -> Self {
        Self { message_id, token }
    }

    fn token_bytes(&self) -> Vec<u8> {
        // Trim leading zero bytes so small tokens stay small on the wire
        let bytes = self.token.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        bytes[skip..].to_vec()
    }

    fn from_parts(message_id: u16, token: &[u8]) -> Result<Self, PduError> {
        if token.len() > 8 {
            return Err(PduError::Malformed(format!(
                "token of {} bytes",
                token.len()
            )));
        }
        let token = token.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        Ok(Self { message_id, token })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pdu {
    pub kind: MessageType,
    pub code: Code,
    pub uri_path: Option<String>,
    pub correlation: Correlation,
    pub payload: Vec<u8>,
}

impl Pdu {
    /// Confirmable request addressed to `path`
    pub fn request(method: Method, path: &str, correlation: Correlation, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Confirmable,
            code: Code::Request(method),
            uri_path: Some(path.to_string()),
            correlation,
            payload,
        }
    }

    /// Piggybacked response: acknowledges the request and echoes its
    /// correlation so the sender can match it
    pub fn response(status: Status, correlation: Correlation, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Acknowledgement,
            code: Code::Response(status),
            uri_path: None,
            correlation,
            payload,
        }
    }

    /// Response to `request` in the matching message type: an acknowledgement
    /// for a confirmable request, a non-confirmable reply otherwise
    pub fn reply_to(request: &Pdu, status: Status, payload: Vec<u8>) -> Self {
        let kind = match request.kind {
            MessageType::NonConfirmable => MessageType::NonConfirmable,
            _ => MessageType::Acknowledgement,
        };
        Self {
            kind,
            ..Self::response(status, request.correlation, payload)
        }
    }

    pub fn status(&self) -> Option<Status> {
        match self.code {
            Code::Response(status) => Some(status),
            _ => None,
        }
    }

    /// Encode into a datagram buffer. The whole route is written as a single
    /// URI-Path option
    pub fn encode(&self, max_size: usize) -> Result<Vec<u8>, PduError> {
        let mut packet = Packet::new();
        packet.header.set_type(self.kind);
        packet.header.code = self.code.into();
        packet.header.message_id = self.correlation.message_id;
        packet.set_token(self.correlation.token_bytes());
        if let Some(path) = &self.uri_path {
            packet.add_option(CoapOption::UriPath, path.as_bytes().to_vec());
        }
        packet.payload.clone_from(&self.payload);

        let bytes = packet.to_bytes().map_err(|e| match e {
            MessageError::InvalidPacketLength => PduError::TooLarge {
                size: self.payload.len(),
                max: max_size,
            },
            e => PduError::from(e),
        })?;

        if bytes.len() > max_size {
            return Err(PduError::TooLarge {
                size: bytes.len(),
                max: max_size,
            });
        }
        Ok(bytes)
    }

    /// Decode a received datagram. Failure is an ordinary error: callers drop
    /// the datagram and keep serving
    pub fn decode(buffer: &[u8]) -> Result<Self, PduError> {
        let packet = Packet::from_bytes(buffer)?;
        let code = Code::try_from(packet.header.code)?;
        let correlation = Correlation::from_parts(packet.header.message_id, packet.get_token())?;

        let uri_path = match packet.get_option(CoapOption::UriPath) {
            Some(segments) => Some(Self::join_path(segments.iter())?),
            None => None,
        };

        Ok(Self {
            kind: packet.header.get_type(),
            code,
            uri_path,
            correlation,
            payload: packet.payload,
        })
    }

    /// A single option holding `/a/b` is taken verbatim; segmented options
    /// (`a`, `b`) are joined the way a standard CoAP client would send them
    fn join_path<'a>(segments: impl Iterator<Item = &'a Vec<u8>>) -> Result<String, PduError> {
        let mut path = String::new();
        for segment in segments {
            let segment = std::str::from_utf8(segment)
                .map_err(|_| PduError::Malformed("URI-Path is not UTF-8".to_string()))?;
            if !segment.starts_with('/') {
                path.push('/');
            }
            path.push_str(segment);
        }
        if path.is_empty() {
            path.push('/');
        }
        Ok(path)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, PduError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

impl From<Status> for ResponseType {
    fn from(status: Status) -> Self {
        match status {
            Status::Created => ResponseType::Created,
            Status::Changed => ResponseType::Changed,
            Status::Content => ResponseType::Content,
            Status::BadRequest => ResponseType::BadRequest,
            Status::Unauthorized => ResponseType::Unauthorized,
            Status::NotFound => ResponseType::NotFound,
            Status::InternalError => ResponseType::InternalServerError,
        }
    }
}

impl TryFrom<ResponseType> for Status {
    type Error = PduError;

    fn try_from(response: ResponseType) -> Result<Self, Self::Error> {
        match response {
            ResponseType::Created => Ok(Status::Created),
            ResponseType::Changed => Ok(Status::Changed),
            ResponseType::Content => Ok(Status::Content),
            ResponseType::BadRequest => Ok(Status::BadRequest),
            ResponseType::Unauthorized => Ok(Status::Unauthorized),
            ResponseType::NotFound => Ok(Status::NotFound),
            ResponseType::InternalServerError => Ok(Status::InternalError),
            other => Err(PduError::Malformed(format!(
                "unsupported response {other:?}"
            ))),
        }
    }
}
