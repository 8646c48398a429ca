//! Wire definitions shared by the context broker and its clients.
//!
//! Every message exchanged between providers, consumers and the broker is a
//! CoAP style PDU carried in a single UDP datagram: a message type, a request
//! method or response status, one URI-Path option naming the route, and a
//! JSON payload. This crate owns the [`Pdu`] codec plus the small set of
//! types both sides need to agree on: the [`Route`] table, the [`Status`]
//! codes and the [`Reply`] body returned by every handler.
//!
//! # Examples
//! ```rust
//! use cotas_pdu::{Correlation, Method, Pdu, Route};
//!
//! let request = Pdu::request(
//!     Method::Post,
//!     Route::SubscribeObject.path(),
//!     Correlation::new(1, 0xfeed),
//!     br#"{"type":"Camera","port":19}"#.to_vec(),
//! );
//! let bytes = request.encode(cotas_pdu::DEFAULT_MAX_PDU_SIZE).unwrap();
//! let decoded = Pdu::decode(&bytes).unwrap();
//! assert_eq!(decoded.uri_path.as_deref(), Some("/subscribe/object"));
//! ```

mod codec;
mod message;

pub use codec::{Code, Correlation, Method, Pdu, PduError, DEFAULT_MAX_PDU_SIZE};
pub use coap_lite::MessageType;
pub use message::{Endpoint, Reply, Route, Status};

/// Identifier handed out by the broker on subscription. Sampled from
/// [`MIN_OBJECT_ID`]..[`MAX_OBJECT_ID`]; zero means "not registered"
pub type ObjectId = u32;

pub const MIN_OBJECT_ID: ObjectId = 20_000;
pub const MAX_OBJECT_ID: ObjectId = 20_000_000;

/// Default port the broker listens on
pub const BROKER_PORT: u16 = 5683;
