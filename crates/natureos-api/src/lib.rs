// natureos-api: async transport gateway for the NatureOS platform.
//
// `Transport` is the boundary the runtime depends on. `HttpTransport`
// implements it over reqwest (REST) and tokio-tungstenite (sensor streams).

pub mod client;
pub mod error;
pub mod gateway;
pub mod models;
pub mod transport;
mod websocket;

pub use client::HttpTransport;
pub use error::Error;
pub use gateway::{
    Ack, AckStatus, Connectivity, EventStream, FailureKind, Fetched, StreamEvent, StreamPosition,
    Transport, TransportError,
};
pub use transport::{TlsMode, TransportConfig};
