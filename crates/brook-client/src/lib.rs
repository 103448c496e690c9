//! brook-client - MQTT 3.1.1 client library.
//!
//! `ClientProtocol` is the client-role protocol handler with no I/O of its
//! own. `Client` drives it over a non-blocking mio socket.
//!
//! # Example
//!
//! ```ignore
//! use brook_client::{Client, ClientConfig, ClientEvent, QoS};
//!
//! let config = ClientConfig::new("localhost:1883")
//!     .client_id("my-client")
//!     .clean_session(false)
//!     .session_store("my-client.json");
//!
//! let mut client = Client::new(config)?;
//! client.connect()?;
//!
//! // Subscribe once CONNACK has arrived
//! while let Ok(_) = client.poll(None) {
//!     while let Some(event) = client.next_event() {
//!         match event {
//!             ClientEvent::Connected { .. } => {
//!                 client.subscribe(&[("sensors/#", QoS::AtLeastOnce)])?;
//!                 client.publish("sensors/temp", "25.5", QoS::AtMostOnce, false)?;
//!             }
//!             ClientEvent::Message { topic, payload, .. } => println!("{topic}: {payload:?}"),
//!             _ => {}
//!         }
//!     }
//! }
//! ```

mod client;
mod config;
mod error;
mod events;
mod protocol;
mod store;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use events::{ClientEvent, ConnectionState};
pub use protocol::ClientProtocol;

// Re-export useful types from core
pub use brook_core::{ConnackCode, InflightState, QoS};
