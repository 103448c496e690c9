//! brook-server - MQTT 3.1.1 broker.
//!
//! The broker state (sessions, subscriptions, retained messages) lives in
//! [`broker::Broker`]. [`connection::Connection`] runs the server side of the
//! protocol for one client, and [`server::Server`] drives both over mio.

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod persistence;
pub mod retain;
pub mod server;
pub mod session;
pub mod signals;
pub mod subscription;
