//! hub-server
//!
//! Async real-time connection hub: tracks which user owns which
//! connections and fans envelopes out to them without letting one slow
//! peer hold up the rest.

pub mod config;
pub mod types;
pub mod handler;
pub mod connection;
pub mod hub;
pub mod server;
pub mod logging;

// the coordinating loop is internal, driven through `hub::Hub`
mod hub_task;

pub use config::{HubConfig, ServerConfig};
pub use connection::{Connection, ConnectionHandle, ConnectionState, Transport};
pub use handler::{LogHandler, MessageHandler};
pub use hub::Hub;
pub use types::CounterSnapshot;
