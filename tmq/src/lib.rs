#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//! use futures::channel::mpsc;
//! use futures::StreamExt;
//! use tmq::broker::Broker;
//! use tmq::types::Packet;
//!
//! #[tokio::main]
//! async fn main() -> tmq::Result<()> {
//!     let broker = Broker::builder().build();
//!     let _ticker = broker.start();
//!
//!     //any decoded packet stream and packet sink will do, e.g. a framed TCP connection
//!     let (_in_tx, in_rx) = mpsc::unbounded::<Packet>();
//!     let (out_tx, _out_rx) = mpsc::unbounded::<Packet>();
//!     tmq::server::serve(broker, in_rx.map(Ok::<_, std::io::Error>), out_tx).await
//! }
//! ```

pub mod broker; // Session table and client entry points
pub mod delivery; // Per-session QoS handshake engine
pub mod error; // Protocol error taxonomy
pub mod hook; // Subscribe policy and lifecycle hooks
pub mod inflight; // In-flight windows, outbound and inbound
pub mod logger; // log facade routed into slog
pub mod queue; // Bounded per-session backlog
pub mod registry; // Topic filter -> subscriber index
pub mod retain; // Retained message storage
pub mod router; // Publish fan-out
pub mod server; // Per-connection driver
pub mod session; // Client session state
pub mod stats; // Broker counters
pub mod topic; // Topic parsing and matching
pub mod types; // Packets and shared value types

pub use tmq_conf as conf;
pub use tmq_utils as utils;

pub use error::MqttError;
pub use types::{QoS, Reason};

pub type Error = anyhow::Error;
pub type Result<T, E = Error> = anyhow::Result<T, E>;
