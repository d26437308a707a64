//! telco runtime - engine boundary plumbing
//!
//! Low-level infrastructure shared by the `telco` API crate and the engine
//! simulator:
//!
//! - **Engine**: locating and launching the engine executable
//! - **Transport**: stdio pipes, WebSocket, or an in-memory pair
//! - **Connection**: request/response correlation and per-object signal FIFOs
//! - **Handle**: single-owner engine references with idempotent release
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │    telco    │  DeviceManager, Device, Session, PortalService, ...
//! └──────┬──────┘
//!        │ Channel (one per wrapper object)
//! ┌──────▼──────┐
//! │telco-runtime│  This crate
//! │  ┌────────┐ │
//! │  │ Handle │ │  ownership, release strategy
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Conn   │ │  correlation, signal routing
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Trans  │ │  pipe / websocket / memory
//! │  └────────┘ │
//! └─────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod handle;
pub mod transport;

pub use channel::Channel;
pub use config::Config;
pub use connection::{
	CLOSE, CONNECT, Connection, ConnectionLike, DISCONNECT, ErrorPayload, Event, Inbound, Message, Notification,
	Request, Response, SignalReceiver, UNREF,
};
pub use engine::{EngineProcess, find_engine};
pub use error::{Error, Result};
pub use handle::{Handle, HandleKind};
pub use transport::{
	BoxFuture, MemoryTransportReceiver, MemoryTransportSender, PipeTransport, PipeTransportReceiver,
	PipeTransportSender, Transport, TransportParts, TransportReceiver, WebSocketTransport, WebSocketTransportReceiver,
	WebSocketTransportSender, memory_pair,
};
