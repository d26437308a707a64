//! telco - Rust client for the telco dynamic instrumentation engine
//!
//! Discover devices, enumerate and spawn processes, attach sessions, load
//! scripts and run a cluster portal, all through an engine reached over a
//! handle-based boundary protocol.
//!
//! # Example
//!
//! ```ignore
//! use telco::{Config, Scope, SessionOptions, Telco};
//!
//! #[tokio::main]
//! async fn main() -> telco::Result<()> {
//!     let telco = Telco::launch(Config::from_env()?).await?;
//!     let manager = telco.device_manager().await?;
//!     let device = manager.local_device().await?;
//!
//!     let session = device.attach("notes", SessionOptions::default()).await?;
//!     let script = session.create_script("send('hi')", Default::default()).await?;
//!     let _sub = script.on("message", |signal| println!("{signal:?}"))?;
//!     script.load().await?;
//!
//!     telco.shutdown().await
//! }
//! ```
//!
//! # Ownership
//!
//! Every wrapper owns exactly one engine reference and gives it back on
//! `release()` or drop; releasing twice is a no-op. Values delivered to
//! signal callbacks are borrowed from the engine and are only valid for the
//! duration of the callback.
//!
//! Wrappers are `Send + Sync`, but calls on one object from several tasks
//! must be serialized by the caller.

mod compiler;
mod context;
mod device;
mod device_manager;
pub mod handlers;
mod io_stream;
mod membership;
mod portal;
mod process;
mod script;
mod session;
pub mod signals;
mod target;
mod telco;

pub use compiler::Compiler;
pub use context::Context;
pub use device::Device;
pub use device_manager::DeviceManager;
pub use handlers::Subscription;
pub use io_stream::IoStream;
pub use membership::PortalMembership;
pub use portal::PortalService;
pub use process::{Application, Child, Crash, Process, Spawn};
pub use script::Script;
pub use session::Session;
pub use signals::{CompilerSignal, DeviceSignal, ManagerSignal, PortalSignal, ScriptSignal, SessionSignal, Signal};
pub use target::Target;
pub use telco::Telco;
pub use telco_protocol::*;
pub use telco_runtime::{Config, Error, HandleKind, Result, TransportParts, memory_pair};
