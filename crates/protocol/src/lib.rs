//! Wire types for the telco engine boundary.
//!
//! This crate contains the serde-serializable types exchanged with the
//! instrumentation engine: enums, option objects, object descriptors, the
//! transfer buffer used for byte payloads, and the portal message envelope.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond serialization/deserialization and builders
//! - **1:1 with the boundary**: Field names match what the engine expects
//! - **Stable**: Changes only when the boundary contract changes
//!
//! Handle-owning wrappers (devices, sessions, portals) are built on top of
//! these types in the `telco` crate.

pub mod buffer;
pub mod descriptors;
pub mod envelope;
pub mod options;
pub mod types;

pub use buffer::TransferBuffer;
pub use descriptors::*;
pub use envelope::Envelope;
pub use options::*;
pub use types::*;

/// Raw engine handle identifier. `0` is the nil handle.
pub type HandleId = u64;

/// The nil handle value.
pub const NIL_HANDLE: HandleId = 0;
