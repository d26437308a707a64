//! Byte payloads crossing the boundary.
//!
//! Payloads travel as base64 strings inside the JSON message. Outgoing payloads
//! are described by [`TransferBuffer`], which borrows the caller's slice: the
//! borrow lives exactly as long as the call that consumes it, so the bytes can
//! neither be reclaimed nor mutated while the request is in flight.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Borrowed byte payload for a single boundary call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferBuffer<'a> {
	bytes: &'a [u8],
}

impl<'a> TransferBuffer<'a> {
	pub fn new(bytes: &'a [u8]) -> Self {
		Self { bytes }
	}

	pub fn len(&self) -> usize {
		self.bytes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.bytes.is_empty()
	}

	pub fn as_bytes(&self) -> &'a [u8] {
		self.bytes
	}
}

impl<'a> From<&'a [u8]> for TransferBuffer<'a> {
	fn from(bytes: &'a [u8]) -> Self {
		Self::new(bytes)
	}
}

impl<'a> From<&'a Vec<u8>> for TransferBuffer<'a> {
	fn from(bytes: &'a Vec<u8>) -> Self {
		Self::new(bytes.as_slice())
	}
}

impl Serialize for TransferBuffer<'_> {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&STANDARD.encode(self.bytes))
	}
}

/// Decodes a base64 payload received from the engine.
pub fn decode(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
	STANDARD.decode(encoded)
}

/// Encodes bytes the way the engine expects them.
pub fn encode(bytes: &[u8]) -> String {
	STANDARD.encode(bytes)
}

/// Serde adapter for owned `Vec<u8>` fields carried as base64.
pub mod base64_bytes {
	use super::*;

	pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&STANDARD.encode(bytes))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(deserializer)?;
		STANDARD.decode(s).map_err(serde::de::Error::custom)
	}
}

/// Serde adapter for optional base64 fields. Use with `#[serde(default)]`.
pub mod base64_bytes_opt {
	use super::*;

	pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
		match bytes {
			Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
		let s = Option::<String>::deserialize(deserializer)?;
		s.map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom)).transpose()
	}
}
