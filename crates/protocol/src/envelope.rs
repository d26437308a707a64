//! Portal message envelope.
//!
//! Every portal message pairs a UTF-8 JSON metadata document with an optional
//! uninterpreted binary payload. The two travel as one unit; either may be
//! absent independently.

use serde::Serialize;
use serde::de::IgnoredAny;

use crate::buffer::TransferBuffer;

/// Outgoing portal message borrowing the caller's text and bytes for the
/// duration of one call.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Envelope<'a> {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub json: Option<&'a str>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<TransferBuffer<'a>>,
}

impl<'a> Envelope<'a> {
	/// Metadata-only message.
	pub fn json(json: &'a str) -> Self {
		Self {
			json: Some(json),
			data: None,
		}
	}

	/// Payload-only message.
	pub fn data(data: &'a [u8]) -> Self {
		Self {
			json: None,
			data: Some(TransferBuffer::new(data)),
		}
	}

	/// Either part, both or neither.
	pub fn new(json: Option<&'a str>, data: Option<&'a [u8]>) -> Self {
		Self {
			json,
			data: data.map(TransferBuffer::new),
		}
	}

	/// Checks that the metadata, if present, is a well-formed JSON document.
	pub fn validate(&self) -> Result<(), serde_json::Error> {
		if let Some(json) = self.json {
			let _: IgnoredAny = serde_json::from_str(json)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn absent_parts_are_omitted() {
		let v = serde_json::to_value(Envelope::json(r#"{"type":"ping"}"#)).unwrap();
		assert_eq!(v, serde_json::json!({"json": "{\"type\":\"ping\"}"}));

		let v = serde_json::to_value(Envelope::data(b"\x01\x02")).unwrap();
		assert_eq!(v, serde_json::json!({"data": "AQI="}));

		let v = serde_json::to_value(Envelope::new(None, Some(b"\x01\x02"))).unwrap();
		assert_eq!(v, serde_json::json!({"data": "AQI="}));
	}

	#[test]
	fn malformed_metadata_fails_validation() {
		assert!(Envelope::json("{not json").validate().is_err());
		assert!(Envelope::json("[1,2,3]").validate().is_ok());
		assert!(Envelope::data(b"raw").validate().is_ok());
	}
}
