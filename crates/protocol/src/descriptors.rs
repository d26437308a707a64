//! Object descriptors returned by the engine.
//!
//! Every engine object reference is a JSON object with a `handle` field plus
//! the immutable fields the engine reports for that kind of object. A missing
//! or zero `handle` is a nil reference.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::buffer::base64_bytes;
use crate::types::{Bus, ChildOrigin, DeviceType};
use crate::HandleId;

/// Bare object reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRef {
	#[serde(default)]
	pub handle: HandleId,
}

/// Opaque device or application icon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Icon {
	/// Image format reported by the engine (e.g. `rgba`, `png`)
	pub format: String,
	#[serde(default)]
	pub width: u32,
	#[serde(default)]
	pub height: u32,
	#[serde(with = "base64_bytes")]
	pub image: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
	#[serde(default)]
	pub handle: HandleId,
	pub id: String,
	pub name: String,
	#[serde(rename = "type")]
	pub kind: DeviceType,
	#[serde(default)]
	pub bus: Bus,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub icon: Option<Icon>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
	#[serde(default)]
	pub handle: HandleId,
	pub pid: u32,
	pub name: String,
	#[serde(default)]
	pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDescriptor {
	#[serde(default)]
	pub handle: HandleId,
	pub identifier: String,
	pub name: String,
	/// `0` when the application is not running.
	#[serde(default)]
	pub pid: u32,
	#[serde(default)]
	pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnDescriptor {
	#[serde(default)]
	pub handle: HandleId,
	pub pid: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub identifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildDescriptor {
	#[serde(default)]
	pub handle: HandleId,
	pub pid: u32,
	pub parent_pid: u32,
	pub origin: ChildOrigin,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub identifier: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub argv: Option<Vec<String>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub envp: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashDescriptor {
	#[serde(default)]
	pub handle: HandleId,
	pub pid: u32,
	pub process_name: String,
	pub summary: String,
	pub report: String,
	#[serde(default)]
	pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
	#[serde(default)]
	pub handle: HandleId,
	pub pid: u32,
	#[serde(default)]
	pub persist_timeout: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipDescriptor {
	#[serde(default)]
	pub handle: HandleId,
	pub id: u32,
}

/// Enumeration result: the list container is its own handle, released
/// independently of the element handles it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListDescriptor<T> {
	#[serde(default)]
	pub list: HandleId,
	pub items: Vec<T>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn missing_handle_is_nil() {
		let d: SpawnDescriptor = serde_json::from_str(r#"{"pid": 42}"#).unwrap();
		assert_eq!(d.handle, crate::NIL_HANDLE);
		assert!(d.identifier.is_none());
	}

	#[test]
	fn device_type_field_is_renamed() {
		let d: DeviceDescriptor =
			serde_json::from_value(serde_json::json!({"handle": 3, "id": "local", "name": "Local System", "type": "local"}))
				.unwrap();
		assert_eq!(d.kind, DeviceType::Local);
		assert_eq!(d.bus, Bus::Local);
	}

	#[test]
	fn list_descriptor_keeps_item_order() {
		let l: ListDescriptor<SpawnDescriptor> = serde_json::from_value(serde_json::json!({
			"list": 9,
			"items": [{"handle": 4, "pid": 1}, {"handle": 5, "pid": 2}]
		}))
		.unwrap();
		assert_eq!(l.list, 9);
		assert_eq!(l.items.iter().map(|s| s.pid).collect::<Vec<_>>(), vec![1, 2]);
	}
}
