//! Portal connection set and tag index.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use telco_protocol::{ApplicationDescriptor, EndpointParameters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
	Node,
	Controller,
}

#[derive(Debug, Clone)]
pub(crate) struct PortalConnection {
	pub role: Role,
	pub address: String,
	pub tags: BTreeSet<String>,
	pub application: Option<ApplicationDescriptor>,
}

/// A message the portal handed to one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
	pub connection_id: u32,
	pub json: Option<String>,
	pub data: Option<Vec<u8>>,
}

#[derive(Debug)]
pub(crate) struct SimPortal {
	pub cluster: EndpointParameters,
	pub control: Option<EndpointParameters>,
	pub device_id: String,
	pub started: bool,
	next_connection: u32,
	connections: BTreeMap<u32, PortalConnection>,
	/// tag -> connections holding it
	tag_index: HashMap<String, BTreeSet<u32>>,
	pub delivered: Vec<Delivery>,
}

impl SimPortal {
	pub fn new(cluster: EndpointParameters, control: Option<EndpointParameters>, device_id: String) -> Self {
		Self {
			cluster,
			control,
			device_id,
			started: false,
			next_connection: 1,
			connections: BTreeMap::new(),
			tag_index: HashMap::new(),
			delivered: Vec::new(),
		}
	}

	/// Port controllers connect to: the control endpoint if there is one.
	pub fn control_port(&self) -> u16 {
		self.control.as_ref().map_or(self.cluster.port, |c| c.port)
	}

	pub fn connect(&mut self, role: Role, address: &str) -> u32 {
		let id = self.next_connection;
		self.next_connection += 1;
		self.connections.insert(
			id,
			PortalConnection {
				role,
				address: address.to_string(),
				tags: BTreeSet::new(),
				application: None,
			},
		);
		id
	}

	pub fn connection(&self, id: u32) -> Option<&PortalConnection> {
		self.connections.get(&id)
	}

	pub fn connection_mut(&mut self, id: u32) -> Option<&mut PortalConnection> {
		self.connections.get_mut(&id)
	}

	pub fn disconnect(&mut self, id: u32) -> Option<PortalConnection> {
		let conn = self.connections.remove(&id)?;
		for tag in &conn.tags {
			self.drop_from_index(tag, id);
		}
		Some(conn)
	}

	/// Drops every connection, returning them in id order.
	pub fn disconnect_all(&mut self) -> Vec<(u32, PortalConnection)> {
		self.tag_index.clear();
		std::mem::take(&mut self.connections).into_iter().collect()
	}

	pub fn ids(&self) -> Vec<u32> {
		self.connections.keys().copied().collect()
	}

	/// Adds `tag` to a connection. Unknown connections are ignored.
	pub fn tag(&mut self, id: u32, tag: &str) -> bool {
		let Some(conn) = self.connections.get_mut(&id) else {
			return false;
		};
		if conn.tags.insert(tag.to_string()) {
			self.tag_index.entry(tag.to_string()).or_default().insert(id);
		}
		true
	}

	pub fn untag(&mut self, id: u32, tag: &str) -> bool {
		let Some(conn) = self.connections.get_mut(&id) else {
			return false;
		};
		if conn.tags.remove(tag) {
			self.drop_from_index(tag, id);
		}
		true
	}

	pub fn tags(&self, id: u32) -> Vec<String> {
		self.connections
			.get(&id)
			.map(|c| c.tags.iter().cloned().collect())
			.unwrap_or_default()
	}

	pub fn holders(&self, tag: &str) -> Vec<u32> {
		self.tag_index
			.get(tag)
			.map(|ids| ids.iter().copied().collect())
			.unwrap_or_default()
	}

	pub fn deliver(&mut self, ids: &[u32], json: Option<&str>, data: Option<&[u8]>) {
		for &connection_id in ids {
			self.delivered.push(Delivery {
				connection_id,
				json: json.map(str::to_string),
				data: data.map(<[u8]>::to_vec),
			});
		}
	}

	fn drop_from_index(&mut self, tag: &str, id: u32) {
		if let Some(ids) = self.tag_index.get_mut(tag) {
			ids.remove(&id);
			if ids.is_empty() {
				self.tag_index.remove(tag);
			}
		}
	}
}
