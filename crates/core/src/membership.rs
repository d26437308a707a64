//! Portal membership of an attached process.

use serde_json::Value;
use telco_protocol::MembershipDescriptor;
use telco_runtime::{Channel, HandleKind, Result};

use crate::context::Context;

/// Returned by [`Session::join_portal`](crate::Session::join_portal).
#[derive(Debug)]
pub struct PortalMembership {
	id: u32,
	channel: Channel,
}

impl PortalMembership {
	pub(crate) fn adopt(ctx: &Context, desc: MembershipDescriptor) -> Self {
		Self {
			id: desc.id,
			channel: ctx.channel(desc.handle, HandleKind::Object, "portal membership"),
		}
	}

	pub fn id(&self) -> u32 {
		self.id
	}

	/// Leaves the portal.
	pub async fn terminate(&self) -> Result<()> {
		self.channel.send_no_result("terminate", Value::Null).await
	}

	pub fn release(self) {
		self.channel.release();
	}
}
