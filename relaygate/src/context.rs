//! Request-scoped context values.
//!
//! Per-request state is collapsed into a single typed struct rather than
//! threaded as loose arguments, the same way `Request::extensions_mut()` is
//! used elsewhere in this crate for passing a typed value between layers
//! that don't otherwise share a call stack.

use std::collections::HashMap;
use std::time::Instant;

use bitflags::bitflags;
use gateway_core::Strng;
use serde_json::Map as JsonMap;
use serde_json::Value as JsonValue;

bitflags! {
	/// Which bodies must be buffered before the endpoint engine runs its
	/// producers, computed once per-endpoint at load time from the union of
	/// every child expression's referenced attributes and every producer's
	/// own body-forwarding behavior.
	#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
	pub struct BufferOptions: u8 {
		const REQUEST_BODY      = 0b0001;
		const REQUEST_JSON_BODY = 0b0010;
		const REQUEST_FORM_BODY = 0b0100;
		/// Any downstream expression references `backend_responses.*.body` or
		/// similar, meaning a response body must be fully materialized
		/// (disabling streaming) rather than piped through.
		const RESPONSE_BODY     = 0b1000;
	}
}

impl BufferOptions {
	pub fn requires_request_buffering(self) -> bool {
		self.intersects(
			BufferOptions::REQUEST_BODY | BufferOptions::REQUEST_JSON_BODY | BufferOptions::REQUEST_FORM_BODY,
		)
	}
}

pub type Claims = JsonMap<String, JsonValue>;

#[derive(Clone, Debug)]
pub struct RequestContext {
	/// name -> validated claims, one entry per access-control validator that
	/// ran successfully.
	pub access_controls: HashMap<Strng, Claims>,
	/// Ordered, de-duplicated union of every validator's granted permissions.
	pub granted_permissions: Vec<String>,
	pub path_params: HashMap<String, String>,
	pub wildcard: Option<String>,
	pub start_time: Instant,
	pub buffer_options: BufferOptions,
	pub handler: Option<Strng>,
	pub server_name: Option<Strng>,
	pub xff: Option<String>,
}

impl RequestContext {
	pub fn new(start_time: Instant) -> Self {
		RequestContext {
			access_controls: HashMap::new(),
			granted_permissions: Vec::new(),
			path_params: HashMap::new(),
			wildcard: None,
			start_time,
			buffer_options: BufferOptions::empty(),
			handler: None,
			server_name: None,
			xff: None,
		}
	}

	/// Trims whitespace, skips blanks, and is a no-op if the permission is
	/// already present.
	pub fn add_permission(&mut self, permission: &str) -> bool {
		let permission = permission.trim();
		if permission.is_empty() {
			return false;
		}
		if self.granted_permissions.iter().any(|p| p == permission) {
			return false;
		}
		self.granted_permissions.push(permission.to_string());
		true
	}

	pub fn add_permissions(&mut self, permissions: impl IntoIterator<Item = String>) {
		for p in permissions {
			self.add_permission(&p);
		}
	}

	/// Whether every one of `required` is present among this request's
	/// granted permissions. An empty `required` list is trivially satisfied.
	pub fn has_permissions(&self, required: &[String]) -> bool {
		required.iter().all(|r| self.granted_permissions.iter().any(|p| p == r))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn add_permission_dedupes_and_trims() {
		let mut ctx = RequestContext::new(Instant::now());
		assert!(ctx.add_permission(" read "));
		assert!(!ctx.add_permission("read"));
		assert!(!ctx.add_permission("  "));
		assert_eq!(ctx.granted_permissions, vec!["read".to_string()]);
	}

	#[test]
	fn has_permissions_requires_every_entry() {
		let mut ctx = RequestContext::new(Instant::now());
		ctx.add_permissions(["read".to_string(), "write".to_string()]);
		assert!(ctx.has_permissions(&["read".to_string()]));
		assert!(ctx.has_permissions(&["read".to_string(), "write".to_string()]));
		assert!(!ctx.has_permissions(&["delete".to_string()]));
		assert!(ctx.has_permissions(&[]));
	}

	#[test]
	fn buffer_options_request_vs_response() {
		let req = BufferOptions::REQUEST_JSON_BODY;
		assert!(req.requires_request_buffering());
		let resp = BufferOptions::RESPONSE_BODY;
		assert!(!resp.requires_request_buffering());
	}
}
