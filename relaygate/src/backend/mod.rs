//! Backend transport: connects to upstream services with connect/TTFB/
//! overall timeouts, gzip negotiation, optional OpenAPI request and
//! response validation, and a classification of transport failures into
//! [`crate::error::ErrorKind`] variants.
//!
//! Outbound transport is built directly on `reqwest`, with a
//! [`transport::TimeoutBody`] wrapper enforcing the overall deadline on the
//! response body stream once headers have already arrived.

pub mod openapi;
pub mod producer;
pub mod transport;

use std::time::Duration;

use gateway_core::Strng;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BackendConfig {
	pub name: Strng,
	pub origin: String,
	#[serde(default)]
	pub hostname: Option<String>,
	#[serde(default)]
	pub path: Option<String>,
	#[serde(default)]
	pub request_headers: std::collections::HashMap<String, String>,
	#[serde(default)]
	pub response_headers: std::collections::HashMap<String, String>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub connect_timeout: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub ttfb_timeout: Option<Duration>,
	#[serde(default, with = "crate::serdes::serde_dur_option")]
	pub timeout: Option<Duration>,
	#[serde(default)]
	pub request_body_limit: Option<String>,
	#[serde(default)]
	pub disable_certificate_validation: bool,
}

impl BackendConfig {
	/// Merge semantics: an endpoint-inline backend override replaces only
	/// the fields it sets, keeping everything else from the named backend
	/// it refines.
	pub fn merge(&self, override_cfg: &BackendConfig) -> BackendConfig {
		BackendConfig {
			name: override_cfg.name.clone(),
			origin: if override_cfg.origin.is_empty() {
				self.origin.clone()
			} else {
				override_cfg.origin.clone()
			},
			hostname: override_cfg.hostname.clone().or_else(|| self.hostname.clone()),
			path: override_cfg.path.clone().or_else(|| self.path.clone()),
			request_headers: merge_maps(&self.request_headers, &override_cfg.request_headers),
			response_headers: merge_maps(&self.response_headers, &override_cfg.response_headers),
			connect_timeout: override_cfg.connect_timeout.or(self.connect_timeout),
			ttfb_timeout: override_cfg.ttfb_timeout.or(self.ttfb_timeout),
			timeout: override_cfg.timeout.or(self.timeout),
			request_body_limit: override_cfg
				.request_body_limit
				.clone()
				.or_else(|| self.request_body_limit.clone()),
			disable_certificate_validation: override_cfg.disable_certificate_validation
				|| self.disable_certificate_validation,
		}
	}
}

fn merge_maps(
	base: &std::collections::HashMap<String, String>,
	over: &std::collections::HashMap<String, String>,
) -> std::collections::HashMap<String, String> {
	let mut out = base.clone();
	out.extend(over.clone());
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn merge_keeps_base_fields_not_overridden() {
		let base = BackendConfig {
			name: Strng::from("api"),
			origin: "https://api.example.com".into(),
			hostname: None,
			path: None,
			request_headers: Default::default(),
			response_headers: Default::default(),
			connect_timeout: Some(Duration::from_secs(2)),
			ttfb_timeout: None,
			timeout: None,
			request_body_limit: None,
			disable_certificate_validation: false,
		};
		let over = BackendConfig {
			name: Strng::from("api"),
			origin: String::new(),
			hostname: None,
			path: Some("/v2".into()),
			request_headers: Default::default(),
			response_headers: Default::default(),
			connect_timeout: None,
			ttfb_timeout: None,
			timeout: None,
			request_body_limit: None,
			disable_certificate_validation: false,
		};
		let merged = base.merge(&over);
		assert_eq!(merged.origin, "https://api.example.com");
		assert_eq!(merged.path.as_deref(), Some("/v2"));
		assert_eq!(merged.connect_timeout, Some(Duration::from_secs(2)));
	}
}
