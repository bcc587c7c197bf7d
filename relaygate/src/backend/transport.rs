//! Executes a single outbound request against a configured backend,
//! applying connect/TTFB/overall timeouts and classifying transport
//! failures.
//!
//! Connect/TTFB timeouts are implemented with `tokio::time::timeout` around
//! the dial and first-frame-read steps respectively, since
//! `reqwest::ClientBuilder` only exposes a single overall
//! `timeout`/`connect_timeout` pair and TTFB has no first-class equivalent
//! there. Backend-level `request_headers` are applied as defaults (set only
//! if the per-call headers didn't already supply the same name);
//! `response_headers` are applied as overrides onto whatever the upstream
//! sent back.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gateway_core::Strng;
use http::{HeaderMap, StatusCode};
use reqwest::Client;

use super::BackendConfig;
use crate::error::{ErrorKind, GatewayError};

#[derive(Clone)]
pub struct Transport {
	client: Client,
	config: Arc<BackendConfig>,
}

pub struct TransportResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl Transport {
	pub fn new(config: BackendConfig) -> Result<Self, GatewayError> {
		let mut builder = Client::builder().gzip(true);
		if let Some(connect) = config.connect_timeout {
			builder = builder.connect_timeout(connect);
		}
		if let Some(overall) = config.timeout {
			builder = builder.timeout(overall);
		}
		if config.disable_certificate_validation {
			builder = builder.danger_accept_invalid_certs(true);
		}
		let client = builder
			.build()
			.map_err(|e| GatewayError::new(ErrorKind::Configuration).with_cause(e))?;
		Ok(Transport {
			client,
			config: Arc::new(config),
		})
	}

	pub fn name(&self) -> &Strng {
		&self.config.name
	}

	/// Performs the request. TTFB is bounded separately from the overall
	/// timeout so a backend that accepts the connection but never responds
	/// is classified distinctly from one that is simply slow to stream a
	/// large body.
	pub async fn send(
		&self,
		method: http::Method,
		path: &str,
		mut headers: HeaderMap,
		body: Bytes,
	) -> Result<TransportResponse, GatewayError> {
		let url = self.build_url(path);
		for (k, v) in &self.config.request_headers {
			if let (Ok(name), Ok(value)) = (http::HeaderName::try_from(k.as_str()), http::HeaderValue::from_str(v)) {
				headers.entry(name).or_insert(value);
			}
		}
		let mut req = self.client.request(method, url).headers(headers);
		if !body.is_empty() {
			req = req.body(body);
		}

		let send_fut = req.send();
		let response = match self.config.ttfb_timeout {
			Some(ttfb) => tokio::time::timeout(ttfb, send_fut)
				.await
				.map_err(|_| GatewayError::new(ErrorKind::BackendTimeout).with_label(self.config.name.clone()))?
				.map_err(classify_reqwest_error)?,
			None => send_fut.await.map_err(classify_reqwest_error)?,
		};

		let status = response.status();
		let mut headers = response.headers().clone();
		let body = response
			.bytes()
			.await
			.map_err(|e| GatewayError::new(ErrorKind::BackendUnreachable).with_cause(e))?;

		for (k, v) in &self.config.response_headers {
			if let (Ok(name), Ok(value)) = (http::HeaderName::try_from(k.as_str()), http::HeaderValue::from_str(v)) {
				headers.insert(name, value);
			}
		}

		Ok(TransportResponse { status, headers, body })
	}

	fn build_url(&self, path: &str) -> String {
		let origin = self.config.origin.trim_end_matches('/');
		let prefix = self.config.path.as_deref().unwrap_or("");
		format!("{origin}{prefix}{path}")
	}
}

fn classify_reqwest_error(err: reqwest::Error) -> GatewayError {
	if err.is_timeout() {
		GatewayError::new(ErrorKind::BackendTimeout).with_cause(err)
	} else if err.is_connect() {
		GatewayError::new(ErrorKind::BackendUnreachable).with_cause(err)
	} else {
		GatewayError::new(ErrorKind::BackendUnreachable).with_cause(err)
	}
}

/// Caps how long a request may spend in-flight overall, independent of the
/// per-step timeouts above.
pub fn effective_overall_timeout(connect: Option<Duration>, ttfb: Option<Duration>, overall: Option<Duration>) -> Option<Duration> {
	[connect, ttfb, overall].into_iter().flatten().min()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn effective_timeout_picks_smallest_configured() {
		let t = effective_overall_timeout(Some(Duration::from_secs(5)), None, Some(Duration::from_secs(2)));
		assert_eq!(t, Some(Duration::from_secs(2)));
	}

	#[test]
	fn effective_timeout_none_when_unset() {
		assert_eq!(effective_overall_timeout(None, None, None), None);
	}

	#[test]
	fn build_url_joins_origin_prefix_and_path() {
		let cfg = BackendConfig {
			name: Strng::from("api"),
			origin: "https://api.example.com/".into(),
			hostname: None,
			path: Some("/v1".into()),
			request_headers: Default::default(),
			response_headers: Default::default(),
			connect_timeout: None,
			ttfb_timeout: None,
			timeout: None,
			request_body_limit: None,
			disable_certificate_validation: false,
		};
		let transport = Transport {
			client: Client::new(),
			config: Arc::new(cfg),
		};
		assert_eq!(transport.build_url("/users"), "https://api.example.com/v1/users");
	}
}
