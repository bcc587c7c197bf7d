//! Bridges a configured [`BackendConfig`] to the endpoint engine's
//! [`Producer`](crate::endpoint::Producer) trait: this is what a `proxy { }`
//! or `request { }` block compiles down to.
//!
//! Request shaping (wildcard substitution into the path template, header
//! mutations, optional OpenAPI validation before send and after receive,
//! `expected_status` classification) happens here, one call per configured
//! proxy/request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use gateway_core::Strng;
use http::{HeaderMap, HeaderName, HeaderValue, Method};

use super::openapi::{OpenApiValidator, ValidationError};
use super::transport::Transport;
use crate::endpoint::{EndpointError, Producer, ProducerOutcome};
use crate::error::{ErrorKind, GatewayError};
use crate::expr::{BackendCallBinding, EvalContext, Expression};

/// Whether produced results stream through to the client by default (a
/// `proxy` block) or are only ever bound by name for later expressions (a
/// `request` block). Response assembly only considers proxies for the
/// single-producer passthrough path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
	Proxy,
	Request,
}

pub struct BackendCall {
	pub name: Strng,
	pub kind: Kind,
	pub transport: Transport,
	pub method: Method,
	/// e.g. `/api/{id}` or `/files/**`; `**` is replaced with the matched
	/// route's wildcard remainder before the call is made.
	pub path_template: String,
	pub request_headers: HashMap<String, Arc<Expression>>,
	pub forward_request_body: bool,
	pub openapi: Option<Arc<OpenApiValidator>>,
	pub expected_status: Option<Vec<u16>>,
	/// Log and continue instead of failing the call when the request fails
	/// OpenAPI validation.
	pub ignore_request_violations: bool,
	/// Log and continue instead of failing the call when the response fails
	/// OpenAPI validation.
	pub ignore_response_violations: bool,
}

#[async_trait]
impl Producer for BackendCall {
	fn name(&self) -> &Strng {
		&self.name
	}

	async fn produce(&self, ctx: &EvalContext) -> Result<ProducerOutcome, EndpointError> {
		let path = self.resolve_path(ctx);
		let headers = self.resolve_headers(ctx);
		let body = if self.forward_request_body {
			ctx
				.request
				.as_ref()
				.and_then(|r| r.body_bytes.clone())
				.unwrap_or_default()
		} else {
			Bytes::new()
		};

		if let Some(validator) = &self.openapi {
			if let Some(req) = &ctx.request {
				if let Err(e) = validator.validate_parameters(&self.method, &path, &req.query, &req.headers) {
					self.handle_violation(e, self.ignore_request_violations)?;
				}
				if let Some(json) = &req.json_body {
					if let Err(e) = validator.validate_request_body(&self.method, &path, json) {
						self.handle_violation(e, self.ignore_request_violations)?;
					}
				}
			}
		}

		let response = self.transport.send(self.method.clone(), &path, headers, body).await?;

		if let Some(expected) = &self.expected_status {
			if !expected.contains(&response.status.as_u16()) {
				return Err(GatewayError::new(ErrorKind::UnexpectedStatus).with_label(self.name.clone()));
			}
		}

		let body_bytes = response.body.clone();
		let body_str = String::from_utf8(response.body.to_vec()).ok();
		let json_body = body_str.as_deref().and_then(|s| serde_json::from_str(s).ok());

		if let (Some(validator), Some(json)) = (&self.openapi, &json_body) {
			if let Err(e) = validator.validate_response_body(&self.method, &path, response.status.as_u16(), json) {
				self.handle_violation(e, self.ignore_response_violations)?;
			}
		}

		let headers_map = response
			.headers
			.iter()
			.filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
			.collect();

		Ok(ProducerOutcome {
			name: self.name.clone(),
			response: BackendCallBinding {
				status: Some(response.status.as_u16()),
				headers: headers_map,
				body: body_str,
				json_body,
				body_bytes: Some(body_bytes),
			},
		})
	}
}

impl BackendCall {
	fn resolve_path(&self, ctx: &EvalContext) -> String {
		let wildcard = ctx.request.as_ref().and_then(|r| r.wildcard.clone()).unwrap_or_default();
		let mut path = self.path_template.replace("**", &wildcard);
		if let Some(req) = &ctx.request {
			for (name, value) in &req.path_params {
				path = path.replace(&format!("{{{name}}}"), value);
			}
		}
		path
	}

	fn resolve_headers(&self, ctx: &EvalContext) -> HeaderMap {
		let mut headers = HeaderMap::new();
		for (name, expr) in &self.request_headers {
			if let Some(value) = ctx.eval_string(expr) {
				if let (Ok(name), Ok(value)) = (HeaderName::try_from(name.as_str()), HeaderValue::from_str(&value)) {
					headers.insert(name, value);
				}
			}
		}
		headers
	}

	fn handle_violation(&self, err: ValidationError, ignore: bool) -> Result<(), EndpointError> {
		if ignore {
			tracing::warn!(backend = %self.name, error = %err, "ignoring openapi validation violation");
			Ok(())
		} else {
			Err(GatewayError::new(ErrorKind::BackendValidationError).with_label(self.name.clone()).with_cause(anyhow::anyhow!(err.to_string())))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::expr::RequestBinding;

	fn ctx_with_wildcard(remainder: &str) -> EvalContext {
		let mut ctx = EvalContext::default();
		ctx.request = Some(Arc::new(RequestBinding {
			wildcard: Some(remainder.to_string()),
			..Default::default()
		}));
		ctx
	}

	#[test]
	fn resolve_path_substitutes_wildcard_remainder() {
		let call = BackendCall {
			name: Strng::from("files"),
			kind: Kind::Proxy,
			transport: Transport::new(crate::backend::BackendConfig {
				name: Strng::from("files"),
				origin: "http://up".into(),
				hostname: None,
				path: None,
				request_headers: Default::default(),
				response_headers: Default::default(),
				connect_timeout: None,
				ttfb_timeout: None,
				timeout: None,
				request_body_limit: None,
				disable_certificate_validation: false,
			})
			.unwrap(),
			method: Method::GET,
			path_template: "/files/**".to_string(),
			request_headers: HashMap::new(),
			forward_request_body: false,
			openapi: None,
			expected_status: None,
			ignore_request_violations: false,
			ignore_response_violations: false,
		};
		let ctx = ctx_with_wildcard("a/b.png");
		assert_eq!(call.resolve_path(&ctx), "/files/a/b.png");
	}
}
