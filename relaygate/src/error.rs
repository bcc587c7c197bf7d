//! The error taxonomy and per-scope error-template chain.
//!
//! A flat `thiserror` enum with a `default_status()` mapping to a status
//! code, generalized with a scope-inherited template chain: an endpoint's
//! error template is the endpoint's own if configured, else the owning
//! API's, else the server's, else a built-in default.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gateway_core::Strng;
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::http_types::{Body, Response};

/// The closed error-kind taxonomy. `*` in a handler registry matches any
/// variant not otherwise registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	Configuration,
	RouteNotFound,
	MethodNotAllowed,
	ApiReqBodySizeExceeded,
	ClientRequest,
	AccessControlCredentialsMissing,
	AccessControlCredentialsMismatch,
	JwtTokenMissing,
	JwtTokenExpired,
	JwtTokenInvalid,
	InsufficientPermissions,
	BackendUnreachable,
	BackendTimeout,
	BackendValidationError,
	UnexpectedStatus,
	SequenceDependencyError,
	EndpointNoProducer,
}

impl ErrorKind {
	/// Status-code defaults per kind; overridable by templates.
	pub fn default_status(self) -> StatusCode {
		use ErrorKind::*;
		match self {
			Configuration => StatusCode::INTERNAL_SERVER_ERROR,
			RouteNotFound => StatusCode::NOT_FOUND,
			MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
			ApiReqBodySizeExceeded => StatusCode::PAYLOAD_TOO_LARGE,
			ClientRequest => StatusCode::BAD_REQUEST,
			AccessControlCredentialsMissing => StatusCode::UNAUTHORIZED,
			AccessControlCredentialsMismatch => StatusCode::FORBIDDEN,
			JwtTokenMissing => StatusCode::UNAUTHORIZED,
			JwtTokenExpired => StatusCode::UNAUTHORIZED,
			JwtTokenInvalid => StatusCode::UNAUTHORIZED,
			InsufficientPermissions => StatusCode::FORBIDDEN,
			BackendUnreachable => StatusCode::BAD_GATEWAY,
			BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
			BackendValidationError => StatusCode::BAD_GATEWAY,
			UnexpectedStatus => StatusCode::BAD_GATEWAY,
			SequenceDependencyError => StatusCode::BAD_GATEWAY,
			EndpointNoProducer => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	pub fn label(self) -> &'static str {
		use ErrorKind::*;
		match self {
			Configuration => "configuration",
			RouteNotFound => "route_not_found",
			MethodNotAllowed => "method_not_allowed",
			ApiReqBodySizeExceeded => "api_req_body_size_exceeded",
			ClientRequest => "client_request",
			AccessControlCredentialsMissing => "access_control.credentials_missing",
			AccessControlCredentialsMismatch => "access_control.credentials_mismatch",
			JwtTokenMissing => "jwt_token_missing",
			JwtTokenExpired => "jwt_token_expired",
			JwtTokenInvalid => "jwt_token_invalid",
			InsufficientPermissions => "insufficient_permissions",
			BackendUnreachable => "backend_unreachable",
			BackendTimeout => "backend_timeout",
			BackendValidationError => "backend_validation_error",
			UnexpectedStatus => "unexpected_status",
			SequenceDependencyError => "sequence_dependency_error",
			EndpointNoProducer => "endpoint_no_producer",
		}
	}
}

/// An error value carrying a kind, an optional scope label (e.g. API name),
/// and an optional wrapped cause kept for logging only (never serialized
/// into the client response).
#[derive(Debug)]
pub struct GatewayError {
	pub kind: ErrorKind,
	pub scope_label: Option<Strng>,
	pub cause: Option<anyhow::Error>,
}

impl GatewayError {
	pub fn new(kind: ErrorKind) -> Self {
		GatewayError {
			kind,
			scope_label: None,
			cause: None,
		}
	}

	pub fn with_label(mut self, label: impl Into<Strng>) -> Self {
		self.scope_label = Some(label.into());
		self
	}

	pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
		self.cause = Some(cause.into());
		self
	}
}

impl fmt::Display for GatewayError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.kind.label())?;
		if let Some(l) = &self.scope_label {
			write!(f, " ({l})")?;
		}
		Ok(())
	}
}

impl std::error::Error for GatewayError {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		self.cause.as_deref().map(|e| e as _)
	}
}

impl From<ErrorKind> for GatewayError {
	fn from(kind: ErrorKind) -> Self {
		GatewayError::new(kind)
	}
}

/// A pure function of (kind, labels, request) -> (status, headers, body).
/// Registering templates per scope (endpoint/api/server) yields the
/// inheritance chain.
pub trait ErrorTemplate: Send + Sync {
	fn render(&self, err: &GatewayError) -> Response;
}

/// The built-in fallback: status from [`ErrorKind::default_status`], a
/// `text/plain` body naming the kind. Every scope ultimately falls back to
/// this if no template was configured anywhere in its chain.
#[derive(Default)]
pub struct DefaultErrorTemplate;

impl ErrorTemplate for DefaultErrorTemplate {
	fn render(&self, err: &GatewayError) -> Response {
		render_default(err)
	}
}

pub fn render_default(err: &GatewayError) -> Response {
	let status = err.kind.default_status();
	let mut headers = HeaderMap::new();
	headers.insert(
		http::header::CONTENT_TYPE,
		HeaderValue::from_static("text/plain; charset=utf-8"),
	);
	let mut resp = Response::new(Body::from(err.to_string()));
	*resp.status_mut() = status;
	*resp.headers_mut() = headers;
	resp
}

/// Per-kind handler registry. `None` key means the wildcard (`*`) handler.
/// Constructing with two `*` registrations is a configuration error:
/// `ErrorHandlers::build` returns `Err` in that case instead of silently
/// keeping the last one.
#[derive(Default)]
pub struct ErrorHandlers {
	by_kind: HashMap<&'static str, Arc<dyn ErrorTemplate>>,
	wildcard: Option<Arc<dyn ErrorTemplate>>,
}

impl ErrorHandlers {
	pub fn builder() -> ErrorHandlersBuilder {
		ErrorHandlersBuilder::default()
	}

	pub fn handle(&self, err: &GatewayError) -> Option<Response> {
		self
			.by_kind
			.get(err.kind.label())
			.or(self.wildcard.as_ref())
			.map(|tpl| tpl.render(err))
	}
}

#[derive(Default)]
pub struct ErrorHandlersBuilder {
	by_kind: HashMap<&'static str, Arc<dyn ErrorTemplate>>,
	wildcard: Option<Arc<dyn ErrorTemplate>>,
}

impl ErrorHandlersBuilder {
	pub fn register(
		&mut self,
		kind: Option<ErrorKind>,
		tpl: Arc<dyn ErrorTemplate>,
	) -> Result<(), GatewayError> {
		match kind {
			Some(k) => {
				self.by_kind.insert(k.label(), tpl);
			},
			None => {
				if self.wildcard.is_some() {
					return Err(
						GatewayError::new(ErrorKind::Configuration)
							.with_cause(anyhow::anyhow!("duplicate `*` error handler registration")),
					);
				}
				self.wildcard = Some(tpl);
			},
		}
		Ok(())
	}

	pub fn build(self) -> ErrorHandlers {
		ErrorHandlers {
			by_kind: self.by_kind,
			wildcard: self.wildcard,
		}
	}
}

/// The endpoint -> api -> server -> default inheritance chain. `render`
/// walks it top-down, using the first scope that has either a custom handler
/// for this error's kind or a template at all.
pub struct ErrorChain {
	pub endpoint_handlers: Option<Arc<ErrorHandlers>>,
	pub endpoint_template: Option<Arc<dyn ErrorTemplate>>,
	pub api_template: Option<Arc<dyn ErrorTemplate>>,
	pub server_template: Arc<dyn ErrorTemplate>,
}

impl ErrorChain {
	pub fn render(&self, err: GatewayError) -> Response {
		if let Some(handlers) = &self.endpoint_handlers {
			if let Some(resp) = handlers.handle(&err) {
				return resp;
			}
		}
		let tpl = self
			.endpoint_template
			.as_ref()
			.or(self.api_template.as_ref())
			.unwrap_or(&self.server_template);
		tpl.render(&err)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn duplicate_wildcard_handler_is_a_configuration_error() {
		let mut b = ErrorHandlers::builder();
		b.register(None, Arc::new(DefaultErrorTemplate)).unwrap();
		let err = b.register(None, Arc::new(DefaultErrorTemplate)).unwrap_err();
		assert_eq!(err.kind.label(), ErrorKind::Configuration.label());
	}

	#[test]
	fn specific_kind_handler_can_transform_to_success() {
		struct Teapot;
		impl ErrorTemplate for Teapot {
			fn render(&self, _err: &GatewayError) -> Response {
				let mut r = Response::new(Body::empty());
				*r.status_mut() = StatusCode::IM_A_TEAPOT;
				r
			}
		}
		let mut b = ErrorHandlers::builder();
		b
			.register(Some(ErrorKind::InsufficientPermissions), Arc::new(Teapot))
			.unwrap();
		let handlers = b.build();
		let resp = handlers
			.handle(&GatewayError::new(ErrorKind::InsufficientPermissions))
			.unwrap();
		assert_eq!(resp.status(), StatusCode::IM_A_TEAPOT);
	}

	#[test]
	fn default_status_codes_match_spec() {
		assert_eq!(
			ErrorKind::RouteNotFound.default_status(),
			StatusCode::NOT_FOUND
		);
		assert_eq!(
			ErrorKind::JwtTokenExpired.default_status(),
			StatusCode::UNAUTHORIZED
		);
		assert_eq!(
			ErrorKind::BackendTimeout.default_status(),
			StatusCode::GATEWAY_TIMEOUT
		);
		assert_eq!(
			ErrorKind::InsufficientPermissions.default_status(),
			StatusCode::FORBIDDEN
		);
	}
}
