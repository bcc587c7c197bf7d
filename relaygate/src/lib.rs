//! Crate root: wires the configuration layer, mux dispatch, access control,
//! endpoint engine, and telemetry into one request-handling entry point,
//! end to end.
//!
//! A flat list of `pub mod` declarations, with `handle_request`/`run` the
//! one place that owns the per-request pipeline rather than splitting it
//! across the mux/engine modules themselves.

pub mod accesscontrol;
pub mod backend;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod expr;
pub mod http_types;
pub mod mux;
pub mod serdes;
pub mod server;
pub mod telemetry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use gateway_core::drain;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tracing::warn;

use crate::config::CompiledEndpoint;
use crate::context::{BufferOptions, RequestContext};
use crate::error::GatewayError;
use crate::expr::{EvalContext, RequestBinding};
use crate::http_types::{Body, Response};
use crate::mux::RouteMatch;
use crate::server::{BoxFuture, ForwardingContext, RequestHandler, Server};
use crate::telemetry::log::{DropOnLog, RequestLog};

/// Whether [`run`] returned because the server finished its own lifecycle
/// or because an interrupt signal initiated the shutdown (exit code 130 on
/// interrupt vs. 0 on normal shutdown, left to the caller in `main.rs`).
pub enum RunOutcome {
	Completed,
	Interrupted,
}

/// Runs the gateway until its drain trigger fires: build listeners from
/// configuration, serve until signalled, then shut down within
/// `shutdown_timeout`. On `SIGINT` the drain is triggered but
/// `server.run()` keeps executing so its two-phase graceful shutdown
/// actually completes before this function returns.
pub async fn run(raw: config::RawConfig) -> anyhow::Result<RunOutcome> {
	let built = config::build(raw)?;
	let (trigger, watcher) = drain::new();

	let handler: RequestHandler<Arc<CompiledEndpoint>> = Arc::new(handle_matched);

	let server = Server::new(built.listeners, handler, watcher, built.shutdown_delay, built.shutdown_timeout);
	let server_fut = server.run();
	tokio::pin!(server_fut);

	tokio::select! {
		result = &mut server_fut => return result.map(|()| RunOutcome::Completed),
		_ = tokio::signal::ctrl_c() => {
			warn!("received interrupt, draining");
			trigger.start_drain();
		}
	}

	server_fut.await?;
	Ok(RunOutcome::Interrupted)
}

fn handle_matched(m: RouteMatch<Arc<CompiledEndpoint>>, req: http::Request<Incoming>) -> BoxFuture<Response> {
	Box::pin(handle_request(m.handler, m.path_params, m.wildcard, req))
}

/// The per-request pipeline: run the access-control chain, check required
/// permissions, then the endpoint engine, rendering any failure at any
/// stage through the endpoint's [`crate::error::ErrorChain`]. An access-log
/// line is always emitted exactly once via [`DropOnLog`], regardless of
/// which branch the request takes or whether it is cancelled mid-flight.
async fn handle_request(
	endpoint: Arc<CompiledEndpoint>,
	path_params: HashMap<String, String>,
	wildcard: Option<String>,
	req: http::Request<Incoming>,
) -> Response {
	let start = Instant::now();
	let (parts, incoming) = req.into_parts();

	let cookies = parse_cookies(&parts.headers);
	let log = RequestLog::new(endpoint.logging.clone());

	let access_outcome = endpoint.access_control.run(&parts.headers, &cookies).await;
	let (claims_by_validator, granted_permissions) = match access_outcome {
		Ok(outcome) => (outcome.claims_by_validator, outcome.granted_permissions),
		Err(err) => {
			let resp = endpoint.error_chain.render(err);
			return finish(log, start, EvalContext::default(), resp);
		},
	};

	let mut request_ctx = RequestContext::new(start);
	request_ctx.path_params = path_params.clone();
	request_ctx.wildcard = wildcard.clone();
	request_ctx.access_controls = claims_by_validator;
	request_ctx.add_permissions(granted_permissions);

	if !request_ctx.has_permissions(&endpoint.required_permissions) {
		let err = GatewayError::new(error::ErrorKind::InsufficientPermissions);
		let resp = endpoint.error_chain.render(err);
		return finish(log, start, EvalContext::default(), resp);
	}

	let access_controls_by_name: HashMap<String, _> = request_ctx
		.access_controls
		.iter()
		.map(|(k, v)| (k.to_string(), v.clone()))
		.collect();

	if !endpoint.access_control.rules.validate(&EvalContext {
		access_controls: Arc::new(access_controls_by_name.clone()),
		..Default::default()
	}) {
		let err = GatewayError::new(error::ErrorKind::InsufficientPermissions);
		let resp = endpoint.error_chain.render(err);
		return finish(log, start, EvalContext::default(), resp);
	}

	let buffer = endpoint.config.buffer_options;
	let body = if buffer.requires_request_buffering() {
		match incoming.collect().await {
			Ok(collected) => Some(collected.to_bytes()),
			Err(_) => None,
		}
	} else {
		None
	};

	let forwarding = parts.extensions.get::<ForwardingContext>().cloned().unwrap_or_default();
	request_ctx.xff = forwarding.xff.clone();

	let binding = build_request_binding(&parts, &cookies, wildcard, path_params, buffer, body.as_ref(), &forwarding);
	let ctx = EvalContext {
		request: Some(Arc::new(binding)),
		access_controls: Arc::new(access_controls_by_name),
		..Default::default()
	};

	match endpoint::Engine::execute(&endpoint.config, ctx.clone()).await {
		Ok(resp) => finish(log, start, ctx, resp),
		Err(err) => {
			let resp = endpoint.error_chain.render(err);
			finish(log, start, ctx, resp)
		},
	}
}

fn finish(log: RequestLog, _start: Instant, ctx: EvalContext, resp: Response) -> Response {
	let mut dropped = DropOnLog::new(log, ctx);
	dropped.inner().status.store(Some(resp.status().as_u16()));
	resp
}

fn parse_cookies(headers: &http::HeaderMap) -> HashMap<String, String> {
	let mut cookies = HashMap::new();
	if let Some(value) = headers.get(http::header::COOKIE).and_then(|v| v.to_str().ok()) {
		for pair in value.split(';') {
			if let Some((k, v)) = pair.trim().split_once('=') {
				cookies.insert(k.to_string(), v.to_string());
			}
		}
	}
	cookies
}

fn build_request_binding(
	parts: &http::request::Parts,
	cookies: &HashMap<String, String>,
	wildcard: Option<String>,
	path_params: HashMap<String, String>,
	buffer: BufferOptions,
	body: Option<&bytes::Bytes>,
	forwarding: &ForwardingContext,
) -> RequestBinding {
	let headers = parts
		.headers
		.iter()
		.filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
		.collect();
	let query = parts
		.uri
		.query()
		.map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
		.unwrap_or_default();

	let body_str = body.and_then(|b| std::str::from_utf8(b).ok().map(str::to_string));
	let json_body = if buffer.contains(BufferOptions::REQUEST_JSON_BODY) {
		body_str.as_deref().and_then(|s| serde_json::from_str(s).ok())
	} else {
		None
	};
	let form_body = if buffer.contains(BufferOptions::REQUEST_FORM_BODY) {
		body_str
			.as_deref()
			.map(|s| url::form_urlencoded::parse(s.as_bytes()).into_owned().collect())
	} else {
		None
	};

	let url = rebuild_forwarded_uri(&parts.uri, &parts.headers, forwarding);

	RequestBinding {
		method: parts.method.clone(),
		url,
		headers,
		query,
		cookies: cookies.clone(),
		path_params,
		wildcard,
		body: body_str,
		json_body,
		form_body,
		body_bytes: body.cloned(),
	}
}

/// Rewrites scheme/authority from the `X-Forwarded-*` values the listener
/// accepted (see [`crate::server::dispatch`]), falling back to the literal
/// `Host` header and the connection's own scheme when forwarding is
/// disabled or the headers are absent.
fn rebuild_forwarded_uri(uri: &http::Uri, headers: &http::HeaderMap, forwarding: &ForwardingContext) -> http::Uri {
	let host = forwarding
		.host
		.clone()
		.or_else(|| headers.get(http::header::HOST).and_then(|v| v.to_str().ok().map(str::to_string)));
	let Some(host) = host else { return uri.clone() };

	let scheme = forwarding.proto.as_deref().unwrap_or("http");
	let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

	let authority = match &forwarding.port {
		Some(port) if !host.contains(':') => format!("{host}:{port}"),
		_ => host,
	};

	http::Uri::builder()
		.scheme(scheme)
		.authority(authority)
		.path_and_query(path_and_query)
		.build()
		.unwrap_or_else(|_| uri.clone())
}

/// Used by [`config::load`]'s callers and `verify`-mode CLI handling: turns
/// a raw configuration into a built gateway without starting any listeners,
/// surfacing every construction error for the caller to report.
pub fn verify(raw: config::RawConfig) -> anyhow::Result<()> {
	config::build(raw)?;
	Ok(())
}

/// Convenience for health/error responses built outside the endpoint engine.
pub fn plain_response(status: StatusCode, body: impl Into<Body>) -> Response {
	let mut resp = Response::new(body.into());
	*resp.status_mut() = status;
	resp
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_cookies_splits_pairs() {
		let mut headers = http::HeaderMap::new();
		headers.insert(http::header::COOKIE, "a=1; b=2".parse().unwrap());
		let cookies = parse_cookies(&headers);
		assert_eq!(cookies.get("a").map(String::as_str), Some("1"));
		assert_eq!(cookies.get("b").map(String::as_str), Some("2"));
	}
}
