//! The endpoint execution engine: runs an endpoint's parallel and sequenced
//! producers, collects their results through a rendezvous channel, and
//! assembles the client response.
//!
//! Response assembly follows a fixed precedence: an explicit response
//! block, else a single-proxy passthrough, else 204 if nothing proxied.
//! Concurrency uses one `tokio::spawn` per leftover producer and one per
//! sequence, reporting into a single `tokio::sync::mpsc` rendezvous channel.

pub mod sequence;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gateway_core::Strng;
use http::StatusCode;
use tokio::sync::mpsc;

use crate::context::BufferOptions;
use crate::error::{ErrorKind, GatewayError};
use crate::expr::{BackendCallBinding, EvalContext, Expression, NamedBindings};
use crate::http_types::{Body, Response};
use sequence::{Sequence, leftover_names};

pub type EndpointError = GatewayError;

#[derive(Clone, Debug)]
pub struct ProducerOutcome {
	pub name: Strng,
	pub response: BackendCallBinding,
}

/// A single unit of work an endpoint can run: a proxy call, a side-effect
/// request, or (in tests) a stub.
#[async_trait]
pub trait Producer: Send + Sync {
	fn name(&self) -> &Strng;
	async fn produce(&self, ctx: &EvalContext) -> Result<ProducerOutcome, EndpointError>;
}

/// Evaluated `response { }` block: status/headers/body expressions run
/// against the final context once every producer has reported.
pub struct ResponseSpec {
	pub status: Option<Arc<Expression>>,
	pub headers: HashMap<String, Arc<Expression>>,
	pub body: Option<Arc<Expression>>,
}

pub struct EndpointConfig {
	pub name: Strng,
	/// Proxy producers not referenced by any sequence.
	pub proxies: Vec<Arc<dyn Producer>>,
	/// Request producers not referenced by any sequence.
	pub requests: Vec<Arc<dyn Producer>>,
	pub sequences: Vec<Sequence>,
	pub response: Option<ResponseSpec>,
	pub buffer_options: BufferOptions,
}

enum RendezvousMsg {
	Leftover(Result<ProducerOutcome, EndpointError>),
	Sequence(HashMap<Strng, Result<ProducerOutcome, EndpointError>>),
}

pub struct Engine;

impl Engine {
	/// Runs every producer (sequences and leftovers concurrently), then
	/// assembles the client response: explicit response block, else
	/// single-proxy passthrough, else 204.
	pub async fn execute(config: &EndpointConfig, mut ctx: EvalContext) -> Result<Response, GatewayError> {
		let all_names: Vec<Strng> = config
			.proxies
			.iter()
			.chain(config.requests.iter())
			.map(|p| p.name().clone())
			.collect();
		let leftover = leftover_names(&all_names, &config.sequences);
		let by_name: HashMap<Strng, Arc<dyn Producer>> = config
			.proxies
			.iter()
			.chain(config.requests.iter())
			.map(|p| (p.name().clone(), p.clone()))
			.collect();

		let (tx, mut rx) = mpsc::channel(config.proxies.len() + config.requests.len() + config.sequences.len() + 1);

		let mut expected = 0usize;
		for name in &leftover {
			if let Some(producer) = by_name.get(name).cloned() {
				expected += 1;
				let tx = tx.clone();
				let ctx = ctx.clone();
				tokio::spawn(async move {
					let outcome = producer.produce(&ctx).await;
					let _ = tx.send(RendezvousMsg::Leftover(outcome)).await;
				});
			}
		}
		for seq in &config.sequences {
			expected += 1;
			let tx = tx.clone();
			let ctx = ctx.clone();
			// Sequence isn't `Clone`; run it by reference within the spawned
			// future's lifetime by scoping to this loop iteration via Arc.
			let seq_nodes = seq.nodes.iter().map(|n| (n.name.clone(), n.depends_on.clone(), n.producer.clone())).collect::<Vec<_>>();
			tokio::spawn(async move {
				let seq = Sequence {
					nodes: seq_nodes
						.into_iter()
						.map(|(name, depends_on, producer)| sequence::SequenceNode { name, depends_on, producer })
						.collect(),
				};
				let outcomes = seq.run(&ctx).await;
				let _ = tx.send(RendezvousMsg::Sequence(outcomes)).await;
			});
		}
		drop(tx);

		let mut bindings = NamedBindings::default();
		let mut proxy_count = 0usize;
		let mut single_proxy_response: Option<BackendCallBinding> = None;
		let mut first_error: Option<GatewayError> = None;
		let mut received = 0usize;

		while received < expected {
			let Some(msg) = rx.recv().await else { break };
			received += 1;
			match msg {
				RendezvousMsg::Leftover(Ok(outcome)) => {
					proxy_count += 1;
					single_proxy_response = Some(outcome.response.clone());
					bindings.insert(outcome.name.to_string(), outcome.response);
				},
				RendezvousMsg::Leftover(Err(e)) => first_error.get_or_insert(e),
				RendezvousMsg::Sequence(outcomes) => {
					for (name, res) in outcomes {
						match res {
							Ok(outcome) => {
								proxy_count += 1;
								single_proxy_response = Some(outcome.response.clone());
								bindings.insert(name.to_string(), outcome.response);
							},
							Err(e) => {
								first_error.get_or_insert(
									GatewayError::new(ErrorKind::SequenceDependencyError).with_cause(anyhow::anyhow!(e.to_string())),
								);
							},
						}
					}
				},
			};
		}

		if let Some(err) = first_error {
			return Err(err);
		}

		if proxy_count == 1 {
			if let Some(only_name) = bindings_single_key(&bindings) {
				bindings.set_default_alias(&only_name);
			}
		}
		ctx.backend_responses = Arc::new(bindings);

		if let Some(response) = &config.response {
			return Ok(assemble_from_spec(response, &ctx));
		}

		if proxy_count == 1 {
			if let Some(body) = single_proxy_response {
				return Ok(assemble_passthrough(&body));
			}
		}

		if proxy_count == 0 {
			let mut resp = Response::new(Body::empty());
			*resp.status_mut() = StatusCode::NO_CONTENT;
			return Ok(resp);
		}

		Err(GatewayError::new(ErrorKind::EndpointNoProducer).with_label(config.name.clone()))
	}
}

fn bindings_single_key(bindings: &NamedBindings) -> Option<String> {
	// NamedBindings only exposes insert/set_default_alias publicly; peeking
	// at its single key for the default-alias rule is done through a tiny
	// accessor kept next to it.
	bindings.only_key()
}

fn assemble_from_spec(spec: &ResponseSpec, ctx: &EvalContext) -> Response {
	let status = spec
		.status
		.as_ref()
		.and_then(|e| ctx.eval_string(e).and_then(|s| s.parse::<u16>().ok()))
		.and_then(|code| StatusCode::from_u16(code).ok())
		.unwrap_or(StatusCode::OK);
	let body = spec.body.as_ref().and_then(|e| ctx.eval_string(e)).unwrap_or_default();
	let mut resp = Response::new(Body::from(body));
	*resp.status_mut() = status;
	for (name, expr) in &spec.headers {
		if let Some(value) = ctx.eval_string(expr) {
			if let (Ok(name), Ok(value)) = (
				http::HeaderName::try_from(name.as_str()),
				http::HeaderValue::from_str(&value),
			) {
				resp.headers_mut().insert(name, value);
			}
		}
	}
	resp
}

fn assemble_passthrough(body: &BackendCallBinding) -> Response {
	let status = body.status.and_then(|s| StatusCode::from_u16(s).ok()).unwrap_or(StatusCode::BAD_GATEWAY);
	let mut resp = Response::new(Body::from(body.body_bytes.clone().unwrap_or_default()));
	*resp.status_mut() = status;
	for (k, v) in &body.headers {
		if let (Ok(name), Ok(value)) = (http::HeaderName::try_from(k.as_str()), http::HeaderValue::from_str(v)) {
			resp.headers_mut().insert(name, value);
		}
	}
	resp
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
