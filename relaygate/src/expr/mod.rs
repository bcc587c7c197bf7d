//! The expression context: a tree of lazily evaluated bindings visible to
//! attribute expressions.
//!
//! Expressions are parsed once at configuration load time
//! (`cel_parser::parse`), the parsed AST is walked once to collect which
//! top-level identifiers it references (`collect_top_level_idents`), and
//! evaluation clones only the bindings an expression actually touches into a
//! fresh `cel_interpreter::Context` scope. The context exposes `request`,
//! `backend_requests`/`backend_responses` (with a `default` alias for the
//! single-proxy case), `env`, and one entry per access-control validator
//! keyed by its configured name.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use cel_interpreter::{Context as CelContext, ExecutionError, Value};
use cel_parser::{Expression as CelExpression, ParseError};
use serde::Serialize;

use crate::context::Claims;

pub const DEFAULT_BACKEND_KEY: &str = "default";

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("parse error: {0}")]
	Parse(#[from] ParseError),
	#[error("evaluation error: {0}")]
	Eval(#[from] ExecutionError),
}

/// A parsed, reusable expression plus the set of top-level identifiers
/// (`request`, `backend_responses`, ...) it references. Computed once at
/// load time so the endpoint engine can union these sets into a
/// [`crate::context::BufferOptions`] bitset without re-parsing.
pub struct Expression {
	ast: CelExpression,
	source: String,
	attributes: HashSet<String>,
}

impl fmt::Debug for Expression {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Expression").field("source", &self.source).finish()
	}
}

impl Expression {
	pub fn new(source: impl Into<String>) -> Result<Self, Error> {
		let source = source.into();
		let ast = cel_parser::parse(&source)?;
		let mut attributes = HashSet::new();
		collect_top_level_idents(&ast, &mut attributes);
		Ok(Expression { ast, source, attributes })
	}

	pub fn source(&self) -> &str {
		&self.source
	}

	/// Top-level identifiers this expression references, e.g. `{"request",
	/// "backend_responses"}` for `request.method == backend_responses.a.status`.
	pub fn attributes(&self) -> &HashSet<String> {
		&self.attributes
	}

	/// Does this expression reference `request.body`/`json_body`/`form_body`,
	/// requiring the endpoint engine to buffer the client body up front?
	pub fn references_request_body(&self) -> bool {
		self.attributes.contains("request")
	}

	pub fn references_backend_responses(&self) -> bool {
		self.attributes.contains("backend_responses")
	}
}

/// Walks a parsed CEL AST collecting the root identifier of every member
/// access / variable reference it contains. Tracking is first-level only:
/// callers only need to know *which* top binding is touched, not the full
/// path, to decide what to bind into the evaluation context.
fn collect_top_level_idents(expr: &CelExpression, out: &mut HashSet<String>) {
	use cel_parser::Expression::*;
	match expr {
		Ident(name) => {
			out.insert(name.to_string());
		},
		Member(base, _) => collect_top_level_idents(base, out),
		Relation(l, _, r) | Arithmetic(l, _, r) | Ternary(l, r, _) => {
			collect_top_level_idents(l, out);
			collect_top_level_idents(r, out);
		},
		Unary(_, inner) => collect_top_level_idents(inner, out),
		FunctionCall(target, recv, args) => {
			collect_top_level_idents(target, out);
			if let Some(r) = recv {
				collect_top_level_idents(r, out);
			}
			for a in args {
				collect_top_level_idents(a, out);
			}
		},
		List(items) => {
			for i in items {
				collect_top_level_idents(i, out);
			}
		},
		Map(entries) => {
			for (k, v) in entries {
				collect_top_level_idents(k, out);
				collect_top_level_idents(v, out);
			}
		},
		_ => {},
	}
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RequestBinding {
	#[serde(with = "http_serde_shim::method")]
	pub method: http::Method,
	#[serde(with = "http_serde_shim::uri")]
	pub url: http::Uri,
	pub headers: HashMap<String, String>,
	pub query: HashMap<String, String>,
	pub cookies: HashMap<String, String>,
	pub path_params: HashMap<String, String>,
	/// The captured remainder of a `/**` route segment, if the matched route
	/// had one. Backend path templates substitute it wherever `/**` appears.
	pub wildcard: Option<String>,
	/// Lossily-decoded view of the body, used only for CEL string/json/form
	/// binding. Binary forwarding must use [`Self::body_bytes`] instead.
	pub body: Option<String>,
	pub json_body: Option<serde_json::Value>,
	pub form_body: Option<HashMap<String, String>>,
	/// The raw body bytes, preserved for producers that forward the request
	/// body verbatim (images, protobuf, any non-UTF-8 payload). Not exposed
	/// to CEL expressions, which only ever see the decoded string/json/form
	/// views above.
	#[serde(skip)]
	pub body_bytes: Option<bytes::Bytes>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BackendCallBinding {
	#[serde(with = "http_serde_shim::status_opt")]
	pub status: Option<u16>,
	pub headers: HashMap<String, String>,
	pub body: Option<String>,
	pub json_body: Option<serde_json::Value>,
	/// Raw response bytes, used for passthrough assembly so a binary upstream
	/// body is not corrupted by a lossy UTF-8 round trip.
	#[serde(skip)]
	pub body_bytes: Option<bytes::Bytes>,
}

/// Keyed collection of named producer results with the `default` alias
/// active whenever there is exactly one proxy.
#[derive(Clone, Debug, Default, Serialize)]
pub struct NamedBindings(HashMap<String, BackendCallBinding>);

impl NamedBindings {
	pub fn insert(&mut self, name: impl Into<String>, value: BackendCallBinding) {
		self.0.insert(name.into(), value);
	}

	pub fn set_default_alias(&mut self, name: &str) {
		if let Some(v) = self.0.get(name).cloned() {
			self.0.insert(DEFAULT_BACKEND_KEY.to_string(), v);
		}
	}

	/// The sole key, if this collection holds exactly one entry. Used by the
	/// endpoint engine to decide whether the `default` alias applies: the
	/// alias only makes sense when there is a single proxy.
	pub fn only_key(&self) -> Option<String> {
		let mut iter = self.0.keys();
		let first = iter.next()?;
		if iter.next().is_some() {
			None
		} else {
			Some(first.clone())
		}
	}
}

/// Everything a single evaluation call might bind. Built once per request
/// (or per-handler-invocation for access control) and cheaply cloned/shared
/// via `Arc` fields since the producer results don't change after the
/// endpoint engine's rendezvous completes.
#[derive(Clone, Debug, Default)]
pub struct EvalContext {
	pub request: Option<Arc<RequestBinding>>,
	pub backend_requests: Arc<NamedBindings>,
	pub backend_responses: Arc<NamedBindings>,
	pub env: Arc<HashMap<String, String>>,
	pub access_controls: Arc<HashMap<String, Claims>>,
}

impl EvalContext {
	pub fn eval(&self, expr: &Expression) -> Result<Value, Error> {
		let mut ctx = CelContext::default();
		if expr.attributes.contains("request") {
			if let Some(req) = &self.request {
				bind(&mut ctx, "request", req.as_ref())?;
			}
		}
		if expr.attributes.contains("backend_requests") {
			bind(&mut ctx, "backend_requests", self.backend_requests.as_ref())?;
		}
		if expr.attributes.contains("backend_responses") {
			bind(&mut ctx, "backend_responses", self.backend_responses.as_ref())?;
		}
		if expr.attributes.contains("env") {
			bind(&mut ctx, "env", self.env.as_ref())?;
		}
		for (name, claims) in self.access_controls.iter() {
			if expr.attributes.contains(name.as_str()) {
				bind(&mut ctx, name, claims)?;
			}
		}
		Ok(Value::resolve(&expr.ast, &ctx)?)
	}

	pub fn eval_bool(&self, expr: &Expression) -> bool {
		matches!(self.eval(expr), Ok(Value::Bool(true)))
	}

	pub fn eval_string(&self, expr: &Expression) -> Option<String> {
		match self.eval(expr) {
			Ok(Value::String(s)) => Some(s.to_string()),
			_ => None,
		}
	}
}

fn bind<T: Serialize>(ctx: &mut CelContext, name: &str, value: &T) -> Result<(), Error> {
	let json = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
	let cel_value = json_to_cel(&json);
	ctx
		.add_variable_from_value(name, cel_value);
	Ok(())
}

/// `cel_interpreter::Value` cannot `From<serde_json::Value>` directly in
/// every published version, so this converts structurally instead.
fn json_to_cel(v: &serde_json::Value) -> Value {
	match v {
		serde_json::Value::Null => Value::Null,
		serde_json::Value::Bool(b) => Value::Bool(*b),
		serde_json::Value::Number(n) => {
			if let Some(i) = n.as_i64() {
				Value::Int(i)
			} else {
				Value::Float(n.as_f64().unwrap_or_default())
			}
		},
		serde_json::Value::String(s) => Value::String(s.clone().into()),
		serde_json::Value::Array(items) => {
			Value::List(items.iter().map(json_to_cel).collect::<Vec<_>>().into())
		},
		serde_json::Value::Object(map) => {
			let entries = map
				.iter()
				.map(|(k, v)| (cel_interpreter::objects::Key::String(k.clone().into()), json_to_cel(v)))
				.collect();
			Value::Map(cel_interpreter::objects::Map::new(entries))
		},
	}
}

/// A tiny local stand-in for the `http_serde` crate's serialization helpers,
/// scoped to just the fields this module needs.
mod http_serde_shim {
	pub mod method {
		use serde::Serializer;
		pub fn serialize<S: Serializer>(m: &http::Method, s: S) -> Result<S::Ok, S::Error> {
			s.serialize_str(m.as_str())
		}
	}
	pub mod uri {
		use serde::Serializer;
		pub fn serialize<S: Serializer>(u: &http::Uri, s: S) -> Result<S::Ok, S::Error> {
			s.serialize_str(&u.to_string())
		}
	}
	pub mod status_opt {
		use serde::Serializer;
		pub fn serialize<S: Serializer>(v: &Option<u16>, s: S) -> Result<S::Ok, S::Error> {
			match v {
				Some(code) => s.serialize_some(code),
				None => s.serialize_none(),
			}
		}
	}
}

/// Accumulates the buffer bitset across every child expression of an
/// endpoint at load time: the union over all expressions referencing
/// body/form/json body.
pub fn accumulate_buffer_options(
	exprs: impl IntoIterator<Item = Arc<Expression>>,
) -> crate::context::BufferOptions {
	use crate::context::BufferOptions;
	let mut opts = BufferOptions::empty();
	for e in exprs {
		if e.references_request_body() {
			// Conservatively require the full body; the endpoint engine
			// narrows for json/form only when the expression source
			// mentions those accessors specifically.
			if e.source().contains("json_body") {
				opts |= BufferOptions::REQUEST_JSON_BODY;
			} else if e.source().contains("form_body") {
				opts |= BufferOptions::REQUEST_FORM_BODY;
			} else if e.source().contains(".body") {
				opts |= BufferOptions::REQUEST_BODY;
			}
		}
		if e.references_backend_responses() && e.source().contains(".body") {
			opts |= BufferOptions::RESPONSE_BODY;
		}
	}
	opts
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
