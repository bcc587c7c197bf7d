//! Structured access logging.
//!
//! An `AsyncLog<T>` wrapper, backed by `crossbeam::atomic::AtomicCell`, lets
//! a value set after the response stream has started (e.g. a trailer
//! status) still land in the final log line. A `RequestLog` is carried for
//! the lifetime of one request and flushed by its `DropOnLog` wrapper's
//! `Drop` impl, so exactly one line is emitted however the request ends,
//! including on cancellation. `LoggingFields` (`add`/`remove`) and the
//! optional `filter` expression are the per-scope inheritance knobs,
//! accumulated server -> api -> endpoint at configuration load time.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crossbeam::atomic::AtomicCell;
use gateway_core::Strng;
use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::expr::{EvalContext, Expression};

#[derive(Clone)]
pub struct AsyncLog<T>(Arc<AtomicCell<Option<T>>>);

impl<T> Default for AsyncLog<T> {
	fn default() -> Self {
		AsyncLog(Arc::new(AtomicCell::new(None)))
	}
}

impl<T> AsyncLog<T> {
	pub fn store(&self, v: Option<T>) {
		self.0.store(v)
	}

	pub fn take(&self) -> Option<T> {
		self.0.take()
	}
}

impl<T: Copy> AsyncLog<T> {
	pub fn load(&self) -> Option<T> {
		self.0.load()
	}
}

impl<T> fmt::Debug for AsyncLog<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AsyncLog").finish_non_exhaustive()
	}
}

/// Per-scope logging policy: which fields are added/removed for the access
/// log line. `filter` suppresses the whole line when it evaluates to
/// `false`.
#[derive(Clone, Default)]
pub struct LoggingFields {
	pub remove: HashSet<String>,
	pub add: IndexMap<String, Arc<Expression>>,
}

#[derive(Clone, Default)]
pub struct LoggingConfig {
	pub filter: Option<Arc<Expression>>,
	pub fields: Arc<LoggingFields>,
}

/// Everything one request accumulates for its access log line.
pub struct RequestLog {
	pub config: LoggingConfig,
	pub start: Instant,
	pub server_name: Option<Strng>,
	pub handler: Option<Strng>,
	pub method: Option<http::Method>,
	pub path: Option<String>,
	pub status: AsyncLog<u16>,
	pub jwt_sub: Option<String>,
	pub access_controls: Vec<String>,
	pub error: Option<String>,
}

impl RequestLog {
	pub fn new(config: LoggingConfig) -> Self {
		RequestLog {
			config,
			start: Instant::now(),
			server_name: None,
			handler: None,
			method: None,
			path: None,
			status: AsyncLog::default(),
			jwt_sub: None,
			access_controls: Vec::new(),
			error: None,
		}
	}

	fn default_fields(&self) -> JsonMap<String, JsonValue> {
		let mut fields = JsonMap::new();
		fields.insert("duration_ms".to_string(), JsonValue::from(self.start.elapsed().as_millis() as u64));
		if let Some(s) = &self.server_name {
			fields.insert("server".to_string(), JsonValue::String(s.to_string()));
		}
		if let Some(h) = &self.handler {
			fields.insert("handler".to_string(), JsonValue::String(h.to_string()));
		}
		if let Some(m) = &self.method {
			fields.insert("method".to_string(), JsonValue::String(m.to_string()));
		}
		if let Some(p) = &self.path {
			fields.insert("path".to_string(), JsonValue::String(p.clone()));
		}
		if let Some(s) = self.status.load() {
			fields.insert("status".to_string(), JsonValue::from(s));
		}
		if let Some(sub) = &self.jwt_sub {
			fields.insert("jwt_sub".to_string(), JsonValue::String(sub.clone()));
		}
		if !self.access_controls.is_empty() {
			fields.insert(
				"access_controls".to_string(),
				JsonValue::Array(self.access_controls.iter().map(|s| JsonValue::String(s.clone())).collect()),
			);
		}
		if let Some(err) = &self.error {
			fields.insert("error".to_string(), JsonValue::String(err.clone()));
		}
		fields
	}

	/// Applies `remove`/`add` and returns the final field set, or `None` if
	/// the configured `filter` expression evaluates to false.
	pub fn render(&self, ctx: &EvalContext) -> Option<JsonMap<String, JsonValue>> {
		if let Some(filter) = &self.config.filter {
			if !ctx.eval_bool(filter) {
				return None;
			}
		}
		let mut fields = self.default_fields();
		for key in &self.config.fields.remove {
			fields.remove(key);
		}
		for (name, expr) in &self.config.fields.add {
			if let Some(value) = ctx.eval_string(expr) {
				fields.insert(name.clone(), JsonValue::String(value));
			}
		}
		Some(fields)
	}

	/// Emits the access log line now (normally called once, from the
	/// request's `Drop` wrapper).
	pub fn emit(&self, ctx: &EvalContext) {
		let Some(fields) = self.render(ctx) else { return };
		tracing::info!(fields = %JsonValue::Object(fields), "request");
	}
}

/// Wraps a `RequestLog` so it is always flushed exactly once, including on
/// cancellation.
pub struct DropOnLog {
	log: Option<RequestLog>,
	ctx: EvalContext,
}

impl DropOnLog {
	pub fn new(log: RequestLog, ctx: EvalContext) -> Self {
		DropOnLog { log: Some(log), ctx }
	}

	pub fn inner(&mut self) -> &mut RequestLog {
		self.log.as_mut().expect("DropOnLog polled after drop")
	}
}

impl Drop for DropOnLog {
	fn drop(&mut self) {
		if let Some(log) = self.log.take() {
			log.emit(&self.ctx);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn filter_suppresses_the_line() {
		let mut fields = LoggingFields::default();
		fields.remove.insert("jwt_sub".to_string());
		let config = LoggingConfig {
			filter: Some(Arc::new(Expression::new("false").unwrap())),
			fields: Arc::new(fields),
		};
		let log = RequestLog::new(config);
		assert!(log.render(&EvalContext::default()).is_none());
	}

	#[test]
	fn remove_strips_default_field() {
		let mut fields = LoggingFields::default();
		fields.remove.insert("jwt_sub".to_string());
		let config = LoggingConfig {
			filter: None,
			fields: Arc::new(fields),
		};
		let mut log = RequestLog::new(config);
		log.jwt_sub = Some("alice".to_string());
		let rendered = log.render(&EvalContext::default()).unwrap();
		assert!(!rendered.contains_key("jwt_sub"));
	}

	#[test]
	fn async_log_round_trips() {
		let log: AsyncLog<u16> = AsyncLog::default();
		assert_eq!(log.load(), None);
		log.store(Some(200));
		assert_eq!(log.load(), Some(200));
	}
}
