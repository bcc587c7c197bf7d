//! The fixed health endpoint every listening port serves.
//!
//! A tiny handler that reads the drain watcher's state and answers 200
//! while healthy, 503 while draining. Served on every listening port
//! alongside regular traffic, so this is a plain function the mux dispatch
//! calls into rather than a standalone server.

use gateway_core::drain::DrainWatcher;
use http::StatusCode;

use crate::http_types::{Body, Response};

pub const DEFAULT_HEALTH_PATH: &str = "/healthz";

pub fn handle(drain: &DrainWatcher) -> Response {
	let (status, text) = if drain.is_draining() {
		(StatusCode::SERVICE_UNAVAILABLE, "draining\n")
	} else {
		(StatusCode::OK, "healthy\n")
	};
	let mut resp = Response::new(Body::from(text));
	*resp.status_mut() = status;
	resp
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn healthy_before_drain_starts() {
		let (_trigger, watcher) = gateway_core::drain::new();
		let resp = handle(&watcher);
		assert_eq!(resp.status(), StatusCode::OK);
	}

	#[tokio::test]
	async fn returns_503_while_draining() {
		let (trigger, watcher) = gateway_core::drain::new();
		trigger.start_drain();
		let resp = handle(&watcher);
		assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
	}
}
