//! Listener / server loop: one TCP listener per configured bind address,
//! host+port-based Mux selection, optional TLS termination, and two-phase
//! graceful shutdown.
//!
//! One `tokio::spawn` per accepted connection, `futures_util::future::select`
//! racing the drain signal against `serve_connection` and calling
//! `graceful_shutdown()` on the loser. Graceful shutdown additionally
//! implements a two-phase drain: listeners stop accepting, the health
//! endpoint flips to 503 (`server::health`), the process sleeps
//! `shutdown_delay`, and only then does in-flight connection draining get a
//! `shutdown_timeout` deadline.

pub mod health;

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::{Either, select};
use gateway_core::drain::DrainWatcher;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_stream::StreamExt as TokioStreamExt;
use tracing::{info, warn};

use crate::http_types::Response;
use crate::mux::{Dispatch, Mux, RouteMatch};

fn auto_server() -> auto::Builder<TokioExecutor> {
	let mut b = auto::Builder::new(TokioExecutor::new());
	b.http1().timer(TokioTimer::new());
	b.http2().timer(TokioTimer::new());
	b
}

/// Whether `X-Forwarded-Host`/`X-Forwarded-Proto` are honored for routing
/// and binding reconstruction. `X-Forwarded-For` is always read regardless
/// of these flags. Applies uniformly to every listener.
#[derive(Clone, Copy, Debug, Default)]
pub struct ForwardingConfig {
	pub xfh_enabled: bool,
	pub xfp_enabled: bool,
}

/// Per-request forwarding values, stashed in the request extensions by
/// [`dispatch`] before the route handler runs.
#[derive(Clone, Debug, Default)]
pub struct ForwardingContext {
	pub xff: Option<String>,
	pub host: Option<String>,
	pub proto: Option<String>,
	pub port: Option<String>,
}

pub struct ListenerConfig<T: Clone + Send + Sync + 'static> {
	pub address: SocketAddr,
	pub hosts: Arc<HostRouter<T>>,
	pub health_path: String,
	pub forwarding: ForwardingConfig,
	pub tls: Option<Arc<rustls::ServerConfig>>,
}

pub type BoxFuture<O> = std::pin::Pin<Box<dyn std::future::Future<Output = O> + Send>>;

/// Invoked once a route is matched; owned by the caller of [`Server::new`]
/// (the top-level wiring in `main.rs`), kept generic here so this module has
/// no dependency on the endpoint/backend types. Receives the full
/// [`RouteMatch`] rather than just the handler so path params and the
/// captured `/**` remainder reach the caller.
pub type RequestHandler<T> = Arc<dyn Fn(RouteMatch<T>, http::Request<Incoming>) -> BoxFuture<Response> + Send + Sync>;

pub struct Server<T: Clone + Send + Sync + 'static> {
	listeners: Vec<ListenerConfig<T>>,
	handler: RequestHandler<T>,
	drain: DrainWatcher,
	shutdown_delay: Duration,
	shutdown_timeout: Duration,
}

impl<T: Clone + Send + Sync + 'static> Server<T> {
	pub fn new(
		listeners: Vec<ListenerConfig<T>>,
		handler: RequestHandler<T>,
		drain: DrainWatcher,
		shutdown_delay: Duration,
		shutdown_timeout: Duration,
	) -> Self {
		Server {
			listeners,
			handler,
			drain,
			shutdown_delay,
			shutdown_timeout,
		}
	}

	pub async fn run(self) -> anyhow::Result<()> {
		let mut binds = Vec::with_capacity(self.listeners.len());
		for listener_cfg in &self.listeners {
			binds.push(TcpListener::bind(listener_cfg.address).await?);
			info!(address = %listener_cfg.address, tls = listener_cfg.tls.is_some(), "listening");
		}

		let mut js: JoinSet<()> = JoinSet::new();
		for (bind, listener_cfg) in binds.into_iter().zip(self.listeners.into_iter()) {
			js.spawn(accept_loop(bind, listener_cfg, self.handler.clone(), self.drain.clone()));
		}

		self.drain.wait_for_drain().await;
		info!("shutdown signalled; closing listeners and waiting shutdown_delay");
		tokio::time::sleep(self.shutdown_delay).await;

		let drained = tokio::time::timeout(self.shutdown_timeout, async {
			while js.join_next().await.is_some() {}
		})
		.await;
		if drained.is_err() {
			warn!("shutdown_timeout elapsed with connections still in flight");
			js.shutdown().await;
		}
		Ok(())
	}
}

/// Unifies a plain and a TLS-terminated socket behind one `AsyncRead` +
/// `AsyncWrite` type so `accept_loop` only has one connection-serving path.
enum Conn {
	Plain(TcpStream),
	Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for Conn {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Conn::Plain(s) => Pin::new(s).poll_read(cx, buf),
			Conn::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Conn {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			Conn::Plain(s) => Pin::new(s).poll_write(cx, buf),
			Conn::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Conn::Plain(s) => Pin::new(s).poll_flush(cx),
			Conn::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Conn::Plain(s) => Pin::new(s).poll_shutdown(cx),
			Conn::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
		}
	}
}

async fn accept_loop<T: Clone + Send + Sync + 'static>(
	bind: TcpListener,
	cfg: ListenerConfig<T>,
	handler: RequestHandler<T>,
	drain: DrainWatcher,
) {
	let hosts = cfg.hosts;
	let health_path = Arc::new(cfg.health_path);
	let local_port = cfg.address.port();
	let forwarding = cfg.forwarding;
	let tls_acceptor = cfg.tls.map(TlsAcceptor::from);
	let stream = tokio_stream::wrappers::TcpListenerStream::new(bind);
	let mut stream = stream.take_until(Box::pin(drain.wait_for_drain()));
	while let Some(Ok(socket)) = TokioStreamExt::next(&mut stream).await {
		let _ = socket.set_nodelay(true);
		let hosts = hosts.clone();
		let handler = handler.clone();
		let health_path = health_path.clone();
		let drain = drain.clone();
		let tls_acceptor = tls_acceptor.clone();
		tokio::spawn(async move {
			let conn = match tls_acceptor {
				Some(acceptor) => match acceptor.accept(socket).await {
					Ok(stream) => Conn::Tls(Box::new(stream)),
					Err(e) => {
						tracing::debug!(error = %e, "tls handshake failed");
						return;
					},
				},
				None => Conn::Plain(socket),
			};
			let serve = auto_server().serve_connection(
				TokioIo::new(conn),
				hyper::service::service_fn(move |req: http::Request<Incoming>| {
					let hosts = hosts.clone();
					let handler = handler.clone();
					let health_path = health_path.clone();
					let drain = drain.clone();
					async move {
						let resp = dispatch(&hosts, &handler, &drain, &health_path, local_port, forwarding, req).await;
						Ok::<_, Infallible>(resp)
					}
				}),
			);
			tokio::pin!(serve);
			match select(Box::pin(drain.wait_for_drain()), serve).await {
				Either::Left((_drain, mut serve)) => {
					Pin::new(&mut serve).graceful_shutdown();
					let _ = serve.await;
				},
				Either::Right((result, _)) => {
					if let Err(e) = result {
						tracing::debug!(error = %e, "connection error");
					}
				},
			}
		});
	}
}

/// Splits a `host:port` value, returning `fallback_port` when no port
/// suffix is present (e.g. a bare `Host` header, or a forwarded value that
/// didn't carry one).
fn split_host_port(value: &str, fallback_port: u16) -> (String, u16) {
	match value.rsplit_once(':') {
		Some((host, port)) => match port.parse::<u16>() {
			Ok(port) => (host.to_string(), port),
			Err(_) => (value.to_string(), fallback_port),
		},
		None => (value.to_string(), fallback_port),
	}
}

/// Dispatch policy: read forwarding headers per the listener's
/// [`ForwardingConfig`], select a Mux by host+port (falling back to `*`,
/// erroring as not-found if neither matches), then try the endpoint/files/spa
/// tables in order.
async fn dispatch<T: Clone + Send + Sync + 'static>(
	hosts: &HostRouter<T>,
	handler: &RequestHandler<T>,
	drain: &DrainWatcher,
	health_path: &str,
	local_port: u16,
	forwarding: ForwardingConfig,
	mut req: http::Request<Incoming>,
) -> Response {
	if req.uri().path() == health_path {
		return health::handle(drain);
	}

	let header_str = |name: http::HeaderName| req.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_string);

	let xff = header_str(http::header::HeaderName::from_static("x-forwarded-for"));
	let literal_host = header_str(http::header::HOST);
	let xfh = if forwarding.xfh_enabled {
		header_str(http::header::HeaderName::from_static("x-forwarded-host"))
	} else {
		None
	};
	let xfp = if forwarding.xfp_enabled {
		header_str(http::header::HeaderName::from_static("x-forwarded-proto"))
	} else {
		None
	};

	let routing_host_raw = xfh.clone().or_else(|| literal_host.clone()).unwrap_or_default();
	let (routing_host, routing_port) = split_host_port(&routing_host_raw, local_port);

	let fwd_ctx = ForwardingContext {
		xff,
		host: xfh.or(literal_host),
		proto: xfp,
		port: Some(routing_port.to_string()),
	};
	req.extensions_mut().insert(fwd_ctx);

	let Some(mux) = hosts.select(&routing_host, routing_port) else {
		return not_found(http::StatusCode::INTERNAL_SERVER_ERROR);
	};
	match mux.find(req.method(), req.uri().path()) {
		Dispatch::Matched(m) => handler(m, req).await,
		Dispatch::MethodNotAllowed => not_found(http::StatusCode::METHOD_NOT_ALLOWED),
		Dispatch::ApiNotFound { .. } => not_found(http::StatusCode::NOT_FOUND),
		Dispatch::NotFound => not_found(http::StatusCode::NOT_FOUND),
	}
}

fn not_found(status: http::StatusCode) -> Response {
	let mut resp = Response::new(crate::http_types::Body::from("not found"));
	*resp.status_mut() = status;
	resp
}

fn normalize_host(host: &str) -> String {
	let host = host.split(':').next().unwrap_or(host);
	host.trim_end_matches('.').to_ascii_lowercase()
}

fn host_port_key(host: &str, port: u16) -> String {
	format!("{}:{port}", normalize_host(host))
}

/// Maps a `{host}:{port}` key to the mux that should handle it, with `*` as
/// the fallback binding for any port.
pub struct HostRouter<T: Clone> {
	by_host_port: HashMap<String, Arc<Mux<T>>>,
	fallback: Option<Arc<Mux<T>>>,
}

impl<T: Clone> Default for HostRouter<T> {
	fn default() -> Self {
		HostRouter {
			by_host_port: HashMap::new(),
			fallback: None,
		}
	}
}

impl<T: Clone> HostRouter<T> {
	pub fn insert(&mut self, host: &str, port: u16, mux: Arc<Mux<T>>) {
		if host == "*" {
			self.fallback = Some(mux);
		} else {
			self.by_host_port.insert(host_port_key(host, port), mux);
		}
	}

	pub fn select(&self, host_header: &str, port: u16) -> Option<Arc<Mux<T>>> {
		let key = host_port_key(host_header, port);
		self.by_host_port.get(&key).cloned().or_else(|| self.fallback.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn host_router_falls_back_to_wildcard() {
		let mut router: HostRouter<&'static str> = HostRouter::default();
		router.insert("*", 8080, Arc::new(Mux::new(vec![])));
		router.insert("api.example.com", 8080, Arc::new(Mux::new(vec![])));
		assert!(router.select("api.example.com", 8080).is_some());
		assert!(router.select("unknown.example.com", 8080).is_some());
	}

	#[test]
	fn host_router_with_no_fallback_and_unknown_host_is_none() {
		let mut router: HostRouter<&'static str> = HostRouter::default();
		router.insert("api.example.com", 8080, Arc::new(Mux::new(vec![])));
		assert!(router.select("unknown.example.com", 8080).is_none());
	}

	#[test]
	fn host_router_keys_by_port_too() {
		let mut router: HostRouter<&'static str> = HostRouter::default();
		router.insert("api.example.com", 8080, Arc::new(Mux::new(vec![])));
		assert!(router.select("api.example.com", 9090).is_none());
	}

	#[test]
	fn host_router_select_strips_port_and_normalizes_case() {
		let mut router: HostRouter<&'static str> = HostRouter::default();
		router.insert("API.Example.com", 8080, Arc::new(Mux::new(vec![])));
		assert!(router.select("api.example.com:8080", 8080).is_some());
	}

	#[test]
	fn split_host_port_parses_embedded_port() {
		assert_eq!(split_host_port("example.com:9090", 8080), ("example.com".to_string(), 9090));
		assert_eq!(split_host_port("example.com", 8080), ("example.com".to_string(), 8080));
	}
}
