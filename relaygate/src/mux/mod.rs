//! Host+port keyed mux selection and endpoint/files/spa layered dispatch.
//!
//! `Mux` builds three separate tries (endpoint routes, file-serving routes,
//! SPA shell routes); `find` tries them in that order, and when the
//! endpoint trie has no match for the request method it checks whether
//! *any* method would have matched (to distinguish 404 from 405), then
//! walks the configured API base-paths to decide whether a 404 inside an
//! API's path space should render that API's error template rather than
//! the server's generic one. The `/**` suffix on a pattern collapses to
//! the trie's wildcard segment.

pub mod trie;

use std::collections::HashMap;

use gateway_core::Strng;
use http::Method;
use trie::{Match, Node};

pub const WILDCARD_SUFFIX: &str = "/**";

#[derive(Clone, Debug)]
pub struct RouteMatch<T: Clone> {
	pub handler: T,
	pub path_params: HashMap<String, String>,
	pub wildcard: Option<String>,
}

/// Outcome of [`Mux::find`]: besides the happy path, distinguishes
/// "no route at all" from "route exists, wrong method" from "route missing
/// but inside an API's base path" so the caller can pick the right error
/// template scope.
pub enum Dispatch<T: Clone> {
	Matched(RouteMatch<T>),
	MethodNotAllowed,
	ApiNotFound { api_base_path: Strng },
	NotFound,
}

struct MethodTries<T: Clone> {
	by_method: HashMap<Method, Node<T>>,
}

impl<T: Clone> Default for MethodTries<T> {
	fn default() -> Self {
		MethodTries { by_method: HashMap::new() }
	}
}

impl<T: Clone> MethodTries<T> {
	fn insert(&mut self, method: Method, pattern: &str, handler: T) -> Result<(), String> {
		self.by_method.entry(method).or_default().insert(pattern, handler)
	}

	fn find(&self, method: &Method, path: &str) -> Option<(T, Match)> {
		self
			.by_method
			.get(method)
			.and_then(|n| n.find(path))
			.map(|(h, m)| (h.clone(), m))
	}

	fn any_method_matches(&self, path: &str) -> bool {
		self.by_method.values().any(|n| n.find(path).is_some())
	}
}

/// One mux per host+port binding.
pub struct Mux<T: Clone> {
	endpoints: MethodTries<T>,
	files: Node<T>,
	spa: Node<T>,
	api_base_paths: Vec<Strng>,
}

impl<T: Clone> Default for Mux<T> {
	fn default() -> Self {
		Mux {
			endpoints: MethodTries::default(),
			files: Node::default(),
			spa: Node::default(),
			api_base_paths: Vec::new(),
		}
	}
}

fn normalize_pattern(pattern: &str) -> String {
	if let Some(prefix) = pattern.strip_suffix(WILDCARD_SUFFIX) {
		format!("{prefix}/{{_wildcard*}}")
	} else {
		pattern.to_string()
	}
}

impl<T: Clone> Mux<T> {
	pub fn new(api_base_paths: Vec<Strng>) -> Self {
		Mux {
			api_base_paths,
			..Default::default()
		}
	}

	pub fn add_endpoint_route(&mut self, method: Method, pattern: &str, handler: T) -> Result<(), String> {
		self.endpoints.insert(method, &normalize_pattern(pattern), handler)
	}

	pub fn add_file_route(&mut self, pattern: &str, handler: T) -> Result<(), String> {
		self.files.insert(&normalize_pattern(pattern), handler)
	}

	pub fn add_spa_route(&mut self, pattern: &str, handler: T) -> Result<(), String> {
		self.spa.insert(&normalize_pattern(pattern), handler)
	}

	pub fn find(&self, method: &Method, path: &str) -> Dispatch<T> {
		if let Some((handler, m)) = self.endpoints.find(method, path) {
			return Dispatch::Matched(RouteMatch {
				handler,
				path_params: m.path_params,
				wildcard: m.wildcard,
			});
		}
		if self.endpoints.any_method_matches(path) {
			return Dispatch::MethodNotAllowed;
		}
		if let Some(api_base_path) = self.api_error_scope(path) {
			return Dispatch::ApiNotFound { api_base_path };
		}
		if let Some((handler, m)) = self.files.find(method, path).or_else(|| self.files.find(&Method::GET, path)) {
			return Dispatch::Matched(RouteMatch {
				handler,
				path_params: m.path_params,
				wildcard: m.wildcard,
			});
		}
		if let Some((handler, m)) = self.spa.find(&Method::GET, path) {
			return Dispatch::Matched(RouteMatch {
				handler,
				path_params: m.path_params,
				wildcard: m.wildcard,
			});
		}
		Dispatch::NotFound
	}

	/// Mirrors `isAPIError`/`matchesPath`: a request path is "inside" an API
	/// base path if it equals the base path, the base path plus `/`, or has
	/// the base path (with trailing slash) as a prefix.
	fn api_error_scope(&self, path: &str) -> Option<Strng> {
		self.api_base_paths.iter().find(|base| matches_path(base, path)).cloned()
	}
}

fn matches_path(api_base_path: &str, req_path: &str) -> bool {
	let trimmed = api_base_path.trim_end_matches('/');
	req_path == trimmed || req_path == format!("{trimmed}/") || req_path.starts_with(&format!("{trimmed}/"))
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
