//! Segment trie used by [`super::Mux`] for path-pattern dispatch.
//!
//! A path is split on `/` and each segment is either a literal, a `{name}`
//! capture, or a `{name*}` wildcard that only appears as the final segment
//! and greedily matches the remainder of the path. At each level, static
//! children are tried before capture children, and a wildcard child is the
//! last resort.

use std::collections::HashMap;

#[derive(Clone, Debug, Default)]
pub struct Match {
	pub path_params: HashMap<String, String>,
	pub wildcard: Option<String>,
}

enum Segment {
	Static(String),
	Capture(String),
	Wildcard(String),
}

fn parse_segment(raw: &str) -> Segment {
	if let Some(inner) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
		if let Some(name) = inner.strip_suffix('*') {
			Segment::Wildcard(name.to_string())
		} else {
			Segment::Capture(inner.to_string())
		}
	} else {
		Segment::Static(raw.to_string())
	}
}

/// A single node in the trie. `handler_id` is `Some` when a route terminates
/// exactly at this node; routes are keyed by an opaque id the caller
/// resolves to its handler, since this module only does matching.
pub struct Node<T> {
	static_children: HashMap<String, Node<T>>,
	capture_child: Option<(String, Box<Node<T>>)>,
	wildcard_child: Option<(String, T)>,
	handler: Option<T>,
}

impl<T> Default for Node<T> {
	fn default() -> Self {
		Node {
			static_children: HashMap::new(),
			capture_child: None,
			wildcard_child: None,
			handler: None,
		}
	}
}

impl<T> Node<T> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Inserts `pattern` (e.g. `/users/{id}/orders/{_*}`) with `handler`.
	/// Returns an error string if a handler is already registered at the
	/// terminal node, as a recoverable `Result` since config loading should
	/// report all collisions, not abort on the first.
	pub fn insert(&mut self, pattern: &str, handler: T) -> Result<(), String> {
		let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
		self.insert_segments(&segments, handler, pattern)
	}

	fn insert_segments(&mut self, segments: &[&str], handler: T, full_pattern: &str) -> Result<(), String> {
		let Some((head, rest)) = segments.split_first() else {
			if self.handler.is_some() {
				return Err(format!("duplicate route pattern: {full_pattern}"));
			}
			self.handler = Some(handler);
			return Ok(());
		};
		match parse_segment(head) {
			Segment::Static(s) => {
				let child = self.static_children.entry(s).or_default();
				child.insert_segments(rest, handler, full_pattern)
			},
			Segment::Capture(name) => {
				if self.capture_child.is_none() {
					self.capture_child = Some((name.clone(), Box::new(Node::default())));
				}
				let (existing_name, child) = self.capture_child.as_mut().unwrap();
				if *existing_name != name {
					return Err(format!(
						"conflicting capture names at the same position: {existing_name} vs {name}"
					));
				}
				child.insert_segments(rest, handler, full_pattern)
			},
			Segment::Wildcard(name) => {
				if !rest.is_empty() {
					return Err(format!("wildcard segment must be last in pattern: {full_pattern}"));
				}
				if self.wildcard_child.is_some() {
					return Err(format!("duplicate wildcard route pattern: {full_pattern}"));
				}
				self.wildcard_child = Some((name, handler));
				Ok(())
			},
		}
	}

	/// Matches `path` against the trie, returning the handler and any
	/// captured path params / wildcard remainder. Static children win over
	/// capture children, which win over a wildcard at the same level.
	pub fn find(&self, path: &str) -> Option<(&T, Match)> {
		let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
		let mut m = Match::default();
		self.find_segments(&segments, &mut m).map(|h| (h, m))
	}

	fn find_segments<'a>(&'a self, segments: &[&str], m: &mut Match) -> Option<&'a T> {
		let Some((head, rest)) = segments.split_first() else {
			return self.handler.as_ref();
		};
		if let Some(child) = self.static_children.get(*head) {
			if let Some(h) = child.find_segments(rest, m) {
				return Some(h);
			}
		}
		if let Some((name, child)) = &self.capture_child {
			let mut candidate = m.clone();
			candidate.path_params.insert(name.clone(), head.to_string());
			if let Some(h) = child.find_segments(rest, &mut candidate) {
				*m = candidate;
				return Some(h);
			}
		}
		if let Some((name, handler)) = &self.wildcard_child {
			let remainder = segments.join("/");
			m.wildcard = Some(remainder.clone());
			m.path_params.insert(name.clone(), remainder);
			return Some(handler);
		}
		None
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn static_beats_capture_beats_wildcard() {
		let mut root: Node<&'static str> = Node::new();
		root.insert("/users/{id}", "capture").unwrap();
		root.insert("/users/me", "static").unwrap();
		root.insert("/users/{_*}", "wildcard").unwrap();

		let (h, _) = root.find("/users/me").unwrap();
		assert_eq!(*h, "static");
		let (h, m) = root.find("/users/42").unwrap();
		assert_eq!(*h, "capture");
		assert_eq!(m.path_params.get("id").unwrap(), "42");
		let (h, m) = root.find("/users/42/orders/7").unwrap();
		assert_eq!(*h, "wildcard");
		assert_eq!(m.wildcard.as_deref(), Some("42/orders/7"));
	}

	#[test]
	fn duplicate_pattern_is_an_error() {
		let mut root: Node<&'static str> = Node::new();
		root.insert("/a", "x").unwrap();
		assert!(root.insert("/a", "y").is_err());
	}

	#[test]
	fn wildcard_must_be_last_segment() {
		let mut root: Node<&'static str> = Node::new();
		assert!(root.insert("/a/{_*}/b", "x").is_err());
	}

	#[test]
	fn no_match_returns_none() {
		let mut root: Node<&'static str> = Node::new();
		root.insert("/a/b", "x").unwrap();
		assert!(root.find("/a/c").is_none());
	}
}
