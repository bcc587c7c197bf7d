//! A cheaply-clonable interned string, used pervasively for config-derived
//! identifiers (route names, backend names, header names) that get cloned
//! into every request's context but are never mutated after load time.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use arcstr::ArcStr;

#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Strng(ArcStr);

impl Strng {
	pub fn new(s: impl Into<ArcStr>) -> Self {
		Strng(s.into())
	}

	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}
}

impl Deref for Strng {
	type Target = str;
	fn deref(&self) -> &str {
		self.0.as_str()
	}
}

impl Borrow<str> for Strng {
	fn borrow(&self) -> &str {
		self.0.as_str()
	}
}

impl From<&str> for Strng {
	fn from(s: &str) -> Self {
		Strng(ArcStr::from(s))
	}
}

impl From<String> for Strng {
	fn from(s: String) -> Self {
		Strng(ArcStr::from(s))
	}
}

impl fmt::Display for Strng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.0, f)
	}
}

impl fmt::Debug for Strng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(&self.0, f)
	}
}

/// Shorthand free-function constructor, for call sites that prefer
/// `strng::new(...)` over `Strng::new(...)`.
pub fn new(s: impl Into<ArcStr>) -> Strng {
	Strng::new(s)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clones_are_cheap_and_equal() {
		let a = Strng::from("users");
		let b = a.clone();
		assert_eq!(a, b);
		assert_eq!(a.as_str(), "users");
	}
}
