//! Small serde helpers shared across config types.
//!
//! Human-readable duration (de)serialization via `duration_str`, so config
//! files write `timeout: 5s` instead of nanosecond integers.

use duration_str::HumanFormat;
use serde::Serializer;

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == Default::default()
}

pub mod serde_dur {
	pub use duration_str::deserialize_duration as deserialize;

	use super::*;

	pub fn serialize<S: Serializer, T: HumanFormat>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&t.human_format())
	}
}

pub mod serde_dur_option {
	pub use duration_str::deserialize_option_duration as deserialize;

	use super::*;

	pub fn serialize<S: Serializer, T: HumanFormat>(t: &Option<T>, serializer: S) -> Result<S::Ok, S::Error> {
		match t {
			None => serializer.serialize_none(),
			Some(t) => serializer.serialize_str(&t.human_format()),
		}
	}
}
