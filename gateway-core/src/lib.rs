//! Small leaf crate shared by the gateway: an interned string type and
//! graceful-shutdown primitives. Kept deliberately tiny so it never needs to
//! depend on the rest of the gateway.

pub mod drain;
pub mod prelude;
pub mod strng;

pub use strng::Strng;
