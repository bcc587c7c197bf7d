//! Shared HTTP type aliases used across the crate.

pub type Body = axum_core::body::Body;
pub type Request = http::Request<Body>;
pub type Response = http::Response<Body>;

pub use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
